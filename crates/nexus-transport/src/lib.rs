//! # Nexus Transport
//!
//! Frame transports for the Nexus hub: `Content-Length` framed JSON over
//! stdio, and HTTP `POST /jsonrpc` with Server-Sent Events for the return
//! path. Both implement the [`Transport`] trait; the protocol layer
//! installs a [`FrameHandler`] and otherwise only calls
//! [`Transport::send`].

pub mod error;
pub mod framing;
pub mod http;
pub mod stdio;
pub mod testing;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use framing::ContentLengthCodec;
pub use http::HttpSseTransport;
pub use stdio::StdioTransport;
pub use traits::{FrameHandler, Transport, TransportKind, TransportState};
