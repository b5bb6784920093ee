//! The transport abstraction shared by stdio and HTTP/SSE.
//!
//! A transport moves opaque JSON frames. Inbound frames are pushed into a
//! [`FrameHandler`] installed by the protocol layer; when the handler
//! produces a response frame, the transport delivers it back on the same
//! channel the inbound frame arrived on (the write half for stdio, the
//! HTTP response body for `POST /jsonrpc`). Outbound traffic initiated by
//! this side goes through [`Transport::send`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;

/// Callback invoked for every inbound frame. Returns the frame to send
/// back, if the inbound frame warranted one.
pub type FrameHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Which wire a transport speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Content-Length framed JSON over stdin/stdout
    #[default]
    Stdio,
    /// HTTP POST inbound, Server-Sent Events outbound
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Connected and pumping frames
    Connected,
    /// Connection failed or dropped
    Failed {
        /// Failure reason
        reason: String,
    },
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// A bidirectional frame channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which wire this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Current connection state.
    async fn state(&self) -> TransportState;

    /// Install the inbound frame handler. Must be called before
    /// [`Transport::connect`]; frames arriving without a handler are
    /// dropped with a warning.
    fn set_handler(&self, handler: FrameHandler);

    /// Establish the channel and start pumping inbound frames.
    async fn connect(&self) -> TransportResult<()>;

    /// Tear the channel down. Safe to call in any state.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Send one outbound frame.
    async fn send(&self, frame: Bytes) -> TransportResult<()>;
}
