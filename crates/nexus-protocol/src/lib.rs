//! # Nexus Protocol
//!
//! JSON-RPC 2.0 framing and the two MCP protocol roles used by the Nexus
//! hub: [`McpClient`] speaks *to* a server, [`McpServer`] speaks *to* a
//! client. Both share the [`ProtocolEngine`] dispatcher, which owns the
//! handler registries and the pending-request table.

pub mod capabilities;
pub mod client;
pub mod engine;
pub mod error;
pub mod jsonrpc;
pub mod methods;
pub mod server;
pub mod types;

pub use capabilities::Capabilities;
pub use client::McpClient;
pub use engine::{
    NotificationFallback, NotificationHandler, ProtocolEngine, RequestFallback, RequestHandler,
};
pub use error::{ErrorCode, ProtocolError, ProtocolResult};
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion, RequestId, ResponseId,
};
pub use server::{McpServer, PromptHandler, SamplingHandler, ToolHandler};
pub use types::{
    Implementation, InitializeParams, InitializeResult, PromptDescriptor, ResourceDescriptor,
    ToolDescriptor,
};
