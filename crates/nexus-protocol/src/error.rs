//! Protocol error codes and the crate error type.

use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// A specialized `Result` for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// JSON-RPC and MCP error codes.
///
/// The `-327xx` block is standard JSON-RPC 2.0; the `-3200x` block is the
/// MCP extension space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Parse error (-32700)
    ParseError,
    /// Invalid request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    InternalError,
    /// Protocol error (-32000)
    ProtocolError,
    /// Unsupported capability (-32001)
    UnsupportedCapability,
    /// Invalid capability (-32002)
    InvalidCapability,
    /// Resource not found (-32003)
    ResourceNotFound,
    /// Tool not found (-32004)
    ToolNotFound,
    /// Prompt not found (-32005)
    PromptNotFound,
    /// Subscription error (-32006)
    SubscriptionError,
    /// Sampling error (-32007)
    SamplingError,
}

impl ErrorCode {
    /// Numeric wire code
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ProtocolError => -32000,
            Self::UnsupportedCapability => -32001,
            Self::InvalidCapability => -32002,
            Self::ResourceNotFound => -32003,
            Self::ToolNotFound => -32004,
            Self::PromptNotFound => -32005,
            Self::SubscriptionError => -32006,
            Self::SamplingError => -32007,
        }
    }
}

/// Errors raised by the protocol engines and their handlers.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The frame was valid JSON but not a valid JSON-RPC envelope.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No handler is registered for the method.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// The parameters did not match the method's expectations.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The negotiated capability tree does not cover the operation.
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// No resource with the given URI.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// No tool with the given name.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// No prompt with the given id.
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    /// Subscription bookkeeping failed.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Sampling failed or no sampling handler is installed.
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Handshake ordering violation (initialize twice, send before init).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a JSON-RPC error object.
    #[error("Peer error: {0}")]
    Rpc(JsonRpcError),

    /// The connection closed with requests still outstanding.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The request did not complete within the allotted time.
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// The wire code this error maps to.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Parse(_) => ErrorCode::ParseError.code(),
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound.code(),
            Self::InvalidParams(_) => ErrorCode::InvalidParams.code(),
            Self::UnsupportedCapability(_) => ErrorCode::UnsupportedCapability.code(),
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound.code(),
            Self::ToolNotFound(_) => ErrorCode::ToolNotFound.code(),
            Self::PromptNotFound(_) => ErrorCode::PromptNotFound.code(),
            Self::Subscription(_) => ErrorCode::SubscriptionError.code(),
            Self::Sampling(_) => ErrorCode::SamplingError.code(),
            Self::Protocol(_) | Self::ConnectionClosed(_) | Self::Timeout(_) => {
                ErrorCode::ProtocolError.code()
            }
            Self::Rpc(error) => error.code,
            Self::Internal(_) => ErrorCode::InternalError.code(),
        }
    }

    /// Render as the JSON-RPC error object sent to the peer.
    #[must_use]
    pub fn to_json_rpc(&self) -> JsonRpcError {
        match self {
            Self::Rpc(error) => error.clone(),
            other => JsonRpcError {
                code: other.error_code(),
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<JsonRpcError> for ProtocolError {
    fn from(error: JsonRpcError) -> Self {
        Self::Rpc(error)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_table() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
        assert_eq!(ErrorCode::ProtocolError.code(), -32000);
        assert_eq!(ErrorCode::UnsupportedCapability.code(), -32001);
        assert_eq!(ErrorCode::InvalidCapability.code(), -32002);
        assert_eq!(ErrorCode::ResourceNotFound.code(), -32003);
        assert_eq!(ErrorCode::ToolNotFound.code(), -32004);
        assert_eq!(ErrorCode::PromptNotFound.code(), -32005);
        assert_eq!(ErrorCode::SubscriptionError.code(), -32006);
        assert_eq!(ErrorCode::SamplingError.code(), -32007);
    }

    #[test]
    fn peer_errors_round_trip() {
        let wire = JsonRpcError {
            code: -32004,
            message: "Tool not found: add".to_string(),
            data: None,
        };
        let error = ProtocolError::from(wire.clone());
        assert_eq!(error.to_json_rpc(), wire);
    }
}
