//! MCP data types carried inside envelope parameters and results.
//!
//! The hub brokers most payloads opaquely; the types here are the ones it
//! actually inspects: handshake structures and the catalog descriptors it
//! caches per server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::Capabilities;

/// Name and version of a protocol participant (`clientInfo` / `serverInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Participant name
    pub name: String,
    /// Participant version
    pub version: String,
}

impl Implementation {
    /// Create a participant descriptor
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Client name and version
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
    /// Capabilities the client offers
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Server name and version
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    /// Capabilities the server offers
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// A server-addressable artifact identified by URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource URI
    pub uri: String,
    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the contents
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A server-exposed callable addressed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the argument object. Opaque to the hub.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A server-exposed named template addressed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt id
    pub id: String,
    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result wrapper for `resources/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Advertised resources
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Result wrapper for `resources/read`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Resource contents, opaque to the hub
    #[serde(default)]
    pub contents: Vec<Value>,
}

/// Result wrapper for `tools/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Advertised tools
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Result wrapper for `prompts/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPromptsResult {
    /// Advertised prompts
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
}
