//! Client-role protocol engine: the side that talks *to* an MCP server.
//!
//! The hub runs one of these per supervised server. It owns the initialize
//! and shutdown handshakes, gates every typed operation on the negotiated
//! capability tree, and forwards brokered envelopes verbatim.

use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{Value, json};
use tracing::{info, warn};

use nexus_transport::Transport;

use crate::capabilities::Capabilities;
use crate::engine::{NotificationFallback, NotificationHandler, ProtocolEngine, RequestHandler};
use crate::error::{ProtocolError, ProtocolResult};
use crate::methods;
use crate::types::{
    Implementation, InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, PromptDescriptor, ReadResourceResult, ResourceDescriptor, ToolDescriptor,
};

#[derive(Debug, Default)]
struct NegotiatedState {
    initialized: bool,
    server_info: Option<Implementation>,
    server_capabilities: Capabilities,
}

/// MCP client role over a transport.
#[derive(Debug)]
pub struct McpClient {
    engine: Arc<ProtocolEngine>,
    info: Implementation,
    state: StdMutex<NegotiatedState>,
}

impl McpClient {
    /// Create a client role bound to a transport.
    pub fn bind(transport: Arc<dyn Transport>, info: Implementation) -> Arc<Self> {
        Arc::new(Self {
            engine: ProtocolEngine::bind(transport),
            info,
            state: StdMutex::new(NegotiatedState::default()),
        })
    }

    /// The underlying dispatcher, for registering handlers of
    /// server-initiated traffic (sampling requests, update notifications).
    #[must_use]
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Register a handler for a server-initiated request method.
    pub fn on_request(&self, method: impl Into<String>, handler: RequestHandler) {
        self.engine.on_request(method, handler);
    }

    /// Register a handler for a server-initiated notification method.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.engine.on_notification(method, handler);
    }

    /// Install the fallback for unhandled server notifications.
    pub fn set_notification_fallback(&self, fallback: NotificationFallback) {
        self.engine.set_notification_fallback(fallback);
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.state.lock().expect("state mutex poisoned").initialized
    }

    /// The server's advertised info, once initialized.
    #[must_use]
    pub fn server_info(&self) -> Option<Implementation> {
        self.state
            .lock()
            .expect("state mutex poisoned")
            .server_info
            .clone()
    }

    /// The negotiated server capability tree, once initialized.
    #[must_use]
    pub fn server_capabilities(&self) -> Capabilities {
        self.state
            .lock()
            .expect("state mutex poisoned")
            .server_capabilities
            .clone()
    }

    /// Check a capability path against the negotiated tree. Always false
    /// before initialization completes.
    #[must_use]
    pub fn has_capability(&self, path: &str) -> bool {
        let state = self.state.lock().expect("state mutex poisoned");
        state.initialized && state.server_capabilities.has(path)
    }

    fn require_capability(&self, path: &str, what: &str) -> ProtocolResult<()> {
        if self.has_capability(path) {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedCapability(format!(
                "Server does not support {what}"
            )))
        }
    }

    /// Perform the initialize handshake: send `initialize`, cache the
    /// server's info and capability tree, then emit `initialized`.
    pub async fn initialize(&self, capabilities: Capabilities) -> ProtocolResult<InitializeResult> {
        if self.initialized() {
            warn!("Protocol already initialized");
            return Err(ProtocolError::Protocol(
                "Protocol already initialized".to_string(),
            ));
        }

        let params = InitializeParams {
            client_info: self.info.clone(),
            capabilities,
        };
        let raw = self
            .engine
            .send_request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(raw)
            .map_err(|decode_error| ProtocolError::Protocol(decode_error.to_string()))?;

        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            state.server_info = Some(result.server_info.clone());
            state.server_capabilities = result.capabilities.clone();
            state.initialized = true;
        }

        self.engine
            .send_notification(methods::INITIALIZED, Some(json!({})))
            .await?;

        info!(
            "Client protocol initialized against {} {}",
            result.server_info.name, result.server_info.version
        );
        Ok(result)
    }

    /// Reverse handshake: `shutdown` request followed by the `exit`
    /// notification. Resets the negotiated state either way.
    pub async fn shutdown(&self) -> ProtocolResult<()> {
        if !self.initialized() {
            warn!("Protocol not initialized; nothing to shut down");
            return Ok(());
        }

        let outcome = async {
            self.engine
                .send_request(methods::SHUTDOWN, Some(json!({})))
                .await?;
            self.engine.send_notification(methods::EXIT, None).await
        }
        .await;

        let mut state = self.state.lock().expect("state mutex poisoned");
        *state = NegotiatedState::default();
        outcome
    }

    /// Fail all outstanding requests; called when the transport drops.
    pub fn connection_lost(&self, reason: &str) {
        self.engine.fail_pending(reason);
        let mut state = self.state.lock().expect("state mutex poisoned");
        *state = NegotiatedState::default();
    }

    // Resource operations

    /// `resources/list`
    pub async fn list_resources(&self) -> ProtocolResult<Vec<ResourceDescriptor>> {
        self.require_capability("resources", "resources")?;
        let raw = self
            .engine
            .send_request(methods::RESOURCES_LIST, Some(json!({})))
            .await?;
        let result: ListResourcesResult = serde_json::from_value(raw)?;
        Ok(result.resources)
    }

    /// `resources/read`
    pub async fn read_resource(&self, uri: &str) -> ProtocolResult<Vec<Value>> {
        self.require_capability("resources", "resources")?;
        let raw = self
            .engine
            .send_request(methods::RESOURCES_READ, Some(json!({"uri": uri})))
            .await?;
        let result: ReadResourceResult = serde_json::from_value(raw)?;
        Ok(result.contents)
    }

    /// `resources/subscribe`
    pub async fn subscribe_resource(&self, uri: &str) -> ProtocolResult<()> {
        self.require_capability("resources.subscriptions", "resource subscriptions")?;
        self.engine
            .send_request(methods::RESOURCES_SUBSCRIBE, Some(json!({"uri": uri})))
            .await?;
        Ok(())
    }

    /// `resources/unsubscribe`
    pub async fn unsubscribe_resource(&self, uri: &str) -> ProtocolResult<()> {
        self.require_capability("resources.subscriptions", "resource subscriptions")?;
        self.engine
            .send_request(methods::RESOURCES_UNSUBSCRIBE, Some(json!({"uri": uri})))
            .await?;
        Ok(())
    }

    // Tool operations

    /// `tools/list`
    pub async fn list_tools(&self) -> ProtocolResult<Vec<ToolDescriptor>> {
        self.require_capability("tools", "tools")?;
        let raw = self
            .engine
            .send_request(methods::TOOLS_LIST, Some(json!({})))
            .await?;
        let result: ListToolsResult = serde_json::from_value(raw)?;
        Ok(result.tools)
    }

    /// `tools/call`
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ProtocolResult<Value> {
        self.require_capability("tools", "tools")?;
        self.engine
            .send_request(
                methods::TOOLS_CALL,
                Some(json!({"name": name, "arguments": arguments})),
            )
            .await
    }

    // Prompt operations

    /// `prompts/list`
    pub async fn list_prompts(&self) -> ProtocolResult<Vec<PromptDescriptor>> {
        self.require_capability("prompts", "prompts")?;
        let raw = self
            .engine
            .send_request(methods::PROMPTS_LIST, Some(json!({})))
            .await?;
        let result: ListPromptsResult = serde_json::from_value(raw)?;
        Ok(result.prompts)
    }

    /// `prompts/get`
    pub async fn get_prompt(&self, id: &str) -> ProtocolResult<Value> {
        self.require_capability("prompts", "prompts")?;
        self.engine
            .send_request(methods::PROMPTS_GET, Some(json!({"id": id})))
            .await
    }

    // Sampling

    /// `sampling/sample` - elicit a completion from the peer.
    pub async fn sample(&self, request: Value) -> ProtocolResult<Value> {
        self.require_capability("sampling", "sampling")?;
        self.engine
            .send_request(methods::SAMPLING_SAMPLE, Some(request))
            .await
    }

    // Brokered traffic

    /// Forward a request envelope verbatim and return the full response
    /// envelope.
    pub async fn forward_request(&self, envelope: Value) -> ProtocolResult<Value> {
        self.engine.forward_request(envelope).await
    }

    /// Forward a notification envelope verbatim.
    pub async fn forward_notification(&self, envelope: Value) -> ProtocolResult<()> {
        self.engine.forward_notification(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_transport::testing::LoopbackTransport;
    use pretty_assertions::assert_eq;

    fn client() -> (Arc<McpClient>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let client = McpClient::bind(
            transport.clone(),
            Implementation::new("Nexus MCP Hub", "0.4.0"),
        );
        (client, transport)
    }

    #[tokio::test]
    async fn capability_checks_are_false_before_initialize() {
        let (client, _transport) = client();
        assert!(!client.has_capability("resources"));
        assert!(!client.initialized());

        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCapability(_)));
    }

    #[tokio::test]
    async fn initialize_caches_the_negotiated_tree() {
        let (client, transport) = client();

        let client_clone = client.clone();
        let handshake =
            tokio::spawn(async move { client_clone.initialize(Capabilities::hub()).await });

        let sent = transport.next_sent().await;
        let sent: Value = serde_json::from_slice(&sent).unwrap();
        assert_eq!(sent["method"], json!("initialize"));
        assert_eq!(sent["params"]["clientInfo"]["name"], json!("Nexus MCP Hub"));

        let response = json!({
            "jsonrpc": "2.0",
            "id": sent["id"],
            "result": {
                "serverInfo": {"name": "echo-server", "version": "1.0.0"},
                "capabilities": {"tools": true}
            }
        });
        client
            .engine()
            .handle_frame(response.to_string().as_bytes())
            .await;

        // The initialized notification follows the response.
        let notified = transport.next_sent().await;
        let notified: Value = serde_json::from_slice(&notified).unwrap();
        assert_eq!(notified["method"], json!("initialized"));

        let result = handshake.await.unwrap().unwrap();
        assert_eq!(result.server_info.name, "echo-server");
        assert!(client.has_capability("tools"));
        assert!(!client.has_capability("resources"));
    }
}
