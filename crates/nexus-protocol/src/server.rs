//! Server-role protocol engine: the side that talks *to* an MCP client.
//!
//! The hub runs one of these per remote client. Lifecycle methods
//! (`initialize`, `initialized`, `shutdown`, `exit`) and subscription
//! bookkeeping are handled here; everything else falls through to the
//! request fallback, which the hub wires to its router. Embedders and test
//! fixtures can instead register local resource, tool, prompt, and sampling
//! backends to serve the full MCP surface in-process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use nexus_transport::Transport;

use crate::capabilities::Capabilities;
use crate::engine::{ProtocolEngine, RequestFallback};
use crate::error::{ProtocolError, ProtocolResult};
use crate::methods;
use crate::types::{
    Implementation, InitializeParams, InitializeResult, PromptDescriptor, ResourceDescriptor,
    ToolDescriptor,
};

/// Backend for `tools/call`: receives the argument object.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ProtocolResult<Value>> + Send + Sync>;

/// Backend for `prompts/get`: receives the request params.
pub type PromptHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ProtocolResult<Value>> + Send + Sync>;

/// Backend for `resources/list`.
pub type ResourceListHandler =
    Arc<dyn Fn() -> BoxFuture<'static, ProtocolResult<Vec<ResourceDescriptor>>> + Send + Sync>;

/// Backend for `resources/read`: receives the URI.
pub type ResourceReadHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, ProtocolResult<Vec<Value>>> + Send + Sync>;

/// Backend for inbound `sampling/sample` requests.
pub type SamplingHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ProtocolResult<Value>> + Send + Sync>;

/// Callback invoked when the peer sends the `exit` notification.
pub type ExitHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    client_info: Option<Implementation>,
    client_capabilities: Capabilities,
}

/// MCP server role over a transport.
pub struct McpServer {
    engine: Arc<ProtocolEngine>,
    peer_id: String,
    session: Arc<StdMutex<SessionState>>,
    subscriptions: Arc<StdMutex<HashMap<String, HashSet<String>>>>,
    tools: Arc<StdMutex<HashMap<String, (ToolDescriptor, ToolHandler)>>>,
    prompts: Arc<StdMutex<HashMap<String, (PromptDescriptor, PromptHandler)>>>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("peer_id", &self.peer_id)
            .field("initialized", &self.initialized())
            .finish()
    }
}

impl McpServer {
    /// Create a server role bound to a transport, advertising the given
    /// info and capability tree. `peer_id` identifies the remote client in
    /// the subscription table.
    pub fn bind(
        transport: Arc<dyn Transport>,
        info: Implementation,
        capabilities: Capabilities,
        peer_id: impl Into<String>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            engine: ProtocolEngine::bind(transport),
            peer_id: peer_id.into(),
            session: Arc::new(StdMutex::new(SessionState::default())),
            subscriptions: Arc::new(StdMutex::new(HashMap::new())),
            tools: Arc::new(StdMutex::new(HashMap::new())),
            prompts: Arc::new(StdMutex::new(HashMap::new())),
        });
        server.register_lifecycle(info, capabilities.clone());
        server.register_subscriptions(capabilities);
        server
    }

    /// The underlying dispatcher.
    #[must_use]
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Install the fallback that receives every request with no local
    /// handler. The hub routes brokered traffic through this hook.
    pub fn set_request_fallback(&self, fallback: RequestFallback) {
        self.engine.set_request_fallback(fallback);
    }

    /// Install the handler invoked when the peer sends `exit`.
    pub fn set_exit_handler(&self, handler: ExitHandler) {
        self.engine.on_notification(
            methods::EXIT,
            Arc::new(move |_params| {
                let handler = handler.clone();
                Box::pin(async move {
                    info!("Peer sent exit notification");
                    handler().await;
                })
            }),
        );
    }

    /// Whether the peer has completed the handshake.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.session.lock().expect("session mutex poisoned").initialized
    }

    /// The client's advertised info, once initialized.
    #[must_use]
    pub fn client_info(&self) -> Option<Implementation> {
        self.session
            .lock()
            .expect("session mutex poisoned")
            .client_info
            .clone()
    }

    /// The client's declared capability tree.
    #[must_use]
    pub fn client_capabilities(&self) -> Capabilities {
        self.session
            .lock()
            .expect("session mutex poisoned")
            .client_capabilities
            .clone()
    }

    /// Check a capability path against the client's declared tree. Always
    /// false before initialization completes.
    #[must_use]
    pub fn client_has_capability(&self, path: &str) -> bool {
        let session = self.session.lock().expect("session mutex poisoned");
        session.initialized && session.client_capabilities.has(path)
    }

    /// Client ids subscribed to a resource URI.
    #[must_use]
    pub fn subscribers_of(&self, uri: &str) -> HashSet<String> {
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    fn register_lifecycle(&self, info: Implementation, capabilities: Capabilities) {
        let session = self.session.clone();
        self.engine.on_request(
            methods::INITIALIZE,
            Arc::new(move |params| {
                let session = session.clone();
                let info = info.clone();
                let capabilities = capabilities.clone();
                Box::pin(async move {
                    let mut state = session.lock().expect("session mutex poisoned");
                    if state.initialized {
                        return Err(ProtocolError::Protocol(
                            "Protocol already initialized".to_string(),
                        ));
                    }

                    let params: InitializeParams = params
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(|decode_error| {
                            ProtocolError::InvalidParams(decode_error.to_string())
                        })?
                        .ok_or_else(|| {
                            ProtocolError::InvalidParams(
                                "Missing initialize params".to_string(),
                            )
                        })?;

                    info!(
                        "Initializing server protocol for client: {} {}",
                        params.client_info.name, params.client_info.version
                    );
                    state.client_info = Some(params.client_info);
                    state.client_capabilities = params.capabilities;

                    let result = InitializeResult {
                        server_info: info,
                        capabilities,
                    };
                    serde_json::to_value(result)
                        .map_err(|encode_error| ProtocolError::Internal(encode_error.to_string()))
                })
            }),
        );

        let session = self.session.clone();
        self.engine.on_notification(
            methods::INITIALIZED,
            Arc::new(move |_params| {
                let session = session.clone();
                Box::pin(async move {
                    session
                        .lock()
                        .expect("session mutex poisoned")
                        .initialized = true;
                    info!("Server protocol initialized");
                })
            }),
        );

        let session = self.session.clone();
        self.engine.on_request(
            methods::SHUTDOWN,
            Arc::new(move |_params| {
                let session = session.clone();
                Box::pin(async move {
                    info!("Shutting down server protocol");
                    session
                        .lock()
                        .expect("session mutex poisoned")
                        .initialized = false;
                    Ok(json!({}))
                })
            }),
        );
    }

    fn register_subscriptions(&self, capabilities: Capabilities) {
        let subscriptions = self.subscriptions.clone();
        let peer_id = self.peer_id.clone();
        let caps = capabilities.clone();
        self.engine.on_request(
            methods::RESOURCES_SUBSCRIBE,
            Arc::new(move |params| {
                let subscriptions = subscriptions.clone();
                let peer_id = peer_id.clone();
                let caps = caps.clone();
                Box::pin(async move {
                    if !caps.has("resources.subscriptions") {
                        return Err(ProtocolError::UnsupportedCapability(
                            "Server does not support resource subscriptions".to_string(),
                        ));
                    }
                    let uri = required_uri(params)?;
                    subscriptions
                        .lock()
                        .expect("subscriptions mutex poisoned")
                        .entry(uri.clone())
                        .or_default()
                        .insert(peer_id);
                    debug!("Subscribed to resource: {uri}");
                    Ok(json!({}))
                })
            }),
        );

        let subscriptions = self.subscriptions.clone();
        let peer_id = self.peer_id.clone();
        self.engine.on_request(
            methods::RESOURCES_UNSUBSCRIBE,
            Arc::new(move |params| {
                let subscriptions = subscriptions.clone();
                let peer_id = peer_id.clone();
                let caps = capabilities.clone();
                Box::pin(async move {
                    if !caps.has("resources.subscriptions") {
                        return Err(ProtocolError::UnsupportedCapability(
                            "Server does not support resource subscriptions".to_string(),
                        ));
                    }
                    let uri = required_uri(params)?;
                    let mut table = subscriptions
                        .lock()
                        .expect("subscriptions mutex poisoned");
                    if let Some(subscribers) = table.get_mut(&uri) {
                        subscribers.remove(&peer_id);
                        if subscribers.is_empty() {
                            table.remove(&uri);
                        }
                        debug!("Unsubscribed from resource: {uri}");
                    }
                    Ok(json!({}))
                })
            }),
        );
    }

    // Local backends, for embedders and test fixtures.

    /// Serve `resources/list` and `resources/read` from local providers.
    pub fn set_resource_provider(&self, list: ResourceListHandler, read: ResourceReadHandler) {
        self.engine.on_request(
            methods::RESOURCES_LIST,
            Arc::new(move |_params| {
                let list = list.clone();
                Box::pin(async move {
                    let resources = list().await?;
                    serde_json::to_value(json!({"resources": resources}))
                        .map_err(|encode_error| ProtocolError::Internal(encode_error.to_string()))
                })
            }),
        );

        self.engine.on_request(
            methods::RESOURCES_READ,
            Arc::new(move |params| {
                let read = read.clone();
                Box::pin(async move {
                    let uri = required_uri(params)?;
                    let contents = read(uri).await?;
                    Ok(json!({"contents": contents}))
                })
            }),
        );
    }

    /// Register a tool backend; installs the `tools/list` and `tools/call`
    /// handlers on first use.
    pub fn register_tool(&self, descriptor: ToolDescriptor, handler: ToolHandler) {
        let first = {
            let mut tools = self.tools.lock().expect("tools mutex poisoned");
            let first = tools.is_empty();
            tools.insert(descriptor.name.clone(), (descriptor, handler));
            first
        };
        if !first {
            return;
        }

        let tools = self.tools.clone();
        self.engine.on_request(
            methods::TOOLS_LIST,
            Arc::new(move |_params| {
                let tools = tools.clone();
                Box::pin(async move {
                    let descriptors: Vec<ToolDescriptor> = tools
                        .lock()
                        .expect("tools mutex poisoned")
                        .values()
                        .map(|(descriptor, _)| descriptor.clone())
                        .collect();
                    Ok(json!({"tools": descriptors}))
                })
            }),
        );

        let tools = self.tools.clone();
        self.engine.on_request(
            methods::TOOLS_CALL,
            Arc::new(move |params| {
                let tools = tools.clone();
                Box::pin(async move {
                    let params = params.unwrap_or_else(|| json!({}));
                    let name = params
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ProtocolError::InvalidParams(
                                "Missing required parameter: name".to_string(),
                            )
                        })?
                        .to_string();
                    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

                    let handler = tools
                        .lock()
                        .expect("tools mutex poisoned")
                        .get(&name)
                        .map(|(_, handler)| handler.clone())
                        .ok_or_else(|| {
                            ProtocolError::ToolNotFound(format!("Tool not found: {name}"))
                        })?;
                    handler(arguments).await
                })
            }),
        );
    }

    /// Register a prompt backend; installs the `prompts/list` and
    /// `prompts/get` handlers on first use.
    pub fn register_prompt(&self, descriptor: PromptDescriptor, handler: PromptHandler) {
        let first = {
            let mut prompts = self.prompts.lock().expect("prompts mutex poisoned");
            let first = prompts.is_empty();
            prompts.insert(descriptor.id.clone(), (descriptor, handler));
            first
        };
        if !first {
            return;
        }

        let prompts = self.prompts.clone();
        self.engine.on_request(
            methods::PROMPTS_LIST,
            Arc::new(move |_params| {
                let prompts = prompts.clone();
                Box::pin(async move {
                    let descriptors: Vec<PromptDescriptor> = prompts
                        .lock()
                        .expect("prompts mutex poisoned")
                        .values()
                        .map(|(descriptor, _)| descriptor.clone())
                        .collect();
                    Ok(json!({"prompts": descriptors}))
                })
            }),
        );

        let prompts = self.prompts.clone();
        self.engine.on_request(
            methods::PROMPTS_GET,
            Arc::new(move |params| {
                let prompts = prompts.clone();
                Box::pin(async move {
                    let params = params.unwrap_or_else(|| json!({}));
                    let id = params
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            ProtocolError::InvalidParams(
                                "Missing required parameter: id".to_string(),
                            )
                        })?
                        .to_string();

                    let handler = prompts
                        .lock()
                        .expect("prompts mutex poisoned")
                        .get(&id)
                        .map(|(_, handler)| handler.clone())
                        .ok_or_else(|| {
                            ProtocolError::PromptNotFound(format!("Prompt not found: {id}"))
                        })?;
                    handler(params).await
                })
            }),
        );
    }

    /// Install a backend for inbound `sampling/sample` requests, gated on
    /// the client's declared `sampling` capability.
    pub fn set_sampling_handler(&self, handler: SamplingHandler) {
        let session = self.session.clone();
        self.engine.on_request(
            methods::SAMPLING_SAMPLE,
            Arc::new(move |params| {
                let session = session.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let supported = {
                        let state = session.lock().expect("session mutex poisoned");
                        state.client_capabilities.has("sampling")
                    };
                    if !supported {
                        return Err(ProtocolError::UnsupportedCapability(
                            "Client does not support sampling".to_string(),
                        ));
                    }
                    handler(params.unwrap_or_else(|| json!({}))).await
                })
            }),
        );
    }

    // Notification emitters. Each is a warn-and-skip no-op before the peer
    // completed initialization.

    /// `notifications/resources/updated` - skipped when nobody subscribed.
    pub async fn notify_resource_updated(&self, uri: &str) -> ProtocolResult<()> {
        if !self.initialized() {
            warn!("Cannot notify peer {}: not initialized", self.peer_id);
            return Ok(());
        }
        if self.subscribers_of(uri).is_empty() {
            debug!("No subscribers for resource: {uri}");
            return Ok(());
        }
        self.engine
            .send_notification(methods::NOTIFY_RESOURCE_UPDATED, Some(json!({"uri": uri})))
            .await
    }

    /// `notifications/resources/list_changed`
    pub async fn notify_resources_changed(&self) -> ProtocolResult<()> {
        if !self.initialized() {
            warn!("Cannot notify peer {}: not initialized", self.peer_id);
            return Ok(());
        }
        self.engine
            .send_notification(methods::NOTIFY_RESOURCES_CHANGED, Some(json!({})))
            .await
    }

    /// `notifications/tools/list_changed`
    pub async fn notify_tools_changed(&self) -> ProtocolResult<()> {
        if !self.initialized() {
            warn!("Cannot notify peer {}: not initialized", self.peer_id);
            return Ok(());
        }
        self.engine
            .send_notification(methods::NOTIFY_TOOLS_CHANGED, Some(json!({})))
            .await
    }

    /// `notifications/prompts/list_changed`
    pub async fn notify_prompts_changed(&self) -> ProtocolResult<()> {
        if !self.initialized() {
            warn!("Cannot notify peer {}: not initialized", self.peer_id);
            return Ok(());
        }
        self.engine
            .send_notification(methods::NOTIFY_PROMPTS_CHANGED, Some(json!({})))
            .await
    }

    /// Elicit a completion from the client, reversed sampling direction.
    pub async fn sample(&self, request: Value) -> ProtocolResult<Value> {
        if !self.client_has_capability("sampling") {
            return Err(ProtocolError::UnsupportedCapability(
                "Client does not support sampling".to_string(),
            ));
        }
        self.engine
            .send_request(methods::SAMPLING_SAMPLE, Some(request))
            .await
    }

    // Brokered traffic toward the client.

    /// Forward a request envelope verbatim and return the full response
    /// envelope.
    pub async fn forward_request(&self, envelope: Value) -> ProtocolResult<Value> {
        if !self.initialized() {
            return Err(ProtocolError::Protocol(format!(
                "Client {} is not initialized",
                self.peer_id
            )));
        }
        self.engine.forward_request(envelope).await
    }

    /// Forward a notification envelope verbatim.
    pub async fn forward_notification(&self, envelope: Value) -> ProtocolResult<()> {
        if !self.initialized() {
            return Err(ProtocolError::Protocol(format!(
                "Client {} is not initialized",
                self.peer_id
            )));
        }
        self.engine.forward_notification(envelope).await
    }

    /// Fail all outstanding requests and reset the session.
    pub fn connection_lost(&self, reason: &str) {
        self.engine.fail_pending(reason);
        let mut state = self.session.lock().expect("session mutex poisoned");
        *state = SessionState::default();
        self.subscriptions
            .lock()
            .expect("subscriptions mutex poisoned")
            .clear();
    }
}

fn required_uri(params: Option<Value>) -> ProtocolResult<String> {
    params
        .as_ref()
        .and_then(|params| params.get("uri"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| ProtocolError::InvalidParams("Missing required parameter: uri".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_transport::testing::LoopbackTransport;
    use pretty_assertions::assert_eq;

    fn server() -> (Arc<McpServer>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let server = McpServer::bind(
            transport.clone(),
            Implementation::new("Nexus MCP Hub", "0.4.0"),
            Capabilities::hub(),
            "client-1",
        );
        (server, transport)
    }

    async fn handshake(server: &Arc<McpServer>) {
        let init = json!({
            "jsonrpc": "2.0", "id": "1", "method": "initialize",
            "params": {
                "clientInfo": {"name": "test-client", "version": "1.0"},
                "capabilities": {"sampling": true, "resources": {"subscriptions": true}}
            }
        });
        let reply = server
            .engine()
            .handle_frame(init.to_string().as_bytes())
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["result"]["serverInfo"]["name"], json!("Nexus MCP Hub"));

        server
            .engine()
            .handle_frame(br#"{"jsonrpc":"2.0","method":"initialized"}"#)
            .await;
        assert!(server.initialized());
    }

    #[tokio::test]
    async fn initialize_then_initialized_flips_the_flag() {
        let (server, _transport) = server();
        assert!(!server.initialized());
        handshake(&server).await;
        assert_eq!(server.client_info().unwrap().name, "test-client");
        assert!(server.client_has_capability("sampling"));
    }

    #[tokio::test]
    async fn double_initialize_is_a_protocol_error() {
        let (server, _transport) = server();
        handshake(&server).await;

        let init = json!({
            "jsonrpc": "2.0", "id": "2", "method": "initialize",
            "params": {"clientInfo": {"name": "again", "version": "1.0"}, "capabilities": {}}
        });
        let reply = server
            .engine()
            .handle_frame(init.to_string().as_bytes())
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32000));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (server, _transport) = server();
        handshake(&server).await;

        for id in ["10", "11"] {
            let frame = json!({"jsonrpc": "2.0", "id": id, "method": "shutdown", "params": {}});
            let reply = server
                .engine()
                .handle_frame(frame.to_string().as_bytes())
                .await
                .unwrap();
            let reply: Value = serde_json::from_str(&reply).unwrap();
            assert_eq!(reply["result"], json!({}));
        }
        assert!(!server.initialized());
    }

    #[tokio::test]
    async fn subscribe_tracks_the_peer_and_updated_notification_fires() {
        let (server, transport) = server();
        handshake(&server).await;

        let subscribe = json!({
            "jsonrpc": "2.0", "id": "3", "method": "resources/subscribe",
            "params": {"uri": "file:///a"}
        });
        server
            .engine()
            .handle_frame(subscribe.to_string().as_bytes())
            .await
            .unwrap();
        assert!(server.subscribers_of("file:///a").contains("client-1"));

        server.notify_resource_updated("file:///a").await.unwrap();
        let sent = transport.next_sent().await;
        let sent: Value = serde_json::from_slice(&sent).unwrap();
        assert_eq!(sent["method"], json!("notifications/resources/updated"));
        assert_eq!(sent["params"]["uri"], json!("file:///a"));
    }

    #[tokio::test]
    async fn updated_notification_skipped_without_subscribers() {
        let (server, transport) = server();
        handshake(&server).await;

        server.notify_resource_updated("file:///b").await.unwrap();
        assert!(transport.sent_is_empty());
    }

    #[tokio::test]
    async fn tool_backend_serves_list_and_call() {
        let (server, _transport) = server();
        handshake(&server).await;

        server.register_tool(
            ToolDescriptor {
                name: "add".to_string(),
                description: Some("Add two numbers".to_string()),
                input_schema: json!({"type": "object"}),
            },
            Arc::new(|arguments| {
                Box::pin(async move {
                    let a = arguments["a"].as_i64().unwrap_or(0);
                    let b = arguments["b"].as_i64().unwrap_or(0);
                    Ok(json!({"sum": a + b}))
                })
            }),
        );

        let call = json!({
            "jsonrpc": "2.0", "id": "4", "method": "tools/call",
            "params": {"name": "add", "arguments": {"a": 1, "b": 2}}
        });
        let reply = server
            .engine()
            .handle_frame(call.to_string().as_bytes())
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["result"], json!({"sum": 3}));

        let missing = json!({
            "jsonrpc": "2.0", "id": "5", "method": "tools/call",
            "params": {"name": "does-not-exist", "arguments": {}}
        });
        let reply = server
            .engine()
            .handle_frame(missing.to_string().as_bytes())
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32004));
    }

    #[tokio::test]
    async fn sample_requires_the_client_capability() {
        let (server, _transport) = server();

        // Not initialized yet: capability checks all fail.
        let err = server.sample(json!({"prompt": "hi"})).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCapability(_)));
    }
}
