//! Connection to one supervised MCP server.
//!
//! Owns the client-role protocol instance. The status walks
//! `disconnected -> connecting -> connected -> initializing -> ready`;
//! failures land in `connection_failed`, `initialization_failed`, or
//! `error`. Initialization caches the server's advertised resources,
//! tools, and prompts under their canonical keys.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use nexus_protocol::{
    Capabilities, Implementation, McpClient, NotificationFallback, PromptDescriptor,
    ProtocolError, RequestFallback, ResourceDescriptor, ToolDescriptor,
};
use nexus_transport::Transport;

use crate::error::{HubError, HubResult};
use crate::registry::ServerSpec;

/// Builds the router hooks for a server connection, given its id:
/// a request fallback and a notification fallback for server-initiated
/// traffic.
pub type ServerFallbackFactory =
    Arc<dyn Fn(String) -> (RequestFallback, NotificationFallback) + Send + Sync>;

/// Connection status of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No transport
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Transport up, handshake not yet run
    Connected,
    /// MCP handshake in progress
    Initializing,
    /// Handshake complete, catalogs cached
    Ready,
    /// Transport connect failed
    ConnectionFailed,
    /// Handshake failed
    InitializationFailed,
    /// Teardown failure
    Error,
}

struct ConnectionInner {
    status: ConnectionStatus,
    error: Option<String>,
    clients: HashSet<String>,
    connect_time: Option<DateTime<Utc>>,
    disconnect_time: Option<DateTime<Utc>>,
}

/// The connection object for one supervised server.
pub struct ServerConnection {
    server_id: String,
    spec: ServerSpec,
    hub_info: Implementation,
    request_timeout: Duration,
    fallback_factory: Option<ServerFallbackFactory>,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    client: StdMutex<Option<Arc<McpClient>>>,
    inner: StdMutex<ConnectionInner>,
    resources: StdMutex<HashMap<String, ResourceDescriptor>>,
    tools: StdMutex<HashMap<String, ToolDescriptor>>,
    prompts: StdMutex<HashMap<String, PromptDescriptor>>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server_id", &self.server_id)
            .field("status", &self.status())
            .finish()
    }
}

impl ServerConnection {
    /// Create a connection in `disconnected` state.
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        spec: ServerSpec,
        hub_info: Implementation,
        request_timeout: Duration,
        fallback_factory: Option<ServerFallbackFactory>,
    ) -> Self {
        let server_id = server_id.into();
        info!("Created MCP server connection for {server_id}");
        Self {
            server_id,
            spec,
            hub_info,
            request_timeout,
            fallback_factory,
            transport: StdMutex::new(None),
            client: StdMutex::new(None),
            inner: StdMutex::new(ConnectionInner {
                status: ConnectionStatus::Disconnected,
                error: None,
                clients: HashSet::new(),
                connect_time: None,
                disconnect_time: None,
            }),
            resources: StdMutex::new(HashMap::new()),
            tools: StdMutex::new(HashMap::new()),
            prompts: StdMutex::new(HashMap::new()),
        }
    }

    /// The server id this connection serves.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().expect("connection mutex poisoned").status
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.inner.lock().expect("connection mutex poisoned").status = status;
    }

    fn set_failure(&self, status: ConnectionStatus, reason: String) {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        inner.status = status;
        inner.error = Some(reason);
    }

    fn protocol(&self) -> Option<Arc<McpClient>> {
        self.client.lock().expect("connection mutex poisoned").clone()
    }

    fn ready_protocol(&self) -> HubResult<Arc<McpClient>> {
        let client = self.protocol().ok_or_else(|| {
            HubError::InvalidState(format!("Server {} is not connected", self.server_id))
        })?;
        if !client.initialized() {
            return Err(HubError::InvalidState(format!(
                "Server {} is not initialized",
                self.server_id
            )));
        }
        Ok(client)
    }

    async fn with_timeout<T>(
        &self,
        operation: impl Future<Output = Result<T, ProtocolError>>,
    ) -> Result<T, ProtocolError> {
        match tokio::time::timeout(self.request_timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::Timeout(self.request_timeout)),
        }
    }

    /// Attach the prepared transport and dial it.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> HubResult<()> {
        if matches!(
            self.status(),
            ConnectionStatus::Connected | ConnectionStatus::Ready
        ) {
            warn!("MCP server {} is already connected", self.server_id);
            return Ok(());
        }

        info!("Connecting to MCP server: {}", self.server_id);
        self.set_status(ConnectionStatus::Connecting);

        let client = McpClient::bind(transport.clone(), self.hub_info.clone());
        if let Some(factory) = &self.fallback_factory {
            let (request_fallback, notification_fallback) = factory(self.server_id.clone());
            client.engine().set_request_fallback(request_fallback);
            client.set_notification_fallback(notification_fallback);
        }

        if let Err(connect_error) = transport.connect().await {
            error!(
                "Failed to connect to MCP server {}: {connect_error}",
                self.server_id
            );
            self.set_failure(ConnectionStatus::ConnectionFailed, connect_error.to_string());
            return Err(connect_error.into());
        }

        *self.transport.lock().expect("connection mutex poisoned") = Some(transport);
        *self.client.lock().expect("connection mutex poisoned") = Some(client);
        {
            let mut inner = self.inner.lock().expect("connection mutex poisoned");
            inner.status = ConnectionStatus::Connected;
            inner.connect_time = Some(Utc::now());
            inner.error = None;
        }
        info!("Connected to MCP server: {}", self.server_id);
        Ok(())
    }

    /// Run the MCP handshake and cache the server's catalogs.
    pub async fn initialize(&self) -> HubResult<()> {
        let client = self.protocol().ok_or_else(|| {
            HubError::InvalidState(format!("Server {} is not connected", self.server_id))
        })?;
        if client.initialized() {
            warn!("MCP server {} is already initialized", self.server_id);
            return Ok(());
        }

        info!("Initializing MCP server: {}", self.server_id);
        self.set_status(ConnectionStatus::Initializing);

        if let Err(handshake_error) = self
            .with_timeout(client.initialize(Capabilities::hub()))
            .await
        {
            error!(
                "Failed to initialize MCP server {}: {handshake_error}",
                self.server_id
            );
            self.set_failure(
                ConnectionStatus::InitializationFailed,
                handshake_error.to_string(),
            );
            return Err(handshake_error.into());
        }

        self.load_catalogs(&client).await;
        self.set_status(ConnectionStatus::Ready);
        info!("Initialized MCP server: {}", self.server_id);
        Ok(())
    }

    /// Fetch resources, tools, and prompts, each guarded by its
    /// capability. Failures are logged, not fatal.
    async fn load_catalogs(&self, client: &Arc<McpClient>) {
        if client.has_capability("resources") {
            match self.with_timeout(client.list_resources()).await {
                Ok(resources) => {
                    let mut cache = self.resources.lock().expect("connection mutex poisoned");
                    *cache = resources
                        .into_iter()
                        .map(|resource| (resource.uri.clone(), resource))
                        .collect();
                    debug!(
                        "Loaded {} resource(s) from MCP server {}",
                        cache.len(),
                        self.server_id
                    );
                }
                Err(list_error) => error!(
                    "Failed to load resources from MCP server {}: {list_error}",
                    self.server_id
                ),
            }
        }

        if client.has_capability("tools") {
            match self.with_timeout(client.list_tools()).await {
                Ok(tools) => {
                    let mut cache = self.tools.lock().expect("connection mutex poisoned");
                    *cache = tools
                        .into_iter()
                        .map(|tool| (tool.name.clone(), tool))
                        .collect();
                    debug!(
                        "Loaded {} tool(s) from MCP server {}",
                        cache.len(),
                        self.server_id
                    );
                }
                Err(list_error) => error!(
                    "Failed to load tools from MCP server {}: {list_error}",
                    self.server_id
                ),
            }
        }

        if client.has_capability("prompts") {
            match self.with_timeout(client.list_prompts()).await {
                Ok(prompts) => {
                    let mut cache = self.prompts.lock().expect("connection mutex poisoned");
                    *cache = prompts
                        .into_iter()
                        .map(|prompt| (prompt.id.clone(), prompt))
                        .collect();
                    debug!(
                        "Loaded {} prompt(s) from MCP server {}",
                        cache.len(),
                        self.server_id
                    );
                }
                Err(list_error) => error!(
                    "Failed to load prompts from MCP server {}: {list_error}",
                    self.server_id
                ),
            }
        }
    }

    /// Tear the connection down. Best-effort MCP shutdown, then transport
    /// teardown and cache clearing. Safe to call in any state.
    pub async fn disconnect(&self) {
        let client = self.client.lock().expect("connection mutex poisoned").take();
        let transport = self
            .transport
            .lock()
            .expect("connection mutex poisoned")
            .take();

        if client.is_none() && transport.is_none() {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }

        info!("Disconnecting from MCP server: {}", self.server_id);
        if let Some(client) = &client {
            if client.initialized() {
                if let Err(shutdown_error) = self.with_timeout(client.shutdown()).await {
                    warn!(
                        "MCP shutdown of server {} failed: {shutdown_error}",
                        self.server_id
                    );
                }
            }
            client.connection_lost("disconnecting");
        }

        if let Some(transport) = transport {
            if let Err(transport_error) = transport.disconnect().await {
                warn!(
                    "Error closing transport of server {}: {transport_error}",
                    self.server_id
                );
                self.set_failure(ConnectionStatus::Error, transport_error.to_string());
            }
        }

        self.resources
            .lock()
            .expect("connection mutex poisoned")
            .clear();
        self.tools.lock().expect("connection mutex poisoned").clear();
        self.prompts
            .lock()
            .expect("connection mutex poisoned")
            .clear();

        {
            let mut inner = self.inner.lock().expect("connection mutex poisoned");
            if inner.status != ConnectionStatus::Error {
                inner.status = ConnectionStatus::Disconnected;
            }
            inner.disconnect_time = Some(Utc::now());
        }
        info!("Disconnected from MCP server: {}", self.server_id);
    }

    /// Whether the negotiated tree has the capability.
    #[must_use]
    pub fn has_capability(&self, path: &str) -> bool {
        self.protocol()
            .is_some_and(|client| client.has_capability(path))
    }

    /// The negotiated capability tree.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.protocol()
            .map(|client| client.server_capabilities())
            .unwrap_or_default()
    }

    /// Whether the handshake completed.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.protocol().is_some_and(|client| client.initialized())
    }

    /// Bind a client id to this server.
    pub fn add_client(&self, client_id: &str) {
        self.inner
            .lock()
            .expect("connection mutex poisoned")
            .clients
            .insert(client_id.to_string());
        debug!(
            "Added client {client_id} to MCP server {}",
            self.server_id
        );
    }

    /// Unbind a client id.
    pub fn remove_client(&self, client_id: &str) {
        self.inner
            .lock()
            .expect("connection mutex poisoned")
            .clients
            .remove(client_id);
        debug!(
            "Removed client {client_id} from MCP server {}",
            self.server_id
        );
    }

    /// Cached resource descriptors by URI.
    #[must_use]
    pub fn resources(&self) -> HashMap<String, ResourceDescriptor> {
        self.resources
            .lock()
            .expect("connection mutex poisoned")
            .clone()
    }

    /// Cached tool descriptors by name.
    #[must_use]
    pub fn tools(&self) -> HashMap<String, ToolDescriptor> {
        self.tools.lock().expect("connection mutex poisoned").clone()
    }

    /// Cached prompt descriptors by id.
    #[must_use]
    pub fn prompts(&self) -> HashMap<String, PromptDescriptor> {
        self.prompts
            .lock()
            .expect("connection mutex poisoned")
            .clone()
    }

    /// Status report for the administrative surface.
    #[must_use]
    pub fn status_report(&self) -> Value {
        let inner = self.inner.lock().expect("connection mutex poisoned");
        let initialized = self.initialized();
        let mut report = json!({
            "id": self.server_id,
            "name": self.spec.name,
            "connected": matches!(
                inner.status,
                ConnectionStatus::Connected
                    | ConnectionStatus::Initializing
                    | ConnectionStatus::Ready
            ),
            "initialized": initialized,
            "status": inner.status,
            "client_count": inner.clients.len(),
            "connect_time": inner.connect_time,
            "disconnect_time": inner.disconnect_time,
        });
        if let Some(error) = &inner.error {
            report["error"] = json!(error);
        }
        drop(inner);
        if initialized {
            report["capabilities"] = self.capabilities().as_value().clone();
            report["resources"] = json!(self.resources.lock().expect("connection mutex poisoned").len());
            report["tools"] = json!(self.tools.lock().expect("connection mutex poisoned").len());
            report["prompts"] = json!(self.prompts.lock().expect("connection mutex poisoned").len());
        }
        report
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> HubResult<Vec<Value>> {
        let client = self.ready_protocol()?;
        Ok(self.with_timeout(client.read_resource(uri)).await?)
    }

    /// Call a tool by name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> HubResult<Value> {
        let client = self.ready_protocol()?;
        Ok(self.with_timeout(client.call_tool(name, arguments)).await?)
    }

    /// Fetch a prompt by id.
    pub async fn get_prompt(&self, id: &str) -> HubResult<Value> {
        let client = self.ready_protocol()?;
        Ok(self.with_timeout(client.get_prompt(id)).await?)
    }

    /// Elicit a completion from the server.
    pub async fn sample(&self, request: Value) -> HubResult<Value> {
        let client = self.ready_protocol()?;
        Ok(self.with_timeout(client.sample(request)).await?)
    }

    /// Forward an envelope verbatim; `None` for notifications.
    pub async fn forward(&self, message: Value) -> HubResult<Option<Value>> {
        let client = self.ready_protocol()?;
        if message.get("id").is_some() {
            let response = self.with_timeout(client.forward_request(message)).await?;
            Ok(Some(response))
        } else {
            client.forward_notification(message).await?;
            Ok(None)
        }
    }
}
