//! Remote client connections.
//!
//! Each remote client gets a fresh UUID id and a server-role protocol
//! session over its transport. Disconnection keeps the record for a
//! 60-second grace window so a reconnecting client carrying the same id
//! can re-attach; the purge task removes it afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use nexus_protocol::{Capabilities, Implementation, McpServer, RequestFallback};
use nexus_transport::Transport;

use crate::error::{HubError, HubResult};

/// How long a disconnected client record lingers before it is purged.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(60);

/// Builds the request fallback for a freshly connected client, given its
/// id. The hub wires this to the router.
pub type ClientFallbackFactory = Arc<dyn Fn(String) -> RequestFallback + Send + Sync>;

/// Connection status of a remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Transport connect in progress
    Connecting,
    /// Transport connected, frames pumping
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Disconnected; record lingers for the grace window
    Disconnected,
    /// Transport connect failed
    ConnectionFailed,
}

struct ClientInner {
    status: ClientStatus,
    error: Option<String>,
    servers: HashSet<String>,
    connect_time: Option<DateTime<Utc>>,
    disconnect_time: Option<DateTime<Utc>>,
}

/// One remote client: transport, server-role session, bookkeeping.
pub struct ClientConnection {
    client_id: String,
    transport: StdMutex<Arc<dyn Transport>>,
    session: StdMutex<Arc<McpServer>>,
    inner: StdMutex<ClientInner>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("client_id", &self.client_id)
            .field("status", &self.status())
            .finish()
    }
}

impl ClientConnection {
    fn new(client_id: String, transport: Arc<dyn Transport>, session: Arc<McpServer>) -> Self {
        Self {
            client_id,
            transport: StdMutex::new(transport),
            session: StdMutex::new(session),
            inner: StdMutex::new(ClientInner {
                status: ClientStatus::Connecting,
                error: None,
                servers: HashSet::new(),
                connect_time: None,
                disconnect_time: None,
            }),
        }
    }

    /// The opaque client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ClientStatus {
        self.inner.lock().expect("client mutex poisoned").status
    }

    fn set_status(&self, status: ClientStatus) {
        self.inner.lock().expect("client mutex poisoned").status = status;
    }

    /// The server-role protocol session.
    #[must_use]
    pub fn session(&self) -> Arc<McpServer> {
        self.session.lock().expect("client mutex poisoned").clone()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.lock().expect("client mutex poisoned").clone()
    }

    /// Whether the MCP handshake completed.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.session().initialized()
    }

    /// Bind the client to a server id.
    pub fn add_server(&self, server_id: &str) {
        self.inner
            .lock()
            .expect("client mutex poisoned")
            .servers
            .insert(server_id.to_string());
    }

    /// Unbind the client from a server id.
    pub fn remove_server(&self, server_id: &str) {
        self.inner
            .lock()
            .expect("client mutex poisoned")
            .servers
            .remove(server_id);
    }

    /// Status report for the administrative surface.
    #[must_use]
    pub fn status_report(&self) -> Value {
        let inner = self.inner.lock().expect("client mutex poisoned");
        let session = self.session();
        let mut report = json!({
            "id": self.client_id,
            "status": inner.status,
            "connected": matches!(inner.status, ClientStatus::Connected),
            "initialized": session.initialized(),
            "servers": inner.servers.iter().cloned().collect::<Vec<_>>(),
            "connect_time": inner.connect_time,
            "disconnect_time": inner.disconnect_time,
        });
        if let Some(error) = &inner.error {
            report["error"] = json!(error);
        }
        if let Some(info) = session.client_info() {
            report["client_info"] = json!(info);
        }
        report
    }
}

/// The live client store.
pub struct ClientRegistry {
    hub_info: Implementation,
    clients: StdMutex<HashMap<String, Arc<ClientConnection>>>,
    fallback_factory: StdMutex<Option<ClientFallbackFactory>>,
    grace: Duration,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.count())
            .finish()
    }
}

impl ClientRegistry {
    /// Create a registry advertising the given hub identity.
    #[must_use]
    pub fn new(hub_info: Implementation) -> Arc<Self> {
        Arc::new(Self {
            hub_info,
            clients: StdMutex::new(HashMap::new()),
            fallback_factory: StdMutex::new(None),
            grace: DISCONNECT_GRACE,
        })
    }

    /// Registry with a custom grace window, for tests.
    #[must_use]
    pub fn with_grace(hub_info: Implementation, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            hub_info,
            clients: StdMutex::new(HashMap::new()),
            fallback_factory: StdMutex::new(None),
            grace,
        })
    }

    /// Install the factory producing each client session's request
    /// fallback. Wired once by the hub.
    pub fn set_fallback_factory(&self, factory: ClientFallbackFactory) {
        *self
            .fallback_factory
            .lock()
            .expect("factory mutex poisoned") = Some(factory);
    }

    fn build_session(
        self: &Arc<Self>,
        client_id: &str,
        transport: &Arc<dyn Transport>,
    ) -> Arc<McpServer> {
        let session = McpServer::bind(
            transport.clone(),
            self.hub_info.clone(),
            Capabilities::hub(),
            client_id,
        );

        let factory = self
            .fallback_factory
            .lock()
            .expect("factory mutex poisoned")
            .clone();
        if let Some(factory) = factory {
            session.set_request_fallback(factory(client_id.to_string()));
        }

        let registry = Arc::downgrade(self);
        let exit_id = client_id.to_string();
        session.set_exit_handler(Arc::new(move || {
            let registry = registry.clone();
            let client_id = exit_id.clone();
            Box::pin(async move {
                // Tear down outside the transport's read task; disconnect
                // aborts that task and must not cancel itself mid-way.
                tokio::spawn(async move {
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    if let Err(disconnect_error) = registry.disconnect(&client_id).await {
                        warn!("Exit-driven disconnect of {client_id} failed: {disconnect_error}");
                    }
                });
            })
        }));

        session
    }

    /// Connect a new client over a transport. Returns the fresh client id.
    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> HubResult<String> {
        let client_id = Uuid::new_v4().to_string();
        let session = self.build_session(&client_id, &transport);
        let connection = Arc::new(ClientConnection::new(
            client_id.clone(),
            transport.clone(),
            session,
        ));
        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .insert(client_id.clone(), connection.clone());
        info!("Created MCP client connection: {client_id}");

        match transport.connect().await {
            Ok(()) => {
                let mut inner = connection.inner.lock().expect("client mutex poisoned");
                inner.status = ClientStatus::Connected;
                inner.connect_time = Some(Utc::now());
                drop(inner);
                info!("Connected to MCP client: {client_id}");
                Ok(client_id)
            }
            Err(connect_error) => {
                let mut inner = connection.inner.lock().expect("client mutex poisoned");
                inner.status = ClientStatus::ConnectionFailed;
                inner.error = Some(connect_error.to_string());
                drop(inner);
                Err(connect_error.into())
            }
        }
    }

    /// Re-attach a client within the grace window, binding a new
    /// transport under the same id.
    pub async fn reattach(
        self: &Arc<Self>,
        client_id: &str,
        transport: Arc<dyn Transport>,
    ) -> HubResult<()> {
        let connection = self
            .get(client_id)
            .ok_or_else(|| HubError::NotFound(format!("Client not found: {client_id}")))?;
        if connection.status() != ClientStatus::Disconnected {
            return Err(HubError::InvalidState(format!(
                "Client {client_id} is not awaiting re-attachment"
            )));
        }

        let session = self.build_session(client_id, &transport);
        transport.connect().await?;

        *connection.transport.lock().expect("client mutex poisoned") = transport;
        *connection.session.lock().expect("client mutex poisoned") = session;
        let mut inner = connection.inner.lock().expect("client mutex poisoned");
        inner.status = ClientStatus::Connected;
        inner.connect_time = Some(Utc::now());
        inner.disconnect_time = None;
        inner.error = None;
        drop(inner);

        info!("Re-attached MCP client: {client_id}");
        Ok(())
    }

    /// Disconnect a client and schedule its purge after the grace window.
    pub async fn disconnect(self: &Arc<Self>, client_id: &str) -> HubResult<bool> {
        let Some(connection) = self.get(client_id) else {
            warn!("Cannot disconnect client: {client_id} not found");
            return Ok(false);
        };

        connection.set_status(ClientStatus::Disconnecting);
        if let Err(transport_error) = connection.transport().disconnect().await {
            warn!("Error closing transport of client {client_id}: {transport_error}");
        }
        connection.session().connection_lost("client disconnected");

        {
            let mut inner = connection.inner.lock().expect("client mutex poisoned");
            inner.status = ClientStatus::Disconnected;
            inner.disconnect_time = Some(Utc::now());
        }
        info!("Disconnected MCP client: {client_id}");

        // Purge after the grace window unless the client re-attached.
        let registry = Arc::downgrade(self);
        let purge_id = client_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut clients = registry.clients.lock().expect("clients mutex poisoned");
            let still_disconnected = clients
                .get(&purge_id)
                .is_some_and(|connection| connection.status() == ClientStatus::Disconnected);
            if still_disconnected {
                clients.remove(&purge_id);
                debug!("Purged disconnected client: {purge_id}");
            }
        });

        Ok(true)
    }

    /// Look up a client.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<ClientConnection>> {
        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .get(client_id)
            .cloned()
    }

    /// Every live client connection, in id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        let mut connections: Vec<Arc<ClientConnection>> = self
            .clients
            .lock()
            .expect("clients mutex poisoned")
            .values()
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        connections
    }

    /// Number of tracked client records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.lock().expect("clients mutex poisoned").len()
    }

    /// Number of clients that completed the MCP handshake.
    #[must_use]
    pub fn initialized_count(&self) -> usize {
        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .values()
            .filter(|connection| connection.initialized())
            .count()
    }

    /// Status reports for every client.
    #[must_use]
    pub fn status_reports(&self) -> Vec<Value> {
        self.all()
            .into_iter()
            .map(|connection| connection.status_report())
            .collect()
    }

    fn require(&self, client_id: &str) -> HubResult<Arc<ClientConnection>> {
        self.get(client_id)
            .ok_or_else(|| HubError::NotFound(format!("Client not found: {client_id}")))
    }

    /// Forward an envelope to a client; `None` for notifications.
    pub async fn forward(&self, client_id: &str, message: Value) -> HubResult<Option<Value>> {
        let connection = self.require(client_id)?;
        let session = connection.session();
        if message.get("id").is_some() {
            Ok(Some(session.forward_request(message).await?))
        } else {
            session.forward_notification(message).await?;
            Ok(None)
        }
    }

    /// `notifications/resources/updated` toward one client.
    pub async fn notify_resource_updated(&self, client_id: &str, uri: &str) -> HubResult<()> {
        let connection = self.require(client_id)?;
        connection.session().notify_resource_updated(uri).await?;
        Ok(())
    }

    /// `notifications/resources/list_changed` toward one client.
    pub async fn notify_resources_changed(&self, client_id: &str) -> HubResult<()> {
        let connection = self.require(client_id)?;
        connection.session().notify_resources_changed().await?;
        Ok(())
    }

    /// `notifications/tools/list_changed` toward one client.
    pub async fn notify_tools_changed(&self, client_id: &str) -> HubResult<()> {
        let connection = self.require(client_id)?;
        connection.session().notify_tools_changed().await?;
        Ok(())
    }

    /// `notifications/prompts/list_changed` toward one client.
    pub async fn notify_prompts_changed(&self, client_id: &str) -> HubResult<()> {
        let connection = self.require(client_id)?;
        connection.session().notify_prompts_changed().await?;
        Ok(())
    }

    /// Elicit a completion from one client.
    pub async fn sample(&self, client_id: &str, request: Value) -> HubResult<Value> {
        let connection = self.require(client_id)?;
        Ok(connection.session().sample(request).await?)
    }

    /// Disconnect every client; used at hub shutdown.
    pub async fn disconnect_all(self: &Arc<Self>) {
        let ids: Vec<String> = self
            .clients
            .lock()
            .expect("clients mutex poisoned")
            .keys()
            .cloned()
            .collect();
        for client_id in ids {
            if let Err(disconnect_error) = self.disconnect(&client_id).await {
                warn!("Error disconnecting client {client_id}: {disconnect_error}");
            }
        }
    }
}
