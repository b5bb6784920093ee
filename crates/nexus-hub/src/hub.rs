//! The hub facade.
//!
//! Composes the registry, supervisor, client registry, router, and
//! security subsystems, and exposes the token-gated operations the
//! administrative surface maps 1:1. The router's destination handlers are
//! closures over the subsystem handles, registered once at construction;
//! the hub-directed handler holds a weak reference back, so there are no
//! ownership cycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use nexus_protocol::{ErrorCode, Implementation, JsonRpcError, JsonRpcResponse, RequestId};
use nexus_transport::{HttpSseTransport, StdioTransport, Transport, TransportKind};

use crate::clients::ClientRegistry;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::metrics::HubMetrics;
use crate::registry::{ServerRegistry, ServerSpec};
use crate::router::{MessageRouter, Route, RouteKind, RouteTarget};
use crate::security::{
    AccessControl, AclResource, ApiKeyProvider, AuthManager, Credentials, PasswordProvider,
    Permission, ResourceKind, UserProfile,
};
use crate::supervisor::{ServerConnection, Supervisor};

/// The central hub.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ServerRegistry>,
    supervisor: Arc<Supervisor>,
    clients: Arc<ClientRegistry>,
    router: Arc<MessageRouter>,
    auth: Arc<AuthManager>,
    acl: Arc<AccessControl>,
    metrics: Arc<HubMetrics>,
    running: AtomicBool,
    metrics_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Hub {
    /// Build a hub from configuration. Stores are opened and subsystems
    /// wired; nothing starts until [`Hub::start`].
    pub fn new(config: HubConfig) -> HubResult<Arc<Self>> {
        let hub_info = Implementation::new(&config.hub.name, &config.hub.version);

        let registry = Arc::new(ServerRegistry::new(config.hub.registry_file.clone())?);
        let supervisor = Supervisor::new(
            registry.clone(),
            config.servers.clone(),
            config.hub.process_registry_file.clone(),
            hub_info.clone(),
            config.hub.allowed_origins.clone(),
        )?;
        let clients = ClientRegistry::new(hub_info);
        let router = Arc::new(MessageRouter::new());
        let acl = Arc::new(AccessControl::new(config.security.roles_file.clone())?);

        let mut auth = AuthManager::new();
        auth.register_provider(Arc::new(PasswordProvider::new(
            config.security.users_file.clone(),
            config.security.bearer_tokens_file.clone(),
            config.security.token_lifetime,
        )?));
        auth.register_provider(Arc::new(ApiKeyProvider::new(
            config.security.tokens_file.clone(),
        )?));

        let hub = Arc::new(Self {
            config,
            registry,
            supervisor,
            clients,
            router,
            auth: Arc::new(auth),
            acl,
            metrics: Arc::new(HubMetrics::new()),
            running: AtomicBool::new(false),
            metrics_task: TokioMutex::new(None),
        });
        hub.wire_router();
        hub.wire_connection_fallbacks();
        info!("Hub initialized");
        Ok(hub)
    }

    // Wiring

    fn wire_router(self: &Arc<Self>) {
        let supervisor = self.supervisor.clone();
        self.router.register_handler(
            RouteKind::Server,
            Arc::new(move |message, _source, destination| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    let server_id = destination.target_id.ok_or_else(|| {
                        HubError::InvalidRequest("Server destination has no id".to_string())
                    })?;
                    let connection = supervisor.connection(&server_id).ok_or_else(|| {
                        HubError::NotFound(format!("Server not connected: {server_id}"))
                    })?;
                    connection.forward(message).await
                })
            }),
        );

        let clients = self.clients.clone();
        self.router.register_handler(
            RouteKind::Client,
            Arc::new(move |message, _source, destination| {
                let clients = clients.clone();
                Box::pin(async move {
                    let client_id = destination.target_id.ok_or_else(|| {
                        HubError::InvalidRequest("Client destination has no id".to_string())
                    })?;
                    clients.forward(&client_id, message).await
                })
            }),
        );

        let weak = Arc::downgrade(self);
        self.router.register_handler(
            RouteKind::Hub,
            Arc::new(move |message, source, _destination| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(hub) = weak.upgrade() else {
                        return Err(HubError::Internal("Hub is shutting down".to_string()));
                    };
                    hub.handle_hub_method(&message, &source).await
                })
            }),
        );

        let supervisor = self.supervisor.clone();
        self.router.register_handler(
            RouteKind::AllServers,
            Arc::new(move |message, _source, _destination| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    broadcast_to_servers(supervisor.connections(), message).await
                })
            }),
        );

        let clients = self.clients.clone();
        self.router.register_handler(
            RouteKind::AllClients,
            Arc::new(move |message, _source, _destination| {
                let clients = clients.clone();
                Box::pin(async move { broadcast_to_clients(&clients, message).await })
            }),
        );

        let supervisor = self.supervisor.clone();
        self.router.register_handler(
            RouteKind::Capability,
            Arc::new(move |message, _source, destination| {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    let capability = destination.capability.ok_or_else(|| {
                        HubError::InvalidRequest(
                            "Capability destination has no capability path".to_string(),
                        )
                    })?;
                    let capable: Vec<Arc<ServerConnection>> = supervisor
                        .connections()
                        .into_iter()
                        .filter(|connection| connection.has_capability(&capability))
                        .collect();
                    if capable.is_empty() {
                        warn!("No servers found with capability: {capability}");
                    }
                    broadcast_to_servers(capable, message).await
                })
            }),
        );
    }

    /// Inbound traffic with no local handler flows into the router, with
    /// the concrete connection as its source. The factories hold the
    /// router weakly: the router's own destination handlers already hold
    /// the supervisor and client registry, and a strong reference back
    /// would close an ownership cycle.
    fn wire_connection_fallbacks(self: &Arc<Self>) {
        let router = Arc::downgrade(&self.router);
        let metrics = self.metrics.clone();
        self.clients.set_fallback_factory(Arc::new(move |client_id| {
            let router = router.clone();
            let metrics = metrics.clone();
            Arc::new(move |raw: Value| {
                let router = router.clone();
                let metrics = metrics.clone();
                let source = RouteTarget::client(client_id.clone());
                Box::pin(async move {
                    let Some(router) = router.upgrade() else {
                        return Ok(None);
                    };
                    metrics.count_routed_message();
                    Ok(router.route_message(raw, source).await)
                })
            })
        }));

        let router = Arc::downgrade(&self.router);
        let metrics = self.metrics.clone();
        self.supervisor
            .set_fallback_factory(Arc::new(move |server_id| {
                let request_router = router.clone();
                let request_metrics = metrics.clone();
                let request_id = server_id.clone();
                let request_fallback: nexus_protocol::RequestFallback =
                    Arc::new(move |raw: Value| {
                        let router = request_router.clone();
                        let metrics = request_metrics.clone();
                        let source = RouteTarget::server(request_id.clone());
                        Box::pin(async move {
                            let Some(router) = router.upgrade() else {
                                return Ok(None);
                            };
                            metrics.count_routed_message();
                            Ok(router.route_message(raw, source).await)
                        })
                    });

                let notification_router = router.clone();
                let notification_metrics = metrics.clone();
                let notification_fallback: nexus_protocol::NotificationFallback =
                    Arc::new(move |raw: Value| {
                        let router = notification_router.clone();
                        let metrics = notification_metrics.clone();
                        let source = RouteTarget::server(server_id.clone());
                        Box::pin(async move {
                            let Some(router) = router.upgrade() else {
                                return;
                            };
                            metrics.count_routed_message();
                            let _ = router.route_message(raw, source).await;
                        })
                    });

                (request_fallback, notification_fallback)
            }));
    }

    // Lifecycle

    /// Start the hub: supervisor monitor, metrics task, auto-start
    /// servers.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Hub is already running");
            return;
        }
        info!("Starting hub");

        self.supervisor.start().await;

        if self.config.servers.auto_start {
            for (server_id, spec) in self.registry.all() {
                if !spec.auto_start {
                    continue;
                }
                info!("Auto-starting server: {server_id}");
                if let Err(start_error) = self.supervisor.start_server(&server_id).await {
                    error!("Failed to auto-start server {server_id}: {start_error}");
                }
            }
        }

        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.monitoring.metrics_interval.max(1));
        let metrics_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(hub) = weak.upgrade() else {
                    break;
                };
                if !hub.running.load(Ordering::SeqCst) {
                    break;
                }
                hub.metrics.refresh(
                    hub.registry.len(),
                    hub.supervisor.connection_count(),
                    hub.clients.count(),
                    hub.clients.initialized_count(),
                );
            }
        });
        *self.metrics_task.lock().await = Some(metrics_task);

        info!(
            "Hub started on {}:{}",
            self.config.hub.host, self.config.hub.port
        );
    }

    /// Stop the hub: servers, clients, background tasks.
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Hub is not running");
            return;
        }
        info!("Stopping hub");

        if let Some(task) = self.metrics_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        self.clients.disconnect_all().await;
        self.supervisor.stop().await;
        info!("Hub stopped");
    }

    /// Whether the hub is running. The liveness probe.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // Authorization plumbing

    fn authorize(
        &self,
        token: &str,
        resource: AclResource,
        permission: Permission,
    ) -> HubResult<UserProfile> {
        let profile = self
            .auth
            .validate_token(token, None)
            .ok_or(HubError::Unauthorized)?;
        if !self.acl.has_permission(&profile.username, &resource, permission) {
            return Err(HubError::Forbidden(format!(
                "User {} lacks {permission:?} on {}:{}",
                profile.username,
                resource_kind_name(resource.kind),
                resource.id.as_deref().unwrap_or("*"),
            )));
        }
        Ok(profile)
    }

    // Public operations (no token)

    /// The hub status document, also served as `hub/status`.
    #[must_use]
    pub fn status(&self) -> Value {
        json!({
            "status": if self.is_running() { "running" } else { "stopped" },
            "server_count": self.registry.len(),
            "client_count": self.clients.count(),
            "mcp_server_count": self.supervisor.connection_count(),
            "mcp_client_count": self.clients.initialized_count(),
        })
    }

    /// Liveness probe.
    #[must_use]
    pub fn health(&self) -> Value {
        json!({
            "status": if self.is_running() { "healthy" } else { "unhealthy" },
            "uptime": self.metrics.uptime_secs(),
        })
    }

    /// Authenticate and issue a token.
    pub fn login(
        &self,
        credentials: &Credentials,
        provider: Option<&str>,
    ) -> HubResult<Value> {
        let profile = self
            .auth
            .authenticate(credentials, provider)
            .ok_or(HubError::Unauthorized)?;
        let token = self
            .auth
            .generate_token(&profile, provider)?
            .ok_or_else(|| HubError::Internal("No authentication provider".to_string()))?;
        Ok(json!({"token": token, "user": profile}))
    }

    /// Revoke a token.
    pub fn logout(&self, token: &str) -> bool {
        self.auth.revoke_token(token, None)
    }

    /// Resolve a token to its user, if valid.
    #[must_use]
    pub fn validate(&self, token: &str) -> Value {
        match self.auth.validate_token(token, None) {
            Some(profile) => json!({"valid": true, "user": profile}),
            None => json!({"valid": false}),
        }
    }

    // Server administration

    /// Register or update a server.
    pub fn register_server(&self, token: &str, server_id: &str, spec: ServerSpec) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Server),
            Permission::ServerCreate,
        )?;
        self.registry.register(server_id, spec)
    }

    /// Unregister a server, stopping it first when needed. Idempotent
    /// after the first call.
    pub async fn unregister_server(&self, token: &str, server_id: &str) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerDelete,
        )?;
        if self.supervisor.is_running(server_id).await {
            self.supervisor.stop_server(server_id).await?;
        }
        let removed = self.registry.unregister(server_id)?;
        if removed {
            self.supervisor.forget(server_id);
        }
        Ok(removed)
    }

    /// Status of every registered server.
    pub fn list_servers(&self, token: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Server),
            Permission::ServerView,
        )?;
        Ok(self.server_statuses())
    }

    /// Status of one server.
    pub fn get_server(&self, token: &str, server_id: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerView,
        )?;
        self.server_status(server_id)
            .ok_or_else(|| HubError::NotFound(format!("Server not found: {server_id}")))
    }

    /// Start a server process.
    pub async fn start_server(&self, token: &str, server_id: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerStart,
        )?;
        self.supervisor.start_server(server_id).await
    }

    /// Stop a server process.
    pub async fn stop_server(&self, token: &str, server_id: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerStop,
        )?;
        self.supervisor.stop_server(server_id).await
    }

    /// Restart a server process.
    pub async fn restart_server(&self, token: &str, server_id: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerStart,
        )?;
        self.supervisor.restart_server(server_id).await
    }

    /// Connect to a server without touching its process.
    pub async fn connect_server(&self, token: &str, server_id: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerModify,
        )?;
        self.supervisor.connect_server(server_id).await
    }

    /// Disconnect a server's connection.
    pub async fn disconnect_server(&self, token: &str, server_id: &str) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerModify,
        )?;
        self.supervisor.disconnect_server(server_id).await
    }

    /// Reconnect a server's connection.
    pub async fn reconnect_server(&self, token: &str, server_id: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Server, server_id),
            Permission::ServerModify,
        )?;
        self.supervisor.reconnect_server(server_id).await
    }

    fn ready_connection(&self, server_id: &str) -> HubResult<Arc<ServerConnection>> {
        self.supervisor
            .connection(server_id)
            .ok_or_else(|| HubError::NotFound(format!("Server not connected: {server_id}")))
    }

    /// Cached resources of a server.
    pub fn server_resources(&self, token: &str, server_id: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Resource),
            Permission::ResourceView,
        )?;
        let connection = self.ready_connection(server_id)?;
        Ok(json!({"resources": connection.resources()}))
    }

    /// Read one resource from a server.
    pub async fn read_server_resource(
        &self,
        token: &str,
        server_id: &str,
        uri: &str,
    ) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Resource),
            Permission::ResourceView,
        )?;
        let connection = self.ready_connection(server_id)?;
        let contents = connection.read_resource(uri).await?;
        Ok(json!({"uri": uri, "contents": contents}))
    }

    /// Cached tools of a server.
    pub fn server_tools(&self, token: &str, server_id: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Tool),
            Permission::ToolView,
        )?;
        let connection = self.ready_connection(server_id)?;
        Ok(json!({"tools": connection.tools()}))
    }

    /// Call a tool on a server.
    pub async fn call_server_tool(
        &self,
        token: &str,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Tool, name),
            Permission::ToolCall,
        )?;
        let connection = self.ready_connection(server_id)?;
        connection.call_tool(name, arguments).await
    }

    /// Cached prompts of a server.
    pub fn server_prompts(&self, token: &str, server_id: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Prompt),
            Permission::PromptView,
        )?;
        let connection = self.ready_connection(server_id)?;
        Ok(json!({"prompts": connection.prompts()}))
    }

    /// Fetch a prompt from a server.
    pub async fn get_server_prompt(
        &self,
        token: &str,
        server_id: &str,
        prompt_id: &str,
    ) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Prompt, prompt_id),
            Permission::PromptUse,
        )?;
        let connection = self.ready_connection(server_id)?;
        connection.get_prompt(prompt_id).await
    }

    /// Elicit a completion from a server.
    pub async fn sample_server(
        &self,
        token: &str,
        server_id: &str,
        request: Value,
    ) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Sampling),
            Permission::SamplingRequest,
        )?;
        let connection = self.ready_connection(server_id)?;
        connection.sample(request).await
    }

    // Router administration

    /// All routes.
    pub fn routes(&self, token: &str) -> HubResult<Vec<Route>> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Router),
            Permission::RouterView,
        )?;
        Ok(self.router.routes())
    }

    /// Add a route.
    pub fn add_route(&self, token: &str, route: Route) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Router),
            Permission::RouterModify,
        )?;
        route.source.validate()?;
        route.destination.validate()?;
        self.router.add_route(route);
        Ok(())
    }

    /// Remove a route.
    pub fn remove_route(&self, token: &str, route: &Route) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Router),
            Permission::RouterModify,
        )?;
        Ok(self.router.remove_route(route))
    }

    /// Drop every route and re-seed the defaults.
    pub fn clear_routes(&self, token: &str) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Router),
            Permission::RouterModify,
        )?;
        self.router.clear_routes();
        Ok(())
    }

    /// Inject a message into the router under an arbitrary source.
    pub async fn inject_message(
        &self,
        token: &str,
        message: Value,
        source: RouteTarget,
    ) -> HubResult<Option<Value>> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Router),
            Permission::RouterModify,
        )?;
        source.validate()?;
        self.metrics.count_routed_message();
        Ok(self.router.route_message(message, source).await)
    }

    /// Route a message on behalf of a connection; internal, not gated.
    pub async fn route_message(
        &self,
        message: Value,
        source: RouteTarget,
    ) -> Option<Value> {
        self.metrics.count_routed_message();
        self.router.route_message(message, source).await
    }

    // Client administration

    /// Connect a new remote client over the named transport. Returns the
    /// fresh client id.
    pub async fn create_client(
        &self,
        token: &str,
        transport: TransportKind,
        host: Option<&str>,
        port: Option<u16>,
    ) -> HubResult<String> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Client),
            Permission::ClientCreate,
        )?;
        let transport: Arc<dyn Transport> = match transport {
            TransportKind::Stdio => Arc::new(StdioTransport::new()),
            TransportKind::Http => {
                let host = host.unwrap_or(&self.config.hub.host).to_string();
                let port = port.unwrap_or(self.config.hub.port);
                Arc::new(HttpSseTransport::new(
                    host,
                    port,
                    self.config.hub.allowed_origins.clone(),
                ))
            }
        };
        self.clients.connect(transport).await
    }

    /// Status of every client.
    pub fn list_clients(&self, token: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Client),
            Permission::ClientView,
        )?;
        Ok(json!({"clients": self.clients.status_reports()}))
    }

    /// Status of one client.
    pub fn get_client(&self, token: &str, client_id: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientView,
        )?;
        self.clients
            .get(client_id)
            .map(|connection| connection.status_report())
            .ok_or_else(|| HubError::NotFound(format!("Client not found: {client_id}")))
    }

    /// Disconnect a client.
    pub async fn disconnect_client(&self, token: &str, client_id: &str) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientDelete,
        )?;
        self.clients.disconnect(client_id).await
    }

    /// `notifications/resources/updated` to one client.
    pub async fn notify_client_resource_updated(
        &self,
        token: &str,
        client_id: &str,
        uri: &str,
    ) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientModify,
        )?;
        self.clients.notify_resource_updated(client_id, uri).await
    }

    /// `notifications/resources/list_changed` to one client.
    pub async fn notify_client_resources_changed(
        &self,
        token: &str,
        client_id: &str,
    ) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientModify,
        )?;
        self.clients.notify_resources_changed(client_id).await
    }

    /// `notifications/tools/list_changed` to one client.
    pub async fn notify_client_tools_changed(
        &self,
        token: &str,
        client_id: &str,
    ) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientModify,
        )?;
        self.clients.notify_tools_changed(client_id).await
    }

    /// `notifications/prompts/list_changed` to one client.
    pub async fn notify_client_prompts_changed(
        &self,
        token: &str,
        client_id: &str,
    ) -> HubResult<()> {
        self.authorize(
            token,
            AclResource::one(ResourceKind::Client, client_id),
            Permission::ClientModify,
        )?;
        self.clients.notify_prompts_changed(client_id).await
    }

    /// Elicit a completion from a client.
    pub async fn sample_client(
        &self,
        token: &str,
        client_id: &str,
        request: Value,
    ) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Sampling),
            Permission::SamplingRequest,
        )?;
        self.clients.sample(client_id, request).await
    }

    // Role administration

    /// Assign a role to a user.
    pub fn assign_role(&self, token: &str, username: &str, role_name: &str) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Admin),
            Permission::AdminModify,
        )?;
        self.acl.assign_role(username, role_name)
    }

    /// Revoke a role from a user.
    pub fn revoke_role(&self, token: &str, username: &str, role_name: &str) -> HubResult<bool> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Admin),
            Permission::AdminModify,
        )?;
        self.acl.revoke_role(username, role_name)
    }

    /// Metrics snapshot.
    pub fn metrics_snapshot(&self, token: &str) -> HubResult<Value> {
        self.authorize(
            token,
            AclResource::any(ResourceKind::Admin),
            Permission::AdminView,
        )?;
        Ok(self.metrics.snapshot())
    }

    // Internals shared with the hub-directed handler

    fn server_status(&self, server_id: &str) -> Option<Value> {
        let spec = self.registry.get(server_id)?;
        let state = self.supervisor.process_state(server_id).unwrap_or_default();
        let connection = self.supervisor.connection(server_id);

        let mut status = json!({
            "id": server_id,
            "name": spec.name,
            "running": state.running,
            "auto_start": spec.auto_start,
            "auto_restart": spec.auto_restart,
            "pid": state.pid,
            "start_time": state.start_time,
            "exit_time": state.exit_time,
            "exit_code": state.exit_code,
            "retries": state.retries,
            "mcp_connected": connection.is_some(),
            "mcp_initialized": connection.as_ref().is_some_and(|c| c.initialized()),
        });
        status["connection"] = connection.map_or_else(
            || {
                json!({
                    "connected": false,
                    "initialized": false,
                    "status": "disconnected",
                    "client_count": 0,
                })
            },
            |connection| connection.status_report(),
        );
        Some(status)
    }

    fn server_statuses(&self) -> Value {
        let mut statuses = serde_json::Map::new();
        for server_id in self.registry.all().keys() {
            if let Some(status) = self.server_status(server_id) {
                statuses.insert(server_id.clone(), status);
            }
        }
        json!({"servers": statuses})
    }

    /// Hub-directed methods: `hub/*` and `auth/*`. The public set is
    /// `hub/status`, `hub/health`, `auth/login`, and `auth/validate`;
    /// `hub/servers` and `hub/clients` read a bearer token from their
    /// params and gate exactly like the facade operations. Unknown
    /// methods yield `None`, which the router reports as
    /// method-not-found.
    async fn handle_hub_method(
        &self,
        message: &Value,
        source: &RouteTarget,
    ) -> HubResult<Option<Value>> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return Ok(None);
        };
        if message.get("id").is_none() {
            // Hub-directed notifications are observed, never answered.
            debug!("Hub notification from {source}: {method}");
            return Ok(None);
        }
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        // An absent token fails validation the same way a bogus one does.
        let bearer = params.get("token").and_then(Value::as_str).unwrap_or_default();

        let response = match method {
            "hub/status" => respond(message, self.status()),
            "hub/health" => respond(message, self.health()),
            "hub/servers" => match self.list_servers(bearer) {
                Ok(result) => respond(message, result),
                Err(gate_error) => {
                    respond_error(message, ErrorCode::ProtocolError, &gate_error.to_string())
                }
            },
            "hub/clients" => match self.list_clients(bearer) {
                Ok(result) => respond(message, result),
                Err(gate_error) => {
                    respond_error(message, ErrorCode::ProtocolError, &gate_error.to_string())
                }
            },
            "auth/login" => {
                let provider = params.get("provider").and_then(Value::as_str);
                let credentials = params.get("credentials").cloned().unwrap_or_else(|| json!({}));
                match serde_json::from_value::<Credentials>(credentials) {
                    Ok(credentials) => match self.login(&credentials, provider) {
                        Ok(result) => respond(message, result),
                        Err(_) => respond_error(
                            message,
                            ErrorCode::ProtocolError,
                            "Authentication failed",
                        ),
                    },
                    Err(_) => respond_error(
                        message,
                        ErrorCode::InvalidParams,
                        "Missing or malformed credentials",
                    ),
                }
            }
            "auth/logout" => match params.get("token").and_then(Value::as_str) {
                Some(token) => respond(message, json!({"success": self.logout(token)})),
                None => respond_error(message, ErrorCode::InvalidParams, "Missing token parameter"),
            },
            "auth/validate" => match params.get("token").and_then(Value::as_str) {
                Some(token) => respond(message, self.validate(token)),
                None => respond_error(message, ErrorCode::InvalidParams, "Missing token parameter"),
            },
            _ => {
                warn!("Unsupported hub method: {method}");
                None
            }
        };
        Ok(response)
    }

    // Accessors used by the binary and tests

    /// The server registration store.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// The supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// The client registry.
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// The router.
    #[must_use]
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The authentication manager.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    /// The access control list.
    #[must_use]
    pub fn acl(&self) -> &Arc<AccessControl> {
        &self.acl
    }
}

fn resource_kind_name(kind: ResourceKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|value| value.as_str().map(ToString::to_string))
        .unwrap_or_else(|| format!("{kind:?}"))
}

fn respond(message: &Value, result: Value) -> Option<Value> {
    let id: RequestId = serde_json::from_value(message.get("id")?.clone()).ok()?;
    serde_json::to_value(JsonRpcResponse::success(result, id)).ok()
}

fn respond_error(message: &Value, code: ErrorCode, text: &str) -> Option<Value> {
    let id: RequestId = serde_json::from_value(message.get("id")?.clone()).ok()?;
    serde_json::to_value(JsonRpcResponse::error_response(
        JsonRpcError::new(code, text),
        id,
    ))
    .ok()
}

/// Forward a message to every server connection in id order. Requests
/// return the first non-null response; per-member failures are logged and
/// only fail the call when every member failed.
async fn broadcast_to_servers(
    connections: Vec<Arc<ServerConnection>>,
    message: Value,
) -> HubResult<Option<Value>> {
    if connections.is_empty() {
        warn!("No servers to broadcast message to");
        return Ok(None);
    }
    let is_request = message.get("id").is_some();
    let mut first_response: Option<Value> = None;
    let mut failures = 0usize;

    for connection in &connections {
        match connection.forward(message.clone()).await {
            Ok(response) => {
                if first_response.is_none() {
                    first_response = response;
                }
            }
            Err(forward_error) => {
                failures += 1;
                error!(
                    "Error forwarding message to server {}: {forward_error}",
                    connection.server_id()
                );
            }
        }
    }

    if is_request && first_response.is_none() && failures == connections.len() {
        return Err(HubError::Internal(
            "All broadcast destinations failed".to_string(),
        ));
    }
    Ok(first_response)
}

/// Forward a message to every client in id order, with the same response
/// selection as server broadcasts.
async fn broadcast_to_clients(
    clients: &Arc<ClientRegistry>,
    message: Value,
) -> HubResult<Option<Value>> {
    let connections = clients.all();
    if connections.is_empty() {
        warn!("No clients to broadcast message to");
        return Ok(None);
    }
    let is_request = message.get("id").is_some();
    let mut first_response: Option<Value> = None;
    let mut failures = 0usize;

    for connection in &connections {
        match clients
            .forward(connection.client_id(), message.clone())
            .await
        {
            Ok(response) => {
                if first_response.is_none() {
                    first_response = response;
                }
            }
            Err(forward_error) => {
                failures += 1;
                error!(
                    "Error forwarding message to client {}: {forward_error}",
                    connection.client_id()
                );
            }
        }
    }

    if is_request && first_response.is_none() && failures == connections.len() {
        return Err(HubError::Internal(
            "All broadcast destinations failed".to_string(),
        ));
    }
    Ok(first_response)
}
