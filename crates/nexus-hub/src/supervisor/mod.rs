//! Server process supervision.
//!
//! The supervisor owns every child process and the single server
//! connection bound to each. A monitor task scans once per second for
//! unexpected exits and schedules bounded auto-restarts. A serializable
//! projection of runtime state is flushed to the process-registry file on
//! every mutation so a hub restart resumes knowledge (never processes) of
//! what was running.

mod connection;

pub use connection::{ConnectionStatus, ServerConnection, ServerFallbackFactory};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

use nexus_protocol::Implementation;
use nexus_transport::{HttpSseTransport, StdioTransport, Transport, TransportKind};

use crate::config::ServersSection;
use crate::error::{HubError, HubResult};
use crate::persist;
use crate::registry::{ServerRegistry, ServerSpec};

/// Delay between spawn and the first connect attempt, giving the child
/// time to become ready.
const CONNECT_DELAY: Duration = Duration::from_secs(2);

/// Hard-kill deadline after a graceful stop times out.
const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// Serializable projection of one server's runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessState {
    /// Child pid while running
    pub pid: Option<u32>,
    /// Whether the child is believed to be alive
    pub running: bool,
    /// Last start time
    pub start_time: Option<DateTime<Utc>>,
    /// Last exit time
    pub exit_time: Option<DateTime<Utc>>,
    /// Last exit code
    pub exit_code: Option<i32>,
    /// Auto-restart attempts since the last explicit (re)start
    pub retries: u32,
}

/// The server supervisor.
pub struct Supervisor {
    defaults: ServersSection,
    process_registry_file: PathBuf,
    hub_info: Implementation,
    origins: Vec<String>,
    registry: Arc<ServerRegistry>,
    children: TokioMutex<HashMap<String, Child>>,
    runtime: StdMutex<HashMap<String, ProcessState>>,
    connections: StdMutex<HashMap<String, Arc<ServerConnection>>>,
    fallback_factory: StdMutex<Option<ServerFallbackFactory>>,
    monitor: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor over a registration store.
    pub fn new(
        registry: Arc<ServerRegistry>,
        defaults: ServersSection,
        process_registry_file: PathBuf,
        hub_info: Implementation,
        origins: Vec<String>,
    ) -> HubResult<Arc<Self>> {
        let mut runtime = persist::load_json::<HashMap<String, ProcessState>>(
            &process_registry_file,
        )?
        .unwrap_or_default();
        // Processes do not survive a hub restart; only knowledge does.
        for state in runtime.values_mut() {
            if state.running {
                state.running = false;
                state.pid = None;
            }
        }

        Ok(Arc::new(Self {
            defaults,
            process_registry_file,
            hub_info,
            origins,
            registry,
            children: TokioMutex::new(HashMap::new()),
            runtime: StdMutex::new(runtime),
            connections: StdMutex::new(HashMap::new()),
            fallback_factory: StdMutex::new(None),
            monitor: TokioMutex::new(None),
            running: AtomicBool::new(false),
        }))
    }

    /// Install the factory producing each connection's router hooks.
    /// Wired once by the hub.
    pub fn set_fallback_factory(&self, factory: ServerFallbackFactory) {
        *self
            .fallback_factory
            .lock()
            .expect("factory mutex poisoned") = Some(factory);
    }

    fn save_process_registry(&self) {
        let runtime = self.runtime.lock().expect("runtime mutex poisoned").clone();
        if let Err(save_error) = persist::save_json(&self.process_registry_file, &runtime) {
            error!("Error saving process registry: {save_error}");
        }
    }

    fn effective_timeout(&self, spec: &ServerSpec) -> Duration {
        Duration::from_secs(spec.timeout.unwrap_or(self.defaults.default_timeout))
    }

    fn effective_max_retries(&self, spec: &ServerSpec) -> u32 {
        spec.max_retries.unwrap_or(self.defaults.max_retries)
    }

    fn effective_retry_delay(&self, spec: &ServerSpec) -> Duration {
        Duration::from_secs(spec.retry_delay.unwrap_or(self.defaults.retry_delay))
    }

    /// Start the monitor task.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Supervisor is already running");
            return;
        }
        info!("Starting supervisor");

        let supervisor = Arc::downgrade(self);
        let monitor = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                if !supervisor.running.load(Ordering::SeqCst) {
                    break;
                }
                supervisor.scan_children().await;
            }
        });
        *self.monitor.lock().await = Some(monitor);
    }

    /// Stop everything: servers, connections, monitor.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Supervisor is not running");
            return;
        }
        info!("Stopping supervisor");

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.abort();
            let _ = monitor.await;
        }

        let ids: Vec<String> = self
            .runtime
            .lock()
            .expect("runtime mutex poisoned")
            .iter()
            .filter(|(_, state)| state.running)
            .map(|(id, _)| id.clone())
            .collect();
        for server_id in ids {
            if let Err(stop_error) = self.stop_server(&server_id).await {
                error!("Failed to stop server {server_id}: {stop_error}");
            }
        }

        let connections: Vec<Arc<ServerConnection>> = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in connections {
            connection.disconnect().await;
        }

        info!("Supervisor stopped");
    }

    /// One monitor pass: detect children that exited behind our back.
    async fn scan_children(self: &Arc<Self>) {
        let mut exited: Vec<(String, Option<i32>)> = Vec::new();
        {
            let mut children = self.children.lock().await;
            for (server_id, child) in children.iter_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => exited.push((server_id.clone(), status.code())),
                    Ok(None) => {}
                    Err(wait_error) => {
                        error!("Error polling server {server_id}: {wait_error}");
                    }
                }
            }
            for (server_id, _) in &exited {
                children.remove(server_id);
            }
        }

        for (server_id, exit_code) in exited {
            let was_running = {
                let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
                let state = runtime.entry(server_id.clone()).or_default();
                let was_running = state.running;
                state.running = false;
                state.pid = None;
                state.exit_code = exit_code;
                state.exit_time = Some(Utc::now());
                was_running
            };
            if !was_running {
                continue;
            }

            warn!(
                "Server {server_id} terminated with exit code {}",
                exit_code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
            );

            // Connection loss fails outstanding requests immediately.
            let connection = self
                .connections
                .lock()
                .expect("connections mutex poisoned")
                .remove(&server_id);
            if let Some(connection) = connection {
                connection.disconnect().await;
            }

            self.maybe_schedule_restart(&server_id);
            self.save_process_registry();
        }
    }

    fn maybe_schedule_restart(self: &Arc<Self>, server_id: &str) {
        let Some(spec) = self.registry.get(server_id) else {
            return;
        };
        if !(self.defaults.auto_restart && spec.auto_restart) {
            return;
        }

        let max_retries = self.effective_max_retries(&spec);
        let retries = {
            let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
            let state = runtime.entry(server_id.to_string()).or_default();
            if state.retries >= max_retries {
                None
            } else {
                state.retries += 1;
                Some(state.retries)
            }
        };

        let Some(attempt) = retries else {
            error!("Server {server_id} failed to stay up after {max_retries} retries");
            return;
        };

        info!("Auto-restarting server {server_id} (retry {attempt}/{max_retries})");
        let delay = self.effective_retry_delay(&spec);
        let supervisor = Arc::downgrade(self);
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            if let Err(start_error) = supervisor.start_server(&server_id).await {
                error!("Failed to restart server {server_id}: {start_error}");
            }
        });
    }

    /// Whether the server's child process is alive.
    pub async fn is_running(&self, server_id: &str) -> bool {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(server_id) else {
            return false;
        };
        match child.try_wait() {
            // The monitor pass will record the exit; report the truth now.
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Spawn a registered server. Rejects when it is already running;
    /// spawn failure is surfaced to the caller with no retry.
    pub async fn start_server(self: &Arc<Self>, server_id: &str) -> HubResult<()> {
        let spec = self
            .registry
            .get(server_id)
            .ok_or_else(|| HubError::NotFound(format!("Server not found: {server_id}")))?;

        if self.is_running(server_id).await {
            return Err(HubError::InvalidState(format!(
                "Server {server_id} is already running"
            )));
        }

        info!("Starting server: {server_id}");
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|spawn_error| {
            error!("Failed to start server {server_id}: {spawn_error}");
            HubError::SpawnFailed(spawn_error.to_string())
        })?;
        let pid = child.id();

        // Stderr always becomes warning-level hub log lines. Stdout is the
        // protocol channel for stdio servers, so it is only log-forwarded
        // for http servers.
        if let Some(stderr) = child.stderr.take() {
            let log_id = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[{log_id}] {line}");
                }
            });
        }
        if spec.transport == TransportKind::Http {
            if let Some(stdout) = child.stdout.take() {
                let log_id = server_id.to_string();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!("[{log_id}] {line}");
                    }
                });
            }
        }

        self.children
            .lock()
            .await
            .insert(server_id.to_string(), child);
        {
            let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
            let state = runtime.entry(server_id.to_string()).or_default();
            state.pid = pid;
            state.running = true;
            state.start_time = Some(Utc::now());
            state.exit_code = None;
            state.exit_time = None;
        }
        self.save_process_registry();
        info!(
            "Server {server_id} started with PID {}",
            pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
        );

        // Connect in the background once the child has had time to come
        // up; start does not block on it.
        let supervisor = Arc::downgrade(self);
        let connect_id = server_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CONNECT_DELAY).await;
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            if let Err(connect_error) = supervisor.connect_server(&connect_id).await {
                error!("Failed to connect to MCP server {connect_id}: {connect_error}");
            }
        });

        Ok(())
    }

    /// Stop a server: disconnect its connection, then wait for the child
    /// within the graceful window, then kill with the hard deadline.
    pub async fn stop_server(self: &Arc<Self>, server_id: &str) -> HubResult<()> {
        let connection = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .remove(server_id);
        if let Some(connection) = connection {
            connection.disconnect().await;
        }

        let Some(mut child) = self.children.lock().await.remove(server_id) else {
            warn!("Server {server_id} is not running");
            return Ok(());
        };

        info!("Stopping server: {server_id}");
        // The MCP shutdown/exit sequence went out with the disconnect
        // above; closing stdin is the remaining terminate signal a stdio
        // server understands.
        drop(child.stdin.take());
        let graceful = self
            .registry
            .get(server_id)
            .map_or(Duration::from_secs(self.defaults.default_timeout), |spec| {
                self.effective_timeout(&spec)
            });

        let exit_code = match tokio::time::timeout(graceful, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(wait_error)) => {
                error!("Error waiting for server {server_id}: {wait_error}");
                None
            }
            Err(_) => {
                warn!("Server {server_id} did not terminate gracefully, forcing kill");
                if let Err(kill_error) = child.start_kill() {
                    error!("Failed to kill server {server_id}: {kill_error}");
                }
                match tokio::time::timeout(KILL_DEADLINE, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(wait_error)) => {
                        error!("Error reaping server {server_id}: {wait_error}");
                        None
                    }
                    Err(_) => {
                        error!("Server {server_id} survived the kill deadline");
                        None
                    }
                }
            }
        };

        {
            let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
            let state = runtime.entry(server_id.to_string()).or_default();
            state.running = false;
            state.pid = None;
            state.exit_code = exit_code;
            state.exit_time = Some(Utc::now());
        }
        self.save_process_registry();
        info!("Server {server_id} stopped");
        Ok(())
    }

    /// Stop then start with the stored registration. Resets the retry
    /// counter.
    pub async fn restart_server(self: &Arc<Self>, server_id: &str) -> HubResult<()> {
        info!("Restarting server: {server_id}");
        if !self.registry.contains(server_id) {
            return Err(HubError::NotFound(format!("Server not found: {server_id}")));
        }

        if self.is_running(server_id).await {
            self.stop_server(server_id).await?;
        }
        {
            let mut runtime = self.runtime.lock().expect("runtime mutex poisoned");
            runtime.entry(server_id.to_string()).or_default().retries = 0;
        }
        self.start_server(server_id).await
    }

    fn build_transport(&self, spec: &ServerSpec) -> HubResult<Option<Arc<dyn Transport>>> {
        match spec.transport {
            // Stdio transports need the child's pipes; the caller fills
            // this in.
            TransportKind::Stdio => Ok(None),
            TransportKind::Http => {
                let host = spec.host.clone().unwrap_or_else(|| "localhost".to_string());
                let port = spec.port.ok_or_else(|| {
                    HubError::InvalidConfiguration("HTTP transport requires a port".to_string())
                })?;
                Ok(Some(Arc::new(HttpSseTransport::new(
                    host,
                    port,
                    self.origins.clone(),
                ))))
            }
        }
    }

    /// Create the connection for a server, dial it, and run the MCP
    /// handshake.
    pub async fn connect_server(self: &Arc<Self>, server_id: &str) -> HubResult<()> {
        let spec = self
            .registry
            .get(server_id)
            .ok_or_else(|| HubError::NotFound(format!("Server not found: {server_id}")))?;

        let existing = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .get(server_id)
            .cloned();
        if let Some(existing) = existing {
            if matches!(existing.status(), ConnectionStatus::Ready) {
                warn!("Server {server_id} is already connected");
                return Ok(());
            }
        }

        let transport: Arc<dyn Transport> = match self.build_transport(&spec)? {
            Some(transport) => transport,
            None => {
                let mut children = self.children.lock().await;
                let child = children.get_mut(server_id).ok_or_else(|| {
                    HubError::InvalidState(format!(
                        "Server {server_id} has no running process to connect to"
                    ))
                })?;
                Arc::new(StdioTransport::from_child(child)?)
            }
        };

        let factory = self
            .fallback_factory
            .lock()
            .expect("factory mutex poisoned")
            .clone();
        let connection = Arc::new(ServerConnection::new(
            server_id,
            spec.clone(),
            self.hub_info.clone(),
            self.effective_timeout(&spec),
            factory,
        ));

        connection.connect(transport).await?;
        if let Err(handshake_error) = connection.initialize().await {
            connection.disconnect().await;
            return Err(handshake_error);
        }

        self.registry
            .set_capabilities(server_id, connection.capabilities());
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(server_id.to_string(), connection);
        info!("Connected to MCP server: {server_id}");
        Ok(())
    }

    /// Tear down a server's connection without touching its process.
    pub async fn disconnect_server(&self, server_id: &str) -> HubResult<bool> {
        let connection = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .remove(server_id);
        let Some(connection) = connection else {
            warn!("Server {server_id} is not connected");
            return Ok(false);
        };
        connection.disconnect().await;
        Ok(true)
    }

    /// Disconnect (when connected) and connect again, process untouched.
    pub async fn reconnect_server(self: &Arc<Self>, server_id: &str) -> HubResult<()> {
        self.disconnect_server(server_id).await?;
        self.connect_server(server_id).await
    }

    /// The live connection for a server.
    #[must_use]
    pub fn connection(&self, server_id: &str) -> Option<Arc<ServerConnection>> {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .get(server_id)
            .cloned()
    }

    /// Every live connection, in server-id order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        let mut connections: Vec<Arc<ServerConnection>> = self
            .connections
            .lock()
            .expect("connections mutex poisoned")
            .values()
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.server_id().cmp(b.server_id()));
        connections
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .len()
    }

    /// The runtime projection for one server.
    #[must_use]
    pub fn process_state(&self, server_id: &str) -> Option<ProcessState> {
        self.runtime
            .lock()
            .expect("runtime mutex poisoned")
            .get(server_id)
            .cloned()
    }

    /// Drop runtime knowledge of a server; used at unregistration.
    pub fn forget(&self, server_id: &str) {
        self.runtime
            .lock()
            .expect("runtime mutex poisoned")
            .remove(server_id);
        self.save_process_registry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> (Arc<Supervisor>, Arc<ServerRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::new(dir.path().join("registry.json")).unwrap());
        let supervisor = Supervisor::new(
            registry.clone(),
            ServersSection::default(),
            dir.path().join("process_registry.json"),
            Implementation::new("Nexus MCP Hub", "0.4.0"),
            vec!["*".to_string()],
        )
        .unwrap();
        (supervisor, registry, dir)
    }

    #[tokio::test]
    async fn start_requires_a_registration() {
        let (supervisor, _registry, _dir) = fixture();
        let result = supervisor.start_server("ghost").await;
        assert!(matches!(result, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced_without_retries() {
        let (supervisor, registry, _dir) = fixture();
        registry
            .register(
                "broken",
                ServerSpec::stdio("Broken", "/nonexistent/definitely-not-a-binary", vec![]),
            )
            .unwrap();

        let result = supervisor.start_server("broken").await;
        assert!(matches!(result, Err(HubError::SpawnFailed(_))));
        assert!(!supervisor.is_running("broken").await);
    }

    #[tokio::test]
    async fn start_records_runtime_state_and_stop_records_exit() {
        let (supervisor, registry, _dir) = fixture();
        let mut spec = ServerSpec::stdio("Sleep", "sleep", vec!["30".to_string()]);
        // sleep ignores stdin, so stop escalates to the kill path; keep
        // the graceful window short.
        spec.timeout = Some(1);
        registry.register("sleep", spec).unwrap();

        supervisor.start_server("sleep").await.unwrap();
        assert!(supervisor.is_running("sleep").await);
        let state = supervisor.process_state("sleep").unwrap();
        assert!(state.running);
        assert!(state.pid.is_some());
        assert!(state.start_time.is_some());

        // Double start is rejected.
        let again = supervisor.start_server("sleep").await;
        assert!(matches!(again, Err(HubError::InvalidState(_))));

        supervisor.stop_server("sleep").await.unwrap();
        assert!(!supervisor.is_running("sleep").await);
        let state = supervisor.process_state("sleep").unwrap();
        assert!(!state.running);
        assert!(state.exit_time.is_some());
    }

    #[tokio::test]
    async fn short_lived_child_is_detected_by_the_monitor() {
        let (supervisor, registry, _dir) = fixture();
        registry
            .register("echo", ServerSpec::stdio("Echo", "echo", vec!["hi".to_string()]))
            .unwrap();

        supervisor.start_server("echo").await.unwrap();
        supervisor.start().await;

        // echo exits immediately; the monitor should record exit code 0
        // and, with auto_restart off by default, schedule nothing.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        let state = supervisor.process_state("echo").unwrap();
        assert!(!state.running);
        assert_eq!(state.exit_code, Some(0));
        assert_eq!(state.retries, 0);
        assert!(state.exit_time.is_some());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn runtime_knowledge_survives_a_reload_as_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::new(dir.path().join("registry.json")).unwrap());
        let mut spec = ServerSpec::stdio("Sleep", "sleep", vec!["30".to_string()]);
        spec.timeout = Some(1);
        registry.register("sleep", spec).unwrap();

        {
            let supervisor = Supervisor::new(
                registry.clone(),
                ServersSection::default(),
                dir.path().join("process_registry.json"),
                Implementation::new("Nexus MCP Hub", "0.4.0"),
                vec![],
            )
            .unwrap();
            supervisor.start_server("sleep").await.unwrap();
            supervisor.stop_server("sleep").await.unwrap();
        }

        let supervisor = Supervisor::new(
            registry,
            ServersSection::default(),
            dir.path().join("process_registry.json"),
            Implementation::new("Nexus MCP Hub", "0.4.0"),
            vec![],
        )
        .unwrap();
        let state = supervisor.process_state("sleep").unwrap();
        assert!(!state.running);
        assert!(state.exit_time.is_some());
    }
}
