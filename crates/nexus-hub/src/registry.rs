//! Server registration store.
//!
//! A registration is the durable description of a server: how to launch
//! it, which transport it speaks, and its restart policy. The whole map
//! is rewritten to the registry file on every mutation. Capability trees
//! reported by live connections are cached here for capability routing.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use nexus_protocol::Capabilities;
use nexus_transport::TransportKind;

use crate::error::{HubError, HubResult};
use crate::persist;

fn default_true() -> bool {
    true
}

/// A persistent server registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Human-readable name
    pub name: String,
    /// Launch command
    pub command: String,
    /// Launch arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides merged over the hub's environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Transport the server speaks
    #[serde(default)]
    pub transport: TransportKind,
    /// HTTP transport host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// HTTP transport port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Start this server when the hub starts
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Restart on unexpected exit
    #[serde(default)]
    pub auto_restart: bool,
    /// Restart ceiling; hub default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Seconds between restarts; hub default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    /// Graceful-stop and request timeout in seconds; hub default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl ServerSpec {
    /// Minimal registration for a stdio server.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            host: None,
            port: None,
            auto_start: true,
            auto_restart: false,
            max_retries: None,
            retry_delay: None,
            timeout: None,
        }
    }

    fn validate(&self) -> HubResult<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::InvalidConfiguration(
                "Missing required field: name".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(HubError::InvalidConfiguration(
                "Missing required field: command".to_string(),
            ));
        }
        if self.transport == TransportKind::Http && self.port.is_none() {
            return Err(HubError::InvalidConfiguration(
                "HTTP transport requires a port".to_string(),
            ));
        }
        Ok(())
    }
}

/// The registration store.
#[derive(Debug)]
pub struct ServerRegistry {
    registry_file: PathBuf,
    servers: StdMutex<BTreeMap<String, ServerSpec>>,
    capabilities: StdMutex<HashMap<String, Capabilities>>,
}

impl ServerRegistry {
    /// Open the registry, loading any persisted registrations.
    pub fn new(registry_file: PathBuf) -> HubResult<Self> {
        let servers = persist::load_json::<BTreeMap<String, ServerSpec>>(&registry_file)?
            .unwrap_or_default();
        if !servers.is_empty() {
            info!(
                "Loaded server registry from {} ({} server(s))",
                registry_file.display(),
                servers.len()
            );
        }
        Ok(Self {
            registry_file,
            servers: StdMutex::new(servers),
            capabilities: StdMutex::new(HashMap::new()),
        })
    }

    /// Register or update a server. Persists on success.
    pub fn register(&self, server_id: &str, spec: ServerSpec) -> HubResult<()> {
        spec.validate()?;
        let mut servers = self.servers.lock().expect("registry mutex poisoned");
        servers.insert(server_id.to_string(), spec);
        info!("Registered server: {server_id}");
        persist::save_json(&self.registry_file, &*servers)
    }

    /// Remove a registration and its capability cache. Idempotent after
    /// the first call.
    pub fn unregister(&self, server_id: &str) -> HubResult<bool> {
        let mut servers = self.servers.lock().expect("registry mutex poisoned");
        if servers.remove(server_id).is_none() {
            warn!("Cannot unregister server: {server_id} not found");
            return Ok(false);
        }
        self.capabilities
            .lock()
            .expect("capabilities mutex poisoned")
            .remove(server_id);
        info!("Unregistered server: {server_id}");
        persist::save_json(&self.registry_file, &*servers)?;
        Ok(true)
    }

    /// Look up a registration.
    #[must_use]
    pub fn get(&self, server_id: &str) -> Option<ServerSpec> {
        self.servers
            .lock()
            .expect("registry mutex poisoned")
            .get(server_id)
            .cloned()
    }

    /// Whether a server id is registered.
    #[must_use]
    pub fn contains(&self, server_id: &str) -> bool {
        self.servers
            .lock()
            .expect("registry mutex poisoned")
            .contains_key(server_id)
    }

    /// All registrations, in id order.
    #[must_use]
    pub fn all(&self) -> BTreeMap<String, ServerSpec> {
        self.servers.lock().expect("registry mutex poisoned").clone()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.lock().expect("registry mutex poisoned").len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache the capability tree a live connection negotiated.
    pub fn set_capabilities(&self, server_id: &str, capabilities: Capabilities) {
        if !self.contains(server_id) {
            warn!("Cannot cache capabilities: server {server_id} not registered");
            return;
        }
        debug!("Cached capabilities for server: {server_id}");
        self.capabilities
            .lock()
            .expect("capabilities mutex poisoned")
            .insert(server_id.to_string(), capabilities);
    }

    /// The cached capability tree for a server.
    #[must_use]
    pub fn capabilities(&self, server_id: &str) -> Option<Capabilities> {
        self.capabilities
            .lock()
            .expect("capabilities mutex poisoned")
            .get(server_id)
            .cloned()
    }

    /// Ids of servers whose cached tree has the capability path.
    #[must_use]
    pub fn find_by_capability(&self, path: &str) -> Vec<String> {
        let capabilities = self
            .capabilities
            .lock()
            .expect("capabilities mutex poisoned");
        let mut matching: Vec<String> = capabilities
            .iter()
            .filter(|(_, tree)| tree.has(path))
            .map(|(server_id, _)| server_id.clone())
            .collect();
        matching.sort();
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> (ServerRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServerRegistry::new(dir.path().join("registry.json")).unwrap();
        (registry, dir)
    }

    #[test]
    fn register_and_unregister() {
        let (registry, _dir) = registry();
        registry
            .register("s1", ServerSpec::stdio("Echo", "echo", vec!["hi".to_string()]))
            .unwrap();
        assert!(registry.contains("s1"));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister("s1").unwrap());
        assert!(!registry.contains("s1"));
        // Idempotent after the first call.
        assert!(!registry.unregister("s1").unwrap());
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let (registry, _dir) = registry();
        let missing_command = ServerSpec::stdio("bad", "", vec![]);
        assert!(matches!(
            registry.register("bad", missing_command),
            Err(HubError::InvalidConfiguration(_))
        ));

        let mut http_without_port = ServerSpec::stdio("web", "serve", vec![]);
        http_without_port.transport = TransportKind::Http;
        assert!(matches!(
            registry.register("web", http_without_port),
            Err(HubError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn registrations_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = ServerRegistry::new(path.clone()).unwrap();
            let mut spec = ServerSpec::stdio("Echo", "echo", vec![]);
            spec.auto_restart = true;
            spec.max_retries = Some(5);
            registry.register("s1", spec).unwrap();
        }

        let registry = ServerRegistry::new(path).unwrap();
        let spec = registry.get("s1").unwrap();
        assert_eq!(spec.name, "Echo");
        assert!(spec.auto_restart);
        assert_eq!(spec.max_retries, Some(5));
    }

    #[test]
    fn capability_lookup_covers_only_cached_servers() {
        let (registry, _dir) = registry();
        registry
            .register("s1", ServerSpec::stdio("One", "one", vec![]))
            .unwrap();
        registry
            .register("s2", ServerSpec::stdio("Two", "two", vec![]))
            .unwrap();

        registry.set_capabilities("s1", Capabilities::new(json!({"tools": true})));
        registry.set_capabilities(
            "s2",
            Capabilities::new(json!({"resources": {"subscriptions": true}})),
        );

        assert_eq!(registry.find_by_capability("tools"), vec!["s1".to_string()]);
        assert_eq!(
            registry.find_by_capability("resources.subscriptions"),
            vec!["s2".to_string()]
        );
        assert!(registry.find_by_capability("prompts").is_empty());
    }

    #[test]
    fn unregister_clears_the_capability_cache() {
        let (registry, _dir) = registry();
        registry
            .register("s1", ServerSpec::stdio("One", "one", vec![]))
            .unwrap();
        registry.set_capabilities("s1", Capabilities::new(json!({"tools": true})));

        registry.unregister("s1").unwrap();
        assert!(registry.capabilities("s1").is_none());
        assert!(registry.find_by_capability("tools").is_empty());
    }
}
