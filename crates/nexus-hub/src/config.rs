//! Hub configuration.
//!
//! Settings come from a JSON file layered under environment overrides with
//! the `NEXUS_` prefix and `__` as the nesting separator, so
//! `NEXUS_HUB__PORT=9000` overrides `hub.port`. Values are type-inferred
//! (`true`/`false`, integers, floats, else strings).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "NEXUS";

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Identity, listen address, and state file locations
    pub hub: HubSection,
    /// Supervisor policy defaults
    pub servers: ServersSection,
    /// Authentication and ACL stores
    pub security: SecuritySection,
    /// Metrics cadence
    pub monitoring: MonitoringSection,
}

/// Identity and state file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Hub name advertised during handshakes
    pub name: String,
    /// Hub version advertised during handshakes
    pub version: String,
    /// Address remote clients connect to
    pub host: String,
    /// Port remote clients connect to
    pub port: u16,
    /// CORS origins for the HTTP transport; `*` for development
    pub allowed_origins: Vec<String>,
    /// Server registration store
    pub registry_file: PathBuf,
    /// Runtime state projection store
    pub process_registry_file: PathBuf,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            name: "Nexus MCP Hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: "localhost".to_string(),
            port: 8000,
            allowed_origins: vec!["*".to_string()],
            registry_file: PathBuf::from("data/registry.json"),
            process_registry_file: PathBuf::from("data/process_registry.json"),
        }
    }
}

/// Supervisor policy defaults, overridable per server registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersSection {
    /// Request timeout and graceful-stop window, in seconds
    pub default_timeout: u64,
    /// Auto-restart ceiling
    pub max_retries: u32,
    /// Delay between restart attempts, in seconds
    pub retry_delay: u64,
    /// Start registered servers when the hub starts
    pub auto_start: bool,
    /// Restart servers that exit unexpectedly
    pub auto_restart: bool,
}

impl Default for ServersSection {
    fn default() -> Self {
        Self {
            default_timeout: 30,
            max_retries: 3,
            retry_delay: 5,
            auto_start: true,
            auto_restart: true,
        }
    }
}

/// Authentication and ACL store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Password-provider user store
    pub users_file: PathBuf,
    /// API-key provider token store
    pub tokens_file: PathBuf,
    /// Bearer-token store for the password provider
    pub bearer_tokens_file: PathBuf,
    /// Role and assignment store
    pub roles_file: PathBuf,
    /// Bearer token lifetime, in seconds
    pub token_lifetime: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            users_file: PathBuf::from("data/users.json"),
            tokens_file: PathBuf::from("data/tokens.json"),
            bearer_tokens_file: PathBuf::from("data/bearer_tokens.json"),
            roles_file: PathBuf::from("data/roles.json"),
            token_lifetime: 3600,
        }
    }
}

/// Metrics cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    /// Seconds between metric refreshes
    pub metrics_interval: u64,
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            metrics_interval: 10,
        }
    }
}

impl HubConfig {
    /// Load configuration from an optional JSON file plus `NEXUS_*`
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&str>) -> HubResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder =
                builder.add_source(config::File::from(std::path::Path::new(path)).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|config_error| HubError::InvalidConfiguration(config_error.to_string()))
    }
}
