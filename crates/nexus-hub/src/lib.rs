//! # Nexus Hub
//!
//! A central hub for the Model Context Protocol: supervises MCP server
//! processes, speaks both protocol roles over stdio and HTTP/SSE, brokers
//! JSON-RPC traffic between clients and servers through a rule-driven
//! router, and gates administration behind bearer tokens and a role ACL.

pub mod clients;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod persist;
pub mod registry;
pub mod router;
pub mod security;
pub mod supervisor;

pub use clients::{ClientRegistry, ClientStatus, DISCONNECT_GRACE};
pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use metrics::HubMetrics;
pub use registry::{ServerRegistry, ServerSpec};
pub use router::{MessageRouter, Route, RouteKind, RouteTarget};
pub use security::{
    AccessControl, AclResource, ApiKeyProvider, AuthManager, AuthProvider, Credentials,
    PasswordProvider, Permission, ResourceKind, Role, UserProfile,
};
pub use supervisor::{ConnectionStatus, ProcessState, ServerConnection, Supervisor};
