//! Authentication providers, token stores, and the role ACL.

pub mod acl;
pub mod auth;

pub use acl::{AccessControl, AclResource, Permission, ResourceKind, Role};
pub use auth::{
    API_KEY_PREFIX, ApiKeyProvider, AuthManager, AuthProvider, Credentials, PasswordHash,
    PasswordProvider, UserProfile,
};
