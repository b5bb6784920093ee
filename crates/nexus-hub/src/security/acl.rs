//! Role-based access control.
//!
//! A role maps resources to permission sets; a resource with no id matches
//! every id of its kind. Users hold role names; a permission check passes
//! when any assigned role has a matching resource entry granting it.
//! Default roles `admin`, `user`, and `guest` are always present. Roles
//! and assignments persist to a single JSON file on every mutation, using
//! `"kind"` / `"kind:id"` keys:
//!
//! ```json
//! {
//!   "roles": {
//!     "admin": {
//!       "description": "Administrator with full access",
//!       "permissions": {"server": ["SERVER_VIEW", "SERVER_CREATE"]}
//!     }
//!   },
//!   "user_roles": {"alice": ["admin"]}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HubResult;
use crate::persist;

/// Permissions guarding hub operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// View server registrations and status
    ServerView,
    /// Register servers
    ServerCreate,
    /// Modify server registrations
    ServerModify,
    /// Unregister servers
    ServerDelete,
    /// Start server processes
    ServerStart,
    /// Stop server processes
    ServerStop,
    /// View client connections
    ClientView,
    /// Create client connections
    ClientCreate,
    /// Modify client connections
    ClientModify,
    /// Disconnect and delete client connections
    ClientDelete,
    /// View resources
    ResourceView,
    /// Create resources
    ResourceCreate,
    /// Modify resources
    ResourceModify,
    /// Delete resources
    ResourceDelete,
    /// View tools
    ToolView,
    /// Call tools
    ToolCall,
    /// View prompts
    PromptView,
    /// Use prompts
    PromptUse,
    /// Request sampling
    SamplingRequest,
    /// View routes
    RouterView,
    /// Modify routes
    RouterModify,
    /// View administrative state
    AdminView,
    /// Modify administrative state
    AdminModify,
}

/// Resource classes the ACL discriminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Supervised servers
    Server,
    /// Remote clients
    Client,
    /// MCP resources
    Resource,
    /// MCP tools
    Tool,
    /// MCP prompts
    Prompt,
    /// Sampling requests
    Sampling,
    /// The route table
    Router,
    /// Hub administration
    Admin,
}

impl ResourceKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Resource => "resource",
            Self::Tool => "tool",
            Self::Prompt => "prompt",
            Self::Sampling => "sampling",
            Self::Router => "router",
            Self::Admin => "admin",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "server" => Some(Self::Server),
            "client" => Some(Self::Client),
            "resource" => Some(Self::Resource),
            "tool" => Some(Self::Tool),
            "prompt" => Some(Self::Prompt),
            "sampling" => Some(Self::Sampling),
            "router" => Some(Self::Router),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// An ACL resource: a kind plus an optional id. No id means every id of
/// the kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AclResource {
    /// Resource kind
    pub kind: ResourceKind,
    /// Specific id, or `None` for the whole kind
    pub id: Option<String>,
}

impl AclResource {
    /// A resource covering every id of a kind.
    #[must_use]
    pub fn any(kind: ResourceKind) -> Self {
        Self { kind, id: None }
    }

    /// A resource naming a specific id.
    pub fn one(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
        }
    }

    /// Whether this role entry covers the queried resource.
    #[must_use]
    pub fn covers(&self, query: &AclResource) -> bool {
        if self.kind != query.kind {
            return false;
        }
        match (&self.id, &query.id) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(own), Some(queried)) => own == queried,
        }
    }

    fn store_key(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{id}", self.kind.as_str()),
            None => self.kind.as_str().to_string(),
        }
    }

    fn from_store_key(key: &str) -> Option<Self> {
        let (kind, id) = match key.split_once(':') {
            Some((kind, id)) => (kind, Some(id.to_string())),
            None => (key, None),
        };
        ResourceKind::parse(kind).map(|kind| Self { kind, id })
    }
}

/// A named set of resource permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Resource to permission-set mapping
    pub permissions: BTreeMap<AclResource, BTreeSet<Permission>>,
}

impl Role {
    /// Create an empty role.
    pub fn new(name: impl Into<String>, description: Option<&str>) -> Self {
        Self {
            name: name.into(),
            description: description.map(ToString::to_string),
            permissions: BTreeMap::new(),
        }
    }

    /// Grant a permission on a resource.
    pub fn grant(&mut self, resource: AclResource, permission: Permission) -> &mut Self {
        self.permissions.entry(resource).or_default().insert(permission);
        self
    }

    /// Revoke a permission from a resource; empty entries are dropped.
    pub fn revoke(&mut self, resource: &AclResource, permission: Permission) {
        if let Some(granted) = self.permissions.get_mut(resource) {
            granted.remove(&permission);
            if granted.is_empty() {
                self.permissions.remove(resource);
            }
        }
    }

    /// Whether any entry covering the resource grants the permission.
    #[must_use]
    pub fn has_permission(&self, resource: &AclResource, permission: Permission) -> bool {
        self.permissions
            .iter()
            .any(|(entry, granted)| entry.covers(resource) && granted.contains(&permission))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoleRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default)]
    permissions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RolesFile {
    #[serde(default)]
    roles: BTreeMap<String, RoleRecord>,
    #[serde(default)]
    user_roles: BTreeMap<String, Vec<String>>,
}

fn role_to_record(role: &Role) -> RoleRecord {
    let permissions = role
        .permissions
        .iter()
        .map(|(resource, granted)| {
            let names = granted
                .iter()
                .map(|permission| {
                    serde_json::to_value(permission)
                        .ok()
                        .and_then(|value| value.as_str().map(ToString::to_string))
                        .unwrap_or_default()
                })
                .collect();
            (resource.store_key(), names)
        })
        .collect();
    RoleRecord {
        description: role.description.clone(),
        permissions,
    }
}

fn record_to_role(name: &str, record: RoleRecord) -> Role {
    let mut role = Role::new(name, record.description.as_deref());
    for (key, names) in record.permissions {
        let Some(resource) = AclResource::from_store_key(&key) else {
            warn!("Unknown resource kind in role {name}: {key}");
            continue;
        };
        for permission_name in names {
            match serde_json::from_value::<Permission>(serde_json::Value::String(
                permission_name.clone(),
            )) {
                Ok(permission) => {
                    role.grant(resource.clone(), permission);
                }
                Err(_) => warn!("Unknown permission in role {name}: {permission_name}"),
            }
        }
    }
    role
}

#[derive(Debug, Default)]
struct AclState {
    roles: HashMap<String, Role>,
    user_roles: HashMap<String, Vec<String>>,
}

/// The access control list: roles, user assignments, persistence.
#[derive(Debug)]
pub struct AccessControl {
    roles_file: PathBuf,
    state: StdMutex<AclState>,
}

impl AccessControl {
    /// Create an ACL backed by the given roles file. Default roles are
    /// seeded first; the file, when present, is layered on top.
    pub fn new(roles_file: PathBuf) -> HubResult<Self> {
        let mut state = AclState::default();
        for role in default_roles() {
            state.roles.insert(role.name.clone(), role);
        }

        if let Some(file) = persist::load_json::<RolesFile>(&roles_file)? {
            for (name, record) in file.roles {
                let role = record_to_role(&name, record);
                state.roles.insert(name, role);
            }
            state.user_roles = file.user_roles.into_iter().collect();
            info!(
                "Loaded {} role(s) and {} assignment(s) from {}",
                state.roles.len(),
                state.user_roles.len(),
                roles_file.display()
            );
        }

        Ok(Self {
            roles_file,
            state: StdMutex::new(state),
        })
    }

    fn save(&self, state: &AclState) -> HubResult<()> {
        let file = RolesFile {
            roles: state
                .roles
                .iter()
                .map(|(name, role)| (name.clone(), role_to_record(role)))
                .collect(),
            user_roles: state
                .user_roles
                .iter()
                .map(|(user, roles)| (user.clone(), roles.clone()))
                .collect(),
        };
        persist::save_json(&self.roles_file, &file)
    }

    /// Add or replace a role.
    pub fn add_role(&self, role: Role) -> HubResult<()> {
        let mut state = self.state.lock().expect("acl mutex poisoned");
        info!("Added role: {}", role.name);
        state.roles.insert(role.name.clone(), role);
        self.save(&state)
    }

    /// Remove a role and every assignment of it.
    pub fn remove_role(&self, role_name: &str) -> HubResult<bool> {
        let mut state = self.state.lock().expect("acl mutex poisoned");
        if state.roles.remove(role_name).is_none() {
            warn!("Role not found: {role_name}");
            return Ok(false);
        }
        for roles in state.user_roles.values_mut() {
            roles.retain(|name| name != role_name);
        }
        state.user_roles.retain(|_, roles| !roles.is_empty());
        info!("Removed role: {role_name}");
        self.save(&state)?;
        Ok(true)
    }

    /// Assign a role to a user. Unknown roles are rejected.
    pub fn assign_role(&self, username: &str, role_name: &str) -> HubResult<bool> {
        let mut state = self.state.lock().expect("acl mutex poisoned");
        if !state.roles.contains_key(role_name) {
            warn!("Role not found: {role_name}");
            return Ok(false);
        }
        let roles = state.user_roles.entry(username.to_string()).or_default();
        if !roles.iter().any(|name| name == role_name) {
            roles.push(role_name.to_string());
            info!("Assigned role {role_name} to user {username}");
            self.save(&state)?;
        }
        Ok(true)
    }

    /// Revoke a role from a user.
    pub fn revoke_role(&self, username: &str, role_name: &str) -> HubResult<bool> {
        let mut state = self.state.lock().expect("acl mutex poisoned");
        let Some(roles) = state.user_roles.get_mut(username) else {
            warn!("User not found: {username}");
            return Ok(false);
        };
        let before = roles.len();
        roles.retain(|name| name != role_name);
        if roles.len() == before {
            warn!("Role {role_name} not assigned to user {username}");
            return Ok(false);
        }
        if roles.is_empty() {
            state.user_roles.remove(username);
        }
        info!("Revoked role {role_name} from user {username}");
        self.save(&state)?;
        Ok(true)
    }

    /// Role names assigned to a user.
    #[must_use]
    pub fn user_roles(&self, username: &str) -> Vec<String> {
        self.state
            .lock()
            .expect("acl mutex poisoned")
            .user_roles
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// All defined roles.
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        self.state
            .lock()
            .expect("acl mutex poisoned")
            .roles
            .values()
            .cloned()
            .collect()
    }

    /// Whether any role assigned to the user grants the permission on the
    /// resource.
    #[must_use]
    pub fn has_permission(
        &self,
        username: &str,
        resource: &AclResource,
        permission: Permission,
    ) -> bool {
        let state = self.state.lock().expect("acl mutex poisoned");
        let Some(role_names) = state.user_roles.get(username) else {
            return false;
        };
        role_names
            .iter()
            .filter_map(|name| state.roles.get(name))
            .any(|role| role.has_permission(resource, permission))
    }
}

fn default_roles() -> Vec<Role> {
    let mut admin = Role::new("admin", Some("Administrator with full access"));
    for permission in [
        Permission::ServerView,
        Permission::ServerCreate,
        Permission::ServerModify,
        Permission::ServerDelete,
        Permission::ServerStart,
        Permission::ServerStop,
    ] {
        admin.grant(AclResource::any(ResourceKind::Server), permission);
    }
    for permission in [
        Permission::ClientView,
        Permission::ClientCreate,
        Permission::ClientModify,
        Permission::ClientDelete,
    ] {
        admin.grant(AclResource::any(ResourceKind::Client), permission);
    }
    for permission in [
        Permission::ResourceView,
        Permission::ResourceCreate,
        Permission::ResourceModify,
        Permission::ResourceDelete,
    ] {
        admin.grant(AclResource::any(ResourceKind::Resource), permission);
    }
    admin
        .grant(AclResource::any(ResourceKind::Tool), Permission::ToolView)
        .grant(AclResource::any(ResourceKind::Tool), Permission::ToolCall)
        .grant(AclResource::any(ResourceKind::Prompt), Permission::PromptView)
        .grant(AclResource::any(ResourceKind::Prompt), Permission::PromptUse)
        .grant(
            AclResource::any(ResourceKind::Sampling),
            Permission::SamplingRequest,
        )
        .grant(AclResource::any(ResourceKind::Router), Permission::RouterView)
        .grant(AclResource::any(ResourceKind::Router), Permission::RouterModify)
        .grant(AclResource::any(ResourceKind::Admin), Permission::AdminView)
        .grant(AclResource::any(ResourceKind::Admin), Permission::AdminModify);

    let mut user = Role::new("user", Some("Regular user with limited access"));
    user.grant(AclResource::any(ResourceKind::Server), Permission::ServerView)
        .grant(AclResource::any(ResourceKind::Client), Permission::ClientView)
        .grant(
            AclResource::any(ResourceKind::Resource),
            Permission::ResourceView,
        )
        .grant(AclResource::any(ResourceKind::Tool), Permission::ToolView)
        .grant(AclResource::any(ResourceKind::Tool), Permission::ToolCall)
        .grant(AclResource::any(ResourceKind::Prompt), Permission::PromptView)
        .grant(AclResource::any(ResourceKind::Prompt), Permission::PromptUse)
        .grant(
            AclResource::any(ResourceKind::Sampling),
            Permission::SamplingRequest,
        );

    let mut guest = Role::new("guest", Some("Guest user with minimal access"));
    guest
        .grant(AclResource::any(ResourceKind::Server), Permission::ServerView)
        .grant(
            AclResource::any(ResourceKind::Resource),
            Permission::ResourceView,
        );

    vec![admin, user, guest]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn acl() -> (AccessControl, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let acl = AccessControl::new(dir.path().join("roles.json")).unwrap();
        (acl, dir)
    }

    #[test]
    fn default_roles_are_seeded() {
        let (acl, _dir) = acl();
        let names: Vec<String> = acl.roles().into_iter().map(|role| role.name).collect();
        for expected in ["admin", "user", "guest"] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }

    #[test]
    fn wildcard_resources_cover_specific_ids() {
        let any = AclResource::any(ResourceKind::Server);
        let s1 = AclResource::one(ResourceKind::Server, "s1");
        assert!(any.covers(&s1));
        assert!(!s1.covers(&any));
        assert!(s1.covers(&s1));
        assert!(!s1.covers(&AclResource::one(ResourceKind::Server, "s2")));
        assert!(!any.covers(&AclResource::any(ResourceKind::Client)));
    }

    #[test]
    fn permission_requires_an_assignment() {
        let (acl, _dir) = acl();
        let resource = AclResource::one(ResourceKind::Server, "s1");
        assert!(!acl.has_permission("u", &resource, Permission::ServerDelete));

        acl.assign_role("u", "user").unwrap();
        assert!(acl.has_permission("u", &resource, Permission::ServerView));
        assert!(!acl.has_permission("u", &resource, Permission::ServerDelete));

        acl.assign_role("u", "admin").unwrap();
        assert!(acl.has_permission("u", &resource, Permission::ServerDelete));
    }

    #[test]
    fn assignment_is_monotone_until_revoked() {
        let (acl, _dir) = acl();
        acl.assign_role("u", "admin").unwrap();
        let resource = AclResource::any(ResourceKind::Router);
        assert!(acl.has_permission("u", &resource, Permission::RouterModify));

        // Assigning another role never removes a grant.
        acl.assign_role("u", "guest").unwrap();
        assert!(acl.has_permission("u", &resource, Permission::RouterModify));

        acl.revoke_role("u", "admin").unwrap();
        assert!(!acl.has_permission("u", &resource, Permission::RouterModify));
    }

    #[test]
    fn unknown_role_cannot_be_assigned() {
        let (acl, _dir) = acl();
        assert!(!acl.assign_role("u", "superuser").unwrap());
        assert!(acl.user_roles("u").is_empty());
    }

    #[test]
    fn roles_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.json");

        {
            let acl = AccessControl::new(path.clone()).unwrap();
            let mut auditor = Role::new("auditor", Some("Read-only everywhere"));
            auditor.grant(AclResource::any(ResourceKind::Admin), Permission::AdminView);
            auditor.grant(
                AclResource::one(ResourceKind::Server, "s1"),
                Permission::ServerView,
            );
            acl.add_role(auditor).unwrap();
            acl.assign_role("carol", "auditor").unwrap();
        }

        let acl = AccessControl::new(path).unwrap();
        assert_eq!(acl.user_roles("carol"), vec!["auditor".to_string()]);
        assert!(acl.has_permission(
            "carol",
            &AclResource::one(ResourceKind::Server, "s1"),
            Permission::ServerView
        ));
        assert!(!acl.has_permission(
            "carol",
            &AclResource::one(ResourceKind::Server, "s2"),
            Permission::ServerView
        ));
    }

    #[test]
    fn removing_a_role_strips_assignments() {
        let (acl, _dir) = acl();
        let mut temp = Role::new("temp", None);
        temp.grant(AclResource::any(ResourceKind::Tool), Permission::ToolCall);
        acl.add_role(temp).unwrap();
        acl.assign_role("u", "temp").unwrap();

        assert!(acl.remove_role("temp").unwrap());
        assert!(acl.user_roles("u").is_empty());
        assert!(!acl.has_permission(
            "u",
            &AclResource::any(ResourceKind::Tool),
            Permission::ToolCall
        ));
    }
}
