//! Route targets and method patterns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// The class of endpoint a route target names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// A specific server connection
    Server,
    /// A specific client connection
    Client,
    /// Every server connection
    AllServers,
    /// Every client connection
    AllClients,
    /// Every server declaring a capability
    Capability,
    /// The hub itself
    Hub,
}

/// A tagged endpoint or endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Target class
    #[serde(rename = "type")]
    pub kind: RouteKind,
    /// Endpoint id, for `Server` and `Client` targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Capability path, for `Capability` targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl RouteTarget {
    /// A specific server.
    pub fn server(id: impl Into<String>) -> Self {
        Self {
            kind: RouteKind::Server,
            target_id: Some(id.into()),
            capability: None,
        }
    }

    /// A specific client.
    pub fn client(id: impl Into<String>) -> Self {
        Self {
            kind: RouteKind::Client,
            target_id: Some(id.into()),
            capability: None,
        }
    }

    /// Every server.
    #[must_use]
    pub fn all_servers() -> Self {
        Self {
            kind: RouteKind::AllServers,
            target_id: None,
            capability: None,
        }
    }

    /// Every client.
    #[must_use]
    pub fn all_clients() -> Self {
        Self {
            kind: RouteKind::AllClients,
            target_id: None,
            capability: None,
        }
    }

    /// Every server declaring a capability path.
    pub fn capability(path: impl Into<String>) -> Self {
        Self {
            kind: RouteKind::Capability,
            target_id: None,
            capability: Some(path.into()),
        }
    }

    /// The hub itself.
    #[must_use]
    pub fn hub() -> Self {
        Self {
            kind: RouteKind::Hub,
            target_id: None,
            capability: None,
        }
    }

    /// Reject targets missing their discriminating field.
    pub fn validate(&self) -> HubResult<()> {
        match self.kind {
            RouteKind::Server | RouteKind::Client if self.target_id.is_none() => {
                Err(HubError::InvalidRequest(format!(
                    "Target id is required for {self} routes"
                )))
            }
            RouteKind::Capability if self.capability.is_none() => Err(HubError::InvalidRequest(
                "Capability is required for capability routes".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether a route's source entry applies to a concrete message
    /// source: classes match on kind alone, specific targets also match
    /// their id or capability.
    #[must_use]
    pub fn matches_source(&self, source: &RouteTarget) -> bool {
        if self.kind != source.kind {
            return false;
        }
        match self.kind {
            RouteKind::Server | RouteKind::Client => {
                // A source with no id (class query) matches any entry of
                // the kind; otherwise ids must agree.
                source.target_id.is_none() || self.target_id == source.target_id
            }
            RouteKind::Capability => {
                source.capability.is_none() || self.capability == source.capability
            }
            _ => true,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RouteKind::Server => {
                write!(f, "SERVER:{}", self.target_id.as_deref().unwrap_or("?"))
            }
            RouteKind::Client => {
                write!(f, "CLIENT:{}", self.target_id.as_deref().unwrap_or("?"))
            }
            RouteKind::AllServers => write!(f, "ALL_SERVERS"),
            RouteKind::AllClients => write!(f, "ALL_CLIENTS"),
            RouteKind::Capability => {
                write!(f, "CAPABILITY:{}", self.capability.as_deref().unwrap_or("?"))
            }
            RouteKind::Hub => write!(f, "HUB"),
        }
    }
}

/// An immutable routing rule: messages from `source` whose method matches
/// `method_pattern` go to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    /// Message origin
    pub source: RouteTarget,
    /// Message destination
    pub destination: RouteTarget,
    /// Method pattern; `None` matches every method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_pattern: Option<String>,
}

impl Route {
    /// Create a route.
    #[must_use]
    pub fn new(
        source: RouteTarget,
        destination: RouteTarget,
        method_pattern: Option<String>,
    ) -> Self {
        Self {
            source,
            destination,
            method_pattern,
        }
    }

    /// Whether this route's pattern matches a method name.
    ///
    /// Supported patterns: exact, `foo/*` (path prefix), `foo*` (prefix),
    /// and a single embedded wildcard `foo/*/bar`. A missing pattern
    /// matches everything.
    #[must_use]
    pub fn matches_method(&self, method: &str) -> bool {
        let Some(pattern) = self.method_pattern.as_deref() else {
            return true;
        };

        if pattern == method {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return method
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            return method.starts_with(prefix);
        }

        // Single embedded wildcard: prefix and suffix must both hold.
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            return method.starts_with(parts[0])
                && method.ends_with(parts[1])
                && method.len() >= parts[0].len() + parts[1].len();
        }

        false
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method_pattern {
            Some(pattern) => write!(f, "{} -> {} ({pattern})", self.source, self.destination),
            None => write!(f, "{} -> {}", self.source, self.destination),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(pattern: Option<&str>) -> Route {
        Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s1"),
            pattern.map(ToString::to_string),
        )
    }

    #[test]
    fn null_pattern_matches_everything() {
        let route = route(None);
        assert!(route.matches_method("tools/call"));
        assert!(route.matches_method("anything"));
    }

    #[test]
    fn exact_match() {
        let route = route(Some("tools/call"));
        assert!(route.matches_method("tools/call"));
        assert!(!route.matches_method("tools/list"));
    }

    #[test]
    fn path_prefix_wildcard() {
        let route = route(Some("resources/*"));
        assert!(route.matches_method("resources/list"));
        assert!(route.matches_method("resources/read"));
        assert!(route.matches_method("resources/sub/deep"));
        assert!(!route.matches_method("resources"));
        assert!(!route.matches_method("resourcesX"));
        assert!(!route.matches_method("tools/call"));
    }

    #[test]
    fn bare_prefix_wildcard() {
        let route = route(Some("resources*"));
        assert!(route.matches_method("resources"));
        assert!(route.matches_method("resources/list"));
        assert!(route.matches_method("resourcesX"));
        assert!(!route.matches_method("resource"));
    }

    #[test]
    fn embedded_wildcard() {
        let route = route(Some("resources/*/get"));
        assert!(route.matches_method("resources/db/get"));
        assert!(route.matches_method("resources//get"));
        assert!(!route.matches_method("resources/db/put"));
        assert!(!route.matches_method("tools/db/get"));
    }

    #[test]
    fn embedded_wildcard_does_not_double_count_overlap() {
        let route = route(Some("ab*ba"));
        assert!(route.matches_method("abba"));
        assert!(route.matches_method("abxba"));
        // "aba" starts with "ab" and ends with "ba", but the two halves
        // would overlap.
        assert!(!route.matches_method("aba"));
    }

    #[test]
    fn two_wildcards_never_match() {
        let route = route(Some("a/*/b/*/c"));
        assert!(!route.matches_method("a/x/b/y/c"));
    }

    #[test]
    fn source_matching_discriminates_ids() {
        let entry = RouteTarget::client("c1");
        assert!(entry.matches_source(&RouteTarget::client("c1")));
        assert!(!entry.matches_source(&RouteTarget::client("c2")));
        assert!(!entry.matches_source(&RouteTarget::server("c1")));

        let class = RouteTarget::all_clients();
        assert!(class.matches_source(&RouteTarget::all_clients()));
        assert!(!class.matches_source(&RouteTarget::client("c1")));
    }

    #[test]
    fn capability_targets_compare_paths() {
        let entry = RouteTarget::capability("resources.subscriptions");
        assert!(entry.matches_source(&RouteTarget::capability("resources.subscriptions")));
        assert!(!entry.matches_source(&RouteTarget::capability("tools")));
    }

    #[test]
    fn target_validation() {
        assert!(RouteTarget::server("s1").validate().is_ok());
        assert!(RouteTarget::hub().validate().is_ok());

        let bare_server = RouteTarget {
            kind: RouteKind::Server,
            target_id: None,
            capability: None,
        };
        assert!(bare_server.validate().is_err());

        let bare_capability = RouteTarget {
            kind: RouteKind::Capability,
            target_id: None,
            capability: None,
        };
        assert!(bare_capability.validate().is_err());
    }

    #[test]
    fn display_forms() {
        assert_eq!(RouteTarget::server("s1").to_string(), "SERVER:s1");
        assert_eq!(RouteTarget::all_clients().to_string(), "ALL_CLIENTS");
        assert_eq!(
            route(Some("tools/*")).to_string(),
            "CLIENT:c1 -> SERVER:s1 (tools/*)"
        );
    }
}
