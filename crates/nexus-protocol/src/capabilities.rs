//! Capability trees and dot-path lookup.
//!
//! Capabilities travel as a free-form JSON object during the handshake.
//! A path like `resources.subscriptions` is present when every segment
//! exists while descending the tree; the leaf value itself is not
//! interpreted beyond existence.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A negotiated capability tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub Value);

impl Capabilities {
    /// Wrap a raw JSON tree.
    #[must_use]
    pub fn new(tree: Value) -> Self {
        Self(tree)
    }

    /// The capability tree the hub advertises on both of its roles:
    /// resources with subscriptions, tools, prompts, and sampling.
    #[must_use]
    pub fn hub() -> Self {
        Self(json!({
            "resources": {
                "subscriptions": true
            },
            "tools": true,
            "prompts": true,
            "sampling": true
        }))
    }

    /// Check a dot-separated capability path against the tree.
    #[must_use]
    pub fn has(&self, path: &str) -> bool {
        let mut current = &self.0;
        for part in path.split('.') {
            match current {
                Value::Object(map) => match map.get(part) {
                    Some(next) => current = next,
                    None => return false,
                },
                _ => return false,
            }
        }
        true
    }

    /// The raw tree.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Capabilities {
    fn from(tree: Value) -> Self {
        Self(tree)
    }
}
