//! Hub metrics.
//!
//! Lock-free gauges refreshed by a periodic task and read by `hub/status`
//! and the external monitoring surface. Uptime counts from the moment the
//! hub starts.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

/// Gauge set for the hub.
#[derive(Debug)]
pub struct HubMetrics {
    started_at: DateTime<Utc>,
    /// Registered servers
    pub server_count: AtomicU64,
    /// Live MCP server connections
    pub mcp_server_count: AtomicU64,
    /// Tracked client records
    pub client_count: AtomicU64,
    /// Clients that completed the handshake
    pub mcp_client_count: AtomicU64,
    /// Messages routed since start
    pub messages_routed: AtomicU64,
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HubMetrics {
    /// Create a gauge set; uptime counts from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            server_count: AtomicU64::new(0),
            mcp_server_count: AtomicU64::new(0),
            client_count: AtomicU64::new(0),
            mcp_client_count: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
        }
    }

    /// Seconds since the hub started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Refresh the population gauges in one pass.
    pub fn refresh(
        &self,
        server_count: usize,
        mcp_server_count: usize,
        client_count: usize,
        mcp_client_count: usize,
    ) {
        self.server_count
            .store(server_count as u64, Ordering::Relaxed);
        self.mcp_server_count
            .store(mcp_server_count as u64, Ordering::Relaxed);
        self.client_count
            .store(client_count as u64, Ordering::Relaxed);
        self.mcp_client_count
            .store(mcp_client_count as u64, Ordering::Relaxed);
    }

    /// Count one routed message.
    pub fn count_routed_message(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for the monitoring surface.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        json!({
            "hub_uptime": self.uptime_secs(),
            "hub_server_count": self.server_count.load(Ordering::Relaxed),
            "hub_mcp_server_count": self.mcp_server_count.load(Ordering::Relaxed),
            "hub_client_count": self.client_count.load(Ordering::Relaxed),
            "hub_mcp_client_count": self.mcp_client_count.load(Ordering::Relaxed),
            "hub_messages_routed": self.messages_routed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn refresh_updates_every_gauge() {
        let metrics = HubMetrics::new();
        metrics.refresh(3, 2, 5, 4);
        metrics.count_routed_message();
        metrics.count_routed_message();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["hub_server_count"], json!(3));
        assert_eq!(snapshot["hub_mcp_server_count"], json!(2));
        assert_eq!(snapshot["hub_client_count"], json!(5));
        assert_eq!(snapshot["hub_mcp_client_count"], json!(4));
        assert_eq!(snapshot["hub_messages_routed"], json!(2));
    }
}
