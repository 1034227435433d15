//! Configuration system.
//!
//! Loads chat configuration from JSON strings/files (file IO left to the
//! binary crates). Shared by the hub and the client so a single JSON
//! document can configure both sides of a deployment.

use serde::{Deserialize, Serialize};

/// Root configuration shared by hub/client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Hub TCP control-plane listen/connect address, e.g. `0.0.0.0:12345`.
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,
    /// Hub UDP message-plane listen/connect address, e.g. `0.0.0.0:12346`.
    #[serde(default = "default_udp_addr")]
    pub udp_addr: String,
    /// Reliable-UDP sliding window size (`W`).
    #[serde(default = "default_window")]
    pub window: usize,
    /// Reliable-UDP retry timeout in seconds (`T`).
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: f64,
    /// Reliable-UDP max retries (`R`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Client keepalive ping interval, seconds.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Topology node inactivity timeout, seconds.
    #[serde(default = "default_topology_gc_secs")]
    pub topology_gc_secs: u64,
    /// Reliable-UDP out-of-order buffer entry lifetime, seconds.
    #[serde(default = "default_reorder_buffer_secs")]
    pub reorder_buffer_secs: u64,
}

fn default_tcp_addr() -> String {
    "0.0.0.0:12345".to_string()
}

fn default_udp_addr() -> String {
    "0.0.0.0:12346".to_string()
}

fn default_window() -> usize {
    5
}

fn default_retry_timeout_secs() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_keepalive_secs() -> u64 {
    10
}

fn default_topology_gc_secs() -> u64 {
    60
}

fn default_reorder_buffer_secs() -> u64 {
    30
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            tcp_addr: default_tcp_addr(),
            udp_addr: default_udp_addr(),
            window: default_window(),
            retry_timeout_secs: default_retry_timeout_secs(),
            max_retries: default_max_retries(),
            keepalive_secs: default_keepalive_secs(),
            topology_gc_secs: default_topology_gc_secs(),
            reorder_buffer_secs: default_reorder_buffer_secs(),
        }
    }
}

impl ChatConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn retry_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.retry_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_ports() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.tcp_addr, "0.0.0.0:12345");
        assert_eq!(cfg.udp_addr, "0.0.0.0:12346");
        assert_eq!(cfg.window, 5);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = ChatConfig::from_json_str(r#"{"tcp_addr":"127.0.0.1:9000"}"#).unwrap();
        assert_eq!(cfg.tcp_addr, "127.0.0.1:9000");
        assert_eq!(cfg.udp_addr, "0.0.0.0:12346");
    }
}
