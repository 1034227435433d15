//! Network topology tracking.
//!
//! Mirrors the original `NetworkTopology` class: a small in-memory graph
//! of peers (`nodes`) and the links between them (`edges`), refreshed by
//! `PING`/`TOPO` traffic and garbage-collected on a fixed inactivity
//! timeout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A tracked peer. `last_seen` is process-local (`Instant`) and never
/// serialized; snapshots carry only the public fields.
#[derive(Debug, Clone)]
struct Node {
    ip: String,
    port: u16,
    latency_ms: f64,
    last_seen: Instant,
}

/// A tracked undirected link between two peers.
#[derive(Debug, Clone)]
struct Edge {
    quality: f64,
    last_seen: Instant,
}

/// Public, serializable view of one node, sent over the wire in a `TOPO`
/// reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub user: String,
    pub ip: String,
    pub port: u16,
    pub latency_ms: f64,
}

/// Public, serializable view of one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeInfo {
    pub from: String,
    pub to: String,
    pub quality: f64,
}

/// A GC'd, point-in-time view of the whole graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<NodeInfo>,
    #[serde(rename = "connections")]
    pub edges: Vec<EdgeInfo>,
}

/// Default quality assigned to edges the hub infers itself (`PING`/`TOPO`
/// handling never measures round-trip quality directly).
pub const DEFAULT_EDGE_QUALITY: f64 = 50.0;

/// In-memory graph of peers and the links between them.
///
/// Not internally synchronized — callers guarding it with a `Mutex`
/// (as the hub and client both do) must not nest that lock inside any
/// other lock in this crate.
#[derive(Debug, Default)]
pub struct TopologyTracker {
    nodes: HashMap<String, Node>,
    edges: HashMap<(String, String), Edge>,
    gc_timeout: Duration,
}

fn edge_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl TopologyTracker {
    pub fn new(gc_timeout: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            gc_timeout,
        }
    }

    /// Inserts or refreshes a node. Latency is smoothed with a flat
    /// two-sample mean `(old + new) / 2` on update, not an EWMA — a node
    /// seen for the first time takes `latency_ms` as-is.
    pub fn upsert_node(&mut self, user: &str, ip: &str, port: u16, latency_ms: f64) {
        self.nodes
            .entry(user.to_string())
            .and_modify(|n| {
                n.ip = ip.to_string();
                n.port = port;
                n.latency_ms = (n.latency_ms + latency_ms) / 2.0;
                n.last_seen = Instant::now();
            })
            .or_insert(Node {
                ip: ip.to_string(),
                port,
                latency_ms,
                last_seen: Instant::now(),
            });
    }

    /// Inserts or overwrites the undirected link `from`<->`to`. Quality is
    /// overwritten, never smoothed, and derived from latency as
    /// `clamp(0, 100, 100 - latency_ms / 10)` when a latency is supplied.
    pub fn update_link(&mut self, from: &str, to: &str, quality: f64) {
        let key = edge_key(from, to);
        self.edges.insert(
            key,
            Edge {
                quality: quality.clamp(0.0, 100.0),
                last_seen: Instant::now(),
            },
        );
    }

    /// Whether an edge between `a` and `b` has already been recorded.
    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.edges.contains_key(&edge_key(a, b))
    }

    /// Whether `user` has already been admitted as a node.
    pub fn has_node(&self, user: &str) -> bool {
        self.nodes.contains_key(user)
    }

    /// Convenience: derives edge quality from a measured latency using
    /// the same formula the client uses for `PING` round-trips.
    pub fn quality_from_latency(latency_ms: f64) -> f64 {
        (100.0 - latency_ms / 10.0).clamp(0.0, 100.0)
    }

    /// Drops nodes (and their incident edges) not seen within the GC
    /// timeout.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let timeout = self.gc_timeout;
        let dead: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| now.duration_since(n.last_seen) > timeout)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &dead {
            self.nodes.remove(user);
        }
        if !dead.is_empty() {
            self.edges
                .retain(|(a, b), _| !dead.contains(a) && !dead.contains(b));
        }
    }

    /// GCs, then returns a serializable snapshot of what remains.
    pub fn snapshot(&mut self) -> TopologySnapshot {
        self.gc();
        let nodes = self
            .nodes
            .iter()
            .map(|(user, n)| NodeInfo {
                user: user.clone(),
                ip: n.ip.clone(),
                port: n.port,
                latency_ms: n.latency_ms,
            })
            .collect();
        let edges = self
            .edges
            .iter()
            .map(|(k, e)| EdgeInfo {
                from: k.0.clone(),
                to: k.1.clone(),
                quality: e.quality,
            })
            .collect();
        TopologySnapshot { nodes, edges }
    }

    pub fn remove_user(&mut self, user: &str) {
        self.nodes.remove(user);
        self.edges.retain(|(a, b), _| a != user && b != user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_latency_is_exact() {
        let mut t = TopologyTracker::new(Duration::from_secs(60));
        t.upsert_node("alice", "127.0.0.1", 1, 40.0);
        let snap = t.snapshot();
        assert_eq!(snap.nodes[0].latency_ms, 40.0);
    }

    #[test]
    fn repeat_latency_is_flat_averaged_not_ewma() {
        let mut t = TopologyTracker::new(Duration::from_secs(60));
        t.upsert_node("alice", "127.0.0.1", 1, 40.0);
        t.upsert_node("alice", "127.0.0.1", 1, 20.0);
        let snap = t.snapshot();
        assert_eq!(snap.nodes[0].latency_ms, 30.0);
    }

    #[test]
    fn edge_is_overwritten_not_smoothed() {
        let mut t = TopologyTracker::new(Duration::from_secs(60));
        t.update_link("alice", "bob", 80.0);
        t.update_link("alice", "bob", 10.0);
        let snap = t.snapshot();
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.edges[0].quality, 10.0);
    }

    #[test]
    fn edge_key_is_symmetric() {
        let mut t = TopologyTracker::new(Duration::from_secs(60));
        t.update_link("bob", "alice", 50.0);
        t.update_link("alice", "bob", 75.0);
        let snap = t.snapshot();
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.edges[0].quality, 75.0);
    }

    #[test]
    fn quality_clamps_to_0_100() {
        assert_eq!(TopologyTracker::quality_from_latency(2000.0), 0.0);
        assert_eq!(TopologyTracker::quality_from_latency(-50.0), 100.0);
        assert_eq!(TopologyTracker::quality_from_latency(500.0), 50.0);
    }

    #[test]
    fn gc_drops_inactive_nodes_and_incident_edges() {
        let mut t = TopologyTracker::new(Duration::from_millis(0));
        t.upsert_node("alice", "127.0.0.1", 1, 10.0);
        t.update_link("alice", "bob", 50.0);
        std::thread::sleep(Duration::from_millis(5));
        let snap = t.snapshot();
        assert!(snap.nodes.is_empty());
        assert!(snap.edges.is_empty());
    }

    #[test]
    fn snapshot_always_gcs_first() {
        let mut t = TopologyTracker::new(Duration::from_millis(0));
        t.upsert_node("alice", "127.0.0.1", 1, 10.0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.snapshot().nodes.is_empty());
    }

    #[test]
    fn remove_user_drops_incident_edges() {
        let mut t = TopologyTracker::new(Duration::from_secs(60));
        t.upsert_node("alice", "127.0.0.1", 1, 10.0);
        t.update_link("alice", "bob", 50.0);
        t.remove_user("alice");
        let snap = t.snapshot();
        assert!(snap.nodes.is_empty());
        assert!(snap.edges.is_empty());
    }
}
