//! Cluster topology view.
//!
//! Topology is owned by external services; the core only reads two maps:
//! which KV host serves each vb, and which eventing nodes are alive. The
//! trait is the narrow capability handed to the stream client and the
//! ownership controller.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub trait ClusterView: Send + Sync + 'static {
    /// vb -> KV host currently serving it.
    fn kv_vb_map(&self) -> AHashMap<u16, String>;

    /// Live eventing nodes (host:port), sorted.
    fn eventing_nodes(&self) -> Vec<String>;

    /// Current high seqno per vb, used by the `from_now` stream boundary.
    /// Views that cannot answer report an empty map (treated as seq 0).
    fn vb_high_seqnos(&self) -> AHashMap<u16, u64> {
        AHashMap::new()
    }
}

/// Mutable in-memory view for tests and the demo node; production swaps
/// in a view backed by the cluster manager.
#[derive(Debug, Default)]
pub struct StaticClusterView {
    kv_vb_map: RwLock<AHashMap<u16, String>>,
    eventing_nodes: RwLock<Vec<String>>,
    high_seqnos: RwLock<AHashMap<u16, u64>>,
}

impl StaticClusterView {
    pub fn new() -> Arc<Self> {
        Arc::new(StaticClusterView::default())
    }

    /// Assign a contiguous vb range to one KV host.
    pub fn assign_vbs(&self, host: &str, vbs: impl IntoIterator<Item = u16>) {
        let mut map = self.kv_vb_map.write();
        for vb in vbs {
            map.insert(vb, host.to_string());
        }
    }

    pub fn set_eventing_nodes(&self, nodes: &[&str]) {
        let mut list: Vec<String> = nodes.iter().map(|s| s.to_string()).collect();
        list.sort();
        *self.eventing_nodes.write() = list;
    }

    pub fn set_high_seqno(&self, vb: u16, seq: u64) {
        self.high_seqnos.write().insert(vb, seq);
    }
}

impl ClusterView for StaticClusterView {
    fn kv_vb_map(&self) -> AHashMap<u16, String> {
        self.kv_vb_map.read().clone()
    }

    fn eventing_nodes(&self) -> Vec<String> {
        self.eventing_nodes.read().clone()
    }

    fn vb_high_seqnos(&self) -> AHashMap<u16, u64> {
        self.high_seqnos.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_view_round_trip() {
        let view = StaticClusterView::new();
        view.assign_vbs("kv1:11210", 0..4);
        view.assign_vbs("kv2:11210", 4..8);
        view.set_eventing_nodes(&["node-b:8096", "node-a:8096"]);

        let map = view.kv_vb_map();
        assert_eq!(map.get(&2).map(String::as_str), Some("kv1:11210"));
        assert_eq!(map.get(&6).map(String::as_str), Some("kv2:11210"));
        assert_eq!(view.eventing_nodes(), vec!["node-a:8096", "node-b:8096"]);
    }
}
