//! Planner capability and vb distribution helpers.
//!
//! The planner itself is an external component; the core only consumes
//! its `vb -> node` output through this trait.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub trait Planner: Send + Sync + 'static {
    /// Node (host:port) the plan assigns this vb to, if any.
    fn vb_owner(&self, vb: u16) -> Option<String>;

    fn should_own(&self, vb: u16, host_port: &str) -> bool {
        self.vb_owner(vb).as_deref() == Some(host_port)
    }

    /// Vbs the plan assigns to `host_port`, sorted.
    fn vbs_for(&self, host_port: &str, num_vbuckets: u16) -> Vec<u16> {
        (0..num_vbuckets)
            .filter(|&vb| self.should_own(vb, host_port))
            .collect()
    }
}

/// Plan held in memory and swapped on topology change; backs tests and
/// the demo node.
#[derive(Debug, Default)]
pub struct StaticPlanner {
    assignments: RwLock<AHashMap<u16, String>>,
}

impl StaticPlanner {
    pub fn new() -> Arc<Self> {
        Arc::new(StaticPlanner::default())
    }

    pub fn assign(&self, host_port: &str, vbs: impl IntoIterator<Item = u16>) {
        let mut map = self.assignments.write();
        for vb in vbs {
            map.insert(vb, host_port.to_string());
        }
    }

    /// Replace the whole plan with an even split across `nodes`.
    pub fn rebalance_across(&self, nodes: &[&str], num_vbuckets: u16) {
        let all: Vec<u16> = (0..num_vbuckets).collect();
        let split = vbucket_distribution(&all, nodes.len());
        let mut map = AHashMap::new();
        for (node, vbs) in nodes.iter().zip(split) {
            for vb in vbs {
                map.insert(vb, node.to_string());
            }
        }
        *self.assignments.write() = map;
    }

    pub fn unassign(&self, vbs: impl IntoIterator<Item = u16>) {
        let mut map = self.assignments.write();
        for vb in vbs {
            map.remove(&vb);
        }
    }
}

impl Planner for StaticPlanner {
    fn vb_owner(&self, vb: u16) -> Option<String> {
        self.assignments.read().get(&vb).cloned()
    }
}

/// Round-robin split of vbs across `n` buckets, the distribution the
/// planner and the worker thread map both use.
pub fn vbucket_distribution(vbs: &[u16], n: usize) -> Vec<Vec<u16>> {
    let n = n.max(1);
    let mut out = vec![Vec::new(); n];
    for (i, &vb) in vbs.iter().enumerate() {
        out[i % n].push(vb);
    }
    out
}

/// Map a document key to its vbucket (crc32 of the key, mod vb count).
pub fn vbucket_by_key(key: &[u8], num_vbuckets: u16) -> u16 {
    debug_assert!(num_vbuckets > 0, "vb count must be positive");
    (crc32fast::hash(key) % num_vbuckets.max(1) as u32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_covers_all_vbs_evenly() {
        let vbs: Vec<u16> = (0..8).collect();
        let split = vbucket_distribution(&vbs, 3);
        assert_eq!(split.len(), 3);
        let total: usize = split.iter().map(Vec::len).sum();
        assert_eq!(total, 8);
        let max = split.iter().map(Vec::len).max().unwrap();
        let min = split.iter().map(Vec::len).min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn key_to_vb_is_stable_and_in_range() {
        let vb = vbucket_by_key(b"doc_1", 1024);
        assert_eq!(vb, vbucket_by_key(b"doc_1", 1024));
        assert!(vb < 1024);
        // Differs for some other key (crc32 spreads).
        assert_ne!(vbucket_by_key(b"doc_1", 1024), vbucket_by_key(b"doc_2", 1024));
    }

    #[test]
    fn static_planner_assign_and_query() {
        let planner = StaticPlanner::new();
        planner.rebalance_across(&["node-a:8096", "node-b:8096"], 8);
        let a_vbs = planner.vbs_for("node-a:8096", 8);
        let b_vbs = planner.vbs_for("node-b:8096", 8);
        assert_eq!(a_vbs.len() + b_vbs.len(), 8);
        assert!(planner.should_own(a_vbs[0], "node-a:8096"));
        assert!(!planner.should_own(a_vbs[0], "node-b:8096"));
    }
}
