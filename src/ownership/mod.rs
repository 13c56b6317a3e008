//! Vbucket ownership control.
//!
//! Reacts to topology changes: gives up vbs the plan moved away, takes
//! over vbs the plan moved here, and keeps retrying vbs whose stream
//! ended while still assigned to this node. Ownership transitions are
//! totally ordered per vb through the CAS-guarded metadata blob.

mod controller;
mod planner;
mod progress;

pub use controller::{
    run_failover_handler, ControlEvent, ControllerCtx, OwnershipController,
};
pub use planner::{vbucket_by_key, vbucket_distribution, Planner, StaticPlanner};
pub use progress::{RebalancePhase, RebalanceProgress, RebalanceStatus};

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;

/// Shared rebalance records, narrowly scoped; the companion
/// `vb_stream_requested` set lives with the stream client.
#[derive(Debug, Default)]
pub struct RebalanceShared {
    /// Vbs whose stream-close checkpoint has already been flushed in the
    /// current rebalance round.
    vbs_stream_closed: RwLock<HashSet<u16>>,
    /// Vbs that returned STREAMEND but still belong to this node.
    vbs_remaining_to_restream: Mutex<Vec<u16>>,
}

impl RebalanceShared {
    pub fn new() -> Arc<Self> {
        Arc::new(RebalanceShared::default())
    }

    /// Returns true exactly once per vb per rebalance round.
    pub fn mark_stream_closed(&self, vb: u16) -> bool {
        self.vbs_stream_closed.write().insert(vb)
    }

    /// New rebalance round: every vb may flush its close checkpoint again.
    pub fn reset_stream_closed(&self) {
        self.vbs_stream_closed.write().clear();
    }

    pub fn queue_restream(&self, vb: u16) {
        let mut list = self.vbs_remaining_to_restream.lock();
        if !list.contains(&vb) {
            list.push(vb);
        }
    }

    pub fn take_restream_list(&self) -> Vec<u16> {
        let mut list = std::mem::take(&mut *self.vbs_remaining_to_restream.lock());
        list.sort_unstable();
        list
    }

    pub fn requeue_restream(&self, vbs: Vec<u16>) {
        let mut list = self.vbs_remaining_to_restream.lock();
        for vb in vbs {
            if !list.contains(&vb) {
                list.push(vb);
            }
        }
    }

    pub fn clear_restream(&self) -> Vec<u16> {
        std::mem::take(&mut *self.vbs_remaining_to_restream.lock())
    }

    pub fn restream_len(&self) -> usize {
        self.vbs_remaining_to_restream.lock().len()
    }
}
