//! Typed stats records and per-vb processing state.
//!
//! Worker-reported stats use fixed typed fields plus an open extension map
//! so newer workers can report counters this node does not know yet.
//! Aggregation across workers is explicit per-field summation.

use crate::checkpoint::StreamStatus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Execution counters reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    #[serde(default)]
    pub on_update_success: u64,
    #[serde(default)]
    pub on_update_failure: u64,
    #[serde(default)]
    pub on_delete_success: u64,
    #[serde(default)]
    pub on_delete_failure: u64,
    #[serde(default)]
    pub doc_timer_create_failure: u64,
    #[serde(default)]
    pub messages_parsed: u64,
    /// Counters this node does not have a typed field for.
    #[serde(flatten)]
    pub ext: BTreeMap<String, u64>,
}

impl ExecutionStats {
    /// Explicit per-field summation; extension keys are summed by name.
    pub fn add(&mut self, other: &ExecutionStats) {
        self.on_update_success += other.on_update_success;
        self.on_update_failure += other.on_update_failure;
        self.on_delete_success += other.on_delete_success;
        self.on_delete_failure += other.on_delete_failure;
        self.doc_timer_create_failure += other.doc_timer_create_failure;
        self.messages_parsed += other.messages_parsed;
        for (key, value) in &other.ext {
            *self.ext.entry(key.clone()).or_insert(0) += value;
        }
    }
}

/// Failure counters reported by the worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailureStats {
    #[serde(default)]
    pub bucket_op_exception_count: u64,
    #[serde(default)]
    pub checkpoint_failure_count: u64,
    #[serde(default)]
    pub n1ql_op_exception_count: u64,
    #[serde(default)]
    pub timeout_count: u64,
    #[serde(default)]
    pub timer_callback_missing_counter: u64,
    #[serde(flatten)]
    pub ext: BTreeMap<String, u64>,
}

impl FailureStats {
    pub fn add(&mut self, other: &FailureStats) {
        self.bucket_op_exception_count += other.bucket_op_exception_count;
        self.checkpoint_failure_count += other.checkpoint_failure_count;
        self.n1ql_op_exception_count += other.n1ql_op_exception_count;
        self.timeout_count += other.timeout_count;
        self.timer_callback_missing_counter += other.timer_callback_missing_counter;
        for (key, value) in &other.ext {
            *self.ext.entry(key.clone()).or_insert(0) += value;
        }
    }
}

/// Latency histogram buckets (microsecond bucket label -> count).
pub type LatencyStats = BTreeMap<String, u64>;

/// Bucket-client exception counts by error name.
pub type LcbExceptionStats = BTreeMap<String, u64>;

/// Per-second processing rates published on the stats ticker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventProcessingStats {
    pub dcp_events_processed_psec: u64,
    pub timer_events_processed_psec: u64,
    pub timestamp: String,
}

/// Compile result reported by the worker for handler code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompileStatus {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub compile_success: bool,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub line_number: i32,
    #[serde(default)]
    pub column_number: i32,
    #[serde(default)]
    pub description: String,
}

/// Queue depths periodically reported by the worker; drives throttling.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerQueueSizes {
    #[serde(default)]
    pub agg_queue_size: u64,
    #[serde(default)]
    pub doc_timer_queue_size: u64,
}

/// Monotonic event counters owned by the dispatch pipeline.
#[derive(Debug, Default)]
pub struct EventCounters {
    pub dcp_mutation: AtomicU64,
    pub dcp_deletion: AtomicU64,
    pub suppressed_mutation: AtomicU64,
    pub doc_timer_sent: AtomicU64,
    pub cron_timer_sent: AtomicU64,
    pub timer_acks_received: AtomicU64,
    pub timer_entries_stored: AtomicU64,
    pub timer_decode_errors: AtomicU64,
    pub timer_scans_skipped: AtomicU64,
}

impl EventCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn dcp_events_processed(&self) -> u64 {
        Self::read(&self.dcp_mutation)
            + Self::read(&self.dcp_deletion)
            + Self::read(&self.suppressed_mutation)
    }

    pub fn timer_events_processed(&self) -> u64 {
        Self::read(&self.doc_timer_sent) + Self::read(&self.cron_timer_sent)
    }
}

/// In-memory per-vb processing record.
///
/// The checkpoint ticker flushes these into `VbucketBlob`s; the ownership
/// controller consults them to decide what this node currently runs.
#[derive(Debug, Clone, Default)]
pub struct VbStat {
    pub assigned_worker: String,
    pub current_vb_owner: String,
    pub node_uuid: String,
    pub vbuuid: u64,
    pub stream_status: Option<StreamStatus>,
    pub last_processed_seq_no: u64,
    pub last_doc_timer_feedback_seq_no: u64,
    pub currently_processed_doc_timer: String,
}

/// Reader-writer guarded table of `VbStat`, one slot per vbucket.
#[derive(Debug)]
pub struct VbProcessingStats {
    slots: RwLock<Vec<VbStat>>,
}

impl VbProcessingStats {
    pub fn new(num_vbuckets: u16) -> Self {
        VbProcessingStats {
            slots: RwLock::new(vec![VbStat::default(); num_vbuckets as usize]),
        }
    }

    pub fn num_vbuckets(&self) -> u16 {
        self.slots.read().len() as u16
    }

    pub fn get(&self, vb: u16) -> VbStat {
        self.slots.read()[vb as usize].clone()
    }

    /// Apply a mutation to one vb slot under the write lock.
    pub fn update<F: FnOnce(&mut VbStat)>(&self, vb: u16, f: F) {
        f(&mut self.slots.write()[vb as usize]);
    }

    pub fn last_processed_seq(&self, vb: u16) -> u64 {
        self.slots.read()[vb as usize].last_processed_seq_no
    }

    pub fn set_last_processed_seq(&self, vb: u16, seq: u64) {
        self.update(vb, |stat| stat.last_processed_seq_no = seq);
    }

    /// Monotonic update of the timer feedback seq; decreases are discarded.
    pub fn advance_timer_feedback_seq(&self, vb: u16, seq: u64) -> bool {
        let mut slots = self.slots.write();
        let stat = &mut slots[vb as usize];
        if seq > stat.last_doc_timer_feedback_seq_no {
            stat.last_doc_timer_feedback_seq_no = seq;
            true
        } else {
            false
        }
    }

    /// True when the slot records this (node, worker) as the live consumer.
    pub fn is_owned_by(&self, vb: u16, node_uuid: &str, worker: &str) -> bool {
        let slots = self.slots.read();
        let stat = &slots[vb as usize];
        stat.node_uuid == node_uuid && stat.assigned_worker == worker
    }

    /// Sorted list of vbs this (node, worker) currently owns.
    pub fn owned_vbs(&self, node_uuid: &str, worker: &str) -> Vec<u16> {
        let slots = self.slots.read();
        let mut owned: Vec<u16> = (0..slots.len() as u16)
            .filter(|&vb| {
                let stat = &slots[vb as usize];
                stat.node_uuid == node_uuid && stat.assigned_worker == worker
            })
            .collect();
        owned.sort_unstable();
        owned
    }

    pub fn clear_ownership(&self, vb: u16) {
        self.update(vb, |stat| {
            stat.assigned_worker.clear();
            stat.current_vb_owner.clear();
            stat.node_uuid.clear();
            stat.stream_status = Some(StreamStatus::Stopped);
        });
    }
}

/// Condense a sorted vb list into a compact range dump for log lines,
/// e.g. `[0-3, 7, 9-10]`.
pub fn condense(vbs: &[u16]) -> String {
    if vbs.is_empty() {
        return "[]".to_string();
    }
    let mut parts: Vec<String> = Vec::new();
    let mut range_start = vbs[0];
    let mut prev = vbs[0];
    for &vb in &vbs[1..] {
        if vb == prev + 1 {
            prev = vb;
            continue;
        }
        parts.push(if range_start == prev {
            format!("{}", range_start)
        } else {
            format!("{}-{}", range_start, prev)
        });
        range_start = vb;
        prev = vb;
    }
    parts.push(if range_start == prev {
        format!("{}", range_start)
    } else {
        format!("{}-{}", range_start, prev)
    });
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_stats_sum_and_ext() {
        let mut total = ExecutionStats::default();
        let worker_a: ExecutionStats = serde_json::from_str(
            r#"{"on_update_success": 5, "agg_queue_memory": 1024}"#,
        )
        .unwrap();
        let worker_b: ExecutionStats = serde_json::from_str(
            r#"{"on_update_success": 7, "on_delete_success": 2, "agg_queue_memory": 512}"#,
        )
        .unwrap();
        total.add(&worker_a);
        total.add(&worker_b);
        assert_eq!(total.on_update_success, 12);
        assert_eq!(total.on_delete_success, 2);
        assert_eq!(total.ext.get("agg_queue_memory"), Some(&1536));
    }

    #[test]
    fn timer_feedback_seq_is_monotonic() {
        let stats = VbProcessingStats::new(4);
        assert!(stats.advance_timer_feedback_seq(1, 100));
        assert!(!stats.advance_timer_feedback_seq(1, 80));
        assert_eq!(stats.get(1).last_doc_timer_feedback_seq_no, 100);
        assert!(stats.advance_timer_feedback_seq(1, 250));
        assert_eq!(stats.get(1).last_doc_timer_feedback_seq_no, 250);
    }

    #[test]
    fn owned_vbs_filters_on_node_and_worker() {
        let stats = VbProcessingStats::new(8);
        for vb in [1u16, 3, 5] {
            stats.update(vb, |stat| {
                stat.node_uuid = "node-a".to_string();
                stat.assigned_worker = "worker_0".to_string();
            });
        }
        stats.update(6, |stat| {
            stat.node_uuid = "node-b".to_string();
            stat.assigned_worker = "worker_0".to_string();
        });
        assert_eq!(stats.owned_vbs("node-a", "worker_0"), vec![1, 3, 5]);
    }

    #[test]
    fn condense_ranges() {
        assert_eq!(condense(&[]), "[]");
        assert_eq!(condense(&[4]), "[4]");
        assert_eq!(condense(&[0, 1, 2, 3, 7, 9, 10]), "[0-3, 7, 9-10]");
    }
}
