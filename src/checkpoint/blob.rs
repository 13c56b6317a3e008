//! Persisted per-vbucket metadata blob and ownership history.

use serde::{Deserialize, Serialize};

/// Upper bound on retained ownership-history entries per vb.
pub const OWNERSHIP_HISTORY_BOUND: usize = 128;

/// Stream lifecycle recorded in the blob and in history entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Bootstrap,
    Running,
    Stopped,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Bootstrap => write!(f, "bootstrap"),
            StreamStatus::Running => write!(f, "running"),
            StreamStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One ownership transition; appended on every bootstrap / stream-open /
/// stream-close, bounded to the most recent [`OWNERSHIP_HISTORY_BOUND`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub assigned_worker: String,
    pub current_vb_owner: String,
    pub operation: StreamStatus,
    #[serde(default)]
    pub start_seq_no: u64,
    pub timestamp: String,
}

/// Per-(handler, vbucket) metadata, stored as JSON under
/// `<app>::vb::<vb>` in the metadata bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VbucketBlob {
    pub vb_id: u16,
    #[serde(default)]
    pub vb_uuid: u64,
    #[serde(default)]
    pub last_seq_no_processed: u64,
    #[serde(default)]
    pub last_checkpointed_seq_no: u64,
    #[serde(default)]
    pub last_doc_timer_feedback_seq_no: u64,
    #[serde(default)]
    pub current_vb_owner: String,
    #[serde(default)]
    pub assigned_worker: String,
    #[serde(default)]
    pub node_uuid: String,
    #[serde(default)]
    pub previous_vb_owner: String,
    #[serde(default)]
    pub previous_assigned_worker: String,
    #[serde(default)]
    pub previous_node_uuid: String,
    #[serde(default)]
    pub dcp_stream_status: Option<StreamStatus>,
    #[serde(default)]
    pub ownership_history: Vec<OwnershipEntry>,
    #[serde(default)]
    pub last_checkpoint_time: String,
    #[serde(default)]
    pub next_doc_timer_to_process: String,
    #[serde(default)]
    pub last_processed_doc_timer: String,
}

impl VbucketBlob {
    /// Stream start seq after a restart: rewind to before any unacked
    /// timer so a crash never silently drops one.
    pub fn replay_start_seq(&self) -> u64 {
        self.last_seq_no_processed
            .min(self.last_doc_timer_feedback_seq_no)
    }

    /// Append a history entry, truncating to the retention bound.
    pub fn push_history(&mut self, entry: OwnershipEntry) {
        self.ownership_history.push(entry);
        if self.ownership_history.len() > OWNERSHIP_HISTORY_BOUND {
            let excess = self.ownership_history.len() - OWNERSHIP_HISTORY_BOUND;
            self.ownership_history.drain(..excess);
        }
    }
}

/// Metadata key of a vb blob: `<app>::vb::<vb>`.
pub fn vb_key(app: &str, vb: u16) -> String {
    format!("{}::vb::{}", app, vb)
}

/// Metadata key advertising the last debugger connection.
pub fn debugger_instance_key(app: &str) -> String {
    format!("{}::debugger_instance_addr", app)
}

/// Metadata key of the start-debugger flag.
pub fn start_debugger_key(app: &str) -> String {
    format!("{}::start_debugger_flag", app)
}

/// Advert written when a debugger session is accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebuggerInstanceAddrBlob {
    #[serde(default)]
    pub consumer_name: String,
    #[serde(default)]
    pub host_port_addr: String,
    #[serde(default, rename = "uuid")]
    pub node_uuid: String,
}

/// Boolean blob flipping the debugger on for the next mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StartDebugBlob {
    #[serde(default)]
    pub start_debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> VbucketBlob {
        VbucketBlob {
            vb_id: 5,
            vb_uuid: 0xDEAD_BEEF,
            last_seq_no_processed: 420,
            last_checkpointed_seq_no: 400,
            last_doc_timer_feedback_seq_no: 380,
            current_vb_owner: "10.1.1.2:8096".to_string(),
            assigned_worker: "worker_app_0".to_string(),
            node_uuid: "uuid-a".to_string(),
            dcp_stream_status: Some(StreamStatus::Running),
            ownership_history: vec![OwnershipEntry {
                assigned_worker: "worker_app_0".to_string(),
                current_vb_owner: "10.1.1.2:8096".to_string(),
                operation: StreamStatus::Running,
                start_seq_no: 380,
                timestamp: "2025-01-01T00:00:00Z".to_string(),
            }],
            ..VbucketBlob::default()
        }
    }

    #[test]
    fn blob_json_round_trip() {
        let blob = sample_blob();
        let encoded = serde_json::to_vec(&blob).unwrap();
        let decoded: VbucketBlob = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn replay_start_is_min_of_cursors() {
        let blob = sample_blob();
        assert_eq!(blob.replay_start_seq(), 380);
        let mut blob = blob;
        blob.last_doc_timer_feedback_seq_no = 500;
        assert_eq!(blob.replay_start_seq(), 420);
    }

    #[test]
    fn history_truncates_to_bound() {
        let mut blob = VbucketBlob::default();
        for i in 0..(OWNERSHIP_HISTORY_BOUND + 10) {
            blob.push_history(OwnershipEntry {
                assigned_worker: "w".to_string(),
                current_vb_owner: "o".to_string(),
                operation: StreamStatus::Running,
                start_seq_no: i as u64,
                timestamp: String::new(),
            });
        }
        assert_eq!(blob.ownership_history.len(), OWNERSHIP_HISTORY_BOUND);
        // Oldest entries are the ones dropped.
        assert_eq!(blob.ownership_history[0].start_seq_no, 10);
    }

    #[test]
    fn decode_tolerates_missing_fields() {
        let decoded: VbucketBlob = serde_json::from_str(r#"{"vb_id": 9}"#).unwrap();
        assert_eq!(decoded.vb_id, 9);
        assert_eq!(decoded.last_seq_no_processed, 0);
        assert!(decoded.dcp_stream_status.is_none());
    }
}
