//! Checkpoint facade over the metadata bucket.
//!
//! One instance per handler. All vb blob reads and writes funnel through
//! here so the CAS retry policy, the seq monotonicity guard, and the
//! ownership-history bound are applied in one place.

use crate::checkpoint::blob::{
    debugger_instance_key, start_debugger_key, vb_key, DebuggerInstanceAddrBlob, OwnershipEntry,
    StartDebugBlob, StreamStatus, VbucketBlob, OWNERSHIP_HISTORY_BOUND,
};
use crate::checkpoint::kv::{Cas, MetadataError, MetadataStore};
use crate::config::ConsumerIdentity;
use crate::retry::{RetryPolicy, BUCKET_OP_BACKOFF, CAS_RETRY_LIMIT};
use crate::stats::VbStat;
use crate::time::TimeSource;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a CAS read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Applied,
    /// Dropped by the monotonicity guard or the CAS retry bound.
    Dropped,
}

pub struct CheckpointStore {
    store: Arc<dyn MetadataStore>,
    app: String,
    retry: RetryPolicy,
    time: Arc<dyn TimeSource>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn MetadataStore>, app: &str, time: Arc<dyn TimeSource>) -> Self {
        CheckpointStore {
            store,
            app: app.to_string(),
            // Transient bucket errors retry until they clear; only CAS
            // conflicts are bounded.
            retry: RetryPolicy::fixed(BUCKET_OP_BACKOFF),
            time,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Read one vb blob. `Ok(None)` when the blob does not exist yet.
    pub async fn get_vb_blob(&self, vb: u16) -> Result<Option<(VbucketBlob, Cas)>, MetadataError> {
        let key = vb_key(&self.app, vb);
        match self.get_raw(&key).await {
            Ok((bytes, cas)) => {
                let blob: VbucketBlob = serde_json::from_slice(&bytes)?;
                Ok(Some((blob, cas)))
            }
            Err(MetadataError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Blind write of one vb blob.
    pub async fn set_vb_blob(&self, vb: u16, blob: &VbucketBlob) -> Result<(), MetadataError> {
        let key = vb_key(&self.app, vb);
        let bytes = serde_json::to_vec(blob)?;
        self.retry
            .run(|| async { self.store.upsert(&key, &bytes, None).await })
            .await
            .map(|_| ())
    }

    /// Create the blob on first deploy; no-op when it already exists.
    ///
    /// Returns the blob now stored and whether this call created it.
    pub async fn ensure_bootstrap(
        &self,
        vb: u16,
        vbuuid: u64,
        identity: &ConsumerIdentity,
    ) -> Result<(VbucketBlob, bool), MetadataError> {
        if let Some((existing, _)) = self.get_vb_blob(vb).await? {
            return Ok((existing, false));
        }

        let now = self.time.now_rfc3339();
        let mut blob = VbucketBlob {
            vb_id: vb,
            vb_uuid: vbuuid,
            assigned_worker: identity.worker_name.clone(),
            current_vb_owner: identity.host_port.clone(),
            node_uuid: identity.node_uuid.clone(),
            previous_assigned_worker: identity.worker_name.clone(),
            previous_vb_owner: identity.host_port.clone(),
            previous_node_uuid: identity.node_uuid.clone(),
            dcp_stream_status: Some(StreamStatus::Bootstrap),
            last_processed_doc_timer: now.clone(),
            next_doc_timer_to_process: now.clone(),
            ..VbucketBlob::default()
        };
        blob.push_history(OwnershipEntry {
            assigned_worker: identity.worker_name.clone(),
            current_vb_owner: identity.host_port.clone(),
            operation: StreamStatus::Bootstrap,
            start_seq_no: 0,
            timestamp: now,
        });

        // Create-if-absent: a concurrent bootstrap by another worker wins
        // the race and we read its blob back.
        let key = vb_key(&self.app, vb);
        let bytes = serde_json::to_vec(&blob)?;
        match self.store.upsert(&key, &bytes, Some(0)).await {
            Ok(_) => Ok((blob, true)),
            Err(MetadataError::CasMismatch(_)) => {
                let (existing, _) = self
                    .get_vb_blob(vb)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(key))?;
                Ok((existing, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Flush in-memory progress into the blob.
    ///
    /// CAS loop until applied, or dropped when the write would lower
    /// `last_seq_no_processed` (another consumer has advanced past us) or
    /// the CAS bound is exhausted.
    pub async fn update_checkpoint(
        &self,
        vb: u16,
        progress: &VbStat,
    ) -> Result<CheckpointWrite, MetadataError> {
        let key = vb_key(&self.app, vb);
        for _ in 0..CAS_RETRY_LIMIT {
            let Some((mut blob, cas)) = self.get_vb_blob(vb).await? else {
                return Ok(CheckpointWrite::Dropped);
            };

            if progress.last_processed_seq_no < blob.last_seq_no_processed {
                debug!(
                    vb,
                    ours = progress.last_processed_seq_no,
                    stored = blob.last_seq_no_processed,
                    "checkpoint would rewind processed seq, dropping"
                );
                return Ok(CheckpointWrite::Dropped);
            }

            blob.last_seq_no_processed = progress.last_processed_seq_no;
            blob.last_checkpointed_seq_no = progress.last_processed_seq_no;
            blob.last_doc_timer_feedback_seq_no = blob
                .last_doc_timer_feedback_seq_no
                .max(progress.last_doc_timer_feedback_seq_no);
            if !progress.currently_processed_doc_timer.is_empty() {
                blob.last_processed_doc_timer = progress.currently_processed_doc_timer.clone();
            }
            blob.last_checkpoint_time = self.time.now_rfc3339();

            let bytes = serde_json::to_vec(&blob)?;
            match self.store.upsert(&key, &bytes, Some(cas)).await {
                Ok(_) => return Ok(CheckpointWrite::Applied),
                Err(MetadataError::CasMismatch(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(vb, "checkpoint CAS retry bound exhausted, dropping write");
        Ok(CheckpointWrite::Dropped)
    }

    /// Record a successfully opened stream: current ownership, vbuuid and
    /// the failover-log seq, plus one history entry.
    pub async fn record_stream_running(
        &self,
        vb: u16,
        identity: &ConsumerIdentity,
        vbuuid: u64,
        flog_seq: u64,
        start_seq: u64,
    ) -> Result<(), MetadataError> {
        self.mutate_blob(vb, |blob| {
            blob.assigned_worker = identity.worker_name.clone();
            blob.current_vb_owner = identity.host_port.clone();
            blob.node_uuid = identity.node_uuid.clone();
            blob.dcp_stream_status = Some(StreamStatus::Running);
            blob.vb_uuid = vbuuid;
            blob.last_seq_no_processed = flog_seq;
            blob.last_checkpoint_time = self.time.now_rfc3339();
            blob.push_history(OwnershipEntry {
                assigned_worker: identity.worker_name.clone(),
                current_vb_owner: identity.host_port.clone(),
                operation: StreamStatus::Running,
                start_seq_no: start_seq,
                timestamp: self.time.now_rfc3339(),
            });
        })
        .await
    }

    /// Release ownership: move current owner fields into `previous_*`,
    /// mark the stream stopped, append one history entry.
    pub async fn clear_ownership(
        &self,
        vb: u16,
        identity: &ConsumerIdentity,
    ) -> Result<(), MetadataError> {
        self.mutate_blob(vb, |blob| {
            blob.previous_assigned_worker = std::mem::take(&mut blob.assigned_worker);
            blob.previous_vb_owner = std::mem::take(&mut blob.current_vb_owner);
            blob.previous_node_uuid = std::mem::take(&mut blob.node_uuid);
            blob.dcp_stream_status = Some(StreamStatus::Stopped);
            blob.last_checkpoint_time = self.time.now_rfc3339();
            blob.push_history(OwnershipEntry {
                assigned_worker: identity.worker_name.clone(),
                current_vb_owner: identity.host_port.clone(),
                operation: StreamStatus::Stopped,
                start_seq_no: blob.last_seq_no_processed,
                timestamp: self.time.now_rfc3339(),
            });
        })
        .await
    }

    /// Append a bare history entry without touching ownership fields.
    pub async fn append_ownership_history(
        &self,
        vb: u16,
        entry: OwnershipEntry,
    ) -> Result<(), MetadataError> {
        debug_assert!(
            OWNERSHIP_HISTORY_BOUND >= 128,
            "history bound must keep at least 128 entries"
        );
        self.mutate_blob(vb, |blob| blob.push_history(entry.clone())).await
    }

    /// CAS read-modify-write of one blob; missing blobs start from default.
    async fn mutate_blob<F>(&self, vb: u16, mutate: F) -> Result<(), MetadataError>
    where
        F: Fn(&mut VbucketBlob),
    {
        let key = vb_key(&self.app, vb);
        for _ in 0..CAS_RETRY_LIMIT {
            let (mut blob, cas) = match self.get_vb_blob(vb).await? {
                Some((blob, cas)) => (blob, Some(cas)),
                None => (
                    VbucketBlob {
                        vb_id: vb,
                        ..VbucketBlob::default()
                    },
                    Some(0),
                ),
            };
            mutate(&mut blob);
            let bytes = serde_json::to_vec(&blob)?;
            match self.store.upsert(&key, &bytes, cas).await {
                Ok(_) => return Ok(()),
                Err(MetadataError::CasMismatch(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(vb, "blob CAS retry bound exhausted, dropping mutation");
        Ok(())
    }

    /// Remove every metadata key of this handler (undeploy).
    pub async fn purge_app(&self) -> Result<usize, MetadataError> {
        let prefix = format!("{}::", self.app);
        let keys = self.store.list_prefix(&prefix).await?;
        let removed = keys.len();
        for key in keys {
            self.store.delete(&key).await?;
        }
        Ok(removed)
    }

    // Debugger blobs.

    pub async fn start_debugger_flag(&self) -> Result<bool, MetadataError> {
        let key = start_debugger_key(&self.app);
        match self.get_raw(&key).await {
            Ok((bytes, _)) => {
                let blob: StartDebugBlob = serde_json::from_slice(&bytes)?;
                Ok(blob.start_debug)
            }
            Err(MetadataError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_start_debugger_flag(&self, on: bool) -> Result<(), MetadataError> {
        let key = start_debugger_key(&self.app);
        let bytes = serde_json::to_vec(&StartDebugBlob { start_debug: on })?;
        self.retry
            .run(|| async { self.store.upsert(&key, &bytes, None).await })
            .await
            .map(|_| ())
    }

    /// Reset the debugger advert so the next session can start.
    pub async fn reset_debugger_instance(&self) -> Result<(), MetadataError> {
        let key = debugger_instance_key(&self.app);
        let bytes = serde_json::to_vec(&DebuggerInstanceAddrBlob::default())?;
        self.retry
            .run(|| async { self.store.upsert(&key, &bytes, None).await })
            .await
            .map(|_| ())
    }

    pub async fn publish_debugger_instance(
        &self,
        advert: &DebuggerInstanceAddrBlob,
    ) -> Result<(), MetadataError> {
        let key = debugger_instance_key(&self.app);
        let bytes = serde_json::to_vec(advert)?;
        self.retry
            .run(|| async { self.store.upsert(&key, &bytes, None).await })
            .await
            .map(|_| ())
    }

    async fn get_raw(&self, key: &str) -> Result<(Vec<u8>, Cas), MetadataError> {
        // NotFound is a result, not a transient failure; only transport
        // errors are retried.
        self.retry
            .run(|| async {
                match self.store.get(key).await {
                    Err(MetadataError::Transient(msg)) => Err(MetadataError::Transient(msg)),
                    other => Ok(other),
                }
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::kv::InMemoryMetadataStore;
    use crate::time::SimulatedTimeSource;

    fn identity() -> ConsumerIdentity {
        ConsumerIdentity {
            host_port: "127.0.0.1:8096".to_string(),
            node_uuid: "uuid-a".to_string(),
            worker_name: "worker_app_0".to_string(),
        }
    }

    fn store() -> CheckpointStore {
        CheckpointStore::new(
            InMemoryMetadataStore::new(),
            "app",
            Arc::new(SimulatedTimeSource::at("2025-01-01T00:00:00Z")),
        )
    }

    #[tokio::test]
    async fn bootstrap_creates_once() {
        let cp = store();
        let (blob, created) = cp.ensure_bootstrap(3, 77, &identity()).await.unwrap();
        assert!(created);
        assert_eq!(blob.vb_uuid, 77);
        assert_eq!(blob.ownership_history.len(), 1);
        assert_eq!(blob.ownership_history[0].operation, StreamStatus::Bootstrap);

        let (again, created) = cp.ensure_bootstrap(3, 99, &identity()).await.unwrap();
        assert!(!created);
        assert_eq!(again.vb_uuid, 77);
    }

    #[tokio::test]
    async fn checkpoint_guard_never_rewinds() {
        let cp = store();
        cp.ensure_bootstrap(1, 7, &identity()).await.unwrap();

        let mut progress = VbStat::default();
        progress.last_processed_seq_no = 100;
        assert_eq!(
            cp.update_checkpoint(1, &progress).await.unwrap(),
            CheckpointWrite::Applied
        );

        progress.last_processed_seq_no = 60;
        assert_eq!(
            cp.update_checkpoint(1, &progress).await.unwrap(),
            CheckpointWrite::Dropped
        );

        let (blob, _) = cp.get_vb_blob(1).await.unwrap().unwrap();
        assert_eq!(blob.last_seq_no_processed, 100);
        assert!(blob.last_checkpointed_seq_no <= blob.last_seq_no_processed);
    }

    #[tokio::test]
    async fn stream_running_then_stopped_history() {
        let cp = store();
        cp.ensure_bootstrap(2, 5, &identity()).await.unwrap();
        cp.record_stream_running(2, &identity(), 5, 40, 40)
            .await
            .unwrap();

        let (blob, _) = cp.get_vb_blob(2).await.unwrap().unwrap();
        assert_eq!(blob.dcp_stream_status, Some(StreamStatus::Running));
        assert_eq!(blob.last_seq_no_processed, 40);

        cp.clear_ownership(2, &identity()).await.unwrap();
        let (blob, _) = cp.get_vb_blob(2).await.unwrap().unwrap();
        assert_eq!(blob.dcp_stream_status, Some(StreamStatus::Stopped));
        assert!(blob.current_vb_owner.is_empty());
        assert_eq!(blob.previous_vb_owner, "127.0.0.1:8096");
        assert_eq!(blob.ownership_history.len(), 3);
    }

    #[tokio::test]
    async fn purge_removes_only_this_app() {
        let kv = InMemoryMetadataStore::new();
        let time: Arc<dyn TimeSource> = Arc::new(SimulatedTimeSource::new(0));
        let cp_a = CheckpointStore::new(kv.clone(), "alpha", time.clone());
        let cp_b = CheckpointStore::new(kv.clone(), "beta", time);
        cp_a.ensure_bootstrap(0, 1, &identity()).await.unwrap();
        cp_b.ensure_bootstrap(0, 1, &identity()).await.unwrap();

        assert_eq!(cp_a.purge_app().await.unwrap(), 1);
        assert!(cp_a.get_vb_blob(0).await.unwrap().is_none());
        assert!(cp_b.get_vb_blob(0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn debugger_flag_round_trip() {
        let cp = store();
        assert!(!cp.start_debugger_flag().await.unwrap());
        cp.set_start_debugger_flag(true).await.unwrap();
        assert!(cp.start_debugger_flag().await.unwrap());
        cp.reset_debugger_instance().await.unwrap();
    }
}
