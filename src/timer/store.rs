//! Durable timer persistence with vbucket affinity.
//!
//! Entries live in a per-handler keyspace under
//! `timer:<vb>:<dueBucket>:<hash>`, so after a handoff the new owner of a
//! vb enumerates its predecessor's entries from the same prefix without
//! any cross-node coordination. Buckets are wall-clock seconds; ordering
//! within a bucket is undefined.

use crate::checkpoint::{MetadataError, MetadataStore};
use crate::time::parse_rfc3339;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// A scheduled future invocation. An empty `doc_key` marks a cron timer
/// (anchored to wall-clock only); otherwise it is a doc timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub vb: u16,
    /// Due instant, RFC3339 at second granularity; doubles as the bucket.
    pub due: String,
    pub callback: String,
    #[serde(default)]
    pub doc_key: String,
}

impl TimerEntry {
    pub fn is_cron(&self) -> bool {
        self.doc_key.is_empty()
    }
}

/// Acknowledgement for one delivered timer, parsed from the feedback
/// socket. Wire shape: `<dueTs>::<callback>::<docKey>::<opaque>::<seq>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerAck {
    pub due: String,
    pub callback: String,
    pub doc_key: String,
    pub seq: u64,
}

/// Parse a 5-field timer acknowledgement string.
pub fn parse_timer_ack(msg: &str) -> Option<TimerAck> {
    let fields: Vec<&str> = msg.split("::").collect();
    if fields.len() != 5 {
        return None;
    }
    let seq = fields[4].parse::<u64>().ok()?;
    Some(TimerAck {
        due: fields[0].to_string(),
        callback: fields[1].to_string(),
        doc_key: fields[2].to_string(),
        seq,
    })
}

/// Parse a stored xattr timer string `<opaque>::<dueTs>::<callback>`;
/// anything but exactly 3 fields is rejected.
pub fn parse_xattr_timer(raw: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = raw.split("::").collect();
    if fields.len() != 3 {
        return None;
    }
    Some((fields[1].to_string(), fields[2].to_string()))
}

/// Result of one due-timer scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Due entries in `(bucket ascending, inner stable)` order.
    pub entries: Vec<TimerEntry>,
    /// Records dropped because they failed to decode.
    pub malformed: usize,
}

pub struct TimerStore {
    store: Arc<dyn MetadataStore>,
}

impl TimerStore {
    /// `store` is this handler's timer keyspace, shared by every node that
    /// may own one of its vbs.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        TimerStore { store }
    }

    fn vb_prefix(&self, vb: u16) -> String {
        format!("timer:{}:", vb)
    }

    /// Storage key of an entry. The hash collapses duplicate schedules of
    /// the same (bucket, doc, callback) into one record.
    pub fn entry_key(&self, entry: &TimerEntry) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(entry.doc_key.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry.callback.as_bytes());
        format!(
            "{}{}:{:08x}",
            self.vb_prefix(entry.vb),
            entry.due,
            hasher.finalize()
        )
    }

    /// Idempotent write; re-enqueueing the same entry overwrites in place.
    pub async fn enqueue(&self, entry: &TimerEntry) -> Result<(), MetadataError> {
        let key = self.entry_key(entry);
        let bytes = serde_json::to_vec(entry)?;
        self.store.upsert(&key, &bytes, None).await.map(|_| ())
    }

    /// All entries of `vb` whose bucket is at or before `up_to`, bucket
    /// ascending. Malformed records are logged, counted and skipped.
    pub async fn scan(&self, vb: u16, up_to: DateTime<Utc>) -> Result<ScanOutcome, MetadataError> {
        let prefix = self.vb_prefix(vb);
        let keys = self.store.list_prefix(&prefix).await?;

        // (bucket instant, key) so ordering is by due time, not by the
        // lexicographic tail of the hash.
        let mut due: Vec<(DateTime<Utc>, String)> = Vec::new();
        let mut outcome = ScanOutcome::default();
        for key in keys {
            let Some(bucket) = Self::bucket_of(&prefix, &key) else {
                warn!(%key, "timer key with unparsable bucket, dropping");
                outcome.malformed += 1;
                continue;
            };
            if bucket <= up_to {
                due.push((bucket, key));
            }
        }
        due.sort();

        for (_, key) in due {
            match self.store.get(&key).await {
                Ok((bytes, _)) => match serde_json::from_slice::<TimerEntry>(&bytes) {
                    Ok(entry) => outcome.entries.push(entry),
                    Err(err) => {
                        warn!(%key, %err, "malformed timer entry, dropping");
                        outcome.malformed += 1;
                        self.store.delete(&key).await?;
                    }
                },
                // Removed by an ack between list and get.
                Err(MetadataError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Remove one entry after its acknowledgement.
    pub async fn remove(&self, entry: &TimerEntry) -> Result<(), MetadataError> {
        self.store.delete(&self.entry_key(entry)).await
    }

    /// Drop every entry of one vb (handoff rejection / undeploy).
    pub async fn purge_vb(&self, vb: u16) -> Result<usize, MetadataError> {
        let keys = self.store.list_prefix(&self.vb_prefix(vb)).await?;
        let removed = keys.len();
        for key in keys {
            self.store.delete(&key).await?;
        }
        Ok(removed)
    }

    /// Extract the due bucket from `timer:<vb>:<bucket>:<hash>`.
    /// RFC3339 buckets contain `:` so the hash is split off the tail.
    fn bucket_of(prefix: &str, key: &str) -> Option<DateTime<Utc>> {
        let rest = key.strip_prefix(prefix)?;
        let (bucket, _hash) = rest.rsplit_once(':')?;
        parse_rfc3339(bucket)
    }
}
