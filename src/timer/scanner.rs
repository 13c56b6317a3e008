//! Periodic due-timer scans.
//!
//! One scanner task per consumer. Each tick walks the vbs this consumer
//! owns and dispatches due entries toward the worker. Entries stay in the
//! store until the worker acknowledges them; the in-flight set keeps a
//! scan from re-dispatching an entry that is already on the wire.

use crate::config::ConsumerIdentity;
use crate::stats::{EventCounters, VbProcessingStats};
use crate::time::TimeSource;
use crate::timer::store::{TimerEntry, TimerStore};
use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Timer work handed to the dispatch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerMsg {
    Doc(TimerEntry),
    /// Cron callbacks of one vb batched into a single worker payload.
    Cron { entries: Vec<TimerEntry> },
}

/// Keys of entries dispatched but not yet acknowledged.
///
/// Shared between the scanner (inserts before dispatch) and the ack path
/// (removes on acknowledgement); cleared per vb on handoff.
#[derive(Debug, Default)]
pub struct InFlightTimers {
    keys: RwLock<HashSet<String>>,
}

impl InFlightTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(InFlightTimers::default())
    }

    /// Returns false when the key was already in flight.
    pub fn insert(&self, key: String) -> bool {
        self.keys.write().insert(key)
    }

    pub fn remove(&self, key: &str) {
        self.keys.write().remove(key);
    }

    pub fn clear_vb(&self, vb: u16) {
        let prefix = format!("timer:{}:", vb);
        self.keys.write().retain(|key| !key.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

/// Tuning for the scanner, split out of `HandlerConfig` so settings
/// updates can swap fields while the scanner runs.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub scan_interval: Duration,
    pub fuzz_offset: u64,
    pub skip_timer_threshold: u64,
    pub cron_timers_per_doc: usize,
}

/// Live-updatable view of the scanner tuning.
pub type SharedScannerConfig = Arc<RwLock<ScannerConfig>>;

pub struct TimerScanner {
    store: Arc<TimerStore>,
    time: Arc<dyn TimeSource>,
    vb_stats: Arc<VbProcessingStats>,
    identity: ConsumerIdentity,
    in_flight: Arc<InFlightTimers>,
    counters: Arc<EventCounters>,
    config: SharedScannerConfig,
    out: mpsc::Sender<TimerMsg>,
    stop: watch::Receiver<bool>,
}

impl TimerScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TimerStore>,
        time: Arc<dyn TimeSource>,
        vb_stats: Arc<VbProcessingStats>,
        identity: ConsumerIdentity,
        in_flight: Arc<InFlightTimers>,
        counters: Arc<EventCounters>,
        config: SharedScannerConfig,
        out: mpsc::Sender<TimerMsg>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        TimerScanner {
            store,
            time,
            vb_stats,
            identity,
            in_flight,
            counters,
            config,
            out,
            stop,
        }
    }

    pub async fn run(mut self) {
        let scan_interval = self.config.read().scan_interval;
        let mut tick = tokio::time::interval(scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.scan_owned_vbs().await;
                }
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        info!("timer scanner exiting");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every owned vb.
    pub async fn scan_owned_vbs(&self) {
        let owned = self
            .vb_stats
            .owned_vbs(&self.identity.node_uuid, &self.identity.worker_name);
        if owned.is_empty() {
            return;
        }
        let config = self.config.read().clone();
        let now = self.time.now_utc();
        let up_to = now - ChronoDuration::seconds(config.fuzz_offset as i64);

        for vb in owned {
            let outcome = match self.store.scan(vb, up_to).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(vb, %err, "timer scan failed, retrying next tick");
                    continue;
                }
            };
            for _ in 0..outcome.malformed {
                EventCounters::bump(&self.counters.timer_decode_errors);
            }

            let mut cron_batch: Vec<TimerEntry> = Vec::new();
            for entry in outcome.entries {
                // Entries far past due are dropped, not fired.
                if let Some(due) = crate::time::parse_rfc3339(&entry.due) {
                    let age = (now - due).num_seconds();
                    if config.skip_timer_threshold > 0
                        && age > config.skip_timer_threshold as i64
                    {
                        debug!(vb, due = %entry.due, age, "skipping stale timer");
                        EventCounters::bump(&self.counters.timer_scans_skipped);
                        if let Err(err) = self.store.remove(&entry).await {
                            warn!(vb, %err, "failed to drop stale timer");
                        }
                        continue;
                    }
                }

                let key = self.store.entry_key(&entry);
                if !self.in_flight.insert(key) {
                    continue;
                }

                self.vb_stats.update(vb, |stat| {
                    stat.currently_processed_doc_timer = entry.due.clone();
                });

                if entry.is_cron() {
                    cron_batch.push(entry);
                    if cron_batch.len() >= config.cron_timers_per_doc {
                        self.emit(TimerMsg::Cron {
                            entries: std::mem::take(&mut cron_batch),
                        })
                        .await;
                    }
                } else {
                    self.emit(TimerMsg::Doc(entry)).await;
                }
            }
            if !cron_batch.is_empty() {
                self.emit(TimerMsg::Cron { entries: cron_batch }).await;
            }
        }
    }

    async fn emit(&self, msg: TimerMsg) {
        if self.out.send(msg).await.is_err() {
            debug!("timer channel closed, dispatch loop is gone");
        }
    }
}
