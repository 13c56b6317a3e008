//! Single-consumer dispatch loop.
//!
//! One task per consumer drains the aggregated feed channel and routes:
//! mutations/deletions to the worker, harvested xattr timers to the timer
//! store, stream lifecycle frames to the checkpoint store and the
//! failover-log handler. Backpressure is the worker's reported queue
//! depth; when it crosses the cap the loop sleeps before the next event.

use crate::checkpoint::{CheckpointStore, OwnershipEntry, StreamStatus};
use crate::config::{ConsumerIdentity, HandlerConfig};
use crate::dispatch::xattr::evaluate_mutation;
use crate::ipc::message::thread_partition;
use crate::ipc::{WorkerGateway, WorkerMessage};
use crate::ownership::{vbucket_by_key, Planner, RebalanceShared};
use crate::stats::{condense, EventCounters, EventProcessingStats, VbProcessingStats};
use crate::stream::{Datatype, FailoverEntry, FeedEvent, StreamReqStatus, VbFlogEntry, VbStreamRequested};
use crate::time::TimeSource;
use crate::timer::{parse_xattr_timer, InFlightTimers, TimerAck, TimerEntry, TimerMsg, TimerStore};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// How long the loop sleeps when the worker reports a full queue.
const THROTTLE_PAUSE: Duration = Duration::from_secs(1);

/// Input channels of the dispatch loop, one producer role each.
pub struct PipelineChannels {
    pub agg_rx: mpsc::Receiver<FeedEvent>,
    pub timer_rx: mpsc::Receiver<TimerMsg>,
    pub acks_rx: mpsc::UnboundedReceiver<TimerAck>,
}

/// Collaborators of the dispatch loop, built by the supervisor.
pub struct PipelineDeps {
    pub config: HandlerConfig,
    pub identity: ConsumerIdentity,
    pub worker: WorkerGateway,
    pub checkpoint: Arc<CheckpointStore>,
    pub timer_store: Arc<TimerStore>,
    pub in_flight: Arc<InFlightTimers>,
    pub vb_stats: Arc<VbProcessingStats>,
    pub counters: Arc<EventCounters>,
    pub vb_flog_tx: mpsc::UnboundedSender<VbFlogEntry>,
    pub vb_stream_requested: VbStreamRequested,
    pub rebalance: Arc<RebalanceShared>,
    pub planner: Arc<dyn Planner>,
    pub time: Arc<dyn TimeSource>,
    pub processing_rates: Arc<RwLock<EventProcessingStats>>,
    pub stop: watch::Receiver<bool>,
}

pub struct DispatchPipeline {
    deps: PipelineDeps,
    last_dcp_count: u64,
    last_timer_count: u64,
    last_rate_millis: u64,
}

impl DispatchPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let start = deps.time.now_millis();
        DispatchPipeline {
            deps,
            last_dcp_count: 0,
            last_timer_count: 0,
            last_rate_millis: start,
        }
    }

    pub async fn run(mut self, channels: PipelineChannels) {
        let PipelineChannels {
            mut agg_rx,
            mut timer_rx,
            mut acks_rx,
        } = channels;

        let worker = self.deps.identity.worker_name.clone();
        info!(%worker, app = %self.deps.config.app_name, "dispatch loop starting");
        let mut stats_tick = tokio::time::interval(self.deps.config.stats_log_interval);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop = self.deps.stop.clone();

        loop {
            if *stop.borrow() {
                self.drain_acks(&mut acks_rx).await;
                info!(%worker, "dispatch loop exiting");
                return;
            }

            self.throttle().await;

            tokio::select! {
                event = agg_rx.recv() => {
                    match event {
                        Some(event) => self.handle_feed_event(event).await,
                        None => {
                            info!(%worker, "aggregated feed closed, dispatch loop exiting");
                            return;
                        }
                    }
                }
                msg = timer_rx.recv() => {
                    if let Some(msg) = msg {
                        self.handle_timer_msg(msg).await;
                    }
                }
                ack = acks_rx.recv() => {
                    if let Some(ack) = ack {
                        self.handle_timer_ack(ack).await;
                    }
                }
                _ = stats_tick.tick() => {
                    self.log_stats();
                    self.request_worker_stats().await;
                }
                _ = stop.changed() => {}
            }
        }
    }

    /// Sleep while the worker's queues are over their caps. This is the
    /// sole backpressure toward the handler.
    async fn throttle(&self) {
        let mut stop = self.deps.stop.clone();
        loop {
            if *stop.borrow() {
                return;
            }
            let sizes = self.deps.worker.queue_sizes();
            let over = sizes.agg_queue_size >= self.deps.config.worker_queue_cap
                || sizes.doc_timer_queue_size >= self.deps.config.feedback_queue_cap;
            if !over {
                return;
            }
            info!(
                agg = sizes.agg_queue_size,
                agg_cap = self.deps.config.worker_queue_cap,
                timer = sizes.doc_timer_queue_size,
                timer_cap = self.deps.config.feedback_queue_cap,
                "throttling events to worker"
            );
            tokio::select! {
                _ = tokio::time::sleep(THROTTLE_PAUSE) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// Bounded drain after a stop signal so in-flight acks land.
    async fn drain_acks(&mut self, acks_rx: &mut mpsc::UnboundedReceiver<TimerAck>) {
        for _ in 0..64 {
            match acks_rx.try_recv() {
                Ok(ack) => self.handle_timer_ack(ack).await,
                Err(_) => break,
            }
        }
    }

    async fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Mutation {
                vb,
                seq,
                cas,
                key,
                value,
                datatype,
            } => {
                self.handle_mutation(vb, seq, cas, key, value, datatype).await;
            }
            FeedEvent::Deletion { vb, seq, cas, key } => {
                EventCounters::bump(&self.deps.counters.dcp_deletion);
                self.deps.vb_stats.set_last_processed_seq(vb, seq);
                let partition =
                    thread_partition(vb, self.deps.config.cpp_worker_thread_count);
                let meta = event_meta(vb, seq, cas);
                self.send_to_worker(WorkerMessage::dcp_deletion(partition, meta, key.as_bytes()))
                    .await;
            }
            FeedEvent::StreamReq {
                vb,
                status,
                failover_log,
                seq,
            } => {
                self.handle_stream_req(vb, status, failover_log, seq).await;
            }
            FeedEvent::StreamEnd { vb } => {
                self.handle_stream_end(vb).await;
            }
        }
    }

    async fn handle_mutation(
        &mut self,
        vb: u16,
        seq: u64,
        cas: u64,
        key: String,
        value: Vec<u8>,
        datatype: Datatype,
    ) {
        trace!(vb, seq, %key, ?datatype, "mutation");
        self.deps.vb_stats.set_last_processed_seq(vb, seq);
        let partition = thread_partition(vb, self.deps.config.cpp_worker_thread_count);

        match datatype {
            Datatype::Json => {
                EventCounters::bump(&self.deps.counters.dcp_mutation);
                let meta = event_meta(vb, seq, cas);
                self.send_to_worker(WorkerMessage::dcp_mutation(
                    partition,
                    meta,
                    key.as_bytes(),
                    &value,
                ))
                .await;
            }
            Datatype::JsonXattr => {
                let verdict = match evaluate_mutation(
                    &value,
                    cas,
                    &self.deps.config.xattr_prefix,
                    self.deps.config.enable_recursive_mutation,
                ) {
                    Ok(verdict) => verdict,
                    Err(err) => {
                        warn!(vb, seq, %key, %err, "undecodable xattr section, skipping event");
                        return;
                    }
                };

                for raw in &verdict.timers {
                    let Some((due, callback)) = parse_xattr_timer(raw) else {
                        debug!(vb, %raw, "malformed stored timer string");
                        EventCounters::bump(&self.deps.counters.timer_decode_errors);
                        continue;
                    };
                    let entry = TimerEntry {
                        vb,
                        due,
                        callback,
                        doc_key: key.clone(),
                    };
                    match self.deps.timer_store.enqueue(&entry).await {
                        Ok(()) => {
                            EventCounters::bump(&self.deps.counters.timer_entries_stored)
                        }
                        Err(err) => warn!(vb, %err, "failed to persist timer entry"),
                    }
                }

                if verdict.forward {
                    EventCounters::bump(&self.deps.counters.dcp_mutation);
                    let meta = event_meta(vb, seq, cas);
                    let body = verdict.body.to_vec();
                    self.send_to_worker(WorkerMessage::dcp_mutation(
                        partition,
                        meta,
                        key.as_bytes(),
                        &body,
                    ))
                    .await;
                } else {
                    trace!(vb, seq, %key, "suppressing recursive mutation");
                    EventCounters::bump(&self.deps.counters.suppressed_mutation);
                }
            }
        }
    }

    async fn handle_stream_req(
        &mut self,
        vb: u16,
        status: StreamReqStatus,
        failover_log: Vec<FailoverEntry>,
        seq: u64,
    ) {
        info!(vb, ?status, "stream request answered");
        if status != StreamReqStatus::Success {
            self.deps.vb_stream_requested.write().remove(&vb);
        }

        match status {
            StreamReqStatus::Success => {
                let Some(latest) = failover_log.first().copied() else {
                    warn!(vb, "success without failover log, cannot persist ownership");
                    self.send_flog(VbFlogEntry::stream_created(vb));
                    return;
                };

                let start_seq = self.deps.vb_stats.last_processed_seq(vb);
                if let Err(err) = self
                    .deps
                    .checkpoint
                    .record_stream_running(
                        vb,
                        &self.deps.identity,
                        latest.vbuuid,
                        latest.seq,
                        start_seq,
                    )
                    .await
                {
                    warn!(vb, %err, "failed to persist stream-running ownership");
                }

                self.deps.vb_stats.update(vb, |stat| {
                    stat.assigned_worker = self.deps.identity.worker_name.clone();
                    stat.current_vb_owner = self.deps.identity.host_port.clone();
                    stat.node_uuid = self.deps.identity.node_uuid.clone();
                    stat.vbuuid = latest.vbuuid;
                    stat.stream_status = Some(StreamStatus::Running);
                });

                self.send_flog(VbFlogEntry::stream_created(vb));
            }
            StreamReqStatus::Rollback => {
                // Retry at the server's seq, not the local checkpoint.
                self.send_flog(VbFlogEntry::retry(vb, status, failover_log, seq));
            }
            StreamReqStatus::Einval | StreamReqStatus::Enomem => {
                self.send_flog(VbFlogEntry::retry(vb, status, failover_log, 0));
            }
            StreamReqStatus::KeyEexists | StreamReqStatus::NotMyVbucket => {
                // Defer to the ownership controller.
                self.send_flog(VbFlogEntry::no_retry(vb, status));
            }
        }
    }

    async fn handle_stream_end(&mut self, vb: u16) {
        info!(vb, "stream end");
        self.deps.vb_stream_requested.write().remove(&vb);
        self.deps.in_flight.clear_vb(vb);
        self.deps.vb_stats.update(vb, |stat| {
            stat.stream_status = Some(StreamStatus::Stopped);
        });

        let entry = OwnershipEntry {
            assigned_worker: self.deps.identity.worker_name.clone(),
            current_vb_owner: self.deps.identity.host_port.clone(),
            operation: StreamStatus::Stopped,
            start_seq_no: self.deps.vb_stats.last_processed_seq(vb),
            timestamp: self.deps.time.now_rfc3339(),
        };
        if let Err(err) = self.deps.checkpoint.append_ownership_history(vb, entry).await {
            warn!(vb, %err, "failed to append stream-end history");
        }

        // First close wins the checkpoint flush.
        if self.deps.rebalance.mark_stream_closed(vb) {
            let progress = self.deps.vb_stats.get(vb);
            if let Err(err) = self.deps.checkpoint.update_checkpoint(vb, &progress).await {
                warn!(vb, %err, "failed to flush checkpoint on stream end");
            }
        }

        // A stream end for a vb the plan still assigns here means the KV
        // side moved; reclaim it on the restream ticker.
        if self
            .deps
            .planner
            .should_own(vb, &self.deps.identity.host_port)
        {
            info!(vb, "stream ended but vb is still ours, queueing restream");
            self.send_flog(VbFlogEntry::stream_end(vb));
            self.deps.rebalance.queue_restream(vb);
        }
    }

    async fn handle_timer_msg(&mut self, msg: TimerMsg) {
        match msg {
            TimerMsg::Doc(entry) => {
                let partition =
                    thread_partition(entry.vb, self.deps.config.cpp_worker_thread_count);
                EventCounters::bump(&self.deps.counters.doc_timer_sent);
                self.send_to_worker(WorkerMessage::doc_timer(
                    partition,
                    &entry.callback,
                    &entry.doc_key,
                    &entry.due,
                ))
                .await;
            }
            TimerMsg::Cron { entries } => {
                let Some(first) = entries.first() else {
                    return;
                };
                let partition =
                    thread_partition(first.vb, self.deps.config.cpp_worker_thread_count);
                let callbacks: Vec<&str> =
                    entries.iter().map(|entry| entry.callback.as_str()).collect();
                let payload = match serde_json::to_string(&callbacks) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, "failed to encode cron payload");
                        return;
                    }
                };
                for _ in &entries {
                    EventCounters::bump(&self.deps.counters.cron_timer_sent);
                }
                self.send_to_worker(WorkerMessage::cron_timer(partition, &payload, &first.due))
                    .await;

                // Cron timers carry no per-entry ack; they are removed at
                // dispatch and fire at most once.
                for entry in &entries {
                    self.deps.in_flight.remove(&self.deps.timer_store.entry_key(entry));
                    if let Err(err) = self.deps.timer_store.remove(entry).await {
                        warn!(vb = entry.vb, %err, "failed to remove cron timer");
                    }
                }
            }
        }
    }

    async fn handle_timer_ack(&mut self, ack: TimerAck) {
        let vb = vbucket_by_key(
            ack.doc_key.as_bytes(),
            self.deps.vb_stats.num_vbuckets(),
        );
        EventCounters::bump(&self.deps.counters.timer_acks_received);
        self.deps.vb_stats.advance_timer_feedback_seq(vb, ack.seq);

        let entry = TimerEntry {
            vb,
            due: ack.due,
            callback: ack.callback,
            doc_key: ack.doc_key,
        };
        self.deps.in_flight.remove(&self.deps.timer_store.entry_key(&entry));
        if let Err(err) = self.deps.timer_store.remove(&entry).await {
            warn!(vb, %err, "failed to remove acked timer");
        }
    }

    /// Ask the worker for its current stat dumps; the responses come
    /// back asynchronously on the primary socket.
    async fn request_worker_stats(&self) {
        use crate::ipc::message::v8_opcode;
        for opcode in [
            v8_opcode::LATENCY_STATS,
            v8_opcode::FAILURE_STATS,
            v8_opcode::EXECUTION_STATS,
            v8_opcode::LCB_EXCEPTIONS,
        ] {
            self.send_to_worker(WorkerMessage::v8_stats_request(opcode)).await;
        }
    }

    async fn send_to_worker(&self, msg: WorkerMessage) {
        if let Err(err) = self.deps.worker.send(msg).await {
            // The supervisor restarts the child; replay from the
            // checkpoint re-covers whatever was in flight.
            debug!(%err, "worker channel closed, dropping frame until restart");
        }
    }

    fn send_flog(&self, entry: VbFlogEntry) {
        if self.deps.vb_flog_tx.send(entry).is_err() {
            debug!("failover-log channel closed");
        }
    }

    fn log_stats(&mut self) {
        let owned = self
            .deps
            .vb_stats
            .owned_vbs(&self.deps.identity.node_uuid, &self.deps.identity.worker_name);
        if owned.is_empty() {
            return;
        }

        let dcp_total = self.deps.counters.dcp_events_processed();
        let timer_total = self.deps.counters.timer_events_processed();
        let now = self.deps.time.now_millis();
        let elapsed_secs = now.saturating_sub(self.last_rate_millis) / 1000;
        if elapsed_secs > 0 {
            let rates = EventProcessingStats {
                dcp_events_processed_psec: (dcp_total - self.last_dcp_count) / elapsed_secs,
                timer_events_processed_psec: (timer_total - self.last_timer_count)
                    / elapsed_secs,
                timestamp: self.deps.time.now_rfc3339(),
            };
            *self.deps.processing_rates.write() = rates;
            self.last_dcp_count = dcp_total;
            self.last_timer_count = timer_total;
            self.last_rate_millis = now;
        }

        info!(
            worker = %self.deps.identity.worker_name,
            mutations = EventCounters::read(&self.deps.counters.dcp_mutation),
            deletions = EventCounters::read(&self.deps.counters.dcp_deletion),
            suppressed = EventCounters::read(&self.deps.counters.suppressed_mutation),
            doc_timers = EventCounters::read(&self.deps.counters.doc_timer_sent),
            cron_timers = EventCounters::read(&self.deps.counters.cron_timer_sent),
            vbs_owned = owned.len(),
            vbs = %condense(&owned),
            "consumer stats"
        );
    }
}

/// Metadata string attached to dcp frames toward the worker.
fn event_meta(vb: u16, seq: u64, cas: u64) -> String {
    serde_json::json!({ "vb": vb, "seq": seq, "cas": cas }).to_string()
}

/// Periodic per-vb checkpoint flush; holds I1 (`last_checkpointed_seq <=
/// last_processed_seq`) by construction.
pub async fn run_checkpoint_ticker(
    interval: Duration,
    checkpoint: Arc<CheckpointStore>,
    vb_stats: Arc<VbProcessingStats>,
    identity: ConsumerIdentity,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                flush_owned(&checkpoint, &vb_stats, &identity).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    // Final flush so restart replays from the newest seqs.
                    flush_owned(&checkpoint, &vb_stats, &identity).await;
                    info!("checkpoint ticker exiting");
                    return;
                }
            }
        }
    }
}

async fn flush_owned(
    checkpoint: &CheckpointStore,
    vb_stats: &VbProcessingStats,
    identity: &ConsumerIdentity,
) {
    for vb in vb_stats.owned_vbs(&identity.node_uuid, &identity.worker_name) {
        let progress = vb_stats.get(vb);
        if let Err(err) = checkpoint.update_checkpoint(vb, &progress).await {
            warn!(vb, %err, "checkpoint flush failed");
        }
    }
}
