//! Control routine: topology reactions, give-up/takeover, restream
//! retries, failover-log handling.

use crate::checkpoint::{CheckpointStore, StreamStatus};
use crate::config::{ConsumerIdentity, RebalanceConfig, SettingsUpdate, StreamBoundary};
use crate::ownership::planner::Planner;
use crate::ownership::progress::{RebalancePhase, RebalanceProgress, RebalanceStatus};
use crate::ownership::RebalanceShared;
use crate::retry::CLUSTER_OP_BACKOFF;
use crate::stats::{condense, VbProcessingStats};
use crate::stream::{ClusterView, StreamClient, StreamReqStatus, VbFlogEntry};
use crate::timer::{InFlightTimers, TimerStore};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Semantic control signals; every event carries its cause.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// Cluster membership or the planner output changed.
    TopologyChange,
    /// Handler settings were rewritten by the admin surface.
    SettingsChange(SettingsUpdate),
    /// The handler is being undeployed; abandon restream work.
    Undeploy,
}

/// Shared context of the control tasks.
pub struct ControllerCtx {
    pub identity: ConsumerIdentity,
    pub config: RwLock<RebalanceConfig>,
    pub boundary: StreamBoundary,
    pub num_vbuckets: u16,
    pub planner: Arc<dyn Planner>,
    pub cluster: Arc<dyn ClusterView>,
    pub checkpoint: Arc<CheckpointStore>,
    pub stream: Arc<StreamClient>,
    pub timer_store: Arc<TimerStore>,
    pub in_flight: Arc<InFlightTimers>,
    pub vb_stats: Arc<VbProcessingStats>,
    pub rebalance: Arc<RebalanceShared>,
    pub status: Arc<RebalanceStatus>,
}

impl ControllerCtx {
    fn owned_vbs(&self) -> Vec<u16> {
        self.vb_stats
            .owned_vbs(&self.identity.node_uuid, &self.identity.worker_name)
    }

    fn planned_vbs(&self) -> Vec<u16> {
        self.planner.vbs_for(&self.identity.host_port, self.num_vbuckets)
    }

    /// Open a vb's stream from its persisted blob, honoring the replay
    /// bound and the deploy-time stream boundary.
    pub async fn open_stream_from_blob(&self, vb: u16) -> Result<(), String> {
        let blob = match self.checkpoint.get_vb_blob(vb).await {
            Ok(Some((blob, _))) => Some(blob),
            Ok(None) => None,
            Err(err) => return Err(err.to_string()),
        };

        let (vbuuid, start_seq) = match blob {
            Some(blob) => (blob.vb_uuid, blob.replay_start_seq()),
            None => {
                // First contact with this vb: bootstrap the blob, then
                // start per the configured boundary.
                if let Err(err) = self
                    .checkpoint
                    .ensure_bootstrap(vb, 0, &self.identity)
                    .await
                {
                    return Err(err.to_string());
                }
                let start = match self.boundary {
                    StreamBoundary::Everything => 0,
                    StreamBoundary::FromNow => self
                        .cluster
                        .vb_high_seqnos()
                        .get(&vb)
                        .copied()
                        .unwrap_or(0),
                };
                (0, start)
            }
        };

        self.stream
            .request_stream(vb, vbuuid, start_seq)
            .await
            .map_err(|err| err.to_string())
    }
}

pub struct OwnershipController {
    ctx: Arc<ControllerCtx>,
    stop: watch::Receiver<bool>,
    /// Cancels the in-flight give-up/takeover round of the previous
    /// topology change.
    round_cancel: Option<watch::Sender<bool>>,
    deployed: bool,
}

impl OwnershipController {
    pub fn new(ctx: Arc<ControllerCtx>, stop: watch::Receiver<bool>) -> Self {
        OwnershipController {
            ctx,
            stop,
            round_cancel: None,
            deployed: true,
        }
    }

    /// Open streams for every planned vb (deploy-time bootstrap).
    ///
    /// A vb whose blob still names another live node is left alone; the
    /// takeover path claims it on the next topology notification.
    pub async fn start_streams(&self) {
        let planned = self.ctx.planned_vbs();
        info!(vbs = %condense(&planned), "opening streams for planned vbs");
        for vb in planned {
            match self.ctx.checkpoint.get_vb_blob(vb).await {
                Ok(Some((blob, _)))
                    if blob.dcp_stream_status == Some(StreamStatus::Running)
                        && !blob.node_uuid.is_empty()
                        && blob.node_uuid != self.ctx.identity.node_uuid =>
                {
                    debug!(
                        vb,
                        owner = %blob.current_vb_owner,
                        "vb held by another node at bootstrap, deferring"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(vb, %err, "bootstrap blob read failed");
                }
            }
            if let Err(err) = self.ctx.open_stream_from_blob(vb).await {
                warn!(vb, %err, "initial stream open failed, queueing restream");
                self.ctx.rebalance.queue_restream(vb);
            }
        }
    }

    pub async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<ControlEvent>) {
        let (restream_interval, progress_interval) = {
            let config = self.ctx.config.read();
            (config.restream_tick_interval, config.progress_tick_interval)
        };
        let mut restream_tick = tokio::time::interval(restream_interval);
        restream_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut progress_tick = tokio::time::interval(progress_interval);
        progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop = self.stop.clone();

        loop {
            tokio::select! {
                event = control_rx.recv() => {
                    match event {
                        Some(ControlEvent::TopologyChange) => self.on_topology_change(),
                        Some(ControlEvent::SettingsChange(update)) => {
                            self.on_settings_change(update);
                        }
                        Some(ControlEvent::Undeploy) => {
                            let dropped = self.ctx.rebalance.clear_restream();
                            if !dropped.is_empty() {
                                info!(
                                    vbs = %condense(&dropped),
                                    "discarding restream work, handler undeployed"
                                );
                            }
                            for vb in self.ctx.owned_vbs() {
                                if let Err(err) = self.ctx.timer_store.purge_vb(vb).await {
                                    warn!(vb, %err, "timer purge on undeploy failed");
                                }
                                self.ctx.in_flight.clear_vb(vb);
                            }
                            self.deployed = false;
                        }
                        None => {
                            info!("control channel closed, control routine exiting");
                            return;
                        }
                    }
                }
                _ = restream_tick.tick() => self.retry_restream().await,
                _ = progress_tick.tick() => self.report_progress(),
                _ = stop.changed() => {
                    if *stop.borrow() {
                        self.cancel_round();
                        info!("control routine exiting");
                        return;
                    }
                }
            }
        }
    }

    fn on_topology_change(&mut self) {
        info!("cluster state changed, recomputing vb ownership");
        self.cancel_round();
        self.ctx.rebalance.reset_stream_closed();
        self.ctx.status.begin();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.round_cancel = Some(cancel_tx);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            vbs_state_update(ctx, cancel_rx).await;
        });
    }

    fn cancel_round(&mut self) {
        if let Some(cancel) = self.round_cancel.take() {
            let _ = cancel.send(true);
        }
    }

    fn on_settings_change(&mut self, update: SettingsUpdate) {
        let mut config = self.ctx.config.write();
        if let Some(n) = update.vb_ownership_giveup_routine_count {
            config.giveup_routine_count = n.max(1);
        }
        if let Some(n) = update.vb_ownership_takeover_routine_count {
            config.takeover_routine_count = n.max(1);
        }
        info!(
            giveup = config.giveup_routine_count,
            takeover = config.takeover_routine_count,
            "applied rebalance settings"
        );
    }

    /// Retry-until-empty over the restream list; vbs that fail to open
    /// stay queued for the next tick.
    async fn retry_restream(&mut self) {
        loop {
            if *self.stop.borrow() || !self.deployed {
                return;
            }
            let vbs = self.ctx.rebalance.take_restream_list();
            if vbs.is_empty() {
                return;
            }
            info!(vbs = %condense(&vbs), "retrying streams for vbs pending restream");

            let mut failed = Vec::new();
            for vb in vbs {
                if self
                    .ctx
                    .vb_stats
                    .is_owned_by(vb, &self.ctx.identity.node_uuid, &self.ctx.identity.worker_name)
                    && self.ctx.vb_stats.get(vb).stream_status == Some(StreamStatus::Running)
                {
                    continue;
                }
                // KV-side stream ends can race the planner moving the vb
                // away; only reclaim what the plan still assigns here.
                if !self.ctx.planner.should_own(vb, &self.ctx.identity.host_port) {
                    continue;
                }
                if let Err(err) = self.ctx.open_stream_from_blob(vb).await {
                    warn!(vb, %err, "restream attempt failed");
                    failed.push(vb);
                }
            }

            if !failed.is_empty() {
                self.ctx.rebalance.requeue_restream(failed);
                return;
            }
            // List drained; loop once more in case stream ends queued new
            // vbs while we were opening.
        }
    }

    fn report_progress(&self) {
        let planned = self.ctx.planned_vbs();
        let owned = self.ctx.owned_vbs();
        let owned_set: std::collections::HashSet<u16> = owned.iter().copied().collect();
        let planned_set: std::collections::HashSet<u16> = planned.iter().copied().collect();

        let missing = planned.iter().filter(|vb| !owned_set.contains(vb)).count();
        let extra = owned.iter().filter(|vb| !planned_set.contains(vb)).count();
        let progress = RebalanceProgress {
            vbs_remaining_to_shuffle: missing + extra,
            vbs_owned_per_plan: planned.len().max(extra),
        };
        let phase = self.ctx.status.observe(progress);
        debug!(?phase, ?progress, "rebalance progress");
    }
}

/// One give-up/takeover round after a topology change.
async fn vbs_state_update(ctx: Arc<ControllerCtx>, cancel: watch::Receiver<bool>) {
    let owned = ctx.owned_vbs();
    let planned = ctx.planned_vbs();
    let planned_set: std::collections::HashSet<u16> = planned.iter().copied().collect();
    let owned_set: std::collections::HashSet<u16> = owned.iter().copied().collect();

    let to_give_up: Vec<u16> = owned
        .iter()
        .copied()
        .filter(|vb| !planned_set.contains(vb))
        .collect();
    let to_take_over: Vec<u16> = planned
        .iter()
        .copied()
        .filter(|vb| !owned_set.contains(vb))
        .filter(|vb| !ctx.stream.vb_stream_requested().read().contains(vb))
        .collect();

    info!(
        giving_up = %condense(&to_give_up),
        taking_over = %condense(&to_take_over),
        "vb ownership update"
    );

    let (giveup_limit, takeover_limit) = {
        let config = ctx.config.read();
        (config.giveup_routine_count, config.takeover_routine_count)
    };

    for chunk in to_give_up.chunks(giveup_limit.max(1)) {
        if *cancel.borrow() {
            return;
        }
        let tasks = chunk.iter().map(|&vb| give_up_vb(&ctx, vb));
        futures::future::join_all(tasks).await;
    }

    if ctx.status.phase() == RebalancePhase::Failed {
        warn!("rebalance marked failed, skipping takeovers");
        return;
    }

    for chunk in to_take_over.chunks(takeover_limit.max(1)) {
        if *cancel.borrow() {
            return;
        }
        let tasks = chunk.iter().map(|&vb| take_over_vb(&ctx, vb, &cancel));
        futures::future::join_all(tasks).await;
    }
}

/// Hand one vb back: flush, close the stream, release the blob.
async fn give_up_vb(ctx: &ControllerCtx, vb: u16) {
    info!(vb, "giving up vb ownership");
    let progress = ctx.vb_stats.get(vb);
    if let Err(err) = ctx.checkpoint.update_checkpoint(vb, &progress).await {
        warn!(vb, %err, "checkpoint flush before give-up failed");
    }

    ctx.stream.close_stream(vb);

    if let Err(err) = ctx.checkpoint.clear_ownership(vb, &ctx.identity).await {
        warn!(vb, %err, "failed to release vb blob");
    }
    ctx.vb_stats.clear_ownership(vb);
    ctx.in_flight.clear_vb(vb);
}

/// Claim one vb: wait for the predecessor's stopped marker, then open the
/// stream at the replay bound.
async fn take_over_vb(ctx: &ControllerCtx, vb: u16, cancel: &watch::Receiver<bool>) {
    let wait_attempts = ctx.config.read().takeover_wait_attempts;

    for attempt in 0..=wait_attempts {
        if *cancel.borrow() {
            return;
        }
        match ctx.checkpoint.get_vb_blob(vb).await {
            Ok(Some((blob, _))) => {
                let predecessor_live = blob.dcp_stream_status == Some(StreamStatus::Running)
                    && blob.node_uuid != ctx.identity.node_uuid
                    && !blob.node_uuid.is_empty();
                if !predecessor_live {
                    break;
                }
                if attempt == wait_attempts {
                    // Planner inconsistency: predecessor never released.
                    // Proceed; the stream open itself will fail and loop
                    // back through the restream path if it is truly held.
                    warn!(
                        vb,
                        owner = %blob.current_vb_owner,
                        "predecessor still shows running after bounded waits, proceeding"
                    );
                    break;
                }
                debug!(vb, attempt, "waiting for predecessor to release vb");
                tokio::time::sleep(CLUSTER_OP_BACKOFF).await;
            }
            Ok(None) => break,
            Err(err) => {
                warn!(vb, %err, "takeover blob read failed");
                tokio::time::sleep(CLUSTER_OP_BACKOFF).await;
            }
        }
    }

    if *cancel.borrow() {
        return;
    }
    if let Err(err) = ctx.open_stream_from_blob(vb).await {
        warn!(vb, %err, "takeover stream open failed, queueing restream");
        ctx.rebalance.queue_restream(vb);
    }
}

/// Failover-log handler: re-issues stream requests after rollback or
/// retryable failures.
pub async fn run_failover_handler(
    ctx: Arc<ControllerCtx>,
    mut vb_flog_rx: mpsc::UnboundedReceiver<VbFlogEntry>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            entry = vb_flog_rx.recv() => {
                let Some(entry) = entry else {
                    info!("failover-log channel closed");
                    return;
                };
                handle_flog_entry(&ctx, entry).await;
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    info!("failover-log handler exiting");
                    return;
                }
            }
        }
    }
}

async fn handle_flog_entry(ctx: &ControllerCtx, entry: VbFlogEntry) {
    let vb = entry.vb;
    if entry.signal_stream_end {
        debug!(vb, "stream end signalled, restream ticker will reclaim");
        return;
    }
    if !entry.stream_req_retry {
        if entry.status == Some(StreamReqStatus::Success) {
            debug!(vb, "stream created");
        } else {
            debug!(vb, status = ?entry.status, "stream request deferred to ownership");
        }
        return;
    }

    let vbuuid = match ctx.checkpoint.get_vb_blob(vb).await {
        Ok(Some((blob, _))) => blob.vb_uuid,
        Ok(None) => 0,
        Err(err) => {
            warn!(vb, %err, "blob read failed during stream retry");
            0
        }
    };

    // Rollback restarts at the server-provided seq; EINVAL/ENOMEM restart
    // from zero with the latest known vbuuid.
    let start_seq = if entry.status == Some(StreamReqStatus::Rollback) {
        entry.seq
    } else {
        0
    };

    info!(vb, vbuuid, start_seq, status = ?entry.status, "re-issuing stream request");
    if let Err(err) = ctx.stream.request_stream(vb, vbuuid, start_seq).await {
        warn!(vb, %err, "stream retry failed, queueing restream");
        if ctx.planner.should_own(vb, &ctx.identity.host_port) {
            ctx.rebalance.queue_restream(vb);
        }
    }
}
