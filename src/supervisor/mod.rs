//! Handler supervision.
//!
//! One `SuperSupervisor` per node owns a `HandlerSupervisor` per deployed
//! handler; each handler supervisor owns its consumers (one child worker
//! each) and every task that serves them: stream client, dispatch loop,
//! timer scanner, checkpoint ticker, failover-log handler, control
//! routine, worker lifecycle. Children that die are restarted with the
//! same identity; graceful shutdown checkpoints before terminating them.

mod worker;

pub use worker::{
    FakeSpawner, FakeWorkerHandle, ProcessSpawner, SpawnError, SpawnedWorker, WorkerIdentity,
    WorkerSpawner, WorkerStream,
};

use crate::checkpoint::{CheckpointStore, MetadataStore, ScopedMetadataStore};
use crate::config::{
    ConsumerIdentity, HandlerConfig, ProcessConfig, RebalanceConfig, SettingsUpdate,
};
use crate::dispatch::{run_checkpoint_ticker, DispatchPipeline, PipelineChannels, PipelineDeps};
use crate::ipc::message::{event, v8_opcode};
use crate::ipc::{
    spawn_worker_channels, Header, Payload, SharedWorkerState, WorkerGateway, WorkerMessage,
};
use crate::ownership::{
    run_failover_handler, ControlEvent, ControllerCtx, OwnershipController, Planner,
    RebalanceProgress, RebalanceShared, RebalanceStatus,
};
use crate::stats::{
    EventCounters, EventProcessingStats, ExecutionStats, FailureStats, LatencyStats,
    LcbExceptionStats, VbProcessingStats, WorkerQueueSizes,
};
use crate::stream::{ClusterView, FeedTransport, StreamClient};
use crate::time::TimeSource;
use crate::timer::{
    InFlightTimers, ScannerConfig, SharedScannerConfig, TimerAck, TimerScanner, TimerStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Deployment state reported to the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Undeployed,
    Enabled,
    Disabled,
    Unexpected,
}

/// External collaborators a node wires once and shares across handlers.
#[derive(Clone)]
pub struct NodeDeps {
    pub metadata_store: Arc<dyn MetadataStore>,
    pub transport: Arc<dyn FeedTransport>,
    pub cluster: Arc<dyn ClusterView>,
    pub planner: Arc<dyn Planner>,
    pub spawner: Arc<dyn WorkerSpawner>,
    pub time: Arc<dyn TimeSource>,
    /// This node's host:port on the eventing service.
    pub host_port: String,
    /// This node's cluster UUID.
    pub node_uuid: String,
}

/// Restricts a node-level plan to one consumer of a multi-worker handler:
/// a vb belongs to consumer `index` when the node owns it and
/// `vb % worker_count == index`.
struct WorkerScopedPlanner {
    inner: Arc<dyn Planner>,
    index: usize,
    worker_count: usize,
}

impl Planner for WorkerScopedPlanner {
    fn vb_owner(&self, vb: u16) -> Option<String> {
        self.inner.vb_owner(vb)
    }

    fn should_own(&self, vb: u16, host_port: &str) -> bool {
        self.inner.should_own(vb, host_port)
            && (vb as usize) % self.worker_count.max(1) == self.index
    }
}

/// Shared handles of one consumer, kept for the admin read side.
pub struct ConsumerRuntime {
    pub worker_name: String,
    pub identity: ConsumerIdentity,
    pub control_tx: mpsc::UnboundedSender<ControlEvent>,
    pub gateway: WorkerGateway,
    pub worker_state: Arc<SharedWorkerState>,
    pub counters: Arc<EventCounters>,
    pub vb_stats: Arc<VbProcessingStats>,
    pub processing_rates: Arc<RwLock<EventProcessingStats>>,
    pub status: Arc<RebalanceStatus>,
    pub scanner_config: SharedScannerConfig,
}

pub struct HandlerSupervisor {
    app_name: String,
    config: HandlerConfig,
    checkpoint: Arc<CheckpointStore>,
    cluster: Arc<dyn ClusterView>,
    consumers: Vec<ConsumerRuntime>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    deployed_at: String,
}

impl HandlerSupervisor {
    /// Assemble and start every task of one handler.
    pub async fn deploy(
        app_name: &str,
        app_code: &str,
        config: HandlerConfig,
        rebalance_config: RebalanceConfig,
        process_config: ProcessConfig,
        deps: NodeDeps,
    ) -> Arc<HandlerSupervisor> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut consumers = Vec::new();

        let checkpoint = Arc::new(CheckpointStore::new(
            deps.metadata_store.clone(),
            app_name,
            deps.time.clone(),
        ));
        let timer_keyspace = ScopedMetadataStore::new(deps.metadata_store.clone(), app_name);

        for index in 0..config.worker_count.max(1) {
            let worker_name = format!("worker_{}_{}", app_name, index);
            let identity = ConsumerIdentity {
                host_port: deps.host_port.clone(),
                node_uuid: deps.node_uuid.clone(),
                worker_name: worker_name.clone(),
            };
            let planner: Arc<dyn Planner> = Arc::new(WorkerScopedPlanner {
                inner: deps.planner.clone(),
                index,
                worker_count: config.worker_count.max(1),
            });

            let vb_stats = Arc::new(VbProcessingStats::new(config.num_vbuckets));
            let counters = Arc::new(EventCounters::default());
            let in_flight = InFlightTimers::new();
            let rebalance = RebalanceShared::new();
            let status = RebalanceStatus::new(rebalance_config.staleness_counter);
            let processing_rates = Arc::new(RwLock::new(EventProcessingStats::default()));
            let vb_stream_requested = Arc::new(RwLock::new(HashSet::new()));
            let timer_store = Arc::new(TimerStore::new(timer_keyspace.clone()));
            let worker_state = SharedWorkerState::new();
            let gateway = WorkerGateway::new();

            let (agg_tx, agg_rx) = mpsc::channel(4096);
            let (timer_tx, timer_rx) = mpsc::channel(1024);
            let (acks_tx, acks_rx) = mpsc::unbounded_channel();
            let (vb_flog_tx, vb_flog_rx) = mpsc::unbounded_channel();
            let (control_tx, control_rx) = mpsc::unbounded_channel();

            let stream = Arc::new(StreamClient::new(
                deps.transport.clone(),
                deps.cluster.clone(),
                identity.clone(),
                &config.source_bucket,
                agg_tx,
                vb_stream_requested.clone(),
                stop_rx.clone(),
            ));

            let ctx = Arc::new(ControllerCtx {
                identity: identity.clone(),
                config: RwLock::new(rebalance_config.clone()),
                boundary: config.stream_boundary,
                num_vbuckets: config.num_vbuckets,
                planner: planner.clone(),
                cluster: deps.cluster.clone(),
                checkpoint: checkpoint.clone(),
                stream: stream.clone(),
                timer_store: timer_store.clone(),
                in_flight: in_flight.clone(),
                vb_stats: vb_stats.clone(),
                rebalance: rebalance.clone(),
                status: status.clone(),
            });

            // Worker lifecycle: spawn, connect, boot, restart on exit.
            let boot = BootFrames::new(app_name, app_code, &identity, &config, &process_config);
            let worker_identity = WorkerIdentity {
                app: app_name.to_string(),
                worker_name: worker_name.clone(),
                index,
                sock_identifier: format!("{}_{}", process_config.sock_identifier, index),
                feedback_sock_identifier: format!(
                    "{}_{}",
                    process_config.feedback_sock_identifier, index
                ),
            };
            tasks.push(tokio::spawn(run_worker_lifecycle(
                deps.spawner.clone(),
                worker_identity,
                gateway.clone(),
                worker_state.clone(),
                acks_tx,
                boot,
                stop_rx.clone(),
            )));

            // Dispatch loop.
            let pipeline = DispatchPipeline::new(PipelineDeps {
                config: config.clone(),
                identity: identity.clone(),
                worker: gateway.clone(),
                checkpoint: checkpoint.clone(),
                timer_store: timer_store.clone(),
                in_flight: in_flight.clone(),
                vb_stats: vb_stats.clone(),
                counters: counters.clone(),
                vb_flog_tx,
                vb_stream_requested: vb_stream_requested.clone(),
                rebalance: rebalance.clone(),
                planner: planner.clone(),
                time: deps.time.clone(),
                processing_rates: processing_rates.clone(),
                stop: stop_rx.clone(),
            });
            tasks.push(tokio::spawn(pipeline.run(PipelineChannels {
                agg_rx,
                timer_rx,
                acks_rx,
            })));

            // Timer scan ticker.
            let scanner_config: SharedScannerConfig = Arc::new(RwLock::new(ScannerConfig {
                scan_interval: config.timer_scan_interval,
                fuzz_offset: config.fuzz_offset,
                skip_timer_threshold: config.skip_timer_threshold,
                cron_timers_per_doc: config.cron_timers_per_doc,
            }));
            let scanner = TimerScanner::new(
                timer_store.clone(),
                deps.time.clone(),
                vb_stats.clone(),
                identity.clone(),
                in_flight.clone(),
                counters.clone(),
                scanner_config.clone(),
                timer_tx,
                stop_rx.clone(),
            );
            tasks.push(tokio::spawn(scanner.run()));

            // Checkpoint ticker.
            tasks.push(tokio::spawn(run_checkpoint_ticker(
                config.checkpoint_interval,
                checkpoint.clone(),
                vb_stats.clone(),
                identity.clone(),
                stop_rx.clone(),
            )));

            // Failover-log handler.
            tasks.push(tokio::spawn(run_failover_handler(
                ctx.clone(),
                vb_flog_rx,
                stop_rx.clone(),
            )));

            // Control routine: open planned streams, then serve events.
            let controller_stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                let controller = OwnershipController::new(ctx, controller_stop);
                controller.start_streams().await;
                controller.run(control_rx).await;
            }));

            consumers.push(ConsumerRuntime {
                worker_name,
                identity,
                control_tx,
                gateway,
                worker_state,
                counters,
                vb_stats,
                processing_rates,
                status,
                scanner_config,
            });
        }

        info!(
            app = app_name,
            workers = consumers.len(),
            "handler deployed"
        );
        Arc::new(HandlerSupervisor {
            app_name: app_name.to_string(),
            config,
            checkpoint,
            cluster: deps.cluster.clone(),
            consumers,
            tasks: Mutex::new(tasks),
            stop_tx,
            deployed_at: deps.time.now_rfc3339(),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn deployed_at(&self) -> &str {
        &self.deployed_at
    }

    pub fn consumers(&self) -> &[ConsumerRuntime] {
        &self.consumers
    }

    /// Topology change: every consumer recomputes its vb set.
    pub fn notify_topology_change(&self) {
        for consumer in &self.consumers {
            let _ = consumer.control_tx.send(ControlEvent::TopologyChange);
        }
    }

    /// Re-read settings and propagate them to controllers and workers.
    pub async fn notify_settings_change(&self, update: SettingsUpdate) {
        for consumer in &self.consumers {
            let _ = consumer
                .control_tx
                .send(ControlEvent::SettingsChange(update.clone()));
            if let Some(threshold) = update.skip_timer_threshold {
                consumer.scanner_config.write().skip_timer_threshold = threshold;
            }
            if let Some(level) = &update.log_level {
                if let Err(err) = consumer
                    .gateway
                    .send(WorkerMessage::log_level(level))
                    .await
                {
                    warn!(worker = %consumer.worker_name, %err, "log level frame failed");
                }
            }
        }
    }

    // Admin read side.

    pub fn execution_stats(&self) -> ExecutionStats {
        let mut total = ExecutionStats::default();
        for consumer in &self.consumers {
            total.add(&consumer.worker_state.execution.read());
        }
        total
    }

    pub fn failure_stats(&self) -> FailureStats {
        let mut total = FailureStats::default();
        for consumer in &self.consumers {
            total.add(&consumer.worker_state.failure.read());
        }
        total
    }

    pub fn latency_stats(&self) -> LatencyStats {
        let mut total = LatencyStats::new();
        for consumer in &self.consumers {
            for (bucket, count) in consumer.worker_state.latency.read().iter() {
                *total.entry(bucket.clone()).or_insert(0) += count;
            }
        }
        total
    }

    pub fn lcb_exception_stats(&self) -> LcbExceptionStats {
        let mut total = LcbExceptionStats::new();
        for consumer in &self.consumers {
            for (name, count) in consumer.worker_state.lcb_exceptions.read().iter() {
                *total.entry(name.clone()).or_insert(0) += count;
            }
        }
        total
    }

    /// dcp/timer counter dump, summed across consumers.
    pub fn event_processing_stats(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for consumer in &self.consumers {
            let counters = &consumer.counters;
            for (name, value) in [
                ("dcp_mutation", EventCounters::read(&counters.dcp_mutation)),
                ("dcp_deletion", EventCounters::read(&counters.dcp_deletion)),
                (
                    "suppressed_mutation",
                    EventCounters::read(&counters.suppressed_mutation),
                ),
                ("doc_timer_sent", EventCounters::read(&counters.doc_timer_sent)),
                ("cron_timer_sent", EventCounters::read(&counters.cron_timer_sent)),
                (
                    "timer_acks_received",
                    EventCounters::read(&counters.timer_acks_received),
                ),
                (
                    "timer_entries_stored",
                    EventCounters::read(&counters.timer_entries_stored),
                ),
                (
                    "timer_decode_errors",
                    EventCounters::read(&counters.timer_decode_errors),
                ),
            ] {
                *out.entry(name.to_string()).or_insert(0) += value;
            }
        }
        out
    }

    /// Seqs processed per vb (max across consumers; each vb has one
    /// owning consumer).
    pub fn seqs_processed(&self) -> BTreeMap<u16, u64> {
        let mut out = BTreeMap::new();
        for consumer in &self.consumers {
            for vb in 0..self.config.num_vbuckets {
                let seq = consumer.vb_stats.last_processed_seq(vb);
                let slot = out.entry(vb).or_insert(0);
                if seq > *slot {
                    *slot = seq;
                }
            }
        }
        out
    }

    /// Events still to be processed, from the cluster's high seqnos.
    pub fn dcp_events_remaining(&self) -> u64 {
        let highs = self.cluster.vb_high_seqnos();
        let seqs = self.seqs_processed();
        highs
            .iter()
            .map(|(vb, high)| high.saturating_sub(*seqs.get(vb).unwrap_or(&0)))
            .sum()
    }

    pub fn is_rebalancing(&self) -> bool {
        self.consumers
            .iter()
            .any(|consumer| consumer.status.is_rebalancing())
    }

    pub fn rebalance_progress(&self) -> RebalanceProgress {
        let mut total = RebalanceProgress::default();
        for consumer in &self.consumers {
            let progress = consumer.status.progress();
            total.vbs_remaining_to_shuffle += progress.vbs_remaining_to_shuffle;
            total.vbs_owned_per_plan += progress.vbs_owned_per_plan;
        }
        total
    }

    /// Ask the first worker to compile `code`; the verdict lands in
    /// shared state as a `compileInfo` response.
    pub async fn request_compile(&self, code: &str) {
        if let Some(consumer) = self.consumers.first() {
            if let Err(err) = consumer.gateway.send(WorkerMessage::v8_compile(code)).await {
                warn!(app = %self.app_name, %err, "compile request failed");
            }
        }
    }

    pub fn latest_compile_status(&self) -> Option<crate::stats::CompileStatus> {
        self.consumers
            .first()
            .and_then(|consumer| consumer.worker_state.compile_info.read().clone())
    }

    // Debugger plumbing.

    pub async fn signal_start_debugger(&self) {
        if let Err(err) = self.checkpoint.set_start_debugger_flag(true).await {
            warn!(app = %self.app_name, %err, "failed to set debugger flag");
            return;
        }
        if let Some(consumer) = self.consumers.first() {
            let _ = consumer
                .gateway
                .send(WorkerMessage::debugger(
                    crate::ipc::message::debugger_opcode::START,
                ))
                .await;
        }
    }

    pub async fn signal_stop_debugger(&self) {
        if let Err(err) = self.checkpoint.set_start_debugger_flag(false).await {
            warn!(app = %self.app_name, %err, "failed to clear debugger flag");
        }
        if let Err(err) = self.checkpoint.reset_debugger_instance().await {
            warn!(app = %self.app_name, %err, "failed to reset debugger advert");
        }
        if let Some(consumer) = self.consumers.first() {
            let _ = consumer
                .gateway
                .send(WorkerMessage::debugger(
                    crate::ipc::message::debugger_opcode::STOP,
                ))
                .await;
        }
    }

    /// Graceful shutdown: stop tickers, drain, checkpoint, terminate
    /// children. Bounded by `deadline`.
    pub async fn stop(&self, deadline: Duration) {
        info!(app = %self.app_name, "stopping handler");
        let _ = self.stop_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(deadline, futures::future::join_all(tasks)).await;
        if drained.is_err() {
            warn!(app = %self.app_name, "shutdown deadline hit, abandoning tasks");
        }
    }

    /// Undeploy: abandon restream work, purge timers, stop, then destroy
    /// the handler's metadata.
    pub async fn undeploy(&self, deadline: Duration) {
        for consumer in &self.consumers {
            let _ = consumer.control_tx.send(ControlEvent::Undeploy);
        }
        // Let the controllers run their purge before tearing down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.stop(deadline).await;
        match self.checkpoint.purge_app().await {
            Ok(removed) => info!(app = %self.app_name, removed, "handler metadata purged"),
            Err(err) => warn!(app = %self.app_name, %err, "metadata purge failed"),
        }
    }
}

/// Frames sent to a freshly connected child, rebuilt on every restart.
#[derive(Clone)]
struct BootFrames {
    init: WorkerMessage,
    load: WorkerMessage,
    log_level: WorkerMessage,
    thread_count: WorkerMessage,
    thread_map: WorkerMessage,
}

impl BootFrames {
    fn new(
        app_name: &str,
        app_code: &str,
        identity: &ConsumerIdentity,
        config: &HandlerConfig,
        process: &ProcessConfig,
    ) -> BootFrames {
        let payload = Payload {
            app_name: Some(app_name.to_string()),
            curr_host: Some(identity.host_port.clone()),
            eventing_dir: Some(process.eventing_dir.clone()),
            kv_host_port: Some(config.source_bucket.clone()),
            lcb_inst_capacity: Some(config.lcb_inst_capacity as i32),
            cron_timers_per_doc: Some(config.cron_timers_per_doc as i32),
            execution_timeout: Some(config.execution_timeout as i32),
            fuzz_offset: Some(config.fuzz_offset as i32),
            checkpoint_interval: Some(config.checkpoint_interval.as_secs() as i32),
            curl_timeout: Some(config.curl_timeout as i64),
            enable_recursive_mutation: Some(config.enable_recursive_mutation),
            ..Payload::default()
        };
        let init = WorkerMessage {
            header: Header {
                event: event::V8_WORKER,
                opcode: v8_opcode::INIT,
                partition: 0,
                metadata: String::new(),
            },
            payload,
        };
        BootFrames {
            init,
            load: WorkerMessage::v8_load(app_code),
            log_level: WorkerMessage::log_level(&config.log_level),
            thread_count: WorkerMessage::thread_count(config.cpp_worker_thread_count),
            thread_map: WorkerMessage::thread_partition_map(
                crate::ipc::thread_partition_map(
                    config.num_vbuckets,
                    config.cpp_worker_thread_count,
                ),
                config.num_vbuckets as i16,
            ),
        }
    }
}

/// Keep one worker child alive until stop: spawn, boot, watch, respawn.
async fn run_worker_lifecycle(
    spawner: Arc<dyn WorkerSpawner>,
    identity: WorkerIdentity,
    gateway: WorkerGateway,
    worker_state: Arc<SharedWorkerState>,
    acks_tx: mpsc::UnboundedSender<TimerAck>,
    boot: BootFrames,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }

        let spawned = match spawner.spawn(&identity).await {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(worker = %identity.worker_name, %err, "worker spawn failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = stop.changed() => continue,
                }
            }
        };

        // Stale depth reports from the previous child must not throttle
        // the fresh one.
        *worker_state.queue_sizes.write() = WorkerQueueSizes::default();

        let handle = spawn_worker_channels(
            spawned.primary,
            spawned.feedback,
            worker_state.clone(),
            acks_tx.clone(),
            &identity.worker_name,
        );
        gateway.set(handle.clone());

        for frame in [
            boot.init.clone(),
            boot.load.clone(),
            boot.log_level.clone(),
            boot.thread_count.clone(),
            boot.thread_map.clone(),
        ] {
            if let Err(err) = gateway.send(frame).await {
                warn!(worker = %identity.worker_name, %err, "boot frame failed");
                break;
            }
        }

        let mut exited = spawned.exited;
        tokio::select! {
            _ = &mut exited => {
                warn!(
                    worker = %identity.worker_name,
                    "worker exited unexpectedly, restarting with same identity"
                );
                gateway.clear();
            }
            _ = handle.closed() => {
                warn!(
                    worker = %identity.worker_name,
                    "worker channel lost, restarting"
                );
                gateway.clear();
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    let _ = gateway.send(WorkerMessage::v8_terminate()).await;
                    info!(worker = %identity.worker_name, "worker lifecycle exiting");
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = stop.changed() => {}
        }
    }
}

/// Per-node root: deploys and owns every handler supervisor.
pub struct SuperSupervisor {
    deps: NodeDeps,
    process_config: ProcessConfig,
    handlers: RwLock<HashMap<String, Arc<HandlerSupervisor>>>,
    processing_status: RwLock<HashMap<String, bool>>,
}

impl SuperSupervisor {
    pub fn new(deps: NodeDeps, process_config: ProcessConfig) -> Arc<Self> {
        Arc::new(SuperSupervisor {
            deps,
            process_config,
            handlers: RwLock::new(HashMap::new()),
            processing_status: RwLock::new(HashMap::new()),
        })
    }

    pub async fn deploy_handler(
        &self,
        app_name: &str,
        app_code: &str,
        config: HandlerConfig,
        rebalance_config: RebalanceConfig,
    ) -> Arc<HandlerSupervisor> {
        let handler = HandlerSupervisor::deploy(
            app_name,
            app_code,
            config,
            rebalance_config,
            self.process_config.clone(),
            self.deps.clone(),
        )
        .await;
        self.handlers
            .write()
            .insert(app_name.to_string(), handler.clone());
        self.processing_status
            .write()
            .insert(app_name.to_string(), true);
        handler
    }

    pub async fn undeploy_handler(&self, app_name: &str, deadline: Duration) {
        let handler = self.handlers.write().remove(app_name);
        self.processing_status.write().remove(app_name);
        if let Some(handler) = handler {
            handler.undeploy(deadline).await;
        }
    }

    /// Graceful node shutdown: stop every handler without purging state.
    pub async fn stop_all(&self, deadline: Duration) {
        let handlers: Vec<Arc<HandlerSupervisor>> =
            self.handlers.write().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.stop(deadline).await;
        }
    }

    pub fn handler(&self, app_name: &str) -> Option<Arc<HandlerSupervisor>> {
        self.handlers.read().get(app_name).cloned()
    }

    pub fn deployed_apps(&self) -> BTreeMap<String, String> {
        self.handlers
            .read()
            .iter()
            .map(|(name, handler)| (name.clone(), handler.deployed_at().to_string()))
            .collect()
    }

    pub fn app_state(&self, app_name: &str) -> AppState {
        let deployed = self.handlers.read().contains_key(app_name);
        let processing = self
            .processing_status
            .read()
            .get(app_name)
            .copied()
            .unwrap_or(false);
        match (deployed, processing) {
            (true, true) => AppState::Enabled,
            (true, false) => AppState::Disabled,
            (false, true) => AppState::Unexpected,
            (false, false) => AppState::Undeployed,
        }
    }

    /// Fan a topology change out to every handler.
    pub fn notify_topology_change(&self) {
        for handler in self.handlers.read().values() {
            handler.notify_topology_change();
        }
    }

    pub async fn notify_settings_change(&self, app_name: &str, update: SettingsUpdate) {
        let handler = self.handler(app_name);
        if let Some(handler) = handler {
            handler.notify_settings_change(update).await;
        }
    }

    /// True while any handler is mid-rebalance.
    pub fn rebalance_status(&self) -> bool {
        self.handlers
            .read()
            .values()
            .any(|handler| handler.is_rebalancing())
    }
}
