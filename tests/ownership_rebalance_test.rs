//! Ownership controller tests: rollback negotiation, give-up/takeover
//! cycles, replay bounds and stuck-rebalance detection.

use eventflow::checkpoint::{CheckpointStore, InMemoryMetadataStore, StreamStatus, VbucketBlob};
use eventflow::config::ProcessConfig;
use eventflow::ownership::StaticPlanner;
use eventflow::stream::{
    FailoverEntry, FeedEvent, SimulatedHost, SimulatedTransport, StaticClusterView,
    StreamReqStatus,
};
use eventflow::supervisor::{FakeSpawner, HandlerSupervisor};
use eventflow::time::SystemTimeSource;
use eventflow::{HandlerConfig, NodeDeps, RebalanceConfig, SuperSupervisor};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NODE: &str = "127.0.0.1:8096";
const OTHER_NODE: &str = "127.0.0.2:8096";
const KV_HOST: &str = "127.0.0.1:11210";
const NUM_VBS: u16 = 8;

struct Harness {
    supervisor: Arc<SuperSupervisor>,
    handler: Arc<HandlerSupervisor>,
    kv: SimulatedHost,
    planner: Arc<StaticPlanner>,
    cluster: Arc<StaticClusterView>,
    store: Arc<InMemoryMetadataStore>,
    app: String,
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

/// Seed blobs and script the KV host before the handler deploys; the
/// controller opens streams immediately on deploy.
struct HarnessSetup<'a> {
    app: &'a str,
    kv_vbs: std::ops::Range<u16>,
    seeded_blob: Option<(u16, VbucketBlob)>,
}

impl Harness {
    async fn start(setup: HarnessSetup<'_>, script: impl FnOnce(&SimulatedHost)) -> Harness {
        let store = InMemoryMetadataStore::new();
        let transport = SimulatedTransport::new();
        let cluster = StaticClusterView::new();
        cluster.assign_vbs(KV_HOST, setup.kv_vbs);
        cluster.set_eventing_nodes(&[NODE]);
        let planner = StaticPlanner::new();
        planner.rebalance_across(&[NODE], NUM_VBS);
        let kv = transport.host(KV_HOST);
        script(&kv);
        let spawner = FakeSpawner::new();

        if let Some((vb, blob)) = setup.seeded_blob {
            let checkpoint = CheckpointStore::new(
                store.clone(),
                setup.app,
                Arc::new(SystemTimeSource::new()),
            );
            checkpoint.set_vb_blob(vb, &blob).await.unwrap();
        }

        let deps = NodeDeps {
            metadata_store: store.clone(),
            transport: transport.clone(),
            cluster: cluster.clone(),
            planner: planner.clone(),
            spawner: spawner.clone(),
            time: Arc::new(SystemTimeSource::new()),
            host_port: NODE.to_string(),
            node_uuid: "uuid-node-a".to_string(),
        };
        let supervisor = SuperSupervisor::new(deps, ProcessConfig::default());
        let mut config = HandlerConfig::test(setup.app);
        config.num_vbuckets = NUM_VBS;
        let handler = supervisor
            .deploy_handler(
                setup.app,
                "function OnUpdate() {}",
                config,
                RebalanceConfig::test(),
            )
            .await;

        Harness {
            supervisor,
            handler,
            kv,
            planner,
            cluster,
            store,
            app: setup.app.to_string(),
        }
    }

    fn checkpoint(&self) -> CheckpointStore {
        CheckpointStore::new(
            self.store.clone(),
            &self.app,
            Arc::new(SystemTimeSource::new()),
        )
    }

    fn worker_name(&self) -> String {
        format!("worker_{}_0", self.app)
    }

    fn owns(&self, vb: u16) -> bool {
        self.handler.consumers()[0]
            .vb_stats
            .is_owned_by(vb, "uuid-node-a", &self.worker_name())
    }

    async fn stop(self) {
        self.supervisor.stop_all(Duration::from_secs(5)).await;
    }
}

#[tokio::test]
async fn rollback_reissues_request_at_server_seq() {
    // Existing blob at seq 100; the server demands a rollback to 80.
    let seeded = VbucketBlob {
        vb_id: 7,
        vb_uuid: 42,
        last_seq_no_processed: 100,
        last_doc_timer_feedback_seq_no: 100,
        node_uuid: "uuid-node-a".to_string(),
        ..VbucketBlob::default()
    };
    let rolled_back = Arc::new(AtomicBool::new(false));
    let trigger = rolled_back.clone();
    let harness = Harness::start(
        HarnessSetup {
            app: "rollback_app",
            kv_vbs: 0..NUM_VBS,
            seeded_blob: Some((7, seeded)),
        },
        move |kv| {
            kv.respond_with(move |req| {
                if req.vb == 7 && !trigger.swap(true, Ordering::SeqCst) {
                    vec![FeedEvent::StreamReq {
                        vb: 7,
                        status: StreamReqStatus::Rollback,
                        failover_log: vec![FailoverEntry { vbuuid: 42, seq: 80 }],
                        seq: 80,
                    }]
                } else {
                    vec![FeedEvent::StreamReq {
                        vb: req.vb,
                        status: StreamReqStatus::Success,
                        failover_log: vec![FailoverEntry {
                            vbuuid: 42,
                            seq: req.start_seq,
                        }],
                        seq: 0,
                    }]
                }
            });
        },
    )
    .await;

    eventually("vb 7 eventually running", || async {
        harness.handler.consumers()[0].vb_stats.get(7).stream_status
            == Some(StreamStatus::Running)
    })
    .await;

    let requests: Vec<_> = harness
        .kv
        .take_requests()
        .into_iter()
        .filter(|req| req.vb == 7)
        .collect();
    assert_eq!(requests.len(), 2, "initial request plus rollback retry");
    assert_eq!(requests[0].start_seq, 100);
    // Retry at the server's rollback point with the same vbuuid.
    assert_eq!(requests[1].start_seq, 80);
    assert_eq!(requests[1].vbuuid, 42);

    harness.stop().await;
}

#[tokio::test]
async fn give_up_and_reclaim_cycle() {
    let harness = Harness::start(
        HarnessSetup {
            app: "s4_app",
            kv_vbs: 0..NUM_VBS,
            seeded_blob: None,
        },
        |kv| kv.accept_all(0xFEED),
    )
    .await;
    let vb = 3u16;

    eventually("vb owned after deploy", || async { harness.owns(vb) }).await;

    // Record some progress so the replay bound is visible: the stream
    // processed to seq 5 and timers acked through 5.
    let consumer = &harness.handler.consumers()[0];
    consumer.vb_stats.set_last_processed_seq(vb, 5);
    consumer.vb_stats.advance_timer_feedback_seq(vb, 5);
    harness.kv.take_requests();

    // Planner moves the vb away; the controller hands it off.
    harness.planner.assign(OTHER_NODE, [vb]);
    harness.handler.notify_topology_change();

    let checkpoint = harness.checkpoint();
    eventually("blob released", || async {
        matches!(
            checkpoint.get_vb_blob(vb).await,
            Ok(Some((blob, _))) if blob.dcp_stream_status == Some(StreamStatus::Stopped)
                && blob.current_vb_owner.is_empty()
                && blob.previous_vb_owner == NODE
        )
    })
    .await;

    // A later change returns the vb to this node.
    harness.planner.assign(NODE, [vb]);
    harness.handler.notify_topology_change();

    eventually("vb reclaimed", || async { harness.owns(vb) }).await;

    let reopen: Vec<_> = harness
        .kv
        .take_requests()
        .into_iter()
        .filter(|req| req.vb == vb)
        .collect();
    assert!(!reopen.is_empty());
    // Restart at min(last processed, last timer feedback) = 5.
    assert_eq!(reopen[0].start_seq, 5);

    let (blob, _) = checkpoint.get_vb_blob(vb).await.unwrap().unwrap();
    assert_eq!(blob.dcp_stream_status, Some(StreamStatus::Running));
    assert_eq!(blob.current_vb_owner, NODE);

    harness.stop().await;
}

#[tokio::test]
async fn takeover_waits_for_predecessor_release() {
    // A blob that still shows another node running: bootstrap defers it.
    let held = VbucketBlob {
        vb_id: 2,
        vb_uuid: 9,
        last_seq_no_processed: 40,
        last_doc_timer_feedback_seq_no: 40,
        current_vb_owner: OTHER_NODE.to_string(),
        assigned_worker: "worker_other_0".to_string(),
        node_uuid: "uuid-node-b".to_string(),
        dcp_stream_status: Some(StreamStatus::Running),
        ..VbucketBlob::default()
    };
    let harness = Harness::start(
        HarnessSetup {
            app: "takeover_app",
            kv_vbs: 0..NUM_VBS,
            seeded_blob: Some((2, held)),
        },
        |kv| kv.accept_all(9),
    )
    .await;

    // Rebalance assigns vb 2 here; the takeover routine must wait while
    // the predecessor still shows running.
    harness.handler.notify_topology_change();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let early: Vec<_> = harness
        .kv
        .take_requests()
        .into_iter()
        .filter(|req| req.vb == 2)
        .collect();
    assert!(
        early.is_empty(),
        "stream must not open while predecessor shows running"
    );

    // Predecessor releases; the bounded wait picks it up.
    let checkpoint = harness.checkpoint();
    let (mut blob, _) = checkpoint.get_vb_blob(2).await.unwrap().unwrap();
    blob.dcp_stream_status = Some(StreamStatus::Stopped);
    blob.current_vb_owner.clear();
    blob.node_uuid.clear();
    checkpoint.set_vb_blob(2, &blob).await.unwrap();

    eventually("vb 2 taken over", || async { harness.owns(2) }).await;

    let requests: Vec<_> = harness
        .kv
        .take_requests()
        .into_iter()
        .filter(|req| req.vb == 2)
        .collect();
    assert_eq!(requests[0].start_seq, 40);
    assert_eq!(requests[0].vbuuid, 9);

    harness.stop().await;
}

#[tokio::test]
async fn stuck_rebalance_reports_failed() {
    // vb 7 has no KV home, so every open fails and progress stalls.
    let harness = Harness::start(
        HarnessSetup {
            app: "stuck_app",
            kv_vbs: 0..7,
            seeded_blob: None,
        },
        |kv| kv.accept_all(1),
    )
    .await;

    harness.handler.notify_topology_change();

    eventually("rebalance marked failed", || async {
        harness.handler.consumers()[0].status.phase()
            == eventflow::ownership::RebalancePhase::Failed
    })
    .await;
    assert!(!harness.handler.is_rebalancing());

    // Failure is sticky until the next topology change repairs the map.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        harness.handler.consumers()[0].status.phase(),
        eventflow::ownership::RebalancePhase::Failed
    );

    harness.cluster.assign_vbs(KV_HOST, 7..8);
    harness.handler.notify_topology_change();
    eventually("vb 7 recovers after repair", || async { harness.owns(7) }).await;

    harness.stop().await;
}

#[tokio::test]
async fn undeploy_discards_restream_work() {
    // vbs 6 and 7 are unreachable: they sit on the restream list.
    let harness = Harness::start(
        HarnessSetup {
            app: "undeploy_app",
            kv_vbs: 0..6,
            seeded_blob: None,
        },
        |kv| kv.accept_all(1),
    )
    .await;

    eventually("reachable vbs owned", || async { harness.owns(0) }).await;

    harness
        .supervisor
        .undeploy_handler("undeploy_app", Duration::from_secs(5))
        .await;

    // Undeploy destroyed every metadata key of the handler.
    let checkpoint = harness.checkpoint();
    assert!(checkpoint.get_vb_blob(0).await.unwrap().is_none());
    assert!(harness.supervisor.deployed_apps().is_empty());
}
