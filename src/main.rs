//! Demo node: runs one handler against a scripted KV feed.
//!
//! Production deployments embed the library behind the cluster manager;
//! this binary wires the simulated collaborators instead so the whole
//! dispatch path (feed -> pipeline -> worker -> timer ack) can be watched
//! from a terminal.
//!
//! Environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | EVENTFLOW_APP | demo_app | Handler name |
//! | EVENTFLOW_VBUCKETS | 16 | Number of vbuckets |
//! | EVENTFLOW_MUTATIONS | 64 | Mutations to publish |
//! | RUST_LOG | info | Log filter |

use eventflow::config::ProcessConfig;
use eventflow::ownership::StaticPlanner;
use eventflow::stream::{Datatype, FeedEvent, StaticClusterView, SimulatedTransport};
use eventflow::supervisor::FakeSpawner;
use eventflow::time::SystemTimeSource;
use eventflow::{HandlerConfig, NodeDeps, RebalanceConfig, SuperSupervisor};
use eventflow::checkpoint::InMemoryMetadataStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_name: String = env_or("EVENTFLOW_APP", "demo_app".to_string());
    let num_vbuckets: u16 = env_or("EVENTFLOW_VBUCKETS", 16);
    let mutations: u64 = env_or("EVENTFLOW_MUTATIONS", 64);

    let node = "127.0.0.1:8096";
    let kv_host = "127.0.0.1:11210";

    // Scripted collaborators standing in for the cluster.
    let transport = SimulatedTransport::new();
    let cluster = StaticClusterView::new();
    cluster.assign_vbs(kv_host, 0..num_vbuckets);
    cluster.set_eventing_nodes(&[node]);
    let planner = StaticPlanner::new();
    planner.rebalance_across(&[node], num_vbuckets);
    let kv = transport.host(kv_host);
    kv.accept_all(0xC0FFEE);

    let spawner = FakeSpawner::new();
    let deps = NodeDeps {
        metadata_store: InMemoryMetadataStore::new(),
        transport: transport.clone(),
        cluster: cluster.clone(),
        planner: planner.clone(),
        spawner: spawner.clone(),
        time: Arc::new(SystemTimeSource::new()),
        host_port: node.to_string(),
        node_uuid: "demo-node-uuid".to_string(),
    };

    let supervisor = SuperSupervisor::new(deps, ProcessConfig::default());
    let mut config = HandlerConfig::test(&app_name);
    config.num_vbuckets = num_vbuckets;
    let handler = supervisor
        .deploy_handler(
            &app_name,
            "function OnUpdate(doc, meta) { log(meta.id); }",
            config,
            RebalanceConfig::test(),
        )
        .await;

    // Give the streams a moment to open, then publish mutations.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for seq in 1..=mutations {
        let vb = (seq % num_vbuckets as u64) as u16;
        kv.push_event(FeedEvent::Mutation {
            vb,
            seq,
            cas: seq * 31,
            key: format!("doc_{}", seq),
            value: format!("{{\"n\":{}}}", seq).into_bytes(),
            datatype: Datatype::Json,
        });
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    let counters = handler.event_processing_stats();
    info!(?counters, "event counters");
    let frames: usize = spawner
        .spawned()
        .iter()
        .map(|worker| worker.worker.received().len())
        .sum();
    info!(frames, "frames delivered to workers");

    supervisor.stop_all(Duration::from_secs(5)).await;
    info!("demo node finished");
}
