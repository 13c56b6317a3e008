//! Feed transport abstraction.
//!
//! The database's published change-stream protocol sits behind
//! `FeedTransport` so the core never speaks it directly. Production wires
//! a real protocol client; tests and the demo node use
//! `SimulatedTransport`, which scripts server behavior per host.

use crate::stream::event::{FailoverEntry, FeedEvent, StreamReqStatus, StreamRequest};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Error type for stream transport operations.
#[derive(Debug)]
pub enum StreamError {
    /// No KV host currently serves the vb.
    NoHostForVb(u16),
    /// The per-host feed connection is gone.
    Disconnected(String),
    /// Connect-time failure.
    Transport(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::NoHostForVb(vb) => write!(f, "no kv host serves vb {}", vb),
            StreamError::Disconnected(host) => write!(f, "feed disconnected: {}", host),
            StreamError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

/// Commands accepted by a per-host feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    StreamRequest(StreamRequest),
    CloseStream(u16),
    CloseFeed,
}

/// A live connection to one KV host: a command handle plus the stream of
/// demultiplexed server frames.
pub struct HostFeed {
    pub host: String,
    pub control: mpsc::UnboundedSender<FeedCommand>,
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait FeedTransport: Send + Sync + 'static {
    /// Open a feed to `host`. `feed_name` identifies this consumer on the
    /// server side for observability.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        feed_name: &'a str,
    ) -> BoxFuture<'a, Result<HostFeed, StreamError>>;
}

// ============================================================================
// SimulatedTransport - scripted KV hosts for tests and the demo node
// ============================================================================

type Responder = Box<dyn Fn(&StreamRequest) -> Vec<FeedEvent> + Send + Sync>;

#[derive(Default)]
struct HostState {
    /// Stream requests observed, newest last.
    requests: Mutex<Vec<StreamRequest>>,
    /// Optional scripted response to each stream request.
    responder: Mutex<Option<Responder>>,
    /// Events queued before the consumer connected.
    pending: Mutex<Vec<FeedEvent>>,
    /// Live event sender once connected.
    event_tx: Mutex<Option<mpsc::UnboundedSender<FeedEvent>>>,
    /// Vbs with an open stream on this feed.
    open_vbs: Mutex<HashSet<u16>>,
}

impl HostState {
    fn deliver(&self, event: FeedEvent) {
        let tx = self.event_tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(event.clone()).is_ok() => {}
            _ => self.pending.lock().push(event),
        }
    }
}

/// Handle a test holds onto one simulated KV host.
#[derive(Clone)]
pub struct SimulatedHost {
    state: Arc<HostState>,
}

impl SimulatedHost {
    /// Inject a server frame toward the consumer.
    pub fn push_event(&self, event: FeedEvent) {
        if let FeedEvent::StreamEnd { vb } = event {
            self.state.open_vbs.lock().remove(&vb);
        }
        self.state.deliver(event);
    }

    /// Stream requests seen so far, draining the record.
    pub fn take_requests(&self) -> Vec<StreamRequest> {
        std::mem::take(&mut *self.state.requests.lock())
    }

    /// Script the response to each incoming stream request.
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&StreamRequest) -> Vec<FeedEvent> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Box::new(f));
    }

    /// Accept every stream request with the given vbuuid and a failover
    /// log ending at the requested start seq.
    pub fn accept_all(&self, vbuuid: u64) {
        self.respond_with(move |req| {
            vec![FeedEvent::StreamReq {
                vb: req.vb,
                status: StreamReqStatus::Success,
                failover_log: vec![FailoverEntry {
                    vbuuid,
                    seq: req.start_seq,
                }],
                seq: 0,
            }]
        });
    }

    pub fn open_vbs(&self) -> Vec<u16> {
        let mut vbs: Vec<u16> = self.state.open_vbs.lock().iter().copied().collect();
        vbs.sort_unstable();
        vbs
    }
}

/// In-memory transport: one scripted state per host name.
#[derive(Default)]
pub struct SimulatedTransport {
    hosts: RwLock<AHashMap<String, Arc<HostState>>>,
}

impl SimulatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(SimulatedTransport::default())
    }

    /// Get-or-create the scripted host, for test setup.
    pub fn host(&self, host: &str) -> SimulatedHost {
        let mut hosts = self.hosts.write();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::default()))
            .clone();
        SimulatedHost { state }
    }
}

impl FeedTransport for SimulatedTransport {
    fn connect<'a>(
        &'a self,
        host: &'a str,
        feed_name: &'a str,
    ) -> BoxFuture<'a, Result<HostFeed, StreamError>> {
        Box::pin(async move {
            debug!(host, feed_name, "simulated feed connect");
            let state = self.host(host).state;

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            // Flush frames queued before the connect.
            for event in state.pending.lock().drain(..) {
                let _ = event_tx.send(event);
            }
            *state.event_tx.lock() = Some(event_tx);

            let (control_tx, mut control_rx) = mpsc::unbounded_channel::<FeedCommand>();
            let task_state = state.clone();
            tokio::spawn(async move {
                while let Some(cmd) = control_rx.recv().await {
                    match cmd {
                        FeedCommand::StreamRequest(req) => {
                            task_state.requests.lock().push(req);
                            task_state.open_vbs.lock().insert(req.vb);
                            let scripted = {
                                let responder = task_state.responder.lock();
                                responder.as_ref().map(|f| f(&req)).unwrap_or_default()
                            };
                            for event in scripted {
                                if !matches!(
                                    event,
                                    FeedEvent::StreamReq {
                                        status: StreamReqStatus::Success,
                                        ..
                                    }
                                ) {
                                    if let FeedEvent::StreamReq { vb, .. } = event {
                                        task_state.open_vbs.lock().remove(&vb);
                                    }
                                }
                                task_state.deliver(event);
                            }
                        }
                        FeedCommand::CloseStream(vb) => {
                            if task_state.open_vbs.lock().remove(&vb) {
                                task_state.deliver(FeedEvent::StreamEnd { vb });
                            }
                        }
                        FeedCommand::CloseFeed => {
                            let vbs: Vec<u16> =
                                task_state.open_vbs.lock().drain().collect();
                            for vb in vbs {
                                task_state.deliver(FeedEvent::StreamEnd { vb });
                            }
                            *task_state.event_tx.lock() = None;
                            return;
                        }
                    }
                }
            });

            Ok(HostFeed {
                host: host.to_string(),
                control: control_tx,
                events: event_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_success_reaches_consumer() {
        let transport = SimulatedTransport::new();
        transport.host("kv1").accept_all(99);

        let mut feed = transport.connect("kv1", "feed").await.unwrap();
        feed.control
            .send(FeedCommand::StreamRequest(StreamRequest::open_ended(5, 99, 0)))
            .unwrap();

        let event = feed.events.recv().await.unwrap();
        match event {
            FeedEvent::StreamReq {
                vb,
                status,
                failover_log,
                ..
            } => {
                assert_eq!(vb, 5);
                assert_eq!(status, StreamReqStatus::Success);
                assert_eq!(failover_log[0].vbuuid, 99);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.host("kv1").open_vbs(), vec![5]);
    }

    #[tokio::test]
    async fn close_feed_ends_every_open_stream() {
        let transport = SimulatedTransport::new();
        transport.host("kv1").accept_all(1);
        let mut feed = transport.connect("kv1", "feed").await.unwrap();
        for vb in [2u16, 4] {
            feed.control
                .send(FeedCommand::StreamRequest(StreamRequest::open_ended(vb, 1, 0)))
                .unwrap();
        }
        // Drain the two success responses.
        feed.events.recv().await.unwrap();
        feed.events.recv().await.unwrap();

        feed.control.send(FeedCommand::CloseFeed).unwrap();
        let mut ended = vec![
            feed.events.recv().await.unwrap().vb(),
            feed.events.recv().await.unwrap().vb(),
        ];
        ended.sort_unstable();
        assert_eq!(ended, vec![2, 4]);
    }

    #[tokio::test]
    async fn events_before_connect_are_buffered() {
        let transport = SimulatedTransport::new();
        transport.host("kv1").push_event(FeedEvent::StreamEnd { vb: 3 });
        let mut feed = transport.connect("kv1", "feed").await.unwrap();
        assert_eq!(feed.events.recv().await.unwrap().vb(), 3);
    }
}
