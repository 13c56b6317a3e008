//! Worker socket actors.
//!
//! The primary socket carries outbound dcp/timer/v8/settings frames and
//! receives stats responses; the feedback socket carries timer
//! acknowledgements only. All writes are serialised through one writer
//! task per socket; readers demultiplex responses into shared typed state
//! or the ack channel.

use crate::ipc::frame::{
    encode_message, encode_response, try_decode_message, try_decode_response,
};
use crate::ipc::message::{resp_msg_type, resp_v8_opcode, Response, WorkerMessage};
use crate::stats::{
    CompileStatus, ExecutionStats, FailureStats, LatencyStats, LcbExceptionStats, WorkerQueueSizes,
};
use crate::timer::{parse_timer_ack, TimerAck};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Error type for the worker channel.
#[derive(Debug)]
pub enum IpcError {
    /// The writer task is gone; the child is being restarted.
    ChannelClosed,
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::ChannelClosed => write!(f, "worker channel closed"),
        }
    }
}

impl std::error::Error for IpcError {}

/// Typed state fed by worker responses, shared with the pipeline and the
/// admin read side.
#[derive(Debug, Default)]
pub struct SharedWorkerState {
    pub latency: RwLock<LatencyStats>,
    pub failure: RwLock<FailureStats>,
    pub execution: RwLock<ExecutionStats>,
    pub lcb_exceptions: RwLock<LcbExceptionStats>,
    pub compile_info: RwLock<Option<CompileStatus>>,
    pub queue_sizes: RwLock<WorkerQueueSizes>,
    pub source_map: RwLock<String>,
    pub handler_code: RwLock<String>,
}

impl SharedWorkerState {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedWorkerState::default())
    }
}

/// Sender half of the worker channel, cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    out_tx: mpsc::Sender<WorkerMessage>,
    state: Arc<SharedWorkerState>,
    closed: watch::Receiver<bool>,
}

impl WorkerHandle {
    pub async fn send(&self, msg: WorkerMessage) -> Result<(), IpcError> {
        self.out_tx.send(msg).await.map_err(|_| IpcError::ChannelClosed)
    }

    pub fn queue_sizes(&self) -> WorkerQueueSizes {
        *self.state.queue_sizes.read()
    }

    pub fn state(&self) -> Arc<SharedWorkerState> {
        self.state.clone()
    }

    /// Resolves when any socket task exits (disconnect or teardown).
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Stable send surface across child restarts.
///
/// The pipeline holds the gateway; the supervisor swaps the underlying
/// `WorkerHandle` in whenever it (re)spawns the child. Frames sent while
/// no child is up are dropped and re-covered by checkpoint replay.
#[derive(Clone, Default)]
pub struct WorkerGateway {
    inner: Arc<RwLock<Option<WorkerHandle>>>,
}

impl WorkerGateway {
    pub fn new() -> Self {
        WorkerGateway::default()
    }

    pub fn set(&self, handle: WorkerHandle) {
        *self.inner.write() = Some(handle);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub async fn send(&self, msg: WorkerMessage) -> Result<(), IpcError> {
        let handle = self.inner.read().clone();
        match handle {
            Some(handle) => handle.send(msg).await,
            None => Err(IpcError::ChannelClosed),
        }
    }

    pub fn queue_sizes(&self) -> WorkerQueueSizes {
        self.inner
            .read()
            .as_ref()
            .map(|handle| handle.queue_sizes())
            .unwrap_or_default()
    }

    pub fn state(&self) -> Option<Arc<SharedWorkerState>> {
        self.inner.read().as_ref().map(|handle| handle.state())
    }
}

/// Spawn the writer and reader tasks over an established socket pair.
///
/// Generic over the stream type: production passes the accepted TCP
/// connections from the child, tests pass duplex pipes.
pub fn spawn_worker_channels<P, F>(
    primary: P,
    feedback: F,
    state: Arc<SharedWorkerState>,
    acks_tx: mpsc::UnboundedSender<TimerAck>,
    worker_name: &str,
) -> WorkerHandle
where
    P: AsyncRead + AsyncWrite + Send + 'static,
    F: AsyncRead + AsyncWrite + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<WorkerMessage>(1024);
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);

    let (mut primary_read, mut primary_write) = tokio::io::split(primary);
    let (mut feedback_read, _feedback_write) = tokio::io::split(feedback);

    // Single writer per socket.
    let writer_closed = closed_tx.clone();
    let writer_name = worker_name.to_string();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        while let Some(msg) = out_rx.recv().await {
            buf.clear();
            encode_message(&msg, &mut buf);
            if let Err(err) = primary_write.write_all(&buf).await {
                error!(worker = %writer_name, %err, "primary socket write failed");
                break;
            }
        }
        let _ = writer_closed.send(true);
    });

    // Primary reader: stats and config responses.
    let reader_state = state.clone();
    let reader_closed = closed_tx.clone();
    let reader_name = worker_name.to_string();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            match read_responses(&mut primary_read, &mut buf).await {
                Some(responses) => {
                    for resp in responses {
                        route_response(resp, &reader_state, &reader_name);
                    }
                }
                None => break,
            }
        }
        debug!(worker = %reader_name, "primary socket reader exiting");
        let _ = reader_closed.send(true);
    });

    // Feedback reader: timer acknowledgements only.
    let feedback_closed = closed_tx;
    let feedback_name = worker_name.to_string();
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4 * 1024);
        loop {
            match read_responses(&mut feedback_read, &mut buf).await {
                Some(responses) => {
                    for resp in responses {
                        if resp.msg_type != resp_msg_type::DOC_TIMER_RESPONSE {
                            warn!(
                                worker = %feedback_name,
                                msg_type = resp.msg_type,
                                "non-timer response on feedback socket, dropping"
                            );
                            continue;
                        }
                        match parse_timer_ack(&resp.msg) {
                            Some(ack) => {
                                if acks_tx.send(ack).is_err() {
                                    return;
                                }
                            }
                            None => warn!(
                                worker = %feedback_name,
                                msg = %resp.msg,
                                "invalid timer ack, dropping"
                            ),
                        }
                    }
                }
                None => break,
            }
        }
        debug!(worker = %feedback_name, "feedback socket reader exiting");
        let _ = feedback_closed.send(true);
    });

    WorkerHandle {
        out_tx,
        state,
        closed: closed_rx,
    }
}

/// Read more bytes and decode every complete response frame buffered so
/// far. `None` on EOF or a corrupt stream.
async fn read_responses<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Option<Vec<Response>> {
    match reader.read_buf(buf).await {
        Ok(0) => None,
        Ok(_) => {
            let mut responses = Vec::new();
            loop {
                match try_decode_response(buf) {
                    Ok(Some(resp)) => responses.push(resp),
                    Ok(None) => break,
                    Err(err) => {
                        error!(%err, "corrupt worker response stream");
                        return None;
                    }
                }
            }
            Some(responses)
        }
        Err(err) => {
            debug!(%err, "worker socket read failed");
            None
        }
    }
}

fn route_response(resp: Response, state: &SharedWorkerState, worker: &str) {
    if resp.msg_type != resp_msg_type::V8_WORKER_CONFIG {
        warn!(
            worker,
            msg_type = resp.msg_type,
            "unexpected response class on primary socket"
        );
        return;
    }
    match resp.opcode {
        resp_v8_opcode::SOURCE_MAP => *state.source_map.write() = resp.msg,
        resp_v8_opcode::HANDLER_CODE => *state.handler_code.write() = resp.msg,
        resp_v8_opcode::APP_LOG => info!(worker, "app log: {}", resp.msg),
        resp_v8_opcode::SYS_LOG => debug!(worker, "worker log: {}", resp.msg),
        resp_v8_opcode::LATENCY_STATS => {
            decode_into(worker, "latency stats", &resp.msg, &state.latency)
        }
        resp_v8_opcode::FAILURE_STATS => {
            decode_into(worker, "failure stats", &resp.msg, &state.failure)
        }
        resp_v8_opcode::EXECUTION_STATS => {
            decode_into(worker, "execution stats", &resp.msg, &state.execution)
        }
        resp_v8_opcode::LCB_EXCEPTIONS => {
            decode_into(worker, "lcb exception stats", &resp.msg, &state.lcb_exceptions)
        }
        resp_v8_opcode::COMPILE_INFO => match serde_json::from_str::<CompileStatus>(&resp.msg) {
            Ok(info) => *state.compile_info.write() = Some(info),
            Err(err) => error!(worker, %err, "failed to decode compile info"),
        },
        resp_v8_opcode::QUEUE_SIZE => {
            decode_into(worker, "queue sizes", &resp.msg, &state.queue_sizes)
        }
        other => debug!(worker, opcode = other, "unknown response opcode, ignoring"),
    }
}

fn decode_into<T: serde::de::DeserializeOwned>(
    worker: &str,
    what: &str,
    msg: &str,
    slot: &RwLock<T>,
) {
    match serde_json::from_str::<T>(msg) {
        Ok(value) => *slot.write() = value,
        Err(err) => error!(worker, %err, "failed to decode {}", what),
    }
}

// ============================================================================
// FakeWorker - scripted child process for tests and the demo node
// ============================================================================

/// Stands in for the V8 child: records every frame it receives and lets
/// the test inject responses on either socket.
pub struct FakeWorker {
    received: Arc<Mutex<Vec<WorkerMessage>>>,
    primary_tx: mpsc::UnboundedSender<Response>,
    feedback_tx: mpsc::UnboundedSender<Response>,
}

impl FakeWorker {
    pub fn spawn(primary: tokio::io::DuplexStream, feedback: tokio::io::DuplexStream) -> FakeWorker {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (primary_tx, mut primary_rx) = mpsc::unbounded_channel::<Response>();
        let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel::<Response>();

        let (mut primary_read, mut primary_write) = tokio::io::split(primary);
        let (_feedback_read, mut feedback_write) = tokio::io::split(feedback);

        let inbox = received.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(16 * 1024);
            loop {
                match primary_read.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => loop {
                        match try_decode_message(&mut buf) {
                            Ok(Some(msg)) => inbox.lock().push(msg),
                            Ok(None) => break,
                            Err(_) => return,
                        }
                    },
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Some(resp) = primary_rx.recv().await {
                buf.clear();
                encode_response(&resp, &mut buf);
                if primary_write.write_all(&buf).await.is_err() {
                    return;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Some(resp) = feedback_rx.recv().await {
                buf.clear();
                encode_response(&resp, &mut buf);
                if feedback_write.write_all(&buf).await.is_err() {
                    return;
                }
            }
        });

        FakeWorker {
            received,
            primary_tx,
            feedback_tx,
        }
    }

    pub fn received(&self) -> Vec<WorkerMessage> {
        self.received.lock().clone()
    }

    pub fn drain_received(&self) -> Vec<WorkerMessage> {
        std::mem::take(&mut *self.received.lock())
    }

    pub fn send_response(&self, resp: Response) {
        let _ = self.primary_tx.send(resp);
    }

    pub fn report_queue_sizes(&self, agg: u64, doc_timer: u64) {
        let sizes = WorkerQueueSizes {
            agg_queue_size: agg,
            doc_timer_queue_size: doc_timer,
        };
        self.send_response(Response {
            msg_type: resp_msg_type::V8_WORKER_CONFIG,
            opcode: resp_v8_opcode::QUEUE_SIZE,
            msg: serde_json::to_string(&sizes).expect("queue sizes encode"),
        });
    }

    /// Acknowledge a delivered timer on the feedback socket.
    pub fn ack_timer(&self, due: &str, callback: &str, doc_key: &str, seq: u64) {
        let _ = self.feedback_tx.send(Response {
            msg_type: resp_msg_type::DOC_TIMER_RESPONSE,
            opcode: 0,
            msg: format!("{}::{}::{}::{}::{}", due, callback, doc_key, "o", seq),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{dcp_opcode, event};
    use tokio::time::{sleep, timeout, Duration};

    async fn settle() {
        sleep(Duration::from_millis(30)).await;
    }

    struct Fixture {
        handle: WorkerHandle,
        worker: FakeWorker,
        acks_rx: mpsc::UnboundedReceiver<TimerAck>,
    }

    fn fixture() -> Fixture {
        let (primary_near, primary_far) = tokio::io::duplex(64 * 1024);
        let (feedback_near, feedback_far) = tokio::io::duplex(64 * 1024);
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let handle = spawn_worker_channels(
            primary_near,
            feedback_near,
            SharedWorkerState::new(),
            acks_tx,
            "worker_app_0",
        );
        let worker = FakeWorker::spawn(primary_far, feedback_far);
        Fixture {
            handle,
            worker,
            acks_rx,
        }
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_worker() {
        let fx = fixture();
        fx.handle
            .send(WorkerMessage::dcp_mutation(1, "m".into(), b"k", b"v"))
            .await
            .unwrap();
        fx.handle.send(WorkerMessage::log_level("INFO")).await.unwrap();
        settle().await;

        let received = fx.worker.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].header.event, event::DCP);
        assert_eq!(received[0].header.opcode, dcp_opcode::MUTATION);
        assert_eq!(received[1].header.metadata, "INFO");
    }

    #[tokio::test]
    async fn queue_size_report_lands_in_shared_state() {
        let fx = fixture();
        fx.worker.report_queue_sizes(500, 7);
        settle().await;
        let sizes = fx.handle.queue_sizes();
        assert_eq!(sizes.agg_queue_size, 500);
        assert_eq!(sizes.doc_timer_queue_size, 7);
    }

    #[tokio::test]
    async fn timer_ack_routed_to_ack_channel() {
        let mut fx = fixture();
        fx.worker.ack_timer("2025-01-01T00:00:01Z", "cb", "doc_1", 250);
        let ack = timeout(Duration::from_secs(1), fx.acks_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.seq, 250);
        assert_eq!(ack.doc_key, "doc_1");
    }

    #[tokio::test]
    async fn execution_stats_decoded_with_extension_fields() {
        let fx = fixture();
        fx.worker.send_response(Response {
            msg_type: resp_msg_type::V8_WORKER_CONFIG,
            opcode: resp_v8_opcode::EXECUTION_STATS,
            msg: r#"{"on_update_success": 12, "custom_counter": 3}"#.to_string(),
        });
        settle().await;
        let state = fx.handle.state();
        let stats = state.execution.read();
        assert_eq!(stats.on_update_success, 12);
        assert_eq!(stats.ext.get("custom_counter"), Some(&3));
    }

    #[tokio::test]
    async fn disconnect_is_observable() {
        let fx = fixture();
        drop(fx.worker);
        timeout(Duration::from_secs(1), fx.handle.closed())
            .await
            .expect("closed() resolves after the worker goes away");
    }
}
