//! Worker child lifecycle.
//!
//! The V8 host is a separate process that connects back over two local
//! sockets. The spawner is a capability so tests and the demo node run a
//! scripted in-process fake instead of a real child.

use crate::ipc::FakeWorker;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Stream type the IPC layer accepts; TCP in production, duplex in tests.
pub trait WorkerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> WorkerStream for T {}

/// Stable identity of one worker slot; restarts reuse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub app: String,
    pub worker_name: String,
    pub index: usize,
    /// Bound socket identifier for the primary channel.
    pub sock_identifier: String,
    /// Bound socket identifier for the feedback channel.
    pub feedback_sock_identifier: String,
}

/// Error type for worker spawning.
#[derive(Debug)]
pub enum SpawnError {
    Io(std::io::Error),
    /// The child never connected back within the accept deadline.
    AcceptTimeout,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Io(e) => write!(f, "spawn io error: {}", e),
            SpawnError::AcceptTimeout => write!(f, "worker never connected back"),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<std::io::Error> for SpawnError {
    fn from(e: std::io::Error) -> Self {
        SpawnError::Io(e)
    }
}

/// A launched child: its two sockets and an exit future.
pub struct SpawnedWorker {
    pub primary: Box<dyn WorkerStream>,
    pub feedback: Box<dyn WorkerStream>,
    /// Resolves when the child process goes away.
    pub exited: Pin<Box<dyn Future<Output = ()> + Send>>,
    pub pid: Option<u32>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn<'a>(&'a self, identity: &'a WorkerIdentity)
        -> BoxFuture<'a, Result<SpawnedWorker, SpawnError>>;
}

/// Launches the real worker binary and waits for it to dial back on two
/// loopback listeners.
pub struct ProcessSpawner {
    binary: std::path::PathBuf,
    accept_deadline: Duration,
}

impl ProcessSpawner {
    pub fn new(binary: impl Into<std::path::PathBuf>) -> Self {
        ProcessSpawner {
            binary: binary.into(),
            accept_deadline: Duration::from_secs(30),
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn<'a>(
        &'a self,
        identity: &'a WorkerIdentity,
    ) -> BoxFuture<'a, Result<SpawnedWorker, SpawnError>> {
        Box::pin(async move {
            let primary_listener = TcpListener::bind("127.0.0.1:0").await?;
            let feedback_listener = TcpListener::bind("127.0.0.1:0").await?;
            let primary_port = primary_listener.local_addr()?.port();
            let feedback_port = feedback_listener.local_addr()?.port();

            let mut child = tokio::process::Command::new(&self.binary)
                .arg(&identity.app)
                .arg(&identity.worker_name)
                .arg(primary_port.to_string())
                .arg(feedback_port.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            let pid = child.id();
            info!(
                worker = %identity.worker_name,
                ?pid,
                primary_port,
                feedback_port,
                "worker process launched"
            );

            let accept_both = async {
                let (primary, _) = primary_listener.accept().await?;
                let (feedback, _) = feedback_listener.accept().await?;
                Ok::<_, std::io::Error>((primary, feedback))
            };
            let (primary, feedback) =
                match tokio::time::timeout(self.accept_deadline, accept_both).await {
                    Ok(Ok(streams)) => streams,
                    Ok(Err(e)) => return Err(SpawnError::Io(e)),
                    Err(_) => {
                        warn!(worker = %identity.worker_name, "worker accept timed out");
                        let _ = child.start_kill();
                        return Err(SpawnError::AcceptTimeout);
                    }
                };

            let exited = Box::pin(async move {
                let _ = child.wait().await;
            });

            Ok(SpawnedWorker {
                primary: Box::new(primary),
                feedback: Box::new(feedback),
                exited,
                pid,
            })
        })
    }
}

/// Handle on one fake child, letting tests script it and kill it.
pub struct FakeWorkerHandle {
    pub worker: Arc<FakeWorker>,
    exit_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl FakeWorkerHandle {
    /// Simulate an unexpected child exit.
    pub fn kill(&self) {
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// In-process spawner: each spawn wires a [`FakeWorker`] over duplex
/// pipes and records its handle for the test to drive.
#[derive(Default)]
pub struct FakeSpawner {
    workers: Mutex<Vec<Arc<FakeWorkerHandle>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeSpawner::default())
    }

    /// Handles of every child spawned so far, oldest first.
    pub fn spawned(&self) -> Vec<Arc<FakeWorkerHandle>> {
        self.workers.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakeWorkerHandle>> {
        self.workers.lock().last().cloned()
    }

    pub fn spawn_count(&self) -> usize {
        self.workers.lock().len()
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn<'a>(
        &'a self,
        identity: &'a WorkerIdentity,
    ) -> BoxFuture<'a, Result<SpawnedWorker, SpawnError>> {
        Box::pin(async move {
            let (primary_near, primary_far) = tokio::io::duplex(256 * 1024);
            let (feedback_near, feedback_far) = tokio::io::duplex(64 * 1024);
            let worker = Arc::new(FakeWorker::spawn(primary_far, feedback_far));
            let (exit_tx, exit_rx) = oneshot::channel();
            let handle = Arc::new(FakeWorkerHandle {
                worker,
                exit_tx: Mutex::new(Some(exit_tx)),
            });
            self.workers.lock().push(handle);
            info!(worker = %identity.worker_name, "fake worker spawned");

            Ok(SpawnedWorker {
                primary: Box::new(primary_near),
                feedback: Box::new(feedback_near),
                exited: Box::pin(async move {
                    let _ = exit_rx.await;
                }),
                pid: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> WorkerIdentity {
        WorkerIdentity {
            app: "app".to_string(),
            worker_name: "worker_app_0".to_string(),
            index: 0,
            sock_identifier: "sock0".to_string(),
            feedback_sock_identifier: "fsock0".to_string(),
        }
    }

    #[tokio::test]
    async fn fake_spawner_records_children() {
        let spawner = FakeSpawner::new();
        let spawned = spawner.spawn(&identity()).await.unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        assert!(spawned.pid.is_none());

        // kill() resolves the exit future.
        let handle = spawner.latest().unwrap();
        handle.kill();
        spawned.exited.await;
    }
}
