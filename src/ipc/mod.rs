//! Framed channel to the worker child process.
//!
//! Length-prefixed CBOR frames with numeric field tags, forward compatible
//! in both directions. Flow control is feedback-only: the worker reports
//! queue depths and the dispatch pipeline throttles on them; there are no
//! explicit credits.

mod conn;
mod frame;
pub mod message;

pub use conn::{
    spawn_worker_channels, FakeWorker, IpcError, SharedWorkerState, WorkerGateway, WorkerHandle,
};
pub use frame::{
    encode_message, encode_response, try_decode_message, try_decode_response, FrameError,
    MAX_FRAME_BYTES,
};
pub use message::{
    thread_partition, thread_partition_map, Header, Payload, Response, ThreadPartition,
    WorkerMessage,
};
