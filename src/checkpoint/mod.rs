//! Per-(handler, vbucket) checkpoint metadata.
//!
//! A thin facade over the shared metadata bucket: vb ownership blobs,
//! ownership history, debugger blobs. All writes are CAS-guarded; the
//! monotonicity guard guarantees a checkpoint never rewinds
//! `last_seq_no_processed`.

mod blob;
mod kv;
mod store;

pub use blob::{
    debugger_instance_key, start_debugger_key, vb_key, DebuggerInstanceAddrBlob, OwnershipEntry,
    StartDebugBlob, StreamStatus, VbucketBlob, OWNERSHIP_HISTORY_BOUND,
};
pub use kv::{Cas, InMemoryMetadataStore, MetadataError, MetadataStore, ScopedMetadataStore};
pub use store::{CheckpointStore, CheckpointWrite};
