//! Change-stream ingestion.
//!
//! Per-host feeds behind a transport trait, demultiplexed into one
//! aggregated channel per handler. Ordering is guaranteed within a vb and
//! within a host only.

mod client;
mod cluster;
mod event;
mod feed;

pub use client::{StreamClient, VbStreamRequested};
pub use cluster::{ClusterView, StaticClusterView};
pub use event::{
    Datatype, FailoverEntry, FeedEvent, StreamReqStatus, StreamRequest, VbFlogEntry,
    OPEN_ENDED_SEQ,
};
pub use feed::{FeedCommand, FeedTransport, HostFeed, SimulatedHost, SimulatedTransport, StreamError};
