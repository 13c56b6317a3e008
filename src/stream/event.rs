//! Change-stream frame types.

/// End seq for an open-ended stream request.
pub const OPEN_ENDED_SEQ: u64 = u64::MAX;

/// Status returned by the server for a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamReqStatus {
    Success,
    /// Server demands a restart from an earlier seq.
    Rollback,
    /// A stream for this vb already exists on this connection.
    KeyEexists,
    /// This host no longer serves the vb.
    NotMyVbucket,
    Einval,
    Enomem,
}

impl StreamReqStatus {
    /// True when the request should be re-issued by the failover-log
    /// handler rather than deferred to the ownership controller.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StreamReqStatus::Rollback | StreamReqStatus::Einval | StreamReqStatus::Enomem
        )
    }
}

/// One `(vbuuid, seq)` pair of a vb's failover log, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vbuuid: u64,
    pub seq: u64,
}

/// Value datatype flags carried on mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Json,
    JsonXattr,
}

/// A demultiplexed server frame, tagged by vbucket.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Mutation {
        vb: u16,
        seq: u64,
        cas: u64,
        key: String,
        value: Vec<u8>,
        datatype: Datatype,
    },
    Deletion {
        vb: u16,
        seq: u64,
        cas: u64,
        key: String,
    },
    StreamReq {
        vb: u16,
        status: StreamReqStatus,
        /// Newest-first; present on SUCCESS and on retryable failures.
        failover_log: Vec<FailoverEntry>,
        /// Rollback point on `Rollback`, zero otherwise.
        seq: u64,
    },
    StreamEnd {
        vb: u16,
    },
}

impl FeedEvent {
    pub fn vb(&self) -> u16 {
        match self {
            FeedEvent::Mutation { vb, .. }
            | FeedEvent::Deletion { vb, .. }
            | FeedEvent::StreamReq { vb, .. }
            | FeedEvent::StreamEnd { vb } => *vb,
        }
    }
}

/// Parameters of one stream open, mirroring the transport's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub vb: u16,
    pub opaque: u16,
    pub flags: u32,
    pub vbuuid: u64,
    pub start_seq: u64,
    pub end_seq: u64,
    pub snap_start: u64,
    pub snap_end: u64,
}

impl StreamRequest {
    /// Open-ended request starting at `start_seq` with a degenerate
    /// snapshot, the shape used for every (re)start.
    pub fn open_ended(vb: u16, vbuuid: u64, start_seq: u64) -> Self {
        StreamRequest {
            vb,
            opaque: vb,
            flags: 0,
            vbuuid,
            start_seq,
            end_seq: OPEN_ENDED_SEQ,
            snap_start: start_seq,
            snap_end: start_seq,
        }
    }
}

/// Outcome of a stream request routed to the failover-log handler.
#[derive(Debug, Clone, PartialEq)]
pub struct VbFlogEntry {
    pub vb: u16,
    pub status: Option<StreamReqStatus>,
    pub failover_log: Vec<FailoverEntry>,
    pub seq: u64,
    pub stream_req_retry: bool,
    pub signal_stream_end: bool,
}

impl VbFlogEntry {
    pub fn stream_created(vb: u16) -> Self {
        VbFlogEntry {
            vb,
            status: Some(StreamReqStatus::Success),
            failover_log: Vec::new(),
            seq: 0,
            stream_req_retry: false,
            signal_stream_end: false,
        }
    }

    pub fn retry(vb: u16, status: StreamReqStatus, failover_log: Vec<FailoverEntry>, seq: u64) -> Self {
        VbFlogEntry {
            vb,
            status: Some(status),
            failover_log,
            seq,
            stream_req_retry: true,
            signal_stream_end: false,
        }
    }

    pub fn no_retry(vb: u16, status: StreamReqStatus) -> Self {
        VbFlogEntry {
            vb,
            status: Some(status),
            failover_log: Vec::new(),
            seq: 0,
            stream_req_retry: false,
            signal_stream_end: false,
        }
    }

    pub fn stream_end(vb: u16) -> Self {
        VbFlogEntry {
            vb,
            status: None,
            failover_log: Vec::new(),
            seq: 0,
            stream_req_retry: false,
            signal_stream_end: true,
        }
    }
}
