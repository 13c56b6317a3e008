//! Worker channel message schemas.
//!
//! Every frame is a `Header` followed by a `Payload`, CBOR-encoded with
//! numeric field tags so either side can add fields without breaking the
//! other. The payload is one open table with optional fields; which ones
//! are set depends on `(event, opcode)`.

use minicbor::bytes::ByteVec;
use minicbor::{Decode, Encode};

/// Top-level event classes on the primary socket.
pub mod event {
    pub const DCP: u8 = 1;
    pub const V8_WORKER: u8 = 2;
    pub const SETTINGS: u8 = 3;
    pub const TIMER: u8 = 4;
    pub const DEBUGGER: u8 = 5;
}

pub mod dcp_opcode {
    pub const DELETION: u8 = 1;
    pub const MUTATION: u8 = 2;
}

pub mod timer_opcode {
    pub const DOC_TIMER: u8 = 1;
    pub const CRON_TIMER: u8 = 2;
}

pub mod v8_opcode {
    pub const DISPOSE: u8 = 1;
    pub const INIT: u8 = 2;
    pub const LOAD: u8 = 3;
    pub const TERMINATE: u8 = 4;
    pub const COMPILE: u8 = 5;
    pub const LATENCY_STATS: u8 = 6;
    pub const FAILURE_STATS: u8 = 7;
    pub const EXECUTION_STATS: u8 = 8;
    pub const LCB_EXCEPTIONS: u8 = 9;
}

pub mod settings_opcode {
    pub const LOG_LEVEL: u8 = 1;
    pub const WORKER_THREAD_COUNT: u8 = 2;
    pub const WORKER_THREAD_PARTITION_MAP: u8 = 3;
}

pub mod debugger_opcode {
    pub const START: u8 = 1;
    pub const STOP: u8 = 2;
}

/// Message classes reported back by the worker.
pub mod resp_msg_type {
    pub const V8_WORKER_CONFIG: u8 = 1;
    pub const DOC_TIMER_RESPONSE: u8 = 2;
}

pub mod resp_v8_opcode {
    pub const SOURCE_MAP: u8 = 1;
    pub const HANDLER_CODE: u8 = 2;
    pub const APP_LOG: u8 = 3;
    pub const SYS_LOG: u8 = 4;
    pub const LATENCY_STATS: u8 = 5;
    pub const FAILURE_STATS: u8 = 6;
    pub const EXECUTION_STATS: u8 = 7;
    pub const COMPILE_INFO: u8 = 8;
    pub const QUEUE_SIZE: u8 = 9;
    pub const LCB_EXCEPTIONS: u8 = 10;
}

/// Frame header: event class, opcode, worker-thread partition, free-form
/// metadata (JSON for dcp events, scalar strings for settings).
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
#[cbor(map)]
pub struct Header {
    #[n(0)]
    pub event: u8,
    #[n(1)]
    pub opcode: u8,
    #[n(2)]
    pub partition: i16,
    #[n(3)]
    pub metadata: String,
}

/// vb partitions handled by one worker thread.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
#[cbor(map)]
pub struct ThreadPartition {
    #[n(0)]
    pub thread_id: i16,
    #[n(1)]
    pub partitions: Vec<u16>,
}

/// One open payload table; unset fields are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
#[cbor(map)]
pub struct Payload {
    #[n(0)]
    pub key: Option<ByteVec>,
    #[n(1)]
    pub value: Option<ByteVec>,
    #[n(2)]
    pub callback_fn: Option<String>,
    #[n(3)]
    pub doc_id: Option<String>,
    #[n(4)]
    pub timer_ts: Option<String>,
    #[n(5)]
    pub timer_partition: Option<i16>,
    #[n(6)]
    pub doc_ids_callback_fns: Option<String>,
    #[n(7)]
    pub app_name: Option<String>,
    #[n(8)]
    pub curr_host: Option<String>,
    #[n(9)]
    pub eventing_dir: Option<String>,
    #[n(10)]
    pub kv_host_port: Option<String>,
    #[n(11)]
    pub handler_code: Option<String>,
    #[n(12)]
    pub lcb_inst_capacity: Option<i32>,
    #[n(13)]
    pub cron_timers_per_doc: Option<i32>,
    #[n(14)]
    pub execution_timeout: Option<i32>,
    #[n(15)]
    pub fuzz_offset: Option<i32>,
    #[n(16)]
    pub checkpoint_interval: Option<i32>,
    #[n(17)]
    pub curl_timeout: Option<i64>,
    #[n(18)]
    pub enable_recursive_mutation: Option<bool>,
    #[n(19)]
    pub thread_map: Option<Vec<ThreadPartition>>,
    #[n(20)]
    pub partition_count: Option<i16>,
}

/// One outbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerMessage {
    pub header: Header,
    pub payload: Payload,
}

/// Inbound frame from the worker on either socket.
#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
#[cbor(map)]
pub struct Response {
    #[n(0)]
    pub msg_type: u8,
    #[n(1)]
    pub opcode: u8,
    #[n(2)]
    pub msg: String,
}

impl WorkerMessage {
    pub fn dcp_mutation(partition: i16, meta: String, key: &[u8], value: &[u8]) -> Self {
        WorkerMessage {
            header: Header {
                event: event::DCP,
                opcode: dcp_opcode::MUTATION,
                partition,
                metadata: meta,
            },
            payload: Payload {
                key: Some(ByteVec::from(key.to_vec())),
                value: Some(ByteVec::from(value.to_vec())),
                ..Payload::default()
            },
        }
    }

    pub fn dcp_deletion(partition: i16, meta: String, key: &[u8]) -> Self {
        WorkerMessage {
            header: Header {
                event: event::DCP,
                opcode: dcp_opcode::DELETION,
                partition,
                metadata: meta,
            },
            payload: Payload {
                key: Some(ByteVec::from(key.to_vec())),
                ..Payload::default()
            },
        }
    }

    pub fn doc_timer(partition: i16, callback: &str, doc_id: &str, timer_ts: &str) -> Self {
        WorkerMessage {
            header: Header {
                event: event::TIMER,
                opcode: timer_opcode::DOC_TIMER,
                partition,
                metadata: String::new(),
            },
            payload: Payload {
                callback_fn: Some(callback.to_string()),
                doc_id: Some(doc_id.to_string()),
                timer_ts: Some(timer_ts.to_string()),
                timer_partition: Some(partition),
                ..Payload::default()
            },
        }
    }

    pub fn cron_timer(partition: i16, payload: &str, timer_ts: &str) -> Self {
        WorkerMessage {
            header: Header {
                event: event::TIMER,
                opcode: timer_opcode::CRON_TIMER,
                partition,
                metadata: String::new(),
            },
            payload: Payload {
                doc_ids_callback_fns: Some(payload.to_string()),
                timer_ts: Some(timer_ts.to_string()),
                timer_partition: Some(partition),
                ..Payload::default()
            },
        }
    }

    pub fn v8_load(app_code: &str) -> Self {
        WorkerMessage {
            header: Header {
                event: event::V8_WORKER,
                opcode: v8_opcode::LOAD,
                partition: 0,
                metadata: app_code.to_string(),
            },
            payload: Payload::default(),
        }
    }

    pub fn v8_compile(app_code: &str) -> Self {
        WorkerMessage {
            header: Header {
                event: event::V8_WORKER,
                opcode: v8_opcode::COMPILE,
                partition: 0,
                metadata: app_code.to_string(),
            },
            payload: Payload::default(),
        }
    }

    pub fn v8_terminate() -> Self {
        WorkerMessage {
            header: Header {
                event: event::V8_WORKER,
                opcode: v8_opcode::TERMINATE,
                partition: 0,
                metadata: String::new(),
            },
            payload: Payload::default(),
        }
    }

    pub fn v8_stats_request(opcode: u8) -> Self {
        WorkerMessage {
            header: Header {
                event: event::V8_WORKER,
                opcode,
                partition: 0,
                metadata: String::new(),
            },
            payload: Payload::default(),
        }
    }

    pub fn log_level(level: &str) -> Self {
        WorkerMessage {
            header: Header {
                event: event::SETTINGS,
                opcode: settings_opcode::LOG_LEVEL,
                partition: 0,
                metadata: level.to_string(),
            },
            payload: Payload::default(),
        }
    }

    pub fn thread_count(count: usize) -> Self {
        WorkerMessage {
            header: Header {
                event: event::SETTINGS,
                opcode: settings_opcode::WORKER_THREAD_COUNT,
                partition: 0,
                metadata: count.to_string(),
            },
            payload: Payload::default(),
        }
    }

    pub fn thread_partition_map(map: Vec<ThreadPartition>, partition_count: i16) -> Self {
        WorkerMessage {
            header: Header {
                event: event::SETTINGS,
                opcode: settings_opcode::WORKER_THREAD_PARTITION_MAP,
                partition: 0,
                metadata: String::new(),
            },
            payload: Payload {
                thread_map: Some(map),
                partition_count: Some(partition_count),
                ..Payload::default()
            },
        }
    }

    pub fn debugger(opcode: u8) -> Self {
        WorkerMessage {
            header: Header {
                event: event::DEBUGGER,
                opcode,
                partition: 0,
                metadata: String::new(),
            },
            payload: Payload::default(),
        }
    }
}

/// Route a vb deterministically to one worker thread.
pub fn thread_partition(vb: u16, thread_count: usize) -> i16 {
    debug_assert!(thread_count > 0, "thread count must be positive");
    (vb as usize % thread_count.max(1)) as i16
}

/// Build the full vb -> thread distribution sent on INIT.
pub fn thread_partition_map(num_vbuckets: u16, thread_count: usize) -> Vec<ThreadPartition> {
    let thread_count = thread_count.max(1);
    let mut map: Vec<ThreadPartition> = (0..thread_count)
        .map(|thread_id| ThreadPartition {
            thread_id: thread_id as i16,
            partitions: Vec::new(),
        })
        .collect();
    for vb in 0..num_vbuckets {
        map[vb as usize % thread_count].partitions.push(vb);
    }
    map
}
