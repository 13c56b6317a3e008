//! Handler and process configuration.
//!
//! All knobs the core consumes are set by external collaborators (the admin
//! surface writes handler settings; the node process passes socket identity).
//! Configs are plain values handed down at construction; there are no
//! process-wide globals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a freshly deployed handler starts reading the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamBoundary {
    /// Replay the full history of every vbucket (start seq 0).
    Everything,
    /// Start from the current high seqno of every vbucket.
    FromNow,
}

impl Default for StreamBoundary {
    fn default() -> Self {
        StreamBoundary::Everything
    }
}

/// Per-handler configuration.
///
/// Field names follow the settings keys published by the admin surface.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Handler (app) name; prefixes every metadata key.
    pub app_name: String,
    /// Source bucket the change stream is opened against.
    pub source_bucket: String,
    /// Number of vbuckets in the source bucket.
    pub num_vbuckets: u16,
    /// Interval between checkpoint flushes of per-vb progress.
    pub checkpoint_interval: Duration,
    /// Number of worker threads inside the child process; also the
    /// partition count for deterministic vb -> thread routing.
    pub cpp_worker_thread_count: usize,
    /// Max cron timer callbacks batched into one cron document payload.
    pub cron_timers_per_doc: usize,
    /// Curl timeout forwarded to the worker on INIT (milliseconds).
    pub curl_timeout: u64,
    /// Forward handler-authored mutations back into the handler.
    pub enable_recursive_mutation: bool,
    /// Per-invocation execution timeout forwarded to the worker (seconds).
    pub execution_timeout: u64,
    /// Throttle threshold for the worker feedback (timer) queue.
    pub feedback_queue_cap: u64,
    /// Seconds subtracted from `now` when scanning due timers.
    pub fuzz_offset: u64,
    /// Bucket-client instance pool size inside the worker.
    pub lcb_inst_capacity: usize,
    /// Log level forwarded to the worker.
    pub log_level: String,
    /// Timer scans older than this many seconds are skipped forward.
    pub skip_timer_threshold: u64,
    /// Interval between stats log lines.
    pub stats_log_interval: Duration,
    /// Where a fresh deployment starts reading.
    pub stream_boundary: StreamBoundary,
    /// Interval between due-timer scans.
    pub timer_scan_interval: Duration,
    /// Number of child worker processes for this handler.
    pub worker_count: usize,
    /// Throttle threshold for the worker's aggregate event queue.
    pub worker_queue_cap: u64,
    /// Reserved xattr key prefix identifying handler-authored metadata.
    pub xattr_prefix: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            app_name: String::new(),
            source_bucket: "default".to_string(),
            num_vbuckets: 1024,
            checkpoint_interval: Duration::from_secs(10),
            cpp_worker_thread_count: 2,
            cron_timers_per_doc: 1000,
            curl_timeout: 500,
            enable_recursive_mutation: false,
            execution_timeout: 10,
            feedback_queue_cap: 10_000,
            fuzz_offset: 0,
            lcb_inst_capacity: 5,
            log_level: "INFO".to_string(),
            skip_timer_threshold: 86_400,
            stats_log_interval: Duration::from_secs(60),
            stream_boundary: StreamBoundary::Everything,
            timer_scan_interval: Duration::from_secs(1),
            worker_count: 1,
            worker_queue_cap: 100_000,
            xattr_prefix: "eventing".to_string(),
        }
    }
}

impl HandlerConfig {
    /// Configuration for tests: few vbuckets, fast tickers.
    pub fn test(app_name: &str) -> Self {
        HandlerConfig {
            app_name: app_name.to_string(),
            num_vbuckets: 8,
            checkpoint_interval: Duration::from_millis(50),
            stats_log_interval: Duration::from_secs(3600),
            timer_scan_interval: Duration::from_millis(20),
            ..HandlerConfig::default()
        }
    }
}

/// Rebalance tuning for the ownership controller.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Max concurrent vbucket give-up routines.
    pub giveup_routine_count: usize,
    /// Max concurrent vbucket takeover routines.
    pub takeover_routine_count: usize,
    /// Bounded retries waiting for a predecessor's `stopped` marker.
    pub takeover_wait_attempts: u32,
    /// Interval of the restream retry ticker.
    pub restream_tick_interval: Duration,
    /// Interval of the rebalance progress ticker.
    pub progress_tick_interval: Duration,
    /// Ticks without strictly increasing progress before the rebalance is
    /// marked failed (default 1200 ticks at 3s each, one hour).
    pub staleness_counter: u32,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        RebalanceConfig {
            giveup_routine_count: 3,
            takeover_routine_count: 3,
            takeover_wait_attempts: 30,
            restream_tick_interval: Duration::from_secs(10),
            progress_tick_interval: Duration::from_secs(3),
            staleness_counter: 1200,
        }
    }
}

impl RebalanceConfig {
    pub fn test() -> Self {
        RebalanceConfig {
            takeover_wait_attempts: 5,
            restream_tick_interval: Duration::from_millis(30),
            progress_tick_interval: Duration::from_millis(20),
            staleness_counter: 50,
            ..RebalanceConfig::default()
        }
    }
}

/// Process-level identity handed to each handler supervisor.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Bound socket identifier for the primary worker channel.
    pub sock_identifier: String,
    /// Bound socket identifier for the feedback (timer ack) channel.
    pub feedback_sock_identifier: String,
    /// Scratch directory handed to the worker on INIT.
    pub eventing_dir: String,
}

/// Identity of one consumer (one worker of one handler on this node).
///
/// Handed to components as a narrow capability record so nothing holds a
/// back-pointer to its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerIdentity {
    /// This eventing node's host:port address.
    pub host_port: String,
    /// Opaque UUID of this node in the cluster.
    pub node_uuid: String,
    /// Worker name, e.g. `worker_<app>_0`.
    pub worker_name: String,
}

/// A settings update published by the admin surface.
///
/// Every field is optional; absent fields leave the current value in place.
/// The flat JSON shape matches the settings document stored per handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_timer_threshold: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vb_ownership_giveup_routine_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vb_ownership_takeover_routine_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_queue_cap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_queue_cap: Option<u64>,
}
