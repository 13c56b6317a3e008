//! Durable scheduling of future handler invocations.
//!
//! Two-phase delivery: a periodic scan dispatches due entries to the
//! worker, and the entry is only removed once the worker acknowledges it
//! on the feedback socket. The acknowledged seq feeds the per-vb replay
//! bound, so a crash rewinds the stream to before any unacked timer.

mod scanner;
mod store;

pub use scanner::{InFlightTimers, ScannerConfig, SharedScannerConfig, TimerMsg, TimerScanner};
pub use store::{parse_timer_ack, parse_xattr_timer, ScanOutcome, TimerAck, TimerEntry, TimerStore};
