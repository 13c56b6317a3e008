//! Rebalance progress reporting and stuck detection.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Progress snapshot published each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceProgress {
    pub vbs_remaining_to_shuffle: usize,
    pub vbs_owned_per_plan: usize,
}

impl RebalanceProgress {
    /// Completed fraction in `[0, 1]`; a plan of zero vbs is complete.
    pub fn fraction(&self) -> f64 {
        if self.vbs_owned_per_plan == 0 {
            return 1.0;
        }
        let done = self
            .vbs_owned_per_plan
            .saturating_sub(self.vbs_remaining_to_shuffle);
        done as f64 / self.vbs_owned_per_plan as f64
    }

    pub fn is_complete(&self) -> bool {
        self.vbs_remaining_to_shuffle == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalancePhase {
    Idle,
    InProgress,
    /// Progress stalled past the staleness bound; no further takeover
    /// attempts until the next topology change.
    Failed,
}

#[derive(Debug)]
struct StatusInner {
    phase: RebalancePhase,
    progress: RebalanceProgress,
    best_fraction: f64,
    stale_ticks: u32,
}

/// Shared rebalance status record.
#[derive(Debug)]
pub struct RebalanceStatus {
    inner: RwLock<StatusInner>,
    staleness_limit: u32,
}

impl RebalanceStatus {
    pub fn new(staleness_limit: u32) -> Arc<Self> {
        Arc::new(RebalanceStatus {
            inner: RwLock::new(StatusInner {
                phase: RebalancePhase::Idle,
                progress: RebalanceProgress::default(),
                best_fraction: 0.0,
                stale_ticks: 0,
            }),
            staleness_limit,
        })
    }

    /// A topology change starts a fresh rebalance round.
    pub fn begin(&self) {
        let mut inner = self.inner.write();
        inner.phase = RebalancePhase::InProgress;
        inner.best_fraction = 0.0;
        inner.stale_ticks = 0;
        info!("rebalance started");
    }

    /// Feed one progress observation; drives the staleness counter.
    pub fn observe(&self, progress: RebalanceProgress) -> RebalancePhase {
        let mut inner = self.inner.write();
        inner.progress = progress;

        if inner.phase != RebalancePhase::InProgress {
            return inner.phase;
        }
        if progress.is_complete() {
            inner.phase = RebalancePhase::Idle;
            inner.stale_ticks = 0;
            info!("rebalance complete");
            return inner.phase;
        }

        let fraction = progress.fraction();
        if fraction > inner.best_fraction {
            inner.best_fraction = fraction;
            inner.stale_ticks = 0;
        } else {
            inner.stale_ticks += 1;
            if inner.stale_ticks >= self.staleness_limit {
                inner.phase = RebalancePhase::Failed;
                error!(
                    remaining = progress.vbs_remaining_to_shuffle,
                    ticks = inner.stale_ticks,
                    "rebalance made no progress, marking failed"
                );
            }
        }
        inner.phase
    }

    pub fn phase(&self) -> RebalancePhase {
        self.inner.read().phase
    }

    pub fn progress(&self) -> RebalanceProgress {
        self.inner.read().progress
    }

    /// True while a rebalance is running (admin surface poll).
    pub fn is_rebalancing(&self) -> bool {
        self.inner.read().phase == RebalancePhase::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(remaining: usize, per_plan: usize) -> RebalanceProgress {
        RebalanceProgress {
            vbs_remaining_to_shuffle: remaining,
            vbs_owned_per_plan: per_plan,
        }
    }

    #[test]
    fn completes_when_nothing_remains() {
        let status = RebalanceStatus::new(10);
        status.begin();
        assert_eq!(status.observe(progress(4, 8)), RebalancePhase::InProgress);
        assert_eq!(status.observe(progress(0, 8)), RebalancePhase::Idle);
    }

    #[test]
    fn stalls_into_failed_after_limit() {
        let status = RebalanceStatus::new(3);
        status.begin();
        status.observe(progress(4, 8));
        // No improvement for three consecutive ticks.
        status.observe(progress(4, 8));
        status.observe(progress(4, 8));
        assert_eq!(status.observe(progress(4, 8)), RebalancePhase::Failed);
        // Further observations stay failed until the next begin().
        assert_eq!(status.observe(progress(2, 8)), RebalancePhase::Failed);
        status.begin();
        assert_eq!(status.observe(progress(2, 8)), RebalancePhase::InProgress);
    }

    #[test]
    fn strict_increase_resets_staleness() {
        let status = RebalanceStatus::new(3);
        status.begin();
        status.observe(progress(6, 8));
        status.observe(progress(6, 8));
        status.observe(progress(5, 8)); // improvement resets the counter
        status.observe(progress(5, 8));
        status.observe(progress(5, 8));
        assert_eq!(status.observe(progress(5, 8)), RebalancePhase::Failed);
    }

    #[test]
    fn empty_plan_is_complete() {
        assert_eq!(progress(0, 0).fraction(), 1.0);
    }
}
