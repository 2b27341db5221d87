//! Commit coordinator counters and phase timings.
//!
//! Everything here is lock-free; counters use `Ordering::Relaxed` and are only
//! meant to be read through point-in-time snapshots.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Count, total, min and max of a category of durations, in microseconds.
#[derive(Debug)]
pub struct TimingStats {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }
}

impl TimingStats {
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_us = self.total_us.load(Ordering::Relaxed);
        let min = self.min_us.load(Ordering::Relaxed);
        TimingSnapshot {
            count,
            total_us,
            min_us: if min == u64::MAX { 0 } else { min },
            max_us: self.max_us.load(Ordering::Relaxed),
            avg_us: if count == 0 {
                0.0
            } else {
                total_us as f64 / count as f64
            },
        }
    }
}

/// Serializable view of [`TimingStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: f64,
}

impl TimingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_us / 1000.0
    }
}

/// Statistics for one [`DistributedDatabase`](crate::DistributedDatabase).
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Phase 1 attempts started, local or on behalf of a peer.
    pub started: AtomicU64,
    /// Transactions applied to local storage.
    pub committed: AtomicU64,
    /// Contexts discarded by rollback.
    pub rolled_back: AtomicU64,
    /// Duplicate key, create and version conflicts.
    pub conflicts: AtomicU64,
    pub lock_timeouts: AtomicU64,
    /// Phase 1 re-runs in commit resolution and client retries.
    pub retries: AtomicU64,
    /// Full database resyncs requested.
    pub resyncs: AtomicU64,
    /// Submissions rejected because the quorum could not be met.
    pub insufficient_nodes: AtomicU64,
    pub ddl_executed: AtomicU64,

    pub phase1_timing: TimingStats,
    pub commit_timing: TimingStats,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_rate(&self) -> f32 {
        let started = self.started.load(Ordering::Relaxed);
        if started == 0 {
            return 0.0;
        }
        self.committed.load(Ordering::Relaxed) as f32 / started as f32
    }

    pub fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            insufficient_nodes: self.insufficient_nodes.load(Ordering::Relaxed),
            ddl_executed: self.ddl_executed.load(Ordering::Relaxed),
            phase1_timing: self.phase1_timing.snapshot(),
            commit_timing: self.commit_timing.snapshot(),
            commit_rate: self.commit_rate(),
        }
    }
}

/// Point-in-time snapshot of [`CoordinatorStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub conflicts: u64,
    pub lock_timeouts: u64,
    pub retries: u64,
    pub resyncs: u64,
    pub insufficient_nodes: u64,
    pub ddl_executed: u64,
    pub phase1_timing: TimingSnapshot,
    pub commit_timing: TimingSnapshot,
    pub commit_rate: f32,
}
