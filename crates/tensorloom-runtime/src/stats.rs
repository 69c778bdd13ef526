use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cumulative execution counters for one stage, shared by all of its worker
/// instances. Snapshotted on demand by the serving layer.
#[derive(Debug, Default)]
pub struct StageStats {
    batches: AtomicU64,
    slots: AtomicU64,
    failures: AtomicU64,
    queued_us: AtomicU64,
    execute_us: AtomicU64,
}

impl StageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, slots: usize, execute_us: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.slots.fetch_add(slots as u64, Ordering::Relaxed);
        self.execute_us.fetch_add(execute_us, Ordering::Relaxed);
    }

    pub fn record_queued(&self, queued_us: u64) {
        self.queued_us.fetch_add(queued_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            slots: self.slots.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            queued_us: self.queued_us.load(Ordering::Relaxed),
            execute_us: self.execute_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a stage's counters. Durations are cumulative
/// microseconds; divide by `slots` (or `batches`) for averages.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub slots: u64,
    pub failures: u64,
    pub queued_us: u64,
    pub execute_us: u64,
}

/// Whole-request counters for one served pipeline, recorded at the serving
/// boundary. `cumulative_us` covers every finished request, failed ones
/// included.
#[derive(Debug, Default)]
pub struct PipelineStats {
    success: AtomicU64,
    failure: AtomicU64,
    cumulative_us: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed_us: u64) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.cumulative_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed_us: u64) {
        self.failure.fetch_add(1, Ordering::Relaxed);
        self.cumulative_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            cumulative_us: self.cumulative_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PipelineSnapshot {
    pub success: u64,
    pub failure: u64,
    pub cumulative_us: u64,
}
