//! Lightweight profiling module - cumulative counters only
//!
//! Counters are bumped by the manager's worker and can be read from any
//! thread without going through the task queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Profiling statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct ProfileStats {
    // Operations
    pub total_allocations: u64,
    pub total_reallocations: u64,
    pub total_locks: u64,
    pub total_unlocks: u64,
    pub total_dumps: u64,
    pub total_restores: u64,

    // Data volume
    pub total_bytes_allocated: u64,
    pub total_bytes_dumped: u64,
    pub total_bytes_restored: u64,

    // Policy activity
    pub policy_evictions: u64,
    pub dump_failures: u64,

    pub uptime_secs: u64,
}

impl ProfileStats {
    /// Average dump size in bytes
    #[inline]
    pub fn avg_dump_size(&self) -> u64 {
        if self.total_dumps > 0 {
            self.total_bytes_dumped / self.total_dumps
        } else {
            0
        }
    }

    /// Locks still outstanding according to the counters
    #[inline]
    pub fn outstanding_locks(&self) -> u64 {
        self.total_locks.saturating_sub(self.total_unlocks)
    }
}

/// Profiler - lock-free metric tracking, cheap to clone
#[derive(Clone)]
pub struct Profiler {
    state: Arc<ProfilerState>,
}

struct ProfilerState {
    total_allocations: AtomicU64,
    total_reallocations: AtomicU64,
    total_locks: AtomicU64,
    total_unlocks: AtomicU64,
    total_dumps: AtomicU64,
    total_restores: AtomicU64,

    total_bytes_allocated: AtomicU64,
    total_bytes_dumped: AtomicU64,
    total_bytes_restored: AtomicU64,

    policy_evictions: AtomicU64,
    dump_failures: AtomicU64,

    start_time: Instant,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ProfilerState {
                total_allocations: AtomicU64::new(0),
                total_reallocations: AtomicU64::new(0),
                total_locks: AtomicU64::new(0),
                total_unlocks: AtomicU64::new(0),
                total_dumps: AtomicU64::new(0),
                total_restores: AtomicU64::new(0),
                total_bytes_allocated: AtomicU64::new(0),
                total_bytes_dumped: AtomicU64::new(0),
                total_bytes_restored: AtomicU64::new(0),
                policy_evictions: AtomicU64::new(0),
                dump_failures: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    /// Get current statistics snapshot
    pub fn stats(&self) -> ProfileStats {
        let s = &self.state;
        ProfileStats {
            total_allocations: s.total_allocations.load(Ordering::Relaxed),
            total_reallocations: s.total_reallocations.load(Ordering::Relaxed),
            total_locks: s.total_locks.load(Ordering::Relaxed),
            total_unlocks: s.total_unlocks.load(Ordering::Relaxed),
            total_dumps: s.total_dumps.load(Ordering::Relaxed),
            total_restores: s.total_restores.load(Ordering::Relaxed),
            total_bytes_allocated: s.total_bytes_allocated.load(Ordering::Relaxed),
            total_bytes_dumped: s.total_bytes_dumped.load(Ordering::Relaxed),
            total_bytes_restored: s.total_bytes_restored.load(Ordering::Relaxed),
            policy_evictions: s.policy_evictions.load(Ordering::Relaxed),
            dump_failures: s.dump_failures.load(Ordering::Relaxed),
            uptime_secs: s.start_time.elapsed().as_secs(),
        }
    }

    pub fn record_allocation(&self, size: usize) {
        self.state.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.state
            .total_bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_reallocation(&self) {
        self.state
            .total_reallocations
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock(&self) {
        self.state.total_locks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unlock(&self) {
        self.state.total_unlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump(&self, size: usize) {
        self.state.total_dumps.fetch_add(1, Ordering::Relaxed);
        self.state
            .total_bytes_dumped
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_restore(&self, size: usize) {
        self.state.total_restores.fetch_add(1, Ordering::Relaxed);
        self.state
            .total_bytes_restored
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_policy_eviction(&self) {
        self.state.policy_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dump_failure(&self) {
        self.state.dump_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler").field("stats", &self.stats()).finish()
    }
}
