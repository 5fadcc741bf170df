//! Allocator instrumentation
//!
//! The manager always keeps [`AllocatorCounters`]; an optional
//! [`MemoryStatsSink`] additionally receives every timed operation with the
//! caller's tag.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Timed allocator operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    Allocate,
    Free,
    Reuse,
    Evict,
    ZeroFill,
}

impl MemoryOp {
    pub const ALL: [MemoryOp; 5] = [
        MemoryOp::Allocate,
        MemoryOp::Free,
        MemoryOp::Reuse,
        MemoryOp::Evict,
        MemoryOp::ZeroFill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryOp::Allocate => "allocate",
            MemoryOp::Free => "free",
            MemoryOp::Reuse => "reuse",
            MemoryOp::Evict => "evict",
            MemoryOp::ZeroFill => "zero_fill",
        }
    }

    fn index(&self) -> usize {
        match self {
            MemoryOp::Allocate => 0,
            MemoryOp::Free => 1,
            MemoryOp::Reuse => 2,
            MemoryOp::Evict => 3,
            MemoryOp::ZeroFill => 4,
        }
    }
}

impl fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for timed allocator operations
///
/// Called while the allocator state lock is held; implementations should
/// only update counters.
pub trait MemoryStatsSink: Send + Sync {
    fn record(&self, op: MemoryOp, tag: &str, elapsed: Duration);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MemoryStatsSink for NoopSink {
    fn record(&self, _op: MemoryOp, _tag: &str, _elapsed: Duration) {}
}

/// Built-in allocator counters
#[derive(Debug, Default)]
pub struct AllocatorCounters {
    fresh_allocations: AtomicU64,
    device_releases: AtomicU64,
    reuse_hits: AtomicU64,
    non_exact_reuses: AtomicU64,
    eager_drains: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    zero_fills: AtomicU64,
    transient_failures: AtomicU64,
    out_of_memory: AtomicU64,
    op_nanos: [AtomicU64; 5],
}

impl AllocatorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fresh_allocation(&self) {
        self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_device_release(&self) {
        self.device_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reuse_hit(&self) {
        self.reuse_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_non_exact_reuse(&self) {
        self.non_exact_reuses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eager_drain(&self) {
        self.eager_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, bytes: usize) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_zero_fill(&self) {
        self.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transient_failure(&self) {
        self.transient_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_out_of_memory(&self) {
        self.out_of_memory.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_elapsed(&self, op: MemoryOp, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.op_nanos[op.index()].fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn fresh_allocations(&self) -> u64 {
        self.fresh_allocations.load(Ordering::Relaxed)
    }

    pub fn device_releases(&self) -> u64 {
        self.device_releases.load(Ordering::Relaxed)
    }

    pub fn reuse_hits(&self) -> u64 {
        self.reuse_hits.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::Relaxed)
    }

    /// Accumulated time spent in `op`
    pub fn total_time(&self, op: MemoryOp) -> Duration {
        Duration::from_nanos(self.op_nanos[op.index()].load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            fresh_allocations: self.fresh_allocations(),
            device_releases: self.device_releases(),
            reuse_hits: self.reuse_hits(),
            non_exact_reuses: self.non_exact_reuses.load(Ordering::Relaxed),
            eager_drains: self.eager_drains.load(Ordering::Relaxed),
            evictions: self.evictions(),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            transient_failures: self.transient_failures(),
            out_of_memory: self.out_of_memory.load(Ordering::Relaxed),
            allocate_nanos: self.total_time(MemoryOp::Allocate).as_nanos() as u64,
            free_nanos: self.total_time(MemoryOp::Free).as_nanos() as u64,
            reuse_nanos: self.total_time(MemoryOp::Reuse).as_nanos() as u64,
            evict_nanos: self.total_time(MemoryOp::Evict).as_nanos() as u64,
            zero_fill_nanos: self.total_time(MemoryOp::ZeroFill).as_nanos() as u64,
        }
    }
}

/// Plain copy of [`AllocatorCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub fresh_allocations: u64,
    pub device_releases: u64,
    pub reuse_hits: u64,
    pub non_exact_reuses: u64,
    pub eager_drains: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub zero_fills: u64,
    pub transient_failures: u64,
    pub out_of_memory: u64,
    pub allocate_nanos: u64,
    pub free_nanos: u64,
    pub reuse_nanos: u64,
    pub evict_nanos: u64,
    pub zero_fill_nanos: u64,
}
