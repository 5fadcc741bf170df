//! Prometheus export of allocator activity
//!
//! [`PrometheusSink`] plugs into [`DeviceMemoryManager::with_stats_sink`]
//! and counts every timed operation per op and caller tag, with a duration
//! histogram alongside. Accounting gauges are refreshed from a
//! [`MemorySnapshot`] on demand.
//!
//! [`DeviceMemoryManager::with_stats_sink`]: crate::memory::DeviceMemoryManager::with_stats_sink

use std::fmt;
use std::time::Duration;

use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::counter::Counter,
    metrics::family::Family,
    metrics::gauge::Gauge,
    metrics::histogram::{exponential_buckets, Histogram},
    registry::Registry,
};

use crate::memory::{CounterSnapshot, MemoryOp, MemorySnapshot, MemoryStatsSink};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OpLabels {
    pub op: String,
    pub tag: String,
}

impl OpLabels {
    fn new(op: MemoryOp, tag: &str) -> Self {
        OpLabels {
            op: op.as_str().to_string(),
            tag: tag.to_string(),
        }
    }
}

fn duration_histogram() -> Histogram {
    // 1us .. ~0.26s
    Histogram::new(exponential_buckets(1e-6, 4.0, 10))
}

#[derive(Debug)]
pub struct PrometheusSink {
    registry: Registry,
    operations: Family<OpLabels, Counter>,
    durations: Family<OpLabels, Histogram, fn() -> Histogram>,
    reserved_bytes: Gauge,
    locked_objects: Gauge,
    unlocked_objects: Gauge,
    free_list_bytes: Gauge,
    evictions: Gauge,
}

impl PrometheusSink {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let operations = Family::<OpLabels, Counter>::default();
        registry.register(
            "devcache_operations",
            "Allocator operations by op and caller tag",
            operations.clone(),
        );

        let durations =
            Family::<OpLabels, Histogram, fn() -> Histogram>::new_with_constructor(duration_histogram);
        registry.register(
            "devcache_operation_duration_seconds",
            "Time spent per allocator operation in seconds",
            durations.clone(),
        );

        let reserved_bytes = Gauge::default();
        registry.register(
            "devcache_reserved_bytes",
            "Bytes currently reserved from the device",
            reserved_bytes.clone(),
        );

        let locked_objects = Gauge::default();
        registry.register(
            "devcache_locked_objects",
            "Resident objects currently pinned",
            locked_objects.clone(),
        );

        let unlocked_objects = Gauge::default();
        registry.register(
            "devcache_unlocked_objects",
            "Resident objects eligible for eviction",
            unlocked_objects.clone(),
        );

        let free_list_bytes = Gauge::default();
        registry.register(
            "devcache_free_list_bytes",
            "Bytes parked in the free list",
            free_list_bytes.clone(),
        );

        let evictions = Gauge::default();
        registry.register(
            "devcache_evictions",
            "Resident objects evicted since the manager was created",
            evictions.clone(),
        );

        PrometheusSink {
            registry,
            operations,
            durations,
            reserved_bytes,
            locked_objects,
            unlocked_objects,
            free_list_bytes,
            evictions,
        }
    }

    /// Refresh accounting gauges
    pub fn observe(&self, snapshot: &MemorySnapshot, counters: &CounterSnapshot) {
        self.reserved_bytes.set(snapshot.reserved_bytes as i64);
        self.locked_objects.set(snapshot.locked_objects as i64);
        self.unlocked_objects.set(snapshot.unlocked_objects as i64);
        self.free_list_bytes.set(snapshot.free_list_bytes as i64);
        self.evictions.set(counters.evictions as i64);
    }

    /// Prometheus text exposition of everything recorded so far
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatsSink for PrometheusSink {
    fn record(&self, op: MemoryOp, tag: &str, elapsed: Duration) {
        let labels = OpLabels::new(op, tag);
        self.operations.get_or_create(&labels).inc();
        self.durations
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}
