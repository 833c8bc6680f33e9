//! Statistics accumulators and snapshots.
//!
//! Counters are plain atomics updated on the hot path; derived rates are
//! computed only when a snapshot is requested. Recent operation latencies go
//! into a bounded ring so the average reflects current behavior, not the
//! whole process lifetime.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cache tier identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

/// Recent latencies kept for the rolling average.
const LATENCY_RING_CAPACITY: usize = 1000;

/// Hot-path accumulators. All counters are monotonic within a process.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    total_requests: AtomicU64,
    total_hits: AtomicU64,
    total_misses: AtomicU64,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l3_hits: AtomicU64,
    l3_misses: AtomicU64,
    warming_ops: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
}

impl StatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, tier: Tier) {
        self.total_hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            Tier::L1 => &self.l1_hits,
            Tier::L2 => &self.l2_hits,
            Tier::L3 => &self.l3_hits,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an overall miss after every tier in `probed` came up empty.
    pub fn record_miss(&self, probed: &[Tier]) {
        self.total_misses.fetch_add(1, Ordering::Relaxed);
        for tier in probed {
            self.record_tier_miss(*tier);
        }
    }

    /// Record a tier-level miss on a probe that fell through to a lower tier.
    pub fn record_tier_miss(&self, tier: Tier) {
        match tier {
            Tier::L1 => &self.l1_misses,
            Tier::L2 => &self.l2_misses,
            Tier::L3 => &self.l3_misses,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_warming(&self, count: u64) {
        self.warming_ops.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let mut ring = self.latencies.lock();
        if ring.len() >= LATENCY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(elapsed);
    }

    fn average_latency_ms(&self) -> f64 {
        let ring = self.latencies.lock();
        if ring.is_empty() {
            return 0.0;
        }
        let total: Duration = ring.iter().sum();
        total.as_secs_f64() * 1000.0 / ring.len() as f64
    }

    /// Take a point-in-time snapshot with derived rates.
    ///
    /// Counters owned by other components (tier error counters, coherency
    /// operations, the current L1 byte size) arrive via `ext` and are folded
    /// into the snapshot.
    #[must_use]
    pub fn snapshot(&self, ext: ExternalCounters) -> CacheStatistics {
        let total_hits = self.total_hits.load(Ordering::Relaxed);
        let total_misses = self.total_misses.load(Ordering::Relaxed);
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l1_misses = self.l1_misses.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let l2_misses = self.l2_misses.load(Ordering::Relaxed);
        let l3_hits = self.l3_hits.load(Ordering::Relaxed);
        let l3_misses = self.l3_misses.load(Ordering::Relaxed);

        CacheStatistics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_hits,
            total_misses,
            hit_rate_percent: rate(total_hits, total_hits + total_misses),
            l1_hits,
            l1_misses,
            l1_hit_rate_percent: rate(l1_hits, l1_hits + l1_misses),
            l1_size_bytes: ext.l1_size_bytes,
            l2_hits,
            l2_misses,
            l2_hit_rate_percent: rate(l2_hits, l2_hits + l2_misses),
            l3_hits,
            l3_misses,
            l3_hit_rate_percent: rate(l3_hits, l3_hits + l3_misses),
            coherency_ops: ext.coherency_ops,
            warming_ops: self.warming_ops.load(Ordering::Relaxed),
            transport_errors: ext.transport_errors,
            serialization_errors: ext.serialization_errors,
            dropped_writes: ext.dropped_writes,
            avg_response_time_ms: self.average_latency_ms(),
        }
    }
}

/// Counters owned by components other than the recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalCounters {
    pub l1_size_bytes: usize,
    pub coherency_ops: u64,
    pub dropped_writes: u64,
    pub transport_errors: u64,
    pub serialization_errors: u64,
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 10_000.0).round() / 100.0
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub total_requests: u64,
    pub total_hits: u64,
    pub total_misses: u64,
    pub hit_rate_percent: f64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l1_hit_rate_percent: f64,
    pub l1_size_bytes: usize,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_hit_rate_percent: f64,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub l3_hit_rate_percent: f64,
    pub coherency_ops: u64,
    pub warming_ops: u64,
    pub transport_errors: u64,
    pub serialization_errors: u64,
    pub dropped_writes: u64,
    pub avg_response_time_ms: f64,
}

/// Metric names and pre-bound label sets.
///
/// Labels are fixed at compile time so the hot path never formats strings.
pub mod labels {
    pub const OPERATIONS_TOTAL: &str = "cache_operations_total";
    pub const OPERATION_DURATION_SECONDS: &str = "cache_operation_duration_seconds";

    pub type LabelSet = &'static [(&'static str, &'static str)];

    pub const HIT_L1: LabelSet = &[("operation", "hit"), ("tier", "l1")];
    pub const HIT_L2: LabelSet = &[("operation", "hit"), ("tier", "l2")];
    pub const HIT_L3: LabelSet = &[("operation", "hit"), ("tier", "l3")];
    pub const MISS_OVERALL: LabelSet = &[("operation", "miss"), ("tier", "overall")];
    pub const GET_OVERALL: LabelSet = &[("operation", "get"), ("tier", "overall")];
    pub const SET_OVERALL: LabelSet = &[("operation", "set"), ("tier", "overall")];
    pub const DELETE_OVERALL: LabelSet = &[("operation", "delete"), ("tier", "overall")];
    pub const ERROR_OVERALL: LabelSet = &[("operation", "error"), ("tier", "overall")];
}

/// A [`MetricsSink`](crate::traits::MetricsSink) that emits through
/// `tracing` at debug level. Useful as a default sink in deployments that
/// scrape structured logs instead of running a metrics pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl crate::traits::MetricsSink for TracingMetricsSink {
    fn increment(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        tracing::debug!(metric = name, ?labels, value, "counter");
    }

    fn observe(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        tracing::debug!(metric = name, ?labels, seconds, "observation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_rates() {
        let stats = StatsRecorder::new();
        for _ in 0..3 {
            stats.record_request();
        }
        stats.record_hit(Tier::L1);
        stats.record_hit(Tier::L2);
        stats.record_miss(&[Tier::L1, Tier::L2]);

        let snap = stats.snapshot(ExternalCounters {
            l1_size_bytes: 42,
            coherency_ops: 7,
            dropped_writes: 1,
            ..ExternalCounters::default()
        });
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.total_hits, 2);
        assert_eq!(snap.total_misses, 1);
        assert!((snap.hit_rate_percent - 66.67).abs() < 0.01);
        assert_eq!(snap.l1_size_bytes, 42);
        assert_eq!(snap.coherency_ops, 7);
        assert_eq!(snap.dropped_writes, 1);
    }

    #[test]
    fn latency_ring_is_bounded() {
        let stats = StatsRecorder::new();
        for _ in 0..(LATENCY_RING_CAPACITY + 100) {
            stats.record_latency(Duration::from_millis(2));
        }
        assert_eq!(stats.latencies.lock().len(), LATENCY_RING_CAPACITY);
        let snap = stats.snapshot(ExternalCounters::default());
        assert!((snap.avg_response_time_ms - 2.0).abs() < 0.01);
    }

    #[test]
    fn counters_are_monotonic_across_snapshots() {
        let stats = StatsRecorder::new();
        stats.record_request();
        stats.record_hit(Tier::L1);
        let s1 = stats.snapshot(ExternalCounters::default());

        stats.record_request();
        stats.record_miss(&[Tier::L1]);
        let s2 = stats.snapshot(ExternalCounters::default());

        assert!(s2.total_requests >= s1.total_requests);
        assert!(s2.total_hits >= s1.total_hits);
        assert!(s2.total_misses >= s1.total_misses);
        assert!(s2.l1_hits >= s1.l1_hits);
        assert!(s2.l1_misses >= s1.l1_misses);
    }
}
