//! DashMap Metrics Store
//!
//! Implements MetricsStore using DashMap for lock-free concurrent access.

use crate::domain::ports::{EdgeOpStats, KindStats, MetricsStore};
use crate::domain::value_objects::DataKind;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read counters for a single kind.
#[derive(Debug, Default)]
pub struct KindCounters {
    pub hits: AtomicU64,
    pub fallback_hits: AtomicU64,
    pub not_found: AtomicU64,
    /// Sum of read latencies in microseconds
    pub latency_us: AtomicU64,
}

impl KindCounters {
    fn record_latency(&self, latency_ms: f64) {
        if latency_ms.is_finite() && latency_ms >= 0.0 {
            self.latency_us
                .fetch_add((latency_ms * 1_000.0) as u64, Ordering::Relaxed);
        }
    }
}

/// Write counters for a single edge.
#[derive(Debug, Default)]
pub struct EdgeCounters {
    pub writes_ok: AtomicU64,
    pub writes_failed: AtomicU64,
    pub timeouts: AtomicU64,
}

/// DashMap-backed metrics store.
///
/// Each kind, edge and named counter has its own entry.
#[derive(Default)]
pub struct DashMapMetricsStore {
    kinds: DashMap<DataKind, KindCounters>,
    edges: DashMap<String, EdgeCounters>,
    named: DashMap<&'static str, AtomicU64>,
}

impl DashMapMetricsStore {
    /// Create a new metrics store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all edge IDs with write metrics.
    pub fn edge_ids(&self) -> Vec<String> {
        self.edges.iter().map(|e| e.key().clone()).collect()
    }
}

impl MetricsStore for DashMapMetricsStore {
    fn record_hit(&self, kind: &DataKind, latency_ms: f64) {
        let entry = self.kinds.entry(kind.clone()).or_default();
        entry.hits.fetch_add(1, Ordering::Relaxed);
        entry.record_latency(latency_ms);
    }

    fn record_fallback_hit(&self, kind: &DataKind, latency_ms: f64) {
        let entry = self.kinds.entry(kind.clone()).or_default();
        entry.fallback_hits.fetch_add(1, Ordering::Relaxed);
        entry.record_latency(latency_ms);
    }

    fn record_not_found(&self, kind: &DataKind, latency_ms: f64) {
        let entry = self.kinds.entry(kind.clone()).or_default();
        entry.not_found.fetch_add(1, Ordering::Relaxed);
        entry.record_latency(latency_ms);
    }

    fn record_edge_write(&self, edge_id: &str, ok: bool) {
        let entry = self.edges.entry(edge_id.to_string()).or_default();
        if ok {
            entry.writes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.writes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_timeout(&self, edge_id: &str) {
        self.edges
            .entry(edge_id.to_string())
            .or_default()
            .timeouts
            .fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, counter: &'static str, value: u64) {
        self.named
            .entry(counter)
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    fn counter(&self, counter: &'static str) -> u64 {
        self.named
            .get(counter)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn counters(&self) -> BTreeMap<&'static str, u64> {
        self.named
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect()
    }

    fn kind_stats(&self) -> Vec<KindStats> {
        let mut stats: Vec<KindStats> = self
            .kinds
            .iter()
            .map(|e| {
                let c = e.value();
                let mut s = KindStats {
                    kind: e.key().to_string(),
                    hits: c.hits.load(Ordering::Relaxed),
                    fallback_hits: c.fallback_hits.load(Ordering::Relaxed),
                    not_found: c.not_found.load(Ordering::Relaxed),
                    avg_latency_ms: 0.0,
                };
                let reads = s.reads();
                if reads > 0 {
                    s.avg_latency_ms =
                        c.latency_us.load(Ordering::Relaxed) as f64 / 1_000.0 / reads as f64;
                }
                s
            })
            .collect();
        stats.sort_by(|a, b| a.kind.cmp(&b.kind));
        stats
    }

    fn edge_stats(&self, edge_id: &str) -> EdgeOpStats {
        self.edges
            .get(edge_id)
            .map(|c| EdgeOpStats {
                writes_ok: c.writes_ok.load(Ordering::Relaxed),
                writes_failed: c.writes_failed.load(Ordering::Relaxed),
                timeouts: c.timeouts.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}
