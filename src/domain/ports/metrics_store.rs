//! Metrics Store Port
//!
//! Defines the interface for recording runtime counters.

use crate::domain::value_objects::DataKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Read statistics of one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub kind: String,
    pub hits: u64,
    pub fallback_hits: u64,
    pub not_found: u64,
    /// Mean latency over every recorded read, in ms
    pub avg_latency_ms: f64,
}

impl KindStats {
    pub fn reads(&self) -> u64 {
        self.hits + self.fallback_hits + self.not_found
    }

    /// Share of reads served by the primary edge.
    pub fn hit_rate(&self) -> f64 {
        match self.reads() {
            0 => 0.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

/// Write statistics of one edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EdgeOpStats {
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub timeouts: u64,
}

/// Store for runtime counters of the fabric.
///
/// Counters are monotone; readers consume them through periodic snapshots.
pub trait MetricsStore: Send + Sync {
    /// A read served from the primary edge.
    fn record_hit(&self, kind: &DataKind, latency_ms: f64);

    /// A primary miss later served by a peer.
    fn record_fallback_hit(&self, kind: &DataKind, latency_ms: f64);

    /// A read that exhausted primary and peers.
    fn record_not_found(&self, kind: &DataKind, latency_ms: f64);

    /// Write outcome on one edge.
    fn record_edge_write(&self, edge_id: &str, ok: bool);

    /// Per-operation deadline elapsed on an edge.
    fn record_timeout(&self, edge_id: &str);

    /// Named event counter (saturated selections, dropped items, ...).
    fn incr(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    /// Add to a named counter.
    fn add(&self, counter: &'static str, value: u64);

    /// Current value of a named counter.
    fn counter(&self, counter: &'static str) -> u64;

    /// Every named counter recorded so far.
    fn counters(&self) -> BTreeMap<&'static str, u64>;

    /// Per-kind read statistics, ordered by kind.
    fn kind_stats(&self) -> Vec<KindStats>;

    fn edge_stats(&self, edge_id: &str) -> EdgeOpStats;
}

/// Names of the event counters recorded through [`MetricsStore::incr`].
pub mod counters {
    pub const SATURATED_SELECTIONS: &str = "saturated_selections";
    pub const DEGRADED_SELECTIONS: &str = "degraded_selections";
    pub const INVALID_COORDINATES: &str = "invalid_coordinates";
    pub const UNKNOWN_KIND_WRITES: &str = "unknown_kind_writes";
    pub const PROPAGATION_ENQUEUED: &str = "propagation_enqueued";
    pub const PROPAGATION_DRAINED: &str = "propagation_drained";
    pub const PROPAGATION_DROPPED: &str = "propagation_dropped";
    pub const PROPAGATION_FAILED: &str = "propagation_failed";
    pub const BACKGROUND_WRITE_FAILED: &str = "background_write_failed";
    pub const BACKFILLS: &str = "backfills";
    pub const SINKS_REMOVED: &str = "sinks_removed";
    pub const STALE_PUSHES_SKIPPED: &str = "stale_pushes_skipped";
    pub const PUSHES_DELIVERED: &str = "pushes_delivered";
    pub const QUARANTINED_ENTRIES: &str = "quarantined_entries";
    pub const EXPIRED_ENTRIES: &str = "expired_entries";
    pub const EVICTED_ENTRIES: &str = "evicted_entries";
    pub const SUPERSEDED_WRITES: &str = "superseded_writes";
    pub const EDGE_RESETS: &str = "edge_resets";
}
