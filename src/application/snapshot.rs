//! Metrics snapshot published by the metrics loop.

use crate::domain::ports::KindStats;
use crate::domain::value_objects::{EdgeStatus, RegionStatus};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct RegionMetrics {
    pub region_id: String,
    pub status: RegionStatus,
    /// Mean of the member edges' rolling latencies
    pub avg_latency_ms: f64,
    pub edges: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeMetrics {
    pub edge_id: String,
    pub status: EdgeStatus,
    pub cache_bytes: u64,
    pub entries: usize,
    pub current_connections: u32,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub timeouts: u64,
    pub error_rate: f64,
}

/// Point-in-time view of the fabric's counters.
///
/// Readers get an `Arc` to an immutable snapshot; refreshes swap it.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at_ms: u64,
    pub regions: Vec<RegionMetrics>,
    pub kinds: Vec<KindStats>,
    pub edges: Vec<EdgeMetrics>,
    /// Stored over original bytes of compressed entries, 1.0 when there are none
    pub compression_ratio: f64,
    pub active_channels: usize,
    pub total_cache_bytes: u64,
    pub total_connections: u64,
    pub propagation_pending: usize,
    pub counters: BTreeMap<String, u64>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            generated_at_ms: 0,
            regions: Vec::new(),
            kinds: Vec::new(),
            edges: Vec::new(),
            compression_ratio: 1.0,
            active_channels: 0,
            total_cache_bytes: 0,
            total_connections: 0,
            propagation_pending: 0,
            counters: BTreeMap::new(),
        }
    }
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn region(&self, region_id: &str) -> Option<&RegionMetrics> {
        self.regions.iter().find(|r| r.region_id == region_id)
    }

    pub fn kind(&self, kind: &str) -> Option<&KindStats> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}
