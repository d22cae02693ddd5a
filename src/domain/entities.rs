//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the distribution fabric.
//! They have no I/O and contain only business logic.

use crate::domain::value_objects::{CodecId, Coordinate, DataKind};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Edge declaration inside a region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Unique identifier for this edge
    pub id: String,
    /// Maximum concurrent client connections
    pub max_connections: u32,
}

/// A geographic region grouping edges that share a location and capacity budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    /// Human readable name
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Maximum concurrent client connections across the region
    pub capacity: u32,
    pub edges: Vec<EdgeSpec>,
}

impl Region {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Sum of member edge capacities.
    pub fn edge_capacity(&self) -> u64 {
        self.edges.iter().map(|e| e.max_connections as u64).sum()
    }
}

/// Key of a cache entry: data kind plus logical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub kind: DataKind,
    pub key: String,
}

impl CacheKey {
    pub fn new(kind: DataKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

/// Metadata stored alongside every cached payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryMetadata {
    pub kind: DataKind,
    /// Unix epoch milliseconds at which the value was written
    pub write_time_ms: u64,
    pub ttl_ms: u64,
    pub compressed: bool,
    pub codec: CodecId,
    pub original_size: u64,
    pub stored_size: u64,
    /// Submission order of the originating distribute call
    pub sequence: u64,
    /// CRC32 of the stored bytes
    pub checksum: u32,
}

impl EntryMetadata {
    /// Instant after which the entry may no longer be served.
    pub fn expires_at_ms(&self) -> u64 {
        self.write_time_ms.saturating_add(self.ttl_ms)
    }

    /// An entry is fresh while `now - write_time <= ttl`.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.write_time_ms) <= self.ttl_ms
    }
}

/// A cached payload. The bytes are reference counted, so a reader holding
/// a clone keeps them alive after the entry has been evicted.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub metadata: EntryMetadata,
}

/// Per-entry compression bookkeeping kept by each edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionInfo {
    pub codec: CodecId,
    pub original_size: u64,
    pub stored_size: u64,
    pub checksum: u32,
}

/// Declared hop count between two regions, overriding the distance estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLink {
    pub from: String,
    pub to: String,
    pub hops: u32,
}

/// One row of an edge's routing table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingEntry {
    pub peer_edge_id: String,
    pub distance_km: f64,
    pub latency_ms: f64,
    pub hop_count: u32,
    pub bandwidth_mbps: u32,
}

/// A delayed write waiting for the propagation drain.
#[derive(Debug, Clone)]
pub struct PropagationItem {
    pub key: CacheKey,
    pub payload: Bytes,
    pub metadata: EntryMetadata,
    /// Region whose representative edge receives the write
    pub target_region: String,
    /// Origin region already written synchronously
    pub excluded_region: String,
    pub enqueued_at_ms: u64,
}

/// Record delivered to stream subscribers.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub edge_id: String,
    pub kind: DataKind,
    pub key: String,
    pub codec: CodecId,
    pub payload: Bytes,
    pub write_time_ms: u64,
}
