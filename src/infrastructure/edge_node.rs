//! Edge Node
//!
//! One edge: a TTL cache under a byte budget, its compression bookkeeping,
//! stream channels, connection count, health status and rolling latency.
//!
//! Cache state is guarded by a per-edge mutex; stream channels have their
//! own lock that also serves as the publish gate. Async callers go through
//! the `*_offloaded` methods, which wait for the lock on the blocking pool.

use crate::domain::entities::{CacheEntry, CacheKey, CompressionInfo, EntryMetadata, StreamRecord};
use crate::domain::error::{FabricError, Result};
use crate::domain::value_objects::EdgeStatus;
use crate::infrastructure::stream_registry::{EdgeChannels, PublishReport};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Smoothing factor of the rolling latency average.
pub const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Limits applied to every edge.
#[derive(Debug, Clone)]
pub struct EdgeNodeConfig {
    pub max_cache_bytes: u64,
    /// Fraction of the budget reclaimed by one eviction pass
    pub eviction_target_fraction: f64,
    /// How long an operation waits for the cache lock
    pub lock_timeout: Duration,
}

impl Default for EdgeNodeConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 2 * 1024 * 1024 * 1024,
            eviction_target_fraction: 0.20,
            lock_timeout: Duration::from_millis(250),
        }
    }
}

/// How the write time of an incoming entry is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// New value from a producer; stamped by this edge
    Fresh,
    /// Copy of another edge's entry (backfill, propagation); keeps its write time
    Replicated,
}

/// Result of a write that reached the cache.
#[derive(Debug, Default, Clone)]
pub struct WriteReport {
    /// Write time recorded on the entry
    pub write_time_ms: u64,
    /// A newer submission already held the key; nothing changed
    pub superseded: bool,
    pub evicted: Vec<CacheKey>,
    pub freed_bytes: u64,
    pub publish: Option<PublishReport>,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(CacheEntry),
    Miss,
    /// Entry existed but its TTL had elapsed; it has been removed
    Expired,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    compression: HashMap<CacheKey, CompressionInfo>,
    /// (expiry time, key) of every entry, earliest first
    expiry: BTreeSet<(u64, CacheKey)>,
    cache_bytes: u64,
    last_write_ms: u64,
}

impl CacheState {
    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.cache_bytes += entry.payload.len() as u64;
        self.expiry.insert((entry.metadata.expires_at_ms(), key.clone()));
        self.entries.insert(key, entry);
    }

    /// Remove an entry and release its bytes.
    fn remove(&mut self, edge_id: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.entries.remove(key) else {
            return Ok(None);
        };
        self.compression.remove(key);
        self.expiry.remove(&(entry.metadata.expires_at_ms(), key.clone()));
        let size = entry.payload.len() as u64;
        self.cache_bytes = self.cache_bytes.checked_sub(size).ok_or_else(|| FabricError::Fatal {
            edge_id: edge_id.to_string(),
            reason: format!(
                "cache bytes underflow: releasing {} from {}",
                size, self.cache_bytes
            ),
        })?;
        Ok(Some(entry))
    }
}

/// Read-only view of an edge.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub id: String,
    pub region_id: String,
    pub status: EdgeStatus,
    pub current_connections: u32,
    pub max_connections: u32,
    pub cache_bytes: u64,
    pub entries: usize,
    pub rolling_latency_ms: f64,
    pub last_write_ms: u64,
    pub channels: usize,
}

pub struct EdgeNode {
    id: String,
    region_id: String,
    max_connections: u32,
    config: EdgeNodeConfig,
    state: Mutex<CacheState>,
    channels: EdgeChannels,
    status: AtomicU8,
    connections: AtomicU32,
    /// f64 bits; NaN until the first sample
    rolling_latency: AtomicU64,
}

impl EdgeNode {
    pub fn new(
        id: impl Into<String>,
        region_id: impl Into<String>,
        max_connections: u32,
        config: EdgeNodeConfig,
    ) -> Self {
        Self {
            id: id.into(),
            region_id: region_id.into(),
            max_connections,
            config,
            state: Mutex::new(CacheState::default()),
            channels: EdgeChannels::new(),
            status: AtomicU8::new(EdgeStatus::Active.as_u8()),
            connections: AtomicU32::new(0),
            rolling_latency: AtomicU64::new(f64::NAN.to_bits()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn channels(&self) -> &EdgeChannels {
        &self.channels
    }

    // ===== Status =====

    pub fn status(&self) -> EdgeStatus {
        EdgeStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Set the status, returning the previous one.
    pub fn set_status(&self, status: EdgeStatus) -> EdgeStatus {
        EdgeStatus::from_u8(self.status.swap(status.as_u8(), Ordering::SeqCst))
    }

    /// Replace the status only if it still equals `expected`.
    pub fn transition_status(&self, expected: EdgeStatus, next: EdgeStatus) -> bool {
        self.status
            .compare_exchange(expected.as_u8(), next.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // ===== Connections =====

    pub fn current_connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Occupy a connection slot until the guard is dropped.
    pub fn connect(self: &Arc<Self>) -> EdgeConnection {
        self.connections.fetch_add(1, Ordering::Relaxed);
        EdgeConnection { edge: self.clone() }
    }

    // ===== Latency =====

    /// Rolling average latency in ms, 0.0 before the first sample.
    pub fn rolling_latency_ms(&self) -> f64 {
        let v = f64::from_bits(self.rolling_latency.load(Ordering::Relaxed));
        if v.is_nan() {
            0.0
        } else {
            v
        }
    }

    pub fn record_latency(&self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        let _ = self
            .rolling_latency
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let current = f64::from_bits(bits);
                let next = if current.is_nan() {
                    sample_ms
                } else {
                    current * (1.0 - LATENCY_EMA_ALPHA) + sample_ms * LATENCY_EMA_ALPHA
                };
                Some(next.to_bits())
            });
    }

    // ===== Cache =====

    fn lock_state(&self, operation: &'static str) -> Result<parking_lot::MutexGuard<'_, CacheState>> {
        self.state
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| FabricError::Timeout {
                edge_id: self.id.clone(),
                operation,
                timeout_ms: self.config.lock_timeout.as_millis() as u64,
            })
    }

    /// Insert or replace an entry.
    ///
    /// Disabled edges refuse writes. When the entry does not fit, entries are
    /// evicted in expiry order first. On success the record is pushed to the
    /// edge's channels for the kind when `publish` is set.
    pub fn write(
        &self,
        key: CacheKey,
        payload: Bytes,
        mut metadata: EntryMetadata,
        mode: WriteMode,
        now_ms: u64,
        publish: bool,
    ) -> Result<WriteReport> {
        if self.status() == EdgeStatus::Disabled {
            return Err(FabricError::EdgeUnavailable {
                edge_id: self.id.clone(),
                status: EdgeStatus::Disabled.to_string(),
            });
        }

        let size = payload.len() as u64;
        if size > self.config.max_cache_bytes {
            return Err(FabricError::CapacityExhausted {
                scope: self.id.clone(),
                reason: format!(
                    "entry of {} bytes exceeds cache budget of {} bytes",
                    size, self.config.max_cache_bytes
                ),
            });
        }

        let mut state = self.lock_state("write")?;
        let mut report = WriteReport::default();

        if let Some(existing) = state.entries.get(&key) {
            let live = existing.metadata.is_fresh(now_ms);
            let newer = existing.metadata.sequence > metadata.sequence;
            let same = existing.metadata.sequence == metadata.sequence && mode == WriteMode::Replicated;
            if live && (newer || same) {
                report.superseded = true;
                report.write_time_ms = existing.metadata.write_time_ms;
                return Ok(report);
            }
        }

        if mode == WriteMode::Fresh {
            metadata.write_time_ms = now_ms.max(state.last_write_ms);
        }

        let replaced = state
            .entries
            .get(&key)
            .map(|e| e.payload.len() as u64)
            .unwrap_or(0);
        let projected = state.cache_bytes - replaced.min(state.cache_bytes) + size;
        if projected > self.config.max_cache_bytes {
            let needed = projected - self.config.max_cache_bytes;
            let target = ((self.config.max_cache_bytes as f64 * self.config.eviction_target_fraction) as u64).max(needed);
            let (evicted, freed) = self.evict_locked(&mut state, target, &key)?;
            report.evicted = evicted;
            report.freed_bytes = freed;
        }

        state.remove(&self.id, &key)?;

        metadata.stored_size = size;
        let info = CompressionInfo {
            codec: metadata.codec,
            original_size: metadata.original_size,
            stored_size: size,
            checksum: metadata.checksum,
        };
        if metadata.compressed {
            state.compression.insert(key.clone(), info);
        }

        let write_time_ms = metadata.write_time_ms;
        let record = StreamRecord {
            edge_id: self.id.clone(),
            kind: key.kind.clone(),
            key: key.key.clone(),
            codec: metadata.codec,
            payload: payload.clone(),
            write_time_ms,
        };

        state.insert(key, CacheEntry { payload, metadata });
        state.last_write_ms = state.last_write_ms.max(write_time_ms);
        report.write_time_ms = write_time_ms;

        if publish {
            let mut gate = self.channels.gate();
            drop(state);
            report.publish = Some(gate.publish(&record));
        }

        Ok(report)
    }

    /// Free at least `target` bytes, earliest expiry first.
    ///
    /// Evicted payloads are only dropped here; readers that already cloned
    /// an entry keep its bytes alive until they finish.
    fn evict_locked(
        &self,
        state: &mut CacheState,
        target: u64,
        keep: &CacheKey,
    ) -> Result<(Vec<CacheKey>, u64)> {
        // Walk the expiry index only as far as the target requires
        let mut victims = Vec::new();
        let mut planned = 0u64;
        for (_, key) in &state.expiry {
            if planned >= target {
                break;
            }
            if key == keep {
                continue;
            }
            if let Some(entry) = state.entries.get(key) {
                planned += entry.payload.len() as u64;
                victims.push(key.clone());
            }
        }

        let mut freed = 0u64;
        let mut evicted = Vec::with_capacity(victims.len());
        for key in victims {
            if let Some(entry) = state.remove(&self.id, &key)? {
                freed += entry.payload.len() as u64;
                evicted.push(key);
            }
        }

        tracing::debug!(
            edge = %self.id,
            evicted = evicted.len(),
            freed_bytes = freed,
            target_bytes = target,
            "eviction pass"
        );
        Ok((evicted, freed))
    }

    /// Look up an entry, removing it if its TTL has elapsed.
    pub fn read(&self, key: &CacheKey, now_ms: u64) -> Result<Lookup> {
        let mut state = self.lock_state("read")?;
        match state.entries.get(key) {
            None => return Ok(Lookup::Miss),
            Some(entry) if entry.metadata.is_fresh(now_ms) => return Ok(Lookup::Hit(entry.clone())),
            Some(_) => {}
        }
        state.remove(&self.id, key)?;
        Ok(Lookup::Expired)
    }

    /// Entry regardless of freshness; does not modify the cache.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Remove an undecodable entry, unless it was replaced since it was read.
    pub fn quarantine(&self, key: &CacheKey, sequence: u64) -> Result<bool> {
        let mut state = self.lock_state("quarantine")?;
        match state.entries.get(key) {
            Some(entry) if entry.metadata.sequence == sequence => {
                Ok(state.remove(&self.id, key)?.is_some())
            }
            _ => Ok(false),
        }
    }

    /// Drop every entry whose TTL has elapsed; returns how many were removed.
    pub fn expire(&self, now_ms: u64) -> Result<usize> {
        let mut state = self.lock_state("expire")?;
        let expired: Vec<CacheKey> = state
            .expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at < now_ms)
            .map(|(_, k)| k.clone())
            .collect();
        for key in &expired {
            state.remove(&self.id, key)?;
        }
        Ok(expired.len())
    }

    // ===== Blocking-pool entry points =====

    /// [`EdgeNode::write`] run on the blocking pool.
    pub async fn write_offloaded(
        self: &Arc<Self>,
        key: CacheKey,
        payload: Bytes,
        metadata: EntryMetadata,
        mode: WriteMode,
        now_ms: u64,
        publish: bool,
    ) -> Result<WriteReport> {
        let edge = Arc::clone(self);
        self.offload("write", move || edge.write(key, payload, metadata, mode, now_ms, publish))
            .await
    }

    /// [`EdgeNode::read`] run on the blocking pool.
    pub async fn read_offloaded(self: &Arc<Self>, key: CacheKey, now_ms: u64) -> Result<Lookup> {
        let edge = Arc::clone(self);
        self.offload("read", move || edge.read(&key, now_ms)).await
    }

    /// [`EdgeNode::quarantine`] run on the blocking pool.
    pub async fn quarantine_offloaded(self: &Arc<Self>, key: CacheKey, sequence: u64) -> Result<bool> {
        let edge = Arc::clone(self);
        self.offload("quarantine", move || edge.quarantine(&key, sequence))
            .await
    }

    /// [`EdgeNode::expire`] run on the blocking pool.
    pub async fn expire_offloaded(self: &Arc<Self>, now_ms: u64) -> Result<usize> {
        let edge = Arc::clone(self);
        self.offload("expire", move || edge.expire(now_ms)).await
    }

    async fn offload<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| FabricError::Fatal {
                edge_id: self.id.clone(),
                reason: format!("{} task failed: {}", operation, e),
            })?
    }

    /// Empty the cache, keeping channels and status.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = CacheState::default();
    }

    pub fn cache_bytes(&self) -> u64 {
        self.state.lock().cache_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// (Σ stored size, Σ original size) over compressed entries.
    pub fn compression_totals(&self) -> (u64, u64) {
        let state = self.state.lock();
        state
            .compression
            .values()
            .fold((0, 0), |(s, o), info| (s + info.stored_size, o + info.original_size))
    }

    pub fn compression_info(&self, key: &CacheKey) -> Option<CompressionInfo> {
        self.state.lock().compression.get(key).copied()
    }

    /// Check that cache bytes equal the sum of stored sizes.
    pub fn verify_accounting(&self) -> Result<()> {
        let state = self.state.lock();
        let sum: u64 = state.entries.values().map(|e| e.payload.len() as u64).sum();
        if sum != state.cache_bytes {
            return Err(FabricError::Fatal {
                edge_id: self.id.clone(),
                reason: format!("cache bytes {} != stored total {}", state.cache_bytes, sum),
            });
        }
        if state.expiry.len() != state.entries.len() {
            return Err(FabricError::Fatal {
                edge_id: self.id.clone(),
                reason: format!(
                    "expiry index holds {} keys for {} entries",
                    state.expiry.len(),
                    state.entries.len()
                ),
            });
        }
        Ok(())
    }

    pub fn view(&self) -> EdgeView {
        let (cache_bytes, entries, last_write_ms) = {
            let state = self.state.lock();
            (state.cache_bytes, state.entries.len(), state.last_write_ms)
        };
        EdgeView {
            id: self.id.clone(),
            region_id: self.region_id.clone(),
            status: self.status(),
            current_connections: self.current_connections(),
            max_connections: self.max_connections,
            cache_bytes,
            entries,
            rolling_latency_ms: self.rolling_latency_ms(),
            last_write_ms,
            channels: self.channels.total(),
        }
    }
}

/// RAII connection slot on an edge.
pub struct EdgeConnection {
    edge: Arc<EdgeNode>,
}

impl EdgeConnection {
    pub fn edge(&self) -> &Arc<EdgeNode> {
        &self.edge
    }
}

impl Drop for EdgeConnection {
    fn drop(&mut self) {
        let _ = self
            .edge
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{SinkError, StreamSink};
    use crate::domain::value_objects::{CodecId, DataKind};

    // ===== Test Helpers =====

    fn edge(max_cache_bytes: u64) -> Arc<EdgeNode> {
        Arc::new(EdgeNode::new(
            "edge-1",
            "region-1",
            10,
            EdgeNodeConfig {
                max_cache_bytes,
                eviction_target_fraction: 0.2,
                lock_timeout: Duration::from_millis(50),
            },
        ))
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(DataKind::MarketPrices, k)
    }

    fn metadata(write_time_ms: u64, ttl_ms: u64, sequence: u64) -> EntryMetadata {
        EntryMetadata {
            kind: DataKind::MarketPrices,
            write_time_ms,
            ttl_ms,
            compressed: true,
            codec: CodecId::Delta,
            original_size: 100,
            stored_size: 0,
            sequence,
            checksum: 0,
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[derive(Default)]
    struct Collect(parking_lot::Mutex<Vec<u64>>);

    impl StreamSink for Collect {
        fn try_deliver(&self, record: StreamRecord) -> std::result::Result<(), SinkError> {
            self.0.lock().push(record.write_time_ms);
            Ok(())
        }
    }

    // ===== Write / Read Tests =====

    #[test]
    fn test_write_then_read() {
        let e = edge(1_000);
        let report = e
            .write(key("BTC"), payload(10), metadata(0, 1_000, 1), WriteMode::Fresh, 500, true)
            .unwrap();

        assert_eq!(report.write_time_ms, 500);
        assert_eq!(e.cache_bytes(), 10);
        assert!(e.compression_info(&key("BTC")).is_some());

        match e.read(&key("BTC"), 1_000).unwrap() {
            Lookup::Hit(entry) => {
                assert_eq!(entry.metadata.write_time_ms, 500);
                assert_eq!(entry.metadata.stored_size, 10);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_read_expired_removes_entry() {
        let e = edge(1_000);
        e.write(key("BTC"), payload(10), metadata(0, 100, 1), WriteMode::Fresh, 0, false)
            .unwrap();

        assert!(matches!(e.read(&key("BTC"), 100).unwrap(), Lookup::Hit(_)));
        assert!(matches!(e.read(&key("BTC"), 101).unwrap(), Lookup::Expired));
        assert!(matches!(e.read(&key("BTC"), 101).unwrap(), Lookup::Miss));
        assert_eq!(e.cache_bytes(), 0);
        assert!(e.compression_info(&key("BTC")).is_none());
    }

    #[test]
    fn test_replace_adjusts_bytes() {
        let e = edge(1_000);
        e.write(key("BTC"), payload(100), metadata(0, 1_000, 1), WriteMode::Fresh, 0, false)
            .unwrap();
        e.write(key("BTC"), payload(40), metadata(0, 1_000, 2), WriteMode::Fresh, 1, false)
            .unwrap();

        assert_eq!(e.cache_bytes(), 40);
        assert_eq!(e.entry_count(), 1);
        e.verify_accounting().unwrap();
    }

    #[test]
    fn test_identity_entry_has_no_compression_info() {
        let e = edge(1_000);
        let mut meta = metadata(0, 1_000, 1);
        meta.compressed = false;
        meta.codec = CodecId::Identity;
        e.write(key("BTC"), payload(10), meta, WriteMode::Fresh, 0, false)
            .unwrap();
        assert!(e.compression_info(&key("BTC")).is_none());
        assert_eq!(e.compression_totals(), (0, 0));
    }

    #[test]
    fn test_fresh_write_times_are_monotone() {
        let e = edge(1_000);
        let a = e
            .write(key("A"), payload(1), metadata(0, 1_000, 1), WriteMode::Fresh, 100, false)
            .unwrap();
        // Clock stepped backwards
        let b = e
            .write(key("B"), payload(1), metadata(0, 1_000, 2), WriteMode::Fresh, 90, false)
            .unwrap();
        assert_eq!(a.write_time_ms, 100);
        assert_eq!(b.write_time_ms, 100);
    }

    #[test]
    fn test_replicated_write_keeps_write_time() {
        let e = edge(1_000);
        let report = e
            .write(key("A"), payload(1), metadata(42, 1_000, 1), WriteMode::Replicated, 100, false)
            .unwrap();
        assert_eq!(report.write_time_ms, 42);
        assert_eq!(e.peek(&key("A")).unwrap().metadata.write_time_ms, 42);
    }

    #[test]
    fn test_older_sequence_is_superseded() {
        let e = edge(1_000);
        e.write(key("A"), payload(5), metadata(0, 1_000, 9), WriteMode::Fresh, 10, false)
            .unwrap();
        let report = e
            .write(key("A"), payload(7), metadata(0, 1_000, 3), WriteMode::Fresh, 20, false)
            .unwrap();

        assert!(report.superseded);
        assert_eq!(e.peek(&key("A")).unwrap().metadata.sequence, 9);
        assert_eq!(e.cache_bytes(), 5);
    }

    #[test]
    fn test_older_sequence_replaces_expired_entry() {
        let e = edge(1_000);
        e.write(key("A"), payload(5), metadata(0, 10, 9), WriteMode::Fresh, 0, false)
            .unwrap();
        let report = e
            .write(key("A"), payload(7), metadata(0, 1_000, 3), WriteMode::Fresh, 100, false)
            .unwrap();
        assert!(!report.superseded);
        assert_eq!(e.cache_bytes(), 7);
    }

    // ===== Gating Tests =====

    #[test]
    fn test_disabled_edge_rejects_writes() {
        let e = edge(1_000);
        e.set_status(EdgeStatus::Disabled);
        let err = e
            .write(key("A"), payload(1), metadata(0, 1_000, 1), WriteMode::Fresh, 0, false)
            .unwrap_err();
        assert!(matches!(err, FabricError::EdgeUnavailable { .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_degraded_edge_accepts_writes() {
        let e = edge(1_000);
        e.set_status(EdgeStatus::Degraded);
        assert!(e
            .write(key("A"), payload(1), metadata(0, 1_000, 1), WriteMode::Fresh, 0, false)
            .is_ok());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let e = edge(100);
        let err = e
            .write(key("A"), payload(101), metadata(0, 1_000, 1), WriteMode::Fresh, 0, false)
            .unwrap_err();
        assert!(matches!(err, FabricError::CapacityExhausted { .. }));
        assert_eq!(e.cache_bytes(), 0);
    }

    #[test]
    fn test_lock_timeout() {
        let e = edge(1_000);
        let _held = e.state.lock();
        let err = e.read(&key("A"), 0).unwrap_err();
        assert!(matches!(err, FabricError::Timeout { operation: "read", .. }));
    }

    // ===== Eviction Tests =====

    #[test]
    fn test_eviction_by_expiry_order() {
        let e = edge(1_000);
        // 9 entries of 100 bytes with interleaved expiries
        let ttls = [900, 100, 700, 300, 500, 200, 800, 400, 600];
        for (i, ttl) in ttls.iter().enumerate() {
            e.write(
                key(&format!("k{}", i)),
                payload(100),
                metadata(0, *ttl, i as u64 + 1),
                WriteMode::Replicated,
                0,
                false,
            )
            .unwrap();
        }
        assert_eq!(e.cache_bytes(), 900);

        // Needs 150 bytes more than fit; target is max(200, 50)
        let report = e
            .write(key("new"), payload(250), metadata(0, 1_000, 100), WriteMode::Replicated, 0, false)
            .unwrap();

        let mut evicted: Vec<_> = report.evicted.iter().map(|k| k.key.clone()).collect();
        evicted.sort();
        // Smallest expiries: k1 (100), k5 (200)
        assert_eq!(evicted, vec!["k1", "k5"]);
        assert_eq!(report.freed_bytes, 200);
        assert!(e.contains(&key("new")));
        assert_eq!(e.cache_bytes(), 950);
        e.verify_accounting().unwrap();
    }

    #[test]
    fn test_eviction_frees_what_is_needed() {
        let e = edge(1_000);
        for i in 0..10 {
            e.write(key(&format!("k{}", i)), payload(100), metadata(0, 100 + i, i + 1), WriteMode::Replicated, 0, false)
                .unwrap();
        }
        // 500 bytes over budget: more than the 20% target
        let report = e
            .write(key("big"), payload(500), metadata(0, 1_000, 100), WriteMode::Replicated, 0, false)
            .unwrap();
        assert_eq!(report.evicted.len(), 5);
        assert!(e.cache_bytes() <= 1_000);
        e.verify_accounting().unwrap();
    }

    #[test]
    fn test_evicted_bytes_survive_for_readers() {
        let e = edge(200);
        e.write(key("a"), payload(150), metadata(0, 10, 1), WriteMode::Replicated, 0, false)
            .unwrap();
        let held = match e.read(&key("a"), 0).unwrap() {
            Lookup::Hit(entry) => entry,
            other => panic!("expected hit, got {:?}", other),
        };
        e.write(key("b"), payload(150), metadata(0, 100, 2), WriteMode::Replicated, 0, false)
            .unwrap();

        assert!(!e.contains(&key("a")));
        assert_eq!(held.payload.len(), 150);
    }

    #[test]
    fn test_eviction_follows_replaced_expiry() {
        let e = edge(300);
        e.write(key("a"), payload(100), metadata(0, 100, 1), WriteMode::Replicated, 0, false)
            .unwrap();
        e.write(key("b"), payload(100), metadata(0, 200, 2), WriteMode::Replicated, 0, false)
            .unwrap();
        // Replacing `a` moves it behind `b` in expiry order
        e.write(key("a"), payload(100), metadata(0, 300, 3), WriteMode::Replicated, 0, false)
            .unwrap();

        let report = e
            .write(key("c"), payload(150), metadata(0, 1_000, 4), WriteMode::Replicated, 0, false)
            .unwrap();

        assert_eq!(report.evicted, vec![key("b")]);
        assert!(e.contains(&key("a")));
        assert!(e.contains(&key("c")));
        assert_eq!(e.cache_bytes(), 250);
        e.verify_accounting().unwrap();

        assert_eq!(e.expire(301).unwrap(), 1);
        assert!(!e.contains(&key("a")));
        e.verify_accounting().unwrap();
    }

    #[test]
    fn test_quarantine_matches_sequence() {
        let e = edge(1_000);
        e.write(key("a"), payload(10), metadata(0, 500, 4), WriteMode::Fresh, 0, false)
            .unwrap();

        assert!(!e.quarantine(&key("a"), 3).unwrap());
        assert!(e.contains(&key("a")));
        assert!(e.quarantine(&key("a"), 4).unwrap());
        assert!(!e.contains(&key("a")));
        assert_eq!(e.cache_bytes(), 0);
    }

    // ===== Expiry Sweep Tests =====

    #[test]
    fn test_expire_sweep() {
        let e = edge(1_000);
        e.write(key("short"), payload(10), metadata(0, 50, 1), WriteMode::Replicated, 0, false)
            .unwrap();
        e.write(key("long"), payload(10), metadata(0, 500, 2), WriteMode::Replicated, 0, false)
            .unwrap();

        assert_eq!(e.expire(100).unwrap(), 1);
        assert!(!e.contains(&key("short")));
        assert!(e.contains(&key("long")));
        assert_eq!(e.cache_bytes(), 10);
        // Idempotent
        assert_eq!(e.expire(100).unwrap(), 0);
    }

    #[test]
    fn test_reset() {
        let e = edge(1_000);
        e.write(key("a"), payload(10), metadata(0, 500, 1), WriteMode::Fresh, 0, false)
            .unwrap();
        e.reset();
        assert_eq!(e.cache_bytes(), 0);
        assert_eq!(e.entry_count(), 0);
    }

    // ===== Offload Tests =====

    #[tokio::test]
    async fn test_offloaded_lock_wait_leaves_runtime_free() {
        let e = edge(1_000);
        let guard = e.state.lock();

        let waiting = tokio::spawn({
            let e = Arc::clone(&e);
            async move { e.read_offloaded(key("a"), 0).await }
        });

        // The only runtime thread keeps running while the read waits on the lock
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(started.elapsed() < Duration::from_millis(40));

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, FabricError::Timeout { operation: "read", .. }));
        drop(guard);

        let report = e
            .write_offloaded(key("a"), payload(4), metadata(0, 100, 1), WriteMode::Fresh, 0, false)
            .await
            .unwrap();
        assert!(!report.superseded);
        assert!(matches!(e.read_offloaded(key("a"), 10).await.unwrap(), Lookup::Hit(_)));
        assert!(e.quarantine_offloaded(key("a"), 1).await.unwrap());
        assert_eq!(e.expire_offloaded(1_000).await.unwrap(), 0);
    }

    // ===== Publish Tests =====

    #[test]
    fn test_write_publishes_to_channels() {
        let e = edge(1_000);
        let sink = Arc::new(Collect::default());
        e.channels().subscribe(DataKind::MarketPrices, sink.clone());

        e.write(key("a"), payload(1), metadata(0, 500, 1), WriteMode::Fresh, 5, true)
            .unwrap();
        e.write(key("a"), payload(1), metadata(0, 500, 2), WriteMode::Fresh, 7, false)
            .unwrap();
        let report = e
            .write(key("b"), payload(1), metadata(0, 500, 3), WriteMode::Fresh, 9, true)
            .unwrap();

        assert_eq!(report.publish.unwrap().delivered, 1);
        assert_eq!(*sink.0.lock(), vec![5, 9]);
    }

    // ===== Connection / Latency Tests =====

    #[test]
    fn test_connection_guard() {
        let e = edge(1_000);
        {
            let _a = e.connect();
            let _b = e.connect();
            assert_eq!(e.current_connections(), 2);
        }
        assert_eq!(e.current_connections(), 0);
    }

    #[test]
    fn test_latency_ema() {
        let e = edge(1_000);
        assert_eq!(e.rolling_latency_ms(), 0.0);
        e.record_latency(10.0);
        assert!((e.rolling_latency_ms() - 10.0).abs() < 1e-9);
        e.record_latency(20.0);
        assert!((e.rolling_latency_ms() - 11.0).abs() < 1e-9);
        e.record_latency(f64::NAN);
        assert!((e.rolling_latency_ms() - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_transitions() {
        let e = edge(1_000);
        assert_eq!(e.set_status(EdgeStatus::Degraded), EdgeStatus::Active);
        assert!(!e.transition_status(EdgeStatus::Active, EdgeStatus::Disabled));
        assert!(e.transition_status(EdgeStatus::Degraded, EdgeStatus::Active));
        assert_eq!(e.status(), EdgeStatus::Active);
    }
}
