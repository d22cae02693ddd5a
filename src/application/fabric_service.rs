//! Fabric Service - main application use case
//!
//! Orchestrates distribution of writes across edges, the read path with
//! peer fallback and backfill, stream subscriptions, operator status
//! changes and the periodic maintenance passes.

use crate::application::snapshot::{EdgeMetrics, MetricsSnapshot, RegionMetrics};
use crate::config::Config;
use crate::domain::entities::{CacheEntry, CacheKey, EntryMetadata, PropagationItem};
use crate::domain::error::{EdgeWriteError, FabricError, Result};
use crate::domain::ports::{counters, Clock, MetricsStore, StreamSink};
use crate::domain::services::{
    CodecRegistry, DistributionPlanner, EdgeCandidate, EdgeLoad, Topology,
};
use crate::domain::value_objects::{
    CodecId, Coordinate, DataKind, EdgeStatus, ReadSource, RegionStatus, Strategy,
};
use crate::infrastructure::{
    EdgeNode, EdgeNodeConfig, EdgeView, HealthMonitor, HealthMonitorConfig, HealthTransition,
    Lookup, PropagationQueues, StreamRegistry, WriteMode, WriteReport,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Key used when a write names none.
pub const DEFAULT_KEY: &str = "latest";

/// Runtime knobs of the service, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct FabricSettings {
    pub default_ttl_ms: u64,
    pub push_enabled: bool,
    pub fallback_peer_limit: usize,
    pub propagation_batch_size: usize,
    pub intelligent_sync_fanout: usize,
    pub stream_buffer_capacity: usize,
}

impl From<&Config> for FabricSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_ttl_ms: config.default_ttl_ms,
            push_enabled: config.push_enabled,
            fallback_peer_limit: config.fallback_peer_limit,
            propagation_batch_size: config.propagation_batch_size.max(1),
            intelligent_sync_fanout: config.intelligent_sync_fanout.max(1),
            stream_buffer_capacity: config.stream_buffer_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistributeOptions {
    /// Region written synchronously by the origin-lazy strategy
    #[serde(default)]
    pub origin_region: Option<String>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Overrides the kind's default strategy
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributeResult {
    pub success: bool,
    pub kind: DataKind,
    pub key: String,
    pub strategy: Strategy,
    pub sequence: u64,
    pub codec: CodecId,
    pub edges_updated: usize,
    pub updated_edges: Vec<String>,
    pub errors: Vec<EdgeWriteError>,
    /// Writes handed to a background task
    pub background_writes: usize,
    /// Regions that will receive the write from the propagation loop
    pub propagation_enqueued: usize,
    pub elapsed_ms: f64,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetResult {
    pub value: Value,
    pub codec: CodecId,
    pub write_time_ms: u64,
    pub source: ReadSource,
    /// Primary edge chosen for the client
    pub edge_id: String,
    /// Edge that held the entry
    pub served_by: String,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionView {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub capacity: u32,
    pub status: RegionStatus,
    pub edges: Vec<EdgeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyView {
    pub fallback_edge: String,
    pub regions: Vec<RegionView>,
}

/// Outcome of one propagation drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub drained: usize,
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct FanOut {
    /// (edge id, stamped write time), ordered by edge id
    updated: Vec<(String, u64)>,
    errors: Vec<EdgeWriteError>,
    background: usize,
    enqueued: usize,
}

enum ReadAttempt {
    Found(CacheEntry, Value),
    Miss,
    Corrupt,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1_000.0
}

fn parse_kind(kind: &str) -> Result<DataKind> {
    DataKind::parse(kind).ok_or_else(|| FabricError::InvalidInput("kind must not be empty".to_string()))
}

/// Distribution core: owns every edge and routes reads and writes.
///
/// Shared as `Arc<FabricService>`; fan-out, background writes and backfills
/// run on spawned tasks holding a clone.
pub struct FabricService {
    settings: FabricSettings,
    topology: Topology,
    codecs: CodecRegistry,
    /// Ordered by edge id
    edges: Vec<Arc<EdgeNode>>,
    edge_index: HashMap<String, usize>,
    region_status: HashMap<String, AtomicU8>,
    /// Serializes region status changes
    region_lock: Mutex<()>,
    queues: PropagationQueues,
    streams: StreamRegistry,
    health: HealthMonitor,
    metrics: Arc<dyn MetricsStore>,
    clock: Arc<dyn Clock>,
    sequence: AtomicU64,
    snapshot: RwLock<Arc<MetricsSnapshot>>,
}

impl FabricService {
    pub fn new(
        config: &Config,
        topology: Topology,
        metrics: Arc<dyn MetricsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let edge_config = EdgeNodeConfig {
            max_cache_bytes: config.max_cache_bytes_per_edge,
            eviction_target_fraction: config.eviction_target_fraction,
            lock_timeout: Duration::from_millis(config.operation_timeout_ms.max(1)),
        };

        let edges: Vec<Arc<EdgeNode>> = topology
            .edges()
            .iter()
            .map(|p| {
                Arc::new(EdgeNode::new(
                    &p.id,
                    &p.region_id,
                    p.max_connections,
                    edge_config.clone(),
                ))
            })
            .collect();
        let edge_index = edges
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().to_string(), i))
            .collect();
        let region_status = topology
            .regions()
            .iter()
            .map(|r| (r.id.clone(), AtomicU8::new(RegionStatus::Active.as_u8())))
            .collect();

        let service = Self {
            settings: FabricSettings::from(config),
            codecs: CodecRegistry::new(config.compression_precision.clone()),
            edges,
            edge_index,
            region_status,
            region_lock: Mutex::new(()),
            queues: PropagationQueues::new(config.propagation_queue_capacity),
            streams: StreamRegistry::new(),
            health: HealthMonitor::new(HealthMonitorConfig {
                error_threshold: config.health_error_threshold,
                window_ms: config.health_window_ms,
                min_samples: config.health_min_samples,
            }),
            metrics,
            clock,
            sequence: AtomicU64::new(0),
            snapshot: RwLock::new(Arc::new(MetricsSnapshot::default())),
            topology,
        };
        service.refresh_metrics();

        tracing::info!(
            regions = service.topology.regions().len(),
            edges = service.edges.len(),
            fallback = %service.topology.fallback_edge(),
            "fabric initialized"
        );
        service
    }

    // ===== Accessors =====

    pub fn settings(&self) -> &FabricSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn edge(&self, edge_id: &str) -> Option<&Arc<EdgeNode>> {
        self.edge_index.get(edge_id).map(|&i| &self.edges[i])
    }

    pub fn edges(&self) -> &[Arc<EdgeNode>] {
        &self.edges
    }

    pub fn pending_propagation(&self) -> usize {
        self.queues.total_len()
    }

    pub fn open_channels(&self) -> usize {
        self.streams.len()
    }

    pub fn region_status(&self, region_id: &str) -> Option<RegionStatus> {
        self.region_status
            .get(region_id)
            .map(|s| EdgeStatus::from_u8(s.load(Ordering::SeqCst)))
    }

    /// Status of an edge after applying its region's status.
    ///
    /// A disabled region disables its edges; a degraded region degrades its
    /// active edges.
    pub fn effective_status(&self, edge: &EdgeNode) -> EdgeStatus {
        let own = edge.status();
        match self.region_status(edge.region_id()) {
            Some(EdgeStatus::Disabled) => EdgeStatus::Disabled,
            Some(EdgeStatus::Degraded) if own == EdgeStatus::Active => EdgeStatus::Degraded,
            _ => own,
        }
    }

    // ===== Distribute =====

    /// Encode a value once and write it to edges per the kind's strategy.
    ///
    /// Succeeds when at least one synchronous edge write succeeded; per-edge
    /// failures are listed in the result.
    pub async fn distribute(
        self: &Arc<Self>,
        kind: &str,
        key: Option<&str>,
        value: &Value,
        options: DistributeOptions,
    ) -> Result<DistributeResult> {
        let started = Instant::now();
        let kind = parse_kind(kind)?;
        let key = match key.map(str::trim) {
            None => DEFAULT_KEY.to_string(),
            Some("") => return Err(FabricError::InvalidInput("key must not be empty".to_string())),
            Some(k) => k.to_string(),
        };
        let ttl_ms = options.ttl_ms.unwrap_or(self.settings.default_ttl_ms);
        if ttl_ms == 0 {
            return Err(FabricError::InvalidInput("ttl_ms must be positive".to_string()));
        }
        if !kind.is_known() {
            self.metrics.incr(counters::UNKNOWN_KIND_WRITES);
            tracing::warn!(kind = %kind, "unknown kind, storing without compression");
        }

        let encoded = self.codecs.encode(&kind, value)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let metadata = EntryMetadata {
            kind: kind.clone(),
            write_time_ms: self.clock.now_ms(),
            ttl_ms,
            compressed: encoded.compressed(),
            codec: encoded.codec,
            original_size: encoded.original_size,
            stored_size: encoded.stored_size,
            sequence,
            checksum: encoded.checksum,
        };
        let cache_key = CacheKey::new(kind.clone(), key.clone());
        let strategy = options
            .strategy
            .unwrap_or_else(|| DistributionPlanner::strategy_for(&kind));

        let fan = match strategy {
            Strategy::PushAll => {
                self.write_edges(self.edges.clone(), &cache_key, &encoded.bytes, &metadata, WriteMode::Fresh)
                    .await
            }
            Strategy::OriginLazy => {
                self.distribute_origin_lazy(&cache_key, &encoded.bytes, metadata, options.origin_region.as_deref())
                    .await?
            }
            Strategy::Intelligent => {
                self.distribute_intelligent(&cache_key, &encoded.bytes, &metadata).await
            }
        };

        if fan.updated.is_empty() {
            tracing::warn!(
                kind = %kind,
                key = %key,
                strategy = %strategy,
                failures = fan.errors.len(),
                "distribution reached no edge"
            );
            return Err(FabricError::DistributionFailed {
                kind,
                errors: fan.errors,
            });
        }

        let elapsed = elapsed_ms(started);
        tracing::debug!(
            kind = %kind,
            key = %key,
            strategy = %strategy,
            sequence,
            edges = fan.updated.len(),
            failures = fan.errors.len(),
            elapsed_ms = elapsed,
            "distributed"
        );

        Ok(DistributeResult {
            success: true,
            kind,
            key,
            strategy,
            sequence,
            codec: encoded.codec,
            edges_updated: fan.updated.len(),
            updated_edges: fan.updated.into_iter().map(|(id, _)| id).collect(),
            errors: fan.errors,
            background_writes: fan.background,
            propagation_enqueued: fan.enqueued,
            elapsed_ms: elapsed,
            compression_ratio: encoded.ratio(),
        })
    }

    async fn distribute_origin_lazy(
        self: &Arc<Self>,
        key: &CacheKey,
        payload: &Bytes,
        mut metadata: EntryMetadata,
        origin_region: Option<&str>,
    ) -> Result<FanOut> {
        let origin = match origin_region {
            Some(region_id) => self
                .topology
                .region(region_id)
                .map(|r| r.id.clone())
                .ok_or_else(|| FabricError::InvalidInput(format!("unknown origin region {}", region_id)))?,
            None => self
                .edge(self.topology.fallback_edge())
                .map(|e| e.region_id().to_string())
                .ok_or_else(|| FabricError::InvalidInput("fallback edge is not configured".to_string()))?,
        };

        let targets: Vec<Arc<EdgeNode>> = self
            .topology
            .edges_in_region(&origin)
            .filter_map(|p| self.edge(&p.id).cloned())
            .collect();
        let mut fan = self
            .write_edges(targets, key, payload, &metadata, WriteMode::Fresh)
            .await;

        let Some((_, write_time_ms)) = fan.updated.first() else {
            return Ok(fan);
        };
        // Replicas carry the origin's stamp
        metadata.write_time_ms = *write_time_ms;

        let now = self.clock.now_ms();
        for region in self.topology.regions() {
            if region.id == origin || self.region_status(&region.id) == Some(RegionStatus::Disabled) {
                continue;
            }
            let dropped = self.queues.push(PropagationItem {
                key: key.clone(),
                payload: payload.clone(),
                metadata: metadata.clone(),
                target_region: region.id.clone(),
                excluded_region: origin.clone(),
                enqueued_at_ms: now,
            });
            self.metrics.incr(counters::PROPAGATION_ENQUEUED);
            fan.enqueued += 1;

            if let Some(dropped) = dropped {
                self.metrics.incr(counters::PROPAGATION_DROPPED);
                tracing::warn!(
                    kind = %dropped.key.kind,
                    key = %dropped.key.key,
                    region = %dropped.target_region,
                    "propagation queue full, dropped oldest item"
                );
            }
        }
        Ok(fan)
    }

    async fn distribute_intelligent(
        self: &Arc<Self>,
        key: &CacheKey,
        payload: &Bytes,
        metadata: &EntryMetadata,
    ) -> FanOut {
        let candidates: Vec<EdgeCandidate> = self
            .edges
            .iter()
            .filter(|e| self.effective_status(e) != EdgeStatus::Disabled)
            .map(|e| EdgeCandidate {
                edge_id: e.id().to_string(),
                subscribers: e.channels().count(&key.kind),
                current_connections: e.current_connections(),
                max_connections: e.max_connections(),
                latency_ms: e.rolling_latency_ms(),
            })
            .collect();

        if candidates.is_empty() {
            // Every edge is out of rotation; report each one
            return self
                .write_edges(self.edges.clone(), key, payload, metadata, WriteMode::Fresh)
                .await;
        }

        let plan = DistributionPlanner::plan_intelligent(candidates, self.settings.intelligent_sync_fanout);
        let synchronous = self.resolve(&plan.synchronous);
        let background = self.resolve(&plan.background);

        let mut fan = self
            .write_edges(synchronous, key, payload, metadata, WriteMode::Fresh)
            .await;

        if !background.is_empty() {
            fan.background = background.len();
            let svc = Arc::clone(self);
            let (key, payload, metadata) = (key.clone(), payload.clone(), metadata.clone());
            tokio::spawn(async move {
                let fan = svc
                    .write_edges(background, &key, &payload, &metadata, WriteMode::Fresh)
                    .await;
                if !fan.errors.is_empty() {
                    svc.metrics
                        .add(counters::BACKGROUND_WRITE_FAILED, fan.errors.len() as u64);
                    tracing::debug!(
                        kind = %key.kind,
                        key = %key.key,
                        failures = fan.errors.len(),
                        "background writes failed"
                    );
                }
            });
        }
        fan
    }

    fn resolve(&self, edge_ids: &[String]) -> Vec<Arc<EdgeNode>> {
        edge_ids.iter().filter_map(|id| self.edge(id).cloned()).collect()
    }

    /// Write to every target concurrently and collect the outcomes.
    ///
    /// Dropping the future aborts writes that have not started.
    async fn write_edges(
        self: &Arc<Self>,
        targets: Vec<Arc<EdgeNode>>,
        key: &CacheKey,
        payload: &Bytes,
        metadata: &EntryMetadata,
        mode: WriteMode,
    ) -> FanOut {
        let mut set = JoinSet::new();
        for edge in targets {
            let svc = Arc::clone(self);
            let (key, payload, metadata) = (key.clone(), payload.clone(), metadata.clone());
            set.spawn(async move {
                let result = svc.write_edge(&edge, key, payload, metadata, mode).await;
                (edge.id().to_string(), result)
            });
        }

        let mut fan = FanOut::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((edge_id, Ok(report))) => fan.updated.push((edge_id, report.write_time_ms)),
                Ok((edge_id, Err(err))) => fan.errors.push(EdgeWriteError {
                    edge_id,
                    retriable: err.is_retriable(),
                    error: err.to_string(),
                }),
                Err(e) => tracing::error!("edge write task failed: {}", e),
            }
        }
        fan.updated.sort();
        fan.errors.sort_by(|a, b| a.edge_id.cmp(&b.edge_id));
        fan
    }

    async fn write_edge(
        &self,
        edge: &Arc<EdgeNode>,
        key: CacheKey,
        payload: Bytes,
        metadata: EntryMetadata,
        mode: WriteMode,
    ) -> Result<WriteReport> {
        let status = self.effective_status(edge);
        let result = if status == EdgeStatus::Disabled {
            Err(FabricError::EdgeUnavailable {
                edge_id: edge.id().to_string(),
                status: status.to_string(),
            })
        } else {
            edge.write_offloaded(
                key,
                payload,
                metadata,
                mode,
                self.clock.now_ms(),
                self.settings.push_enabled,
            )
            .await
        };
        self.observe_write(edge, &result);
        result
    }

    fn observe_write(&self, edge: &EdgeNode, result: &Result<WriteReport>) {
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                self.metrics.record_edge_write(edge.id(), false);
                self.observe_error(edge, err);
                return;
            }
        };

        self.metrics.record_edge_write(edge.id(), true);
        self.health.record(edge.id(), true, self.clock.now_ms());
        if report.superseded {
            self.metrics.incr(counters::SUPERSEDED_WRITES);
        }
        if !report.evicted.is_empty() {
            self.metrics
                .add(counters::EVICTED_ENTRIES, report.evicted.len() as u64);
            tracing::debug!(
                edge = %edge.id(),
                evicted = report.evicted.len(),
                freed_bytes = report.freed_bytes,
                "evicted entries to admit write"
            );
        }

        let Some(publish) = &report.publish else {
            return;
        };
        if publish.delivered > 0 {
            self.metrics
                .add(counters::PUSHES_DELIVERED, publish.delivered as u64);
        }
        if publish.stale {
            self.metrics.incr(counters::STALE_PUSHES_SKIPPED);
        }
        for (channel_id, reason) in &publish.removed {
            self.streams.remove(channel_id);
            self.metrics.incr(counters::SINKS_REMOVED);
            tracing::warn!(
                edge = %edge.id(),
                channel = %channel_id,
                reason = %reason,
                "removed stream channel"
            );
        }
    }

    /// Count timeouts and recover edges whose accounting broke.
    fn observe_error(&self, edge: &EdgeNode, err: &FabricError) {
        match err {
            FabricError::Timeout { .. } => {
                self.metrics.record_timeout(edge.id());
                self.health.record(edge.id(), false, self.clock.now_ms());
            }
            FabricError::Fatal { reason, .. } => {
                tracing::error!(edge = %edge.id(), reason = %reason, "resetting edge cache");
                edge.reset();
                self.metrics.incr(counters::EDGE_RESETS);
                self.health.record(edge.id(), false, self.clock.now_ms());
            }
            _ => {}
        }
    }

    // ===== Get =====

    /// Serve a read from the client's primary edge, falling back to its
    /// nearest peers.
    ///
    /// A peer hit is copied back to the primary in the background.
    pub async fn get(
        self: &Arc<Self>,
        kind: &str,
        key: &str,
        client: Option<Coordinate>,
    ) -> Result<GetResult> {
        let started = Instant::now();
        let kind = parse_kind(kind)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(FabricError::InvalidInput("key must not be empty".to_string()));
        }
        let cache_key = CacheKey::new(kind.clone(), key);

        let primary = self.select_primary(client)?;
        let _slot = primary.connect();
        let now = self.clock.now_ms();
        let mut corrupt = false;

        match self.read_from(&primary, &cache_key, now).await {
            ReadAttempt::Found(entry, value) => {
                let elapsed = elapsed_ms(started);
                primary.record_latency(elapsed);
                self.metrics.record_hit(&kind, elapsed);
                return Ok(GetResult {
                    value,
                    codec: entry.metadata.codec,
                    write_time_ms: entry.metadata.write_time_ms,
                    source: ReadSource::Primary,
                    edge_id: primary.id().to_string(),
                    served_by: primary.id().to_string(),
                    elapsed_ms: elapsed,
                });
            }
            ReadAttempt::Corrupt => corrupt = true,
            ReadAttempt::Miss => {}
        }

        let routes = self
            .topology
            .routing_table(primary.id())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        let peers = routes
            .iter()
            .filter_map(|r| self.edge(&r.peer_edge_id))
            .filter(|e| self.effective_status(e) != EdgeStatus::Disabled)
            .take(self.settings.fallback_peer_limit);

        for peer in peers {
            match self.read_from(peer, &cache_key, now).await {
                ReadAttempt::Found(entry, value) => {
                    let elapsed = elapsed_ms(started);
                    primary.record_latency(elapsed);
                    self.metrics.record_fallback_hit(&kind, elapsed);
                    tracing::debug!(
                        kind = %kind,
                        key = %key,
                        primary = %primary.id(),
                        peer = %peer.id(),
                        "served from peer"
                    );
                    let result = GetResult {
                        value,
                        codec: entry.metadata.codec,
                        write_time_ms: entry.metadata.write_time_ms,
                        source: ReadSource::Fallback,
                        edge_id: primary.id().to_string(),
                        served_by: peer.id().to_string(),
                        elapsed_ms: elapsed,
                    };
                    self.spawn_backfill(Arc::clone(&primary), cache_key, entry);
                    return Ok(result);
                }
                ReadAttempt::Corrupt => corrupt = true,
                ReadAttempt::Miss => {}
            }
        }

        let elapsed = elapsed_ms(started);
        primary.record_latency(elapsed);
        self.metrics.record_not_found(&kind, elapsed);
        if corrupt {
            Err(FabricError::DecodingFailed(format!(
                "no decodable entry for {}/{}",
                kind, key
            )))
        } else {
            Err(FabricError::NotFound {
                kind,
                key: key.to_string(),
            })
        }
    }

    /// Id of the edge that would serve a client at `client`.
    pub fn primary_edge(&self, client: Option<Coordinate>) -> Result<String> {
        self.select_primary(client).map(|e| e.id().to_string())
    }

    fn select_primary(&self, client: Option<Coordinate>) -> Result<Arc<EdgeNode>> {
        let selection = self
            .topology
            .select_primary(client, |id| match self.edge(id) {
                Some(edge) => EdgeLoad {
                    status: self.effective_status(edge),
                    current_connections: edge.current_connections(),
                },
                None => EdgeLoad {
                    status: EdgeStatus::Disabled,
                    current_connections: 0,
                },
            })
            .ok_or_else(|| FabricError::EdgeUnavailable {
                edge_id: "*".to_string(),
                status: "every edge is disabled".to_string(),
            })?;

        if selection.used_fallback_edge {
            self.metrics.incr(counters::INVALID_COORDINATES);
        }
        if selection.saturated {
            self.metrics.incr(counters::SATURATED_SELECTIONS);
            tracing::warn!(edge = %selection.edge_id, "every active edge is saturated");
        }
        if selection.degraded {
            self.metrics.incr(counters::DEGRADED_SELECTIONS);
            tracing::warn!(edge = %selection.edge_id, "no active edge, serving from a degraded edge");
        }

        self.edge(&selection.edge_id)
            .cloned()
            .ok_or_else(|| FabricError::EdgeUnavailable {
                edge_id: selection.edge_id,
                status: "unknown".to_string(),
            })
    }

    async fn read_from(&self, edge: &Arc<EdgeNode>, key: &CacheKey, now_ms: u64) -> ReadAttempt {
        let entry = match edge.read_offloaded(key.clone(), now_ms).await {
            Ok(Lookup::Hit(entry)) => entry,
            Ok(Lookup::Expired) => {
                self.metrics.incr(counters::EXPIRED_ENTRIES);
                return ReadAttempt::Miss;
            }
            Ok(Lookup::Miss) => return ReadAttempt::Miss,
            Err(err) => {
                self.observe_error(edge, &err);
                return ReadAttempt::Miss;
            }
        };

        match self
            .codecs
            .decode_checked(entry.metadata.codec, &entry.payload, entry.metadata.checksum)
        {
            Ok(value) => ReadAttempt::Found(entry, value),
            Err(err) => {
                tracing::warn!(
                    edge = %edge.id(),
                    kind = %key.kind,
                    key = %key.key,
                    error = %err,
                    "quarantining undecodable entry"
                );
                match edge
                    .quarantine_offloaded(key.clone(), entry.metadata.sequence)
                    .await
                {
                    Ok(true) => self.metrics.incr(counters::QUARANTINED_ENTRIES),
                    Ok(false) => {}
                    Err(e) => self.observe_error(edge, &e),
                }
                ReadAttempt::Corrupt
            }
        }
    }

    fn spawn_backfill(self: &Arc<Self>, primary: Arc<EdgeNode>, key: CacheKey, entry: CacheEntry) {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            match svc
                .write_edge(&primary, key, entry.payload, entry.metadata, WriteMode::Replicated)
                .await
            {
                Ok(_) => svc.metrics.incr(counters::BACKFILLS),
                Err(e) => tracing::debug!(edge = %primary.id(), error = %e, "backfill failed"),
            }
        });
    }

    // ===== Streams =====

    /// Attach a sink to an edge's channel for a kind.
    pub fn subscribe(&self, edge_id: &str, kind: &str, sink: Arc<dyn StreamSink>) -> Result<Uuid> {
        let edge = self
            .edge(edge_id)
            .ok_or_else(|| FabricError::InvalidInput(format!("unknown edge {}", edge_id)))?;
        let kind = parse_kind(kind)?;

        let status = self.effective_status(edge);
        if status == EdgeStatus::Disabled {
            return Err(FabricError::EdgeUnavailable {
                edge_id: edge_id.to_string(),
                status: status.to_string(),
            });
        }

        let channel_id = edge.channels().subscribe(kind.clone(), sink);
        self.streams.register(channel_id, edge_id, kind.clone());
        tracing::debug!(edge = %edge_id, kind = %kind, channel = %channel_id, "channel opened");
        Ok(channel_id)
    }

    /// Detach a channel; false when it was already gone.
    pub fn unsubscribe(&self, channel_id: Uuid) -> bool {
        let Some(channel) = self.streams.remove(&channel_id) else {
            return false;
        };
        let removed = self
            .edge(&channel.edge_id)
            .map(|e| e.channels().unsubscribe(channel_id))
            .unwrap_or(false);
        tracing::debug!(edge = %channel.edge_id, channel = %channel_id, "channel closed");
        removed
    }

    /// Close every channel of every edge.
    pub fn close_streams(&self) -> usize {
        let mut closed = 0;
        for edge in &self.edges {
            for channel_id in edge.channels().close_all() {
                self.streams.remove(&channel_id);
                closed += 1;
            }
        }
        closed
    }

    // ===== Topology & Status =====

    pub fn topology_view(&self) -> TopologyView {
        let regions = self
            .topology
            .regions()
            .iter()
            .map(|r| RegionView {
                id: r.id.clone(),
                name: r.name.clone(),
                latitude: r.latitude,
                longitude: r.longitude,
                capacity: r.capacity,
                status: self.region_status(&r.id).unwrap_or(RegionStatus::Active),
                edges: self
                    .topology
                    .edges_in_region(&r.id)
                    .filter_map(|p| self.edge(&p.id))
                    .map(|e| e.view())
                    .collect(),
            })
            .collect();

        TopologyView {
            fallback_edge: self.topology.fallback_edge().to_string(),
            regions,
        }
    }

    /// Operator status change; returns the previous status.
    pub fn set_edge_status(&self, edge_id: &str, status: EdgeStatus) -> Result<EdgeStatus> {
        let edge = self
            .edge(edge_id)
            .ok_or_else(|| FabricError::InvalidInput(format!("unknown edge {}", edge_id)))?;
        self.health.release(edge_id);
        let previous = edge.set_status(status);
        tracing::info!(edge = %edge_id, from = %previous, to = %status, "edge status changed");
        Ok(previous)
    }

    /// Operator status change of a region; returns the previous status.
    ///
    /// At least one region stays active.
    pub fn set_region_status(&self, region_id: &str, status: RegionStatus) -> Result<RegionStatus> {
        let _guard = self.region_lock.lock();
        let cell = self
            .region_status
            .get(region_id)
            .ok_or_else(|| FabricError::InvalidInput(format!("unknown region {}", region_id)))?;
        let previous = EdgeStatus::from_u8(cell.load(Ordering::SeqCst));

        if status != RegionStatus::Active && previous == RegionStatus::Active {
            let others_active = self.region_status.iter().any(|(id, s)| {
                id != region_id && EdgeStatus::from_u8(s.load(Ordering::SeqCst)) == RegionStatus::Active
            });
            if !others_active {
                return Err(FabricError::InvalidInput(format!(
                    "region {} is the last active region",
                    region_id
                )));
            }
        }

        cell.store(status.as_u8(), Ordering::SeqCst);
        tracing::info!(region = %region_id, from = %previous, to = %status, "region status changed");
        Ok(previous)
    }

    // ===== Maintenance =====

    /// Apply up to a batch of queued items per kind to one edge of each
    /// target region.
    pub async fn drain_propagation(&self) -> DrainReport {
        let mut report = DrainReport::default();

        for kind in self.queues.kinds() {
            for item in self.queues.drain(&kind, self.settings.propagation_batch_size) {
                report.drained += 1;
                self.metrics.incr(counters::PROPAGATION_DRAINED);

                let Some(edge) = self.representative_edge(&item.target_region) else {
                    report.failed += 1;
                    self.metrics.incr(counters::PROPAGATION_FAILED);
                    tracing::debug!(region = %item.target_region, "no writable edge for propagation");
                    continue;
                };

                match self
                    .write_edge(&edge, item.key, item.payload, item.metadata, WriteMode::Replicated)
                    .await
                {
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        report.failed += 1;
                        self.metrics.incr(counters::PROPAGATION_FAILED);
                        tracing::debug!(edge = %edge.id(), error = %e, "propagation write failed");
                    }
                }
            }
        }

        if report.drained > 0 {
            tracing::debug!(
                drained = report.drained,
                applied = report.applied,
                failed = report.failed,
                "propagation drained"
            );
        }
        report
    }

    /// Lowest-id edge of a region that accepts writes.
    fn representative_edge(&self, region_id: &str) -> Option<Arc<EdgeNode>> {
        self.topology
            .edges_in_region(region_id)
            .filter_map(|p| self.edge(&p.id))
            .find(|e| self.effective_status(e) != EdgeStatus::Disabled)
            .cloned()
    }

    /// Drop expired entries on every edge; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut removed = 0;
        for edge in &self.edges {
            match edge.expire_offloaded(now).await {
                Ok(n) => removed += n,
                Err(e) => self.observe_error(edge, &e),
            }
        }
        if removed > 0 {
            self.metrics.add(counters::EXPIRED_ENTRIES, removed as u64);
            tracing::debug!(removed, "expired entries swept");
        }
        removed
    }

    pub fn evaluate_health(&self) -> Vec<HealthTransition> {
        self.health.evaluate(&self.edges, self.clock.now_ms())
    }

    /// Latest published snapshot.
    pub fn metrics(&self) -> Arc<MetricsSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Rebuild and publish the metrics snapshot.
    pub fn refresh_metrics(&self) -> Arc<MetricsSnapshot> {
        let snapshot = Arc::new(self.build_snapshot());
        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    fn build_snapshot(&self) -> MetricsSnapshot {
        let regions = self
            .topology
            .regions()
            .iter()
            .map(|r| {
                let latencies: Vec<f64> = self
                    .topology
                    .edges_in_region(&r.id)
                    .filter_map(|p| self.edge(&p.id))
                    .map(|e| e.rolling_latency_ms())
                    .collect();
                let avg_latency_ms = match latencies.len() {
                    0 => 0.0,
                    n => latencies.iter().sum::<f64>() / n as f64,
                };
                RegionMetrics {
                    region_id: r.id.clone(),
                    status: self.region_status(&r.id).unwrap_or(RegionStatus::Active),
                    avg_latency_ms,
                    edges: latencies.len(),
                }
            })
            .collect();

        let mut stored = 0u64;
        let mut original = 0u64;
        let edges = self
            .edges
            .iter()
            .map(|e| {
                let (s, o) = e.compression_totals();
                stored += s;
                original += o;
                let stats = self.metrics.edge_stats(e.id());
                EdgeMetrics {
                    edge_id: e.id().to_string(),
                    status: e.status(),
                    cache_bytes: e.cache_bytes(),
                    entries: e.entry_count(),
                    current_connections: e.current_connections(),
                    writes_ok: stats.writes_ok,
                    writes_failed: stats.writes_failed,
                    timeouts: stats.timeouts,
                    error_rate: self.health.error_rate(e.id()),
                }
            })
            .collect::<Vec<_>>();

        let counters: BTreeMap<String, u64> = self
            .metrics
            .counters()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        MetricsSnapshot {
            generated_at_ms: self.clock.now_ms(),
            regions,
            kinds: self.metrics.kind_stats(),
            compression_ratio: if original == 0 {
                1.0
            } else {
                stored as f64 / original as f64
            },
            active_channels: self.edges.iter().map(|e| e.channels().total()).sum(),
            total_cache_bytes: edges.iter().map(|e| e.cache_bytes).sum(),
            total_connections: edges.iter().map(|e| e.current_connections as u64).sum(),
            propagation_pending: self.queues.total_len(),
            counters,
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{ChannelSink, DashMapMetricsStore, ManualClock};
    use crate::domain::entities::{EdgeSpec, Region};
    use serde_json::json;

    fn region(id: &str, lat: f64, lon: f64, edges: &[&str]) -> Region {
        Region {
            id: id.to_string(),
            name: id.to_string(),
            latitude: lat,
            longitude: lon,
            capacity: 200,
            edges: edges
                .iter()
                .map(|e| EdgeSpec {
                    id: e.to_string(),
                    max_connections: 100,
                })
                .collect(),
        }
    }

    fn small_topology() -> Topology {
        Topology::new(
            vec![
                region("us-east", 39.04, -77.49, &["us-east-a", "us-east-b"]),
                region("eu-west", 53.35, -6.26, &["eu-west-a", "eu-west-b"]),
                region("ap-northeast", 35.68, 139.69, &["ap-northeast-a"]),
            ],
            Some("us-east-a".to_string()),
        )
        .unwrap()
    }

    struct Harness {
        service: Arc<FabricService>,
        metrics: Arc<DashMapMetricsStore>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: Config) -> Harness {
        let metrics = Arc::new(DashMapMetricsStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let service = Arc::new(FabricService::new(
            &config,
            small_topology(),
            metrics.clone(),
            clock.clone(),
        ));
        Harness {
            service,
            metrics,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    fn near_us_east() -> Option<Coordinate> {
        Some(Coordinate::new(40.7, -74.0))
    }

    fn cached_on(h: &Harness, edge_id: &str, kind: DataKind, key: &str) -> bool {
        h.service.edge(edge_id).unwrap().contains(&CacheKey::new(kind, key))
    }

    // ===== Distribute Tests =====

    #[tokio::test]
    async fn test_push_all_reaches_every_edge() {
        let h = harness();
        let result = h
            .service
            .distribute("market_prices", Some("BTCUSD"), &json!([1.5]), DistributeOptions::default())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.strategy, Strategy::PushAll);
        assert_eq!(result.edges_updated, 5);
        assert!(result.errors.is_empty());
        for edge in h.service.edges() {
            assert!(edge.contains(&CacheKey::new(DataKind::MarketPrices, "BTCUSD")));
        }
    }

    #[tokio::test]
    async fn test_missing_key_uses_default() {
        let h = harness();
        let result = h
            .service
            .distribute("market_prices", None, &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.key, DEFAULT_KEY);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let h = harness();
        let value = json!([1.0]);

        let empty_kind = h
            .service
            .distribute("", Some("k"), &value, DistributeOptions::default())
            .await;
        assert!(matches!(empty_kind, Err(FabricError::InvalidInput(_))));

        let empty_key = h
            .service
            .distribute("market_prices", Some("  "), &value, DistributeOptions::default())
            .await;
        assert!(matches!(empty_key, Err(FabricError::InvalidInput(_))));

        let zero_ttl = h
            .service
            .distribute(
                "market_prices",
                Some("k"),
                &value,
                DistributeOptions {
                    ttl_ms: Some(0),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(zero_ttl, Err(FabricError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unknown_kind_counted() {
        let h = harness();
        let result = h
            .service
            .distribute("weather", Some("paris"), &json!({"t": 21}), DistributeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.codec, CodecId::Identity);
        assert_eq!(result.strategy, Strategy::Intelligent);
        assert_eq!(h.metrics.counter(counters::UNKNOWN_KIND_WRITES), 1);
    }

    #[tokio::test]
    async fn test_disabled_edge_reported_in_errors() {
        let h = harness();
        h.service.set_edge_status("eu-west-b", EdgeStatus::Disabled).unwrap();

        let result = h
            .service
            .distribute("market_prices", Some("k"), &json!([2.0]), DistributeOptions::default())
            .await
            .unwrap();

        assert_eq!(result.edges_updated, 4);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].edge_id, "eu-west-b");
        assert!(result.errors[0].retriable);
    }

    #[tokio::test]
    async fn test_all_edges_disabled_fails_distribution() {
        let h = harness();
        for edge in h.service.edges().to_vec() {
            h.service.set_edge_status(edge.id(), EdgeStatus::Disabled).unwrap();
        }

        let err = h
            .service
            .distribute("market_prices", Some("k"), &json!([2.0]), DistributeOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        match err {
            FabricError::DistributionFailed { errors, .. } => assert_eq!(errors.len(), 5),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_origin_lazy_writes_origin_and_enqueues() {
        let h = harness();
        let result = h
            .service
            .distribute(
                "agent_positions",
                Some("grid"),
                &json!({"agents": [{"x": 1.25}]}),
                DistributeOptions {
                    origin_region: Some("eu-west".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result.strategy, Strategy::OriginLazy);
        assert_eq!(result.updated_edges, vec!["eu-west-a", "eu-west-b"]);
        assert_eq!(result.propagation_enqueued, 2);
        assert!(!cached_on(&h, "us-east-a", DataKind::AgentPositions, "grid"));

        let report = h.service.drain_propagation().await;
        assert_eq!(report.applied, 2);
        assert!(cached_on(&h, "us-east-a", DataKind::AgentPositions, "grid"));
        assert!(!cached_on(&h, "us-east-b", DataKind::AgentPositions, "grid"));
        assert!(cached_on(&h, "ap-northeast-a", DataKind::AgentPositions, "grid"));
    }

    #[tokio::test]
    async fn test_origin_lazy_replicas_keep_write_time() {
        let h = harness();
        h.service
            .distribute(
                "economic_indicators",
                Some("cpi"),
                &json!({"value": 3.1}),
                DistributeOptions {
                    origin_region: Some("us-east".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let origin_time = h
            .service
            .edge("us-east-a")
            .unwrap()
            .peek(&CacheKey::new(DataKind::EconomicIndicators, "cpi"))
            .unwrap()
            .metadata
            .write_time_ms;

        h.clock.advance(500);
        h.service.drain_propagation().await;

        let replica = h
            .service
            .edge("eu-west-a")
            .unwrap()
            .peek(&CacheKey::new(DataKind::EconomicIndicators, "cpi"))
            .unwrap();
        assert_eq!(replica.metadata.write_time_ms, origin_time);
    }

    #[tokio::test]
    async fn test_origin_lazy_unknown_region() {
        let h = harness();
        let err = h
            .service
            .distribute(
                "agent_positions",
                Some("grid"),
                &json!({}),
                DistributeOptions {
                    origin_region: Some("mars".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_propagation_overflow_drops_oldest() {
        let mut config = Config::default();
        config.propagation_queue_capacity = 2;
        let h = harness_with(config);

        for i in 0..3 {
            h.service
                .distribute(
                    "agent_positions",
                    Some(&format!("grid-{}", i)),
                    &json!({"n": i}),
                    DistributeOptions {
                        origin_region: Some("us-east".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(h.service.pending_propagation(), 2);
        assert_eq!(h.metrics.counter(counters::PROPAGATION_DROPPED), 4);
    }

    #[tokio::test]
    async fn test_intelligent_prefers_subscribed_edges() {
        let mut config = Config::default();
        config.intelligent_sync_fanout = 1;
        let h = harness_with(config);
        let (sink, _rx) = ChannelSink::bounded(8);
        h.service
            .subscribe("ap-northeast-a", "order_book", Arc::new(sink))
            .unwrap();

        let result = h
            .service
            .distribute(
                "order_book",
                Some("BTCUSD"),
                &json!({"bids": [[100.0, 1.0]], "asks": [[101.0, 2.0]]}),
                DistributeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.strategy, Strategy::Intelligent);
        assert_eq!(result.updated_edges, vec!["ap-northeast-a"]);
        assert_eq!(result.background_writes, 4);
    }

    #[tokio::test]
    async fn test_late_background_write_keeps_newer_value() {
        let mut config = Config::default();
        config.intelligent_sync_fanout = 1;
        let h = harness_with(config);
        let older = json!([1, 1, 1, 1, 1, 1, 1, 1]);
        let newer = json!([2, 2, 2, 2, 2, 2, 2, 2]);

        // Background writes of the first call are spawned but cannot run yet
        let first = h
            .service
            .distribute("trade_volumes", Some("vol"), &older, DistributeOptions::default())
            .await
            .unwrap();
        assert_eq!(first.strategy, Strategy::Intelligent);
        assert_eq!(first.background_writes, 4);

        // Apply the newer write to every edge on its own runtime while this
        // runtime is blocked
        let service = Arc::clone(&h.service);
        let newer_value = newer.clone();
        let second = std::thread::spawn(move || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(service.distribute(
                    "trade_volumes",
                    Some("vol"),
                    &newer_value,
                    DistributeOptions {
                        strategy: Some(Strategy::PushAll),
                        ..Default::default()
                    },
                ))
        })
        .join()
        .unwrap()
        .unwrap();
        assert!(second.sequence > first.sequence);
        assert_eq!(second.edges_updated, 5);

        // Now the older background writes land
        for _ in 0..100 {
            if h.metrics.counter(counters::SUPERSEDED_WRITES) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.metrics.counter(counters::SUPERSEDED_WRITES), 4);

        let key = CacheKey::new(DataKind::TradeVolumes, "vol");
        for edge in h.service.edges() {
            assert_eq!(edge.peek(&key).unwrap().metadata.sequence, second.sequence);
        }
        let read = h.service.get("trade_volumes", "vol", near_us_east()).await.unwrap();
        assert_eq!(read.value, newer);
    }

    #[tokio::test]
    async fn test_late_propagation_replica_keeps_newer_value() {
        let h = harness();
        let origin_lazy = DistributeOptions {
            strategy: Some(Strategy::OriginLazy),
            origin_region: Some("eu-west".to_string()),
            ..Default::default()
        };
        h.service
            .distribute("economic_indicators", Some("cpi"), &json!({"v": 1}), origin_lazy)
            .await
            .unwrap();
        let push_all = DistributeOptions {
            strategy: Some(Strategy::PushAll),
            ..Default::default()
        };
        h.service
            .distribute("economic_indicators", Some("cpi"), &json!({"v": 2}), push_all)
            .await
            .unwrap();

        // Replicas of the first write are applied after the second
        let report = h.service.drain_propagation().await;
        assert_eq!(report.applied, 2);
        assert_eq!(h.metrics.counter(counters::SUPERSEDED_WRITES), 2);

        for coord in [near_us_east(), Some(Coordinate::new(35.6, 139.7))] {
            let read = h.service.get("economic_indicators", "cpi", coord).await.unwrap();
            assert_eq!(read.value, json!({"v": 2}));
        }
    }

    #[tokio::test]
    async fn test_strategy_override() {
        let h = harness();
        let result = h
            .service
            .distribute(
                "market_prices",
                Some("k"),
                &json!([1.0]),
                DistributeOptions {
                    strategy: Some(Strategy::OriginLazy),
                    origin_region: Some("ap-northeast".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.updated_edges, vec!["ap-northeast-a"]);
    }

    // ===== Get Tests =====

    #[tokio::test]
    async fn test_get_primary_hit() {
        let h = harness();
        let value = json!([64123.5]);
        h.service
            .distribute("market_prices", Some("BTCUSD"), &value, DistributeOptions::default())
            .await
            .unwrap();

        let result = h
            .service
            .get("market_prices", "BTCUSD", near_us_east())
            .await
            .unwrap();
        assert_eq!(result.source, ReadSource::Primary);
        assert_eq!(result.edge_id, "us-east-a");
        assert_eq!(result.served_by, "us-east-a");
        assert_eq!(result.value, value);
        assert_eq!(h.metrics.kind_stats()[0].hits, 1);
    }

    #[tokio::test]
    async fn test_get_fallback_and_backfill() {
        let h = harness();
        h.service
            .distribute(
                "agent_positions",
                Some("grid"),
                &json!({"n": 1}),
                DistributeOptions {
                    origin_region: Some("eu-west".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = h
            .service
            .get("agent_positions", "grid", near_us_east())
            .await
            .unwrap();
        assert_eq!(result.source, ReadSource::Fallback);
        assert_eq!(result.edge_id, "us-east-a");
        assert!(result.served_by.starts_with("eu-west"));

        for _ in 0..50 {
            if cached_on(&h, "us-east-a", DataKind::AgentPositions, "grid") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(cached_on(&h, "us-east-a", DataKind::AgentPositions, "grid"));

        let again = h
            .service
            .get("agent_positions", "grid", near_us_east())
            .await
            .unwrap();
        assert_eq!(again.source, ReadSource::Primary);
        assert_eq!(again.write_time_ms, result.write_time_ms);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let h = harness();
        let err = h
            .service
            .get("market_prices", "NOPE", near_us_east())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NotFound { .. }));
        assert_eq!(h.metrics.kind_stats()[0].not_found, 1);
    }

    #[tokio::test]
    async fn test_get_after_ttl_is_not_found() {
        let h = harness();
        h.service
            .distribute(
                "market_prices",
                Some("k"),
                &json!([1.0]),
                DistributeOptions {
                    ttl_ms: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        h.clock.advance(101);
        let err = h.service.get("market_prices", "k", near_us_east()).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_without_coordinates_uses_fallback_edge() {
        let h = harness();
        h.service
            .distribute("market_prices", Some("k"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();

        let result = h.service.get("market_prices", "k", None).await.unwrap();
        assert_eq!(result.edge_id, "us-east-a");
        assert_eq!(h.metrics.counter(counters::INVALID_COORDINATES), 1);

        let invalid = Some(Coordinate::new(120.0, 0.0));
        h.service.get("market_prices", "k", invalid).await.unwrap();
        assert_eq!(h.metrics.counter(counters::INVALID_COORDINATES), 2);
    }

    #[tokio::test]
    async fn test_get_quarantines_corrupt_entry() {
        let h = harness();
        let key = CacheKey::new(DataKind::MarketPrices, "bad");
        let edge = h.service.edge("us-east-a").unwrap().clone();
        edge.write(
            key.clone(),
            Bytes::from_static(b"{not json"),
            EntryMetadata {
                kind: DataKind::MarketPrices,
                write_time_ms: 1_000_000,
                ttl_ms: 10_000,
                compressed: false,
                codec: CodecId::Identity,
                original_size: 9,
                stored_size: 9,
                sequence: 1,
                checksum: crc32fast::hash(b"{not json"),
            },
            WriteMode::Fresh,
            1_000_000,
            false,
        )
        .unwrap();

        let err = h.service.get("market_prices", "bad", near_us_east()).await.unwrap_err();
        assert!(matches!(err, FabricError::DecodingFailed(_)));
        assert!(!edge.contains(&key));
        assert_eq!(h.metrics.counter(counters::QUARANTINED_ENTRIES), 1);
    }

    #[tokio::test]
    async fn test_degraded_primary_is_skipped() {
        let h = harness();
        h.service.set_edge_status("us-east-a", EdgeStatus::Degraded).unwrap();
        assert_eq!(h.service.primary_edge(near_us_east()).unwrap(), "us-east-b");

        h.service.set_region_status("us-east", RegionStatus::Degraded).unwrap();
        assert!(h.service.primary_edge(near_us_east()).unwrap().starts_with("eu-west"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_saturated_selection_logged_and_counted() {
        let topology = Topology::new(
            vec![Region {
                id: "solo".to_string(),
                name: "solo".to_string(),
                latitude: 0.0,
                longitude: 0.0,
                capacity: 1,
                edges: vec![EdgeSpec {
                    id: "solo-a".to_string(),
                    max_connections: 1,
                }],
            }],
            None,
        )
        .unwrap();
        let metrics = Arc::new(DashMapMetricsStore::new());
        let service = Arc::new(FabricService::new(
            &Config::default(),
            topology,
            metrics.clone(),
            Arc::new(ManualClock::new(0)),
        ));

        let _held = service.edge("solo-a").unwrap().connect();
        let primary = service.primary_edge(Some(Coordinate::new(1.0, 1.0))).unwrap();

        assert_eq!(primary, "solo-a");
        assert_eq!(metrics.counter(counters::SATURATED_SELECTIONS), 1);
        assert!(logs_contain("every active edge is saturated"));
    }

    #[tokio::test]
    async fn test_get_with_every_edge_degraded_reads_nearest() {
        let h = harness();
        h.service
            .distribute("market_prices", Some("BTC"), &json!([1.0, 2.0, 3.0]), DistributeOptions::default())
            .await
            .unwrap();

        let ids: Vec<String> = h.service.edges().iter().map(|e| e.id().to_string()).collect();
        for id in &ids {
            h.service.set_edge_status(id, EdgeStatus::Degraded).unwrap();
        }

        let read = h.service.get("market_prices", "BTC", near_us_east()).await.unwrap();
        assert_eq!(read.source, ReadSource::Primary);
        assert_eq!(read.edge_id, "us-east-a");
        assert_eq!(read.value, json!([1.0, 2.0, 3.0]));
        assert_eq!(h.metrics.counter(counters::DEGRADED_SELECTIONS), 1);

        for id in &ids {
            h.service.set_edge_status(id, EdgeStatus::Disabled).unwrap();
        }
        let err = h.service.get("market_prices", "BTC", near_us_east()).await.unwrap_err();
        assert!(matches!(err, FabricError::EdgeUnavailable { .. }));
    }

    // ===== Stream Tests =====

    #[tokio::test]
    async fn test_subscribe_receives_push() {
        let h = harness();
        let (sink, mut rx) = ChannelSink::bounded(8);
        let channel = h
            .service
            .subscribe("us-east-a", "market_prices", Arc::new(sink))
            .unwrap();
        assert_eq!(h.service.open_channels(), 1);

        h.service
            .distribute("market_prices", Some("BTCUSD"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();

        let record = rx.try_recv().unwrap();
        assert_eq!(record.edge_id, "us-east-a");
        assert_eq!(record.key, "BTCUSD");

        assert!(h.service.unsubscribe(channel));
        assert!(!h.service.unsubscribe(channel));
        assert_eq!(h.service.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_push_disabled_delivers_nothing() {
        let mut config = Config::default();
        config.push_enabled = false;
        let h = harness_with(config);
        let (sink, mut rx) = ChannelSink::bounded(8);
        h.service
            .subscribe("us-east-a", "market_prices", Arc::new(sink))
            .unwrap();

        h.service
            .distribute("market_prices", Some("k"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_removes_channel() {
        let h = harness();
        let (sink, rx) = ChannelSink::bounded(8);
        h.service
            .subscribe("us-east-a", "market_prices", Arc::new(sink))
            .unwrap();
        drop(rx);

        h.service
            .distribute("market_prices", Some("k"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();

        assert_eq!(h.service.open_channels(), 0);
        assert_eq!(h.metrics.counter(counters::SINKS_REMOVED), 1);
    }

    #[test]
    fn test_subscribe_validation() {
        let h = harness();
        let (sink, _rx) = ChannelSink::bounded(8);
        let sink: Arc<dyn StreamSink> = Arc::new(sink);

        assert!(matches!(
            h.service.subscribe("nowhere", "market_prices", sink.clone()),
            Err(FabricError::InvalidInput(_))
        ));

        h.service.set_edge_status("us-east-b", EdgeStatus::Disabled).unwrap();
        assert!(matches!(
            h.service.subscribe("us-east-b", "market_prices", sink),
            Err(FabricError::EdgeUnavailable { .. })
        ));
    }

    // ===== Status Tests =====

    #[test]
    fn test_last_active_region_protected() {
        let h = harness();
        h.service.set_region_status("us-east", RegionStatus::Disabled).unwrap();
        h.service.set_region_status("eu-west", RegionStatus::Degraded).unwrap();

        let err = h
            .service
            .set_region_status("ap-northeast", RegionStatus::Disabled)
            .unwrap_err();
        assert!(matches!(err, FabricError::InvalidInput(_)));

        let previous = h
            .service
            .set_region_status("us-east", RegionStatus::Active)
            .unwrap();
        assert_eq!(previous, RegionStatus::Disabled);
    }

    #[tokio::test]
    async fn test_disabled_region_rejects_writes() {
        let h = harness();
        h.service.set_region_status("ap-northeast", RegionStatus::Disabled).unwrap();

        let result = h
            .service
            .distribute("market_prices", Some("k"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.edges_updated, 4);
        assert_eq!(result.errors[0].edge_id, "ap-northeast-a");
    }

    #[test]
    fn test_unknown_edge_status_change() {
        let h = harness();
        assert!(h.service.set_edge_status("nowhere", EdgeStatus::Active).is_err());
        assert!(h.service.set_region_status("nowhere", RegionStatus::Active).is_err());
    }

    #[test]
    fn test_topology_view() {
        let h = harness();
        let view = h.service.topology_view();
        assert_eq!(view.fallback_edge, "us-east-a");
        assert_eq!(view.regions.len(), 3);
        assert_eq!(view.regions[0].edges.len(), 2);
    }

    // ===== Maintenance Tests =====

    #[tokio::test]
    async fn test_sweep_expired() {
        let h = harness();
        h.service
            .distribute(
                "market_prices",
                Some("k"),
                &json!([1.0]),
                DistributeOptions {
                    ttl_ms: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(h.service.sweep_expired().await, 0);
        h.clock.advance(51);
        assert_eq!(h.service.sweep_expired().await, 5);
        assert_eq!(h.metrics.counter(counters::EXPIRED_ENTRIES), 5);
    }

    #[tokio::test]
    async fn test_refresh_metrics_snapshot() {
        let h = harness();
        h.service
            .distribute("market_prices", Some("k"), &json!([1.0]), DistributeOptions::default())
            .await
            .unwrap();
        h.service.get("market_prices", "k", near_us_east()).await.unwrap();

        // Published snapshot is stale until refreshed
        assert_eq!(h.service.metrics().total_cache_bytes, 0);

        let snapshot = h.service.refresh_metrics();
        assert!(snapshot.total_cache_bytes > 0);
        assert_eq!(snapshot.regions.len(), 3);
        assert_eq!(snapshot.kind("market_prices").unwrap().hits, 1);
        assert!(snapshot.region("us-east").unwrap().avg_latency_ms >= 0.0);
        assert!(snapshot.compression_ratio <= 1.0);
        assert_eq!(h.service.metrics().generated_at_ms, snapshot.generated_at_ms);
    }
}
