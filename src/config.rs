use crate::domain::entities::{Region, RegionLink};
use crate::domain::services::{CodecRegistry, Topology};
use crate::domain::value_objects::DataKind;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

const ENV_PREFIX: &str = "EDGE_FABRIC_";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Server
    pub api_listen_addr: String,
    pub debug: bool,
    pub topology_path: Option<String>,

    // Cache
    pub max_cache_bytes_per_edge: u64,
    pub default_ttl_ms: u64,
    pub eviction_target_fraction: f64,
    pub compression_precision: HashMap<DataKind, u32>,

    // Maintenance cadences
    pub propagation_drain_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub expiry_sweep_interval_ms: u64,

    // Distribution
    pub push_enabled: bool,
    pub fallback_peer_limit: usize,
    pub propagation_queue_capacity: usize,
    pub propagation_batch_size: usize,
    pub operation_timeout_ms: u64,
    pub intelligent_sync_fanout: usize,
    pub stream_buffer_capacity: usize,

    // Health
    pub health_error_threshold: f64,
    pub health_window_ms: u64,
    pub health_min_samples: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_listen_addr: "0.0.0.0:8090".to_string(),
            debug: false,
            topology_path: None,
            max_cache_bytes_per_edge: 2 * 1024 * 1024 * 1024,
            default_ttl_ms: 30_000,
            eviction_target_fraction: 0.20,
            compression_precision: CodecRegistry::default_precision(),
            propagation_drain_interval_ms: 1_000,
            metrics_interval_ms: 5_000,
            expiry_sweep_interval_ms: 30_000,
            push_enabled: true,
            fallback_peer_limit: 3,
            propagation_queue_capacity: 10_000,
            propagation_batch_size: 256,
            operation_timeout_ms: 250,
            intelligent_sync_fanout: 5,
            stream_buffer_capacity: 256,
            health_error_threshold: 0.5,
            health_window_ms: 10_000,
            health_min_samples: 10,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

/// Parse a variable, keeping the default when it is unset or unparsable.
fn parsed<T: FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(name: &str, default: bool) -> bool {
    var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Parse `kind=places,kind=places`; malformed pairs are skipped.
fn parse_precision(raw: &str) -> HashMap<DataKind, u32> {
    let mut precision = CodecRegistry::default_precision();
    for pair in raw.split(',') {
        let Some((kind, places)) = pair.split_once('=') else {
            continue;
        };
        if let (Some(kind), Ok(places)) = (DataKind::parse(kind), places.trim().parse::<u32>()) {
            precision.insert(kind, places);
        }
    }
    precision
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let fraction = parsed("EVICTION_TARGET_FRACTION", defaults.eviction_target_fraction);
    let eviction_target_fraction = if fraction > 0.0 && fraction <= 1.0 {
        fraction
    } else {
        defaults.eviction_target_fraction
    };

    Ok(Config {
        api_listen_addr: var("API_LISTEN_ADDR").unwrap_or(defaults.api_listen_addr),
        debug: std::env::var("DEBUG").is_ok(),
        topology_path: var("TOPOLOGY_PATH"),
        max_cache_bytes_per_edge: parsed("MAX_CACHE_BYTES_PER_EDGE", defaults.max_cache_bytes_per_edge),
        default_ttl_ms: parsed("DEFAULT_TTL_MS", defaults.default_ttl_ms),
        eviction_target_fraction,
        compression_precision: var("COMPRESSION_PRECISION")
            .map(|raw| parse_precision(&raw))
            .unwrap_or(defaults.compression_precision),
        propagation_drain_interval_ms: parsed(
            "PROPAGATION_DRAIN_INTERVAL_MS",
            defaults.propagation_drain_interval_ms,
        ),
        metrics_interval_ms: parsed("METRICS_INTERVAL_MS", defaults.metrics_interval_ms),
        expiry_sweep_interval_ms: parsed("EXPIRY_SWEEP_INTERVAL_MS", defaults.expiry_sweep_interval_ms),
        push_enabled: flag("PUSH_ENABLED", defaults.push_enabled),
        fallback_peer_limit: parsed("FALLBACK_PEER_LIMIT", defaults.fallback_peer_limit),
        propagation_queue_capacity: parsed(
            "PROPAGATION_QUEUE_CAPACITY",
            defaults.propagation_queue_capacity,
        ),
        propagation_batch_size: parsed("PROPAGATION_BATCH_SIZE", defaults.propagation_batch_size),
        operation_timeout_ms: parsed("OPERATION_TIMEOUT_MS", defaults.operation_timeout_ms),
        intelligent_sync_fanout: parsed("INTELLIGENT_SYNC_FANOUT", defaults.intelligent_sync_fanout),
        stream_buffer_capacity: parsed("STREAM_BUFFER", defaults.stream_buffer_capacity),
        health_error_threshold: parsed("HEALTH_ERROR_THRESHOLD", defaults.health_error_threshold),
        health_window_ms: parsed("HEALTH_WINDOW_MS", defaults.health_window_ms),
        health_min_samples: parsed("HEALTH_MIN_SAMPLES", defaults.health_min_samples),
    })
}

/// On-disk topology description.
#[derive(Debug, Deserialize)]
pub struct TopologyFile {
    pub fallback_edge: Option<String>,
    pub regions: Vec<Region>,
    /// Declared region hop counts; undeclared pairs use distance buckets
    #[serde(default)]
    pub adjacency: Vec<RegionLink>,
}

/// Build the topology from the configured file, or the built-in default.
pub fn load_topology(config: &Config) -> anyhow::Result<Topology> {
    let Some(path) = &config.topology_path else {
        return Topology::new(Topology::default_regions(), None)
            .context("invalid built-in topology");
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file {}", path))?;
    let file: TopologyFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse topology file {}", path))?;

    Topology::new(file.regions, file.fallback_edge)
        .and_then(|topology| topology.with_adjacency(&file.adjacency))
        .with_context(|| format!("invalid topology in {}", path))
}
