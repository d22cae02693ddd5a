//! edge-fabric Library
//!
//! Global edge distribution core: geo-routed edge caches with
//! domain-specific compression, strategy-driven distribution, peer
//! fallback reads and per-edge push streams.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{DistributeOptions, DistributeResult, FabricService, GetResult, MetricsSnapshot};
pub use config::{load_config, load_topology, Config};
pub use domain::entities::{CacheKey, Region, StreamRecord};
pub use domain::error::{FabricError, Result};
pub use domain::ports::{Clock, MetricsStore, StreamSink};
pub use domain::services::{CodecRegistry, Topology};
pub use domain::value_objects::{Coordinate, DataKind, EdgeStatus, ReadSource, RegionStatus, Strategy};
