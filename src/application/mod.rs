//! Application Layer
//!
//! Use cases of the fabric, orchestrating domain services and edges.

mod fabric_service;
mod maintenance;
mod snapshot;

pub use fabric_service::{
    DistributeOptions, DistributeResult, DrainReport, FabricService, FabricSettings, GetResult,
    RegionView, TopologyView, DEFAULT_KEY,
};
pub use maintenance::{spawn_maintenance, MaintenanceIntervals};
pub use snapshot::{EdgeMetrics, MetricsSnapshot, RegionMetrics};
