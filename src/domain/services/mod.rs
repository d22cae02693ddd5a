mod codec;
mod planner;
mod topology;

pub use codec::{CodecRegistry, EncodedPayload, DEFAULT_PRECISION, MAX_PRECISION};
pub use planner::{DistributionPlanner, EdgeCandidate, IntelligentPlan};
pub use topology::{
    estimate_bandwidth_mbps, estimate_latency_ms, haversine_km, EdgeLoad, EdgePlacement,
    PrimarySelection, Topology, EARTH_RADIUS_KM,
};
