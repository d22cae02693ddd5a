//! Infrastructure Layer
//!
//! Edge caches, stream channels, propagation queues and the background
//! machinery that keeps them healthy.

pub mod edge_node;
pub mod health_monitor;
pub mod propagation;
pub mod shutdown;
pub mod stream_registry;

pub use edge_node::{
    EdgeConnection, EdgeNode, EdgeNodeConfig, EdgeView, Lookup, WriteMode, WriteReport,
    LATENCY_EMA_ALPHA,
};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig, HealthTransition};
pub use propagation::PropagationQueues;
pub use shutdown::{shutdown_signal, SessionGuard, ShutdownController};
pub use stream_registry::{ChannelRef, EdgeChannels, PublishGate, PublishReport, StreamRegistry};
