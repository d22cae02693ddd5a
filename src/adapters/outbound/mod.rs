mod channel_sink;
mod clock;
mod dashmap_metrics_store;

pub use channel_sink::ChannelSink;
pub use clock::{ManualClock, SystemClock};
pub use dashmap_metrics_store::DashMapMetricsStore;
