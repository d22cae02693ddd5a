mod clock;
mod metrics_store;
mod stream_sink;

pub use clock::Clock;
pub use metrics_store::{counters, EdgeOpStats, KindStats, MetricsStore};
pub use stream_sink::{SinkError, StreamSink};
