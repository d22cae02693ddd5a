//! Stream Sink Port
//!
//! Delivery target for push subscriptions.

use crate::domain::entities::StreamRecord;

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The bounded buffer is full (slow consumer)
    #[error("sink buffer full")]
    Full,
    /// The receiving side is gone
    #[error("sink closed")]
    Closed,
}

/// A bounded, non-blocking delivery target.
///
/// Implementations must never block the caller; a refused delivery
/// causes the channel to be removed.
pub trait StreamSink: Send + Sync {
    fn try_deliver(&self, record: StreamRecord) -> Result<(), SinkError>;
}
