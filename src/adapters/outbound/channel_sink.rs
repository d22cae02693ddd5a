//! Channel Sink
//!
//! StreamSink backed by a bounded tokio mpsc channel.

use crate::domain::entities::StreamRecord;
use crate::domain::ports::{SinkError, StreamSink};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Sink that hands records to a bounded channel without waiting.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamRecord>,
}

impl ChannelSink {
    /// Create a sink and its receiving end.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<StreamRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::Sender<StreamRecord>) -> Self {
        Self { tx }
    }
}

impl StreamSink for ChannelSink {
    fn try_deliver(&self, record: StreamRecord) -> Result<(), SinkError> {
        self.tx.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}
