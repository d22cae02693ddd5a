//! Stream Channel Registry
//!
//! Per-edge push subscriptions grouped by kind, plus a global index from
//! channel id to owning edge used by unsubscribe.

use crate::domain::entities::StreamRecord;
use crate::domain::ports::{SinkError, StreamSink};
use crate::domain::value_objects::DataKind;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

struct Channel {
    id: Uuid,
    sink: Arc<dyn StreamSink>,
}

#[derive(Default)]
struct KindChannels {
    channels: Vec<Channel>,
    /// Write time of the last record pushed for this kind
    watermark_ms: u64,
}

/// Outcome of pushing one record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Channels dropped because their sink refused the record
    pub removed: Vec<(Uuid, SinkError)>,
    /// Record was older than the last one pushed and was not delivered
    pub stale: bool,
}

/// Stream channels owned by one edge.
///
/// The inner lock doubles as the edge's publish gate: a writer acquires
/// it before releasing the cache lock, so records reach channels in the
/// order writes were applied.
#[derive(Default)]
pub struct EdgeChannels {
    inner: Mutex<HashMap<DataKind, KindChannels>>,
}

impl EdgeChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: DataKind, sink: Arc<dyn StreamSink>) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .entry(kind)
            .or_default()
            .channels
            .push(Channel { id, sink });
        id
    }

    /// Remove a channel; returns false if it was not registered here.
    pub fn unsubscribe(&self, channel_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        for kind in inner.values_mut() {
            if let Some(pos) = kind.channels.iter().position(|c| c.id == channel_id) {
                kind.channels.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of channels subscribed to a kind.
    pub fn count(&self, kind: &DataKind) -> usize {
        self.inner
            .lock()
            .get(kind)
            .map(|k| k.channels.len())
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.inner.lock().values().map(|k| k.channels.len()).sum()
    }

    /// Drop every channel, returning their ids.
    pub fn close_all(&self) -> Vec<Uuid> {
        let mut inner = self.inner.lock();
        inner
            .drain()
            .flat_map(|(_, k)| k.channels.into_iter().map(|c| c.id))
            .collect()
    }

    /// Acquire the publish gate.
    pub fn gate(&self) -> PublishGate<'_> {
        PublishGate {
            inner: self.inner.lock(),
        }
    }
}

/// Exclusive right to push records for one edge.
pub struct PublishGate<'a> {
    inner: MutexGuard<'a, HashMap<DataKind, KindChannels>>,
}

impl PublishGate<'_> {
    /// Deliver a record to every channel of its kind.
    ///
    /// Delivery never blocks; a sink that refuses is removed.
    pub fn publish(&mut self, record: &StreamRecord) -> PublishReport {
        let mut report = PublishReport::default();
        let Some(kind) = self.inner.get_mut(&record.kind) else {
            return report;
        };

        if record.write_time_ms < kind.watermark_ms {
            report.stale = true;
            return report;
        }
        kind.watermark_ms = record.write_time_ms;

        kind.channels.retain(|channel| match channel.sink.try_deliver(record.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                report.removed.push((channel.id, err));
                false
            }
        });

        report
    }
}

/// Where a channel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub edge_id: String,
    pub kind: DataKind,
}

/// Global channel index: channel id to owning edge and kind.
#[derive(Default)]
pub struct StreamRegistry {
    index: DashMap<Uuid, ChannelRef>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel_id: Uuid, edge_id: &str, kind: DataKind) {
        self.index.insert(
            channel_id,
            ChannelRef {
                edge_id: edge_id.to_string(),
                kind,
            },
        );
    }

    pub fn remove(&self, channel_id: &Uuid) -> Option<ChannelRef> {
        self.index.remove(channel_id).map(|(_, r)| r)
    }

    pub fn get(&self, channel_id: &Uuid) -> Option<ChannelRef> {
        self.index.get(channel_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
