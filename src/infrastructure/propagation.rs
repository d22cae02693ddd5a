//! Propagation Queues
//!
//! Bounded per-kind FIFOs of delayed writes for non-origin regions.
//! Overflow drops the oldest item: a newer write for the same kind
//! supersedes it anyway.

use crate::domain::entities::PropagationItem;
use crate::domain::value_objects::DataKind;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub struct PropagationQueues {
    queues: DashMap<DataKind, Mutex<VecDeque<PropagationItem>>>,
    capacity: usize,
}

impl PropagationQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an item; returns the item dropped to make room, if any.
    pub fn push(&self, item: PropagationItem) -> Option<PropagationItem> {
        let kind = item.key.kind.clone();
        if let Some(queue) = self.queues.get(&kind) {
            return self.push_into(&mut queue.lock(), item);
        }
        let queue = self.queues.entry(kind).or_default();
        let mut guard = queue.lock();
        self.push_into(&mut guard, item)
    }

    fn push_into(&self, queue: &mut VecDeque<PropagationItem>, item: PropagationItem) -> Option<PropagationItem> {
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(item);
        dropped
    }

    /// Take up to `max` items from the front of a kind's queue.
    pub fn drain(&self, kind: &DataKind, max: usize) -> Vec<PropagationItem> {
        match self.queues.get(kind) {
            Some(queue) => {
                let mut queue = queue.lock();
                let n = max.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    /// Kinds that currently have a queue.
    pub fn kinds(&self) -> Vec<DataKind> {
        let mut kinds: Vec<DataKind> = self.queues.iter().map(|q| q.key().clone()).collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self, kind: &DataKind) -> usize {
        self.queues.get(kind).map(|q| q.lock().len()).unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|q| q.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}
