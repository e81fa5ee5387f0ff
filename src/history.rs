//! Bounded in-memory history
//!
//! [`BoundedLog`] is the one eviction primitive used for every in-memory
//! history: message archives, activity logs, interval samples and failure
//! windows. Pushing past capacity evicts the oldest entry.

use std::collections::VecDeque;

/// FIFO log holding at most `capacity` entries
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    /// Create a log holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one if the log was full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Drop leading entries while `predicate` holds
    pub fn prune_front<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) {
        while self.entries.front().is_some_and(&mut predicate) {
            self.entries.pop_front();
        }
    }

    /// Keep only entries matching `predicate`
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, predicate: F) {
        self.entries.retain(predicate);
    }

    /// Remove the first entry matching `predicate`
    pub fn take_first<F: FnMut(&T) -> bool>(&mut self, predicate: F) -> Option<T> {
        let index = self.entries.iter().position(predicate)?;
        self.entries.remove(index)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
