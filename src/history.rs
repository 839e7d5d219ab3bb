//! Bounded in-memory reading history.
//!
//! Every device key owns a fixed-capacity ring buffer. Once a ring is full
//! each new reading overwrites the oldest one, so a long-running process
//! holds at most `capacity` readings per device.
//!
//! [`HistoryStore`] itself is not synchronised and expects a single writer.
//! [`SharedHistory`] wraps it in a read-write lock for the case where a
//! sink writes while other tasks query; queries copy `Arc` handles out under
//! the read lock, so a reader never sees a slot mid-update.

use crate::reading::{Metric, Reading};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Default number of readings kept per device.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Fixed-capacity circular buffer.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    slots: Vec<T>,
    capacity: usize,
    /// Slot the next push writes to once the ring is full
    head: usize,
}

impl<T> Ring<T> {
    /// Create an empty ring. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            head: 0,
        }
    }

    /// Append a value, overwriting the oldest one when full.
    pub fn push(&mut self, value: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(value);
        } else {
            self.slots[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recently pushed value.
    pub fn latest(&self) -> Option<&T> {
        if self.slots.is_empty() {
            None
        } else {
            let newest = (self.head + self.slots.len() - 1) % self.slots.len();
            self.slots.get(newest)
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer.iter())
    }

    /// Up to `max` most recent values, oldest first.
    pub fn recent(&self, max: usize) -> impl Iterator<Item = &T> {
        let skip = self.len().saturating_sub(max);
        self.iter().skip(skip)
    }
}

/// Per-device reading history.
#[derive(Debug)]
pub struct HistoryStore {
    capacity: usize,
    rings: HashMap<String, Ring<Arc<Reading>>>,
    /// Device keys in first-seen order
    keys: Vec<String>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: HashMap::new(),
            keys: Vec::new(),
        }
    }

    /// Readings kept per device.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading to the ring of `device_key`, creating the ring on first use.
    pub fn append(&mut self, device_key: &str, reading: Arc<Reading>) {
        match self.rings.get_mut(device_key) {
            Some(ring) => ring.push(reading),
            None => {
                let mut ring = Ring::new(self.capacity);
                ring.push(reading);
                self.rings.insert(device_key.to_string(), ring);
                self.keys.push(device_key.to_string());
            }
        }
    }

    /// At most `max_points` most recent readings of a device, oldest first.
    ///
    /// Unknown keys yield an empty vector. Clamping to a display width is
    /// the caller's job.
    pub fn recent(&self, device_key: &str, max_points: usize) -> Vec<Arc<Reading>> {
        self.rings
            .get(device_key)
            .map(|ring| ring.recent(max_points).cloned().collect())
            .unwrap_or_default()
    }

    /// One metric's most recent values, oldest first.
    ///
    /// Readings that do not carry the metric are skipped.
    pub fn series(&self, device_key: &str, metric: Metric, max_points: usize) -> Vec<f64> {
        let Some(ring) = self.rings.get(device_key) else {
            return Vec::new();
        };
        let mut values: Vec<f64> = ring
            .iter()
            .rev()
            .filter_map(|reading| reading.get(metric))
            .take(max_points)
            .collect();
        values.reverse();
        values
    }

    pub fn latest(&self, device_key: &str) -> Option<Arc<Reading>> {
        self.rings
            .get(device_key)
            .and_then(|ring| ring.latest().cloned())
    }

    /// Number of readings held for a device.
    pub fn len(&self, device_key: &str) -> usize {
        self.rings.get(device_key).map_or(0, Ring::len)
    }

    /// Device keys in the order they were first seen.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A [`HistoryStore`] shared between a writer and concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct SharedHistory {
    inner: Arc<RwLock<HistoryStore>>,
}

impl SharedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HistoryStore::new(capacity))),
        }
    }

    pub fn append(&self, device_key: &str, reading: Arc<Reading>) {
        self.inner.write().append(device_key, reading);
    }

    pub fn recent(&self, device_key: &str, max_points: usize) -> Vec<Arc<Reading>> {
        self.inner.read().recent(device_key, max_points)
    }

    pub fn series(&self, device_key: &str, metric: Metric, max_points: usize) -> Vec<f64> {
        self.inner.read().series(device_key, metric, max_points)
    }

    /// Latest reading of every device, in first-seen order.
    pub fn latest_per_device(&self) -> Vec<Arc<Reading>> {
        let store = self.inner.read();
        store
            .keys()
            .iter()
            .filter_map(|key| store.latest(key))
            .collect()
    }

    /// Run a closure against the store under the read lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&HistoryStore) -> R) -> R {
        f(&self.inner.read())
    }
}
