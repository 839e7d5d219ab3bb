//! Duplicate broadcast suppression.
//!
//! Sensors repeat each sample over several advertisements. Every sample
//! carries a 4-bit wrap-around counter; a broadcast whose counter equals the
//! last accepted counter of the same device is a re-broadcast.

use std::collections::HashMap;

/// Tracks the last accepted sequence counter per device key.
///
/// Entries are created on first sight and never removed, so memory is
/// bounded by the number of distinct devices.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last_counter: HashMap<String, u8>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a broadcast is new.
    ///
    /// Returns `true` and records the counter for the first broadcast of a
    /// key and whenever the counter differs from the recorded one (including
    /// a wrap from 15 back to 0). Returns `false` for a repeat.
    pub fn accept(&mut self, device_key: &str, sequence_counter: u8) -> bool {
        match self.last_counter.get_mut(device_key) {
            Some(last) if *last == sequence_counter => false,
            Some(last) => {
                *last = sequence_counter;
                true
            }
            None => {
                self.last_counter
                    .insert(device_key.to_string(), sequence_counter);
                true
            }
        }
    }

    /// Number of devices seen so far.
    pub fn len(&self) -> usize {
        self.last_counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_counter.is_empty()
    }
}
