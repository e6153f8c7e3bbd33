//! Buffer for out-of-step consensus messages.
//!
//! Gossip does not respect phase boundaries: reductions for step `s + 1`
//! routinely arrive while step `s` is still collecting. The queue holds them
//! keyed by `(round, step)` until the loop enters that step; anything below
//! the current position is stale and dropped on the floor.

use std::collections::{BTreeMap, VecDeque};
use umbra_messages::Payload;

/// Priority queue of future-step messages, ordered by `(round, step)`.
#[derive(Debug, Default)]
pub struct MsgQueue {
    entries: BTreeMap<(u64, u8), VecDeque<Payload>>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a message for a future `(round, step)`.
    pub fn put(&mut self, round: u64, step: u8, payload: Payload) {
        self.entries
            .entry((round, step))
            .or_default()
            .push_back(payload);
    }

    /// Drain every message buffered for exactly `(round, step)`.
    pub fn drain(&mut self, round: u64, step: u8) -> VecDeque<Payload> {
        self.entries.remove(&(round, step)).unwrap_or_default()
    }

    /// Drop everything strictly below `(round, step)`.
    pub fn clear_stale(&mut self, round: u64, step: u8) {
        self.entries.retain(|&(r, s), _| (r, s) >= (round, step));
    }

    /// Drop all rounds below `round`.
    pub fn clear_rounds_below(&mut self, round: u64) {
        self.entries.retain(|&(r, _), _| r >= round);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
