//! Consensus configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use umbra_types::Hash;

/// Tunables of the consensus engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Committee sample size (total occurrences) per step.
    pub committee_size: usize,

    /// Initial timeout of the score-selection window, in milliseconds.
    /// Doubles after every empty round, reset on an accepted block.
    pub selection_timeout_ms: u64,

    /// Timeout of each reduction step, in milliseconds.
    pub reduction_timeout_ms: u64,

    /// Number of BLS verification workers of the agreement accumulator.
    pub agreement_workers: usize,

    /// Initial minimum acceptable score, big-endian. Halves after every
    /// empty round, reset on an accepted block.
    pub score_threshold: Hash,
}

impl Default for Config {
    fn default() -> Self {
        let mut threshold = [0u8; 32];
        threshold[0] = 0x20;
        Config {
            committee_size: 64,
            selection_timeout_ms: 5_000,
            reduction_timeout_ms: 5_000,
            agreement_workers: 4,
            score_threshold: Hash::from_bytes(threshold),
        }
    }
}

impl Config {
    pub fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }

    pub fn reduction_timeout(&self) -> Duration {
        Duration::from_millis(self.reduction_timeout_ms)
    }
}

/// Halve a big-endian 256-bit threshold (logical shift right by one).
pub(crate) fn halve_threshold(threshold: &Hash) -> Hash {
    let bytes = threshold.as_bytes();
    let mut out = [0u8; 32];
    let mut carry = 0u8;
    for (i, b) in bytes.iter().enumerate() {
        out[i] = (b >> 1) | (carry << 7);
        carry = b & 1;
    }
    Hash::from_bytes(out)
}
