//! Bit-exact signable forms.
//!
//! Every reduction and agreement vote signs the same 41-byte layout, so a
//! vote cast at one (round, step) can never be replayed at another.

use crate::hash::Hash;
use crate::seed::{Seed, SEED_SIZE};

/// `round (u64 LE) || step (u8) || block_hash (32)`: the message signed by
/// reduction votes and re-signed (per step) inside agreement certificates.
pub fn reduction_message(round: u64, step: u8, block_hash: &Hash) -> [u8; 41] {
    let mut out = [0u8; 41];
    out[..8].copy_from_slice(&round.to_le_bytes());
    out[8] = step;
    out[9..].copy_from_slice(block_hash.as_bytes());
    out
}

/// `round (u64 LE) || seed (33)`: the seed-advance commitment signed by the
/// block generator.
pub fn seed_message(round: u64, seed: &Seed) -> [u8; 8 + SEED_SIZE] {
    let mut out = [0u8; 8 + SEED_SIZE];
    out[..8].copy_from_slice(&round.to_le_bytes());
    out[8..].copy_from_slice(seed.as_bytes());
    out
}
