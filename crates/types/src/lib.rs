//! Core types for the Umbra consensus engine.
//!
//! This crate provides the foundational types used throughout the node:
//!
//! - **Primitives**: [`Hash`], BLS keys and signatures, the block [`Seed`]
//! - **Consensus types**: [`Block`], [`Certificate`], [`StepVotes`]
//! - **Provisioners**: the ordered stake set and committee sortition
//!
//! It is self-contained: no other workspace crate is a dependency, making it
//! the foundation layer.

mod block;
mod bls;
mod committee;
mod hash;
mod provisioners;
mod seed;
mod signing;
mod transaction;

pub use block::{Block, Certificate, Header, StepVotes, BLOCK_GAS_LIMIT};
pub use bls::{
    CryptoError, Keys, PublicKey, SecretKey, Signature, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE,
    SIGNATURE_SIZE,
};
pub use committee::{quorum, Committee};
pub use hash::Hash;
pub use provisioners::{Provisioner, Provisioners, Stake};
pub use seed::{Seed, SEED_SIZE};
pub use signing::{reduction_message, seed_message};
pub use transaction::{Transaction, TxError, TxType};

/// Test utilities shared by downstream crates.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic keys from a seed byte.
    pub fn test_keys(seed: u8) -> Keys {
        let mut ikm = [0u8; 32];
        ikm[0] = seed;
        ikm[31] = seed.wrapping_add(1);
        Keys::from_seed(&ikm)
    }

    /// A provisioner set of `n` members with equal stake, eligible from
    /// height 0, plus the keys that control them (index-aligned).
    pub fn test_provisioners(n: usize) -> (Provisioners, Vec<Keys>) {
        let mut p = Provisioners::new();
        let keys: Vec<Keys> = (0..n).map(|i| test_keys(i as u8)).collect();
        for k in &keys {
            p.add_stake(k.public(), Stake::new(1000, 0, u64::MAX));
        }
        (p, keys)
    }

    /// A transfer transaction with a payload derived from `seed`.
    pub fn test_transaction(seed: u8) -> Transaction {
        Transaction::new(TxType::Transfer, vec![seed; 16], 100_000, 1)
    }
}
