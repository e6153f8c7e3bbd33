//! Deterministic committee sortition.
//!
//! A committee is a stake-weighted random sample (with replacement) of the
//! provisioner set for one `(round, step)`. Sampling is driven purely by the
//! sortition seed, so every node derives the same committee from the same
//! snapshot. Voting weight of a member equals its multiplicity in the sample.

use crate::bls::PublicKey;
use crate::hash::Hash;
use crate::provisioners::Provisioners;
use crate::seed::Seed;
use std::collections::{BTreeMap, BTreeSet};

/// Votes needed for quorum in a committee of `size` occurrences.
pub fn quorum(size: usize) -> usize {
    (size * 2).div_ceil(3) + 1
}

/// A sampled committee: ordered members with their multiplicities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    /// Distinct members in public-key order, with occurrence counts.
    members: BTreeMap<PublicKey, usize>,
    /// Requested sample size (total occurrences).
    size: usize,
}

impl Committee {
    /// Sample the committee for `(round, step)` from a provisioner snapshot.
    ///
    /// Each of the `size` draws hashes `seed || round || step || index` into
    /// a score below the total eligible stake weight and walks the ordered
    /// set to the matching member. Ties cannot occur: the walk is strict, and
    /// key order breaks equal-weight neighbours deterministically.
    pub fn sortition(
        provisioners: &Provisioners,
        seed: &Seed,
        round: u64,
        step: u8,
        size: usize,
    ) -> Self {
        let total = provisioners.total_eligible_stake(round);
        let mut members: BTreeMap<PublicKey, usize> = BTreeMap::new();

        if total == 0 {
            return Committee { members, size };
        }

        for i in 0..size {
            let mut buf = Vec::with_capacity(SEED_INPUT_LEN);
            buf.extend_from_slice(seed.as_bytes());
            buf.extend_from_slice(&round.to_le_bytes());
            buf.push(step);
            buf.extend_from_slice(&(i as u32).to_le_bytes());

            let digest = Hash::digest(&buf);
            let mut score_bytes = [0u8; 8];
            score_bytes.copy_from_slice(&digest.as_bytes()[..8]);
            let mut score = u64::from_le_bytes(score_bytes) % total;

            for p in provisioners.iter() {
                let weight = p.eligible_stake(round);
                if score < weight {
                    *members.entry(p.public_key.clone()).or_insert(0) += 1;
                    break;
                }
                score -= weight;
            }
        }

        Committee { members, size }
    }

    /// Multiplicity of `key` in the sample; zero for non-members.
    pub fn votes_for(&self, key: &PublicKey) -> usize {
        self.members.get(key).copied().unwrap_or(0)
    }

    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.contains_key(key)
    }

    /// Total occurrences (the requested sample size).
    pub fn total_occurrences(&self) -> usize {
        self.size
    }

    /// Votes needed for quorum in this committee.
    pub fn quorum(&self) -> usize {
        quorum(self.size)
    }

    /// Distinct members in public-key order.
    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.members.keys()
    }

    /// Bitset of the given signers, aligned with the ordered membership.
    ///
    /// Signers outside the committee are ignored; bits beyond the 64th
    /// member cannot be represented and are skipped.
    pub fn bits(&self, signers: &BTreeSet<PublicKey>) -> u64 {
        let mut bits = 0u64;
        for (idx, key) in self.members.keys().enumerate() {
            if idx >= 64 {
                break;
            }
            if signers.contains(key) {
                bits |= 1u64 << idx;
            }
        }
        bits
    }

    /// Members selected by a bitset, in committee order.
    pub fn intersect(&self, bitset: u64) -> Vec<PublicKey> {
        self.members
            .keys()
            .enumerate()
            .filter(|(idx, _)| *idx < 64 && bitset & (1u64 << idx) != 0)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

const SEED_INPUT_LEN: usize = crate::seed::SEED_SIZE + 8 + 1 + 4;
