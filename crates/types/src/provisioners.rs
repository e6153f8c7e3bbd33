//! The provisioner set.
//!
//! Provisioners are stakers eligible to vote. The set is ordered by public
//! key bytes so committee sampling indexes it deterministically. The chain
//! acceptor exclusively owns the live set between rounds; every consensus
//! round works on a snapshot (a plain clone).

use crate::bls::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single stake of a provisioner.
///
/// The stake counts towards voting weight at height `h` iff
/// `created_at <= h < eligibility`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub value: u64,
    pub created_at: u64,
    pub eligibility: u64,
}

impl Stake {
    pub fn new(value: u64, created_at: u64, eligibility: u64) -> Self {
        Stake {
            value,
            created_at,
            eligibility,
        }
    }

    pub fn eligible_at(&self, height: u64) -> bool {
        self.created_at <= height && height < self.eligibility
    }
}

/// A provisioner: a BLS identity plus its stakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioner {
    pub public_key: PublicKey,
    pub stakes: Vec<Stake>,
}

impl Provisioner {
    /// Total stake value counting towards voting weight at `height`.
    pub fn eligible_stake(&self, height: u64) -> u64 {
        self.stakes
            .iter()
            .filter(|s| s.eligible_at(height))
            .map(|s| s.value)
            .sum()
    }
}

/// The ordered set of provisioners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Provisioners {
    members: BTreeMap<PublicKey, Provisioner>,
}

impl Provisioners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stake for `key`, creating the provisioner if unknown.
    pub fn add_stake(&mut self, key: &PublicKey, stake: Stake) {
        self.members
            .entry(key.clone())
            .or_insert_with(|| Provisioner {
                public_key: key.clone(),
                stakes: Vec::new(),
            })
            .stakes
            .push(stake);
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<Provisioner> {
        self.members.remove(key)
    }

    pub fn get(&self, key: &PublicKey) -> Option<&Provisioner> {
        self.members.get(key)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in public-key order.
    pub fn iter(&self) -> impl Iterator<Item = &Provisioner> {
        self.members.values()
    }

    /// Total stake counting towards voting weight at `height`.
    pub fn total_eligible_stake(&self, height: u64) -> u64 {
        self.iter().map(|p| p.eligible_stake(height)).sum()
    }
}
