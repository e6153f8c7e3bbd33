//! Per-step reduction vote storage.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use umbra_messages::Reduction;
use umbra_types::{Committee, Hash, PublicKey, StepVotes};

/// Accumulates reduction votes for one step, organised by block hash.
///
/// Every collected vote is folded into the running [`StepVotes`] of its hash
/// by group addition, and the sender is inserted into the signer cluster
/// once per unit of voting weight. When a hash first reaches quorum the
/// step votes are frozen (bitset filled in) and returned; the aggregator is
/// single-use and ignores everything after that.
///
/// The caller is responsible for membership filtering, signature checks and
/// duplicate suppression. A duplicate `(sender, step)` reaching this type,
/// or a failure of the group addition itself, is a programming error and
/// aborts the process.
pub struct Aggregator {
    committee: Committee,
    step: u8,
    entries: BTreeMap<Hash, Entry>,
    done: bool,
}

#[derive(Default)]
struct Entry {
    aggregate: Option<umbra_types::Signature>,
    cluster: BTreeMap<PublicKey, usize>,
    total: usize,
}

impl Aggregator {
    /// An aggregator over the committee of one `(round, step)`.
    pub fn new(committee: Committee, step: u8) -> Self {
        Aggregator {
            committee,
            step,
            entries: BTreeMap::new(),
            done: false,
        }
    }

    /// Fold a vote in. Returns the frozen step votes the first time a block
    /// hash reaches quorum, `None` otherwise.
    ///
    /// # Panics
    ///
    /// If the same sender is aggregated twice for this step, or if the BLS
    /// group addition fails. Both indicate a broken caller, not bad input.
    pub fn collect_vote(&mut self, vote: &Reduction) -> Option<(Hash, StepVotes)> {
        if self.done {
            return None;
        }

        let header = &vote.header;
        let weight = self.committee.votes_for(&header.pubkey);
        if weight == 0 {
            return None;
        }

        let entry = self.entries.entry(header.block_hash).or_default();

        if entry.cluster.contains_key(&header.pubkey) {
            panic!(
                "duplicate vote aggregated for sender {:?} at step {}",
                header.pubkey, self.step
            );
        }

        entry.aggregate = Some(match entry.aggregate.take() {
            None => vote.signed_hash.clone(),
            Some(aggregate) => aggregate
                .combine(&vote.signed_hash)
                .unwrap_or_else(|e| panic!("vote aggregation failed at step {}: {e}", self.step)),
        });

        entry.cluster.insert(header.pubkey.clone(), weight);
        entry.total += weight;

        debug!(
            step = self.step,
            block_hash = ?header.block_hash,
            total = entry.total,
            quorum = self.committee.quorum(),
            "vote collected"
        );

        if entry.total >= self.committee.quorum() {
            self.done = true;
            let signers: BTreeSet<PublicKey> = entry.cluster.keys().cloned().collect();
            let step_votes = StepVotes {
                aggregate: entry.aggregate.clone(),
                bitset: self.committee.bits(&signers),
                step: self.step,
            };
            return Some((header.block_hash, step_votes));
        }

        None
    }

    /// Whether quorum was already reached.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_messages::Reduction;
    use umbra_types::test_utils::test_provisioners;
    use umbra_types::{quorum, Committee, Seed};

    fn setup(n: usize, size: usize, step: u8) -> (Aggregator, Vec<umbra_types::Keys>, Committee) {
        let (provisioners, keys) = test_provisioners(n);
        let committee = Committee::sortition(&provisioners, &Seed::ZERO, 1, step, size);
        (Aggregator::new(committee.clone(), step), keys, committee)
    }

    #[test]
    fn quorum_emits_exactly_one_result() {
        let (mut agg, keys, committee) = setup(4, 4, 1);
        let hash = Hash::digest(b"candidate");

        let mut results = 0;
        let mut collected = 0;
        for k in &keys {
            if committee.votes_for(k.public()) == 0 {
                continue;
            }
            let vote = Reduction::sign(k, 1, 1, hash);
            if let Some((h, sv)) = agg.collect_vote(&vote) {
                results += 1;
                assert_eq!(h, hash);
                assert!(!sv.is_empty());
                assert_eq!(sv.step, 1);
                assert_eq!(sv.bitset.count_ones() as usize, collected + 1);
            }
            collected += 1;
        }

        assert_eq!(results, 1, "quorum must be reported exactly once");
        assert!(agg.is_done());
    }

    #[test]
    fn conflicting_hashes_cannot_both_reach_quorum() {
        let (mut agg, keys, committee) = setup(4, 4, 1);
        let h1 = Hash::digest(b"one");
        let h2 = Hash::digest(b"two");

        // Quorum needs strictly more than two thirds of the occurrences, so
        // whatever the sampled weights, two distinct hashes can never both
        // cross it within one step.
        let mut results = 0;
        for (i, k) in keys.iter().enumerate() {
            if committee.votes_for(k.public()) == 0 {
                continue;
            }
            let hash = if i % 2 == 0 { h1 } else { h2 };
            if agg.collect_vote(&Reduction::sign(k, 1, 1, hash)).is_some() {
                results += 1;
            }
        }
        assert!(results <= 1);
        assert_eq!(quorum(4), 4);
    }

    #[test]
    fn non_member_votes_are_ignored() {
        let (mut agg, _, _) = setup(4, 4, 1);
        let outsider = umbra_types::test_utils::test_keys(99);
        let vote = Reduction::sign(&outsider, 1, 1, Hash::digest(b"candidate"));
        assert!(agg.collect_vote(&vote).is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate vote aggregated")]
    fn duplicate_sender_is_fatal() {
        let (mut agg, keys, committee) = setup(4, 4, 1);
        let member = keys
            .iter()
            .find(|k| committee.votes_for(k.public()) > 0)
            .unwrap();
        let vote = Reduction::sign(member, 1, 1, Hash::digest(b"candidate"));
        let _ = agg.collect_vote(&vote);
        let _ = agg.collect_vote(&vote);
    }
}
