//! Agreement accumulation.
//!
//! Agreements for any step of the round arrive for as long as the round
//! lives, so the accumulator runs beside the phase pipeline: a pool of
//! workers pulls messages off a shared queue and does the CPU-heavy BLS
//! checks, a collector tallies verified weight per block hash and seals the
//! certificate the first time a hash crosses quorum.

use crate::round::{RoundUpdate, Winner};
use crate::{Config, ConsensusError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use umbra_messages::Agreement;
use umbra_types::{reduction_message, Certificate, Committee, Hash, PublicKey, StepVotes};

/// Handle to the per-round agreement pipeline.
pub struct Accumulator;

impl Accumulator {
    /// Spawn the workers and the collector for one round. Returns the inbox
    /// agreements are pushed into; the first winner goes out on `winner_tx`.
    ///
    /// All tasks exit when `cancel` fires or the inbox closes.
    pub fn spawn(
        ru: RoundUpdate,
        config: &Config,
        winner_tx: mpsc::Sender<Winner>,
        cancel: CancellationToken,
    ) -> mpsc::Sender<Agreement> {
        let (inbox_tx, inbox_rx) = mpsc::channel::<Agreement>(256);
        let (verified_tx, verified_rx) = mpsc::channel::<(Agreement, usize)>(256);

        let shared_rx = Arc::new(Mutex::new(inbox_rx));
        let handler = Arc::new(Handler::new(ru, config.committee_size));

        let workers = config.agreement_workers.max(2);
        for worker in 0..workers {
            let shared_rx = shared_rx.clone();
            let verified_tx = verified_tx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let msg = {
                        let mut rx = shared_rx.lock().await;
                        tokio::select! {
                            m = rx.recv() => m,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(agreement) = msg else { break };

                    match handler.verify(&agreement) {
                        Ok(weight) => {
                            if verified_tx.send((agreement, weight)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(worker, error = %e, "dropping invalid agreement");
                        }
                    }
                }
            });
        }

        let quorum = handler.quorum();
        tokio::spawn(collect(verified_rx, winner_tx, quorum, cancel));

        inbox_tx
    }
}

/// Tallies verified agreements until the first quorum.
async fn collect(
    mut verified_rx: mpsc::Receiver<(Agreement, usize)>,
    winner_tx: mpsc::Sender<Winner>,
    quorum: usize,
    cancel: CancellationToken,
) {
    let mut seen: BTreeSet<(Vec<u8>, u64, u8)> = BTreeSet::new();
    let mut weights: BTreeMap<Hash, usize> = BTreeMap::new();

    loop {
        let msg = tokio::select! {
            m = verified_rx.recv() => m,
            _ = cancel.cancelled() => None,
        };
        let Some((agreement, weight)) = msg else { return };

        let header = &agreement.header;
        let key = (
            header.pubkey.to_bytes().to_vec(),
            header.round,
            header.step,
        );
        if !seen.insert(key) {
            // Duplicate (sender, round, step): silently dropped.
            continue;
        }

        let total = weights.entry(header.block_hash).or_insert(0);
        *total += weight;

        debug!(
            round = header.round,
            step = header.step,
            block_hash = ?header.block_hash,
            total, quorum,
            "agreement accumulated"
        );

        if *total >= quorum {
            info!(
                round = header.round,
                step = header.step,
                block_hash = ?header.block_hash,
                "winning agreement"
            );
            let certificate = Certificate::new(
                agreement.first_step.clone(),
                agreement.second_step.clone(),
                header.step,
            );
            let _ = winner_tx
                .send(Winner {
                    block_hash: header.block_hash,
                    certificate,
                })
                .await;
            return;
        }
    }
}

/// Stateless verification of a single agreement against the round snapshot.
struct Handler {
    ru: RoundUpdate,
    committee_size: usize,
}

impl Handler {
    fn new(ru: RoundUpdate, committee_size: usize) -> Self {
        Handler { ru, committee_size }
    }

    fn quorum(&self) -> usize {
        umbra_types::quorum(self.committee_size)
    }

    fn committee(&self, step: u8) -> Committee {
        Committee::sortition(
            &self.ru.provisioners,
            &self.ru.seed,
            self.ru.round,
            step,
            self.committee_size,
        )
    }

    /// Full check of one agreement; returns the sender's voting weight.
    fn verify(&self, agreement: &Agreement) -> Result<usize, ConsensusError> {
        let header = &agreement.header;
        let step = header.step;

        // Sender must sit in the agreement committee or the preceding one.
        let committee = self.committee(step);
        let weight = match committee.votes_for(&header.pubkey) {
            0 => {
                let previous = self.committee(step.wrapping_sub(1));
                match previous.votes_for(&header.pubkey) {
                    0 => return Err(ConsensusError::NotCommitteeMember),
                    w => w,
                }
            }
            w => w,
        };

        agreement
            .verify_signature()
            .map_err(|_| ConsensusError::InvalidSignature)?;

        let expected_first = step.wrapping_sub(2);
        let expected_second = step.wrapping_sub(1);
        self.verify_step_votes(header.round, expected_first, &header.block_hash, &agreement.first_step)?;
        self.verify_step_votes(
            header.round,
            expected_second,
            &header.block_hash,
            &agreement.second_step,
        )?;

        Ok(weight)
    }

    /// Verify one step's aggregate against the committee selected by its
    /// bitset.
    fn verify_step_votes(
        &self,
        round: u64,
        expected_step: u8,
        block_hash: &Hash,
        votes: &StepVotes,
    ) -> Result<(), ConsensusError> {
        if votes.step != expected_step {
            return Err(ConsensusError::InvalidStepVotes(format!(
                "step {} where {} was expected",
                votes.step, expected_step
            )));
        }

        let Some(aggregate) = &votes.aggregate else {
            return Err(ConsensusError::InvalidStepVotes("empty step votes".into()));
        };

        let committee = self.committee(votes.step);
        let signers: Vec<PublicKey> = committee.intersect(votes.bitset);
        if signers.is_empty() {
            return Err(ConsensusError::InvalidStepVotes("empty bitset".into()));
        }

        let apk = PublicKey::aggregate(&signers)
            .map_err(|e| ConsensusError::InvalidStepVotes(e.to_string()))?;

        apk.verify(
            &reduction_message(round, votes.step, block_hash),
            aggregate,
        )
        .map_err(|_| ConsensusError::InvalidStepVotes("aggregate does not verify".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::test_utils::test_provisioners;
    use umbra_types::{Keys, Seed};

    fn round_update(n: usize) -> (RoundUpdate, Vec<Keys>) {
        let (provisioners, keys) = test_provisioners(n);
        (
            RoundUpdate {
                round: 1,
                seed: Seed::ZERO,
                hash: Hash::digest(b"tip"),
                timestamp: 0,
                cert: Certificate::default(),
                provisioners,
            },
            keys,
        )
    }

    /// Aggregate reduction votes of every committee member into StepVotes.
    fn full_step_votes(
        ru: &RoundUpdate,
        keys: &[Keys],
        size: usize,
        step: u8,
        hash: Hash,
    ) -> StepVotes {
        let committee =
            Committee::sortition(&ru.provisioners, &ru.seed, ru.round, step, size);
        let mut aggregate: Option<umbra_types::Signature> = None;
        let mut signers = BTreeSet::new();

        for k in keys {
            if committee.votes_for(k.public()) == 0 {
                continue;
            }
            let sig = k.sign(&reduction_message(ru.round, step, &hash));
            aggregate = Some(match aggregate {
                None => sig,
                Some(agg) => agg.combine(&sig).unwrap(),
            });
            signers.insert(k.public().clone());
        }

        StepVotes {
            aggregate,
            bitset: committee.bits(&signers),
            step,
        }
    }

    fn signed_agreement(ru: &RoundUpdate, keys: &[Keys], size: usize, sender: &Keys) -> Agreement {
        let hash = Hash::digest(b"winning candidate");
        let first = full_step_votes(ru, keys, size, 1, hash);
        let second = full_step_votes(ru, keys, size, 2, hash);
        Agreement::sign(sender, ru.round, 3, hash, first, second)
    }

    #[test]
    fn valid_agreement_passes() {
        let (ru, keys) = round_update(4);
        let size = 4;
        let handler = Handler::new(ru.clone(), size);

        let committee = Committee::sortition(&ru.provisioners, &ru.seed, ru.round, 3, size);
        let sender = keys
            .iter()
            .find(|k| committee.votes_for(k.public()) > 0)
            .unwrap();

        let agreement = signed_agreement(&ru, &keys, size, sender);
        let weight = handler.verify(&agreement).unwrap();
        assert!(weight > 0);
    }

    #[test]
    fn tampered_block_hash_fails() {
        let (ru, keys) = round_update(4);
        let size = 4;
        let handler = Handler::new(ru.clone(), size);

        let committee = Committee::sortition(&ru.provisioners, &ru.seed, ru.round, 3, size);
        let sender = keys
            .iter()
            .find(|k| committee.votes_for(k.public()) > 0)
            .unwrap();

        let mut agreement = signed_agreement(&ru, &keys, size, sender);
        agreement.header.block_hash = Hash::digest(b"some other block");
        assert!(handler.verify(&agreement).is_err());
    }

    #[test]
    fn outsider_sender_is_rejected() {
        let (ru, keys) = round_update(4);
        let size = 4;
        let handler = Handler::new(ru.clone(), size);

        let outsider = umbra_types::test_utils::test_keys(200);
        let agreement = signed_agreement(&ru, &keys, size, &outsider);
        assert!(matches!(
            handler.verify(&agreement),
            Err(ConsensusError::NotCommitteeMember)
        ));
    }

    #[test]
    fn empty_step_votes_are_rejected() {
        let (ru, keys) = round_update(4);
        let size = 4;
        let handler = Handler::new(ru.clone(), size);

        let committee = Committee::sortition(&ru.provisioners, &ru.seed, ru.round, 3, size);
        let sender = keys
            .iter()
            .find(|k| committee.votes_for(k.public()) > 0)
            .unwrap();

        let agreement = Agreement::sign(
            sender,
            ru.round,
            3,
            Hash::digest(b"candidate"),
            StepVotes::empty(1),
            StepVotes::empty(2),
        );
        assert!(handler.verify(&agreement).is_err());
    }

    #[tokio::test]
    async fn pipeline_emits_single_winner() {
        let (ru, keys) = round_update(4);
        let config = Config {
            committee_size: 4,
            ..Default::default()
        };
        let (winner_tx, mut winner_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let inbox = Accumulator::spawn(ru.clone(), &config, winner_tx, cancel.clone());

        let committee = Committee::sortition(&ru.provisioners, &ru.seed, ru.round, 3, 4);
        for k in &keys {
            if committee.votes_for(k.public()) == 0 {
                continue;
            }
            inbox.send(signed_agreement(&ru, &keys, 4, k)).await.unwrap();
        }

        let winner = tokio::time::timeout(std::time::Duration::from_secs(5), winner_rx.recv())
            .await
            .expect("winner within deadline")
            .expect("winner");
        assert_eq!(winner.block_hash, Hash::digest(b"winning candidate"));
        assert_eq!(winner.certificate.step, 3);
        assert!(!winner.certificate.first_reduction.is_empty());

        cancel.cancel();
    }
}
