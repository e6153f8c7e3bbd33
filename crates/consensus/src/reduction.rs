//! One reduction step.
//!
//! The driver casts the node's own vote over the hash carried in from the
//! previous phase, funnels incoming votes through membership and signature
//! checks into the [`Aggregator`], and exits on quorum or on the step
//! timeout. In the first step a non-empty hash is additionally checked
//! against the chain (`verify_candidate`) before the node signs; the check
//! runs concurrently with vote collection and shares the step deadline.

use crate::aggregator::Aggregator;
use crate::round::RoundUpdate;
use crate::traits::CandidateVerifier;
use crate::{ConsensusError, MsgQueue};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use umbra_messages::{Agreement, Payload, Reduction};
use umbra_types::{Committee, Hash, Keys, PublicKey, StepVotes};

/// In-flight candidate verification. Lives inside the step's select loop,
/// so cancelling or dropping the step tears it down with everything else.
type VerifyFuture = Pin<Box<dyn Future<Output = Result<(), ConsensusError>> + Send>>;

/// Borrowed context of one reduction step inside a round.
pub struct ReductionStep<'a> {
    pub ru: &'a RoundUpdate,
    pub step: u8,
    pub committee: Committee,
    pub timeout: Duration,
    pub keys: &'a Keys,
    pub inbound: &'a mut mpsc::Receiver<Payload>,
    pub queue: &'a mut MsgQueue,
    pub outbound: &'a mpsc::Sender<Payload>,
    pub agreements: &'a mpsc::Sender<Agreement>,
    pub cancel: &'a CancellationToken,
}

impl ReductionStep<'_> {
    /// Run the step over `vote_hash` (possibly the empty hash).
    ///
    /// Returns the hash that reached quorum together with its frozen step
    /// votes, or `(Hash::ZERO, empty)` when the step timed out or the
    /// round was cancelled. `verifier` is only passed for the first step
    /// of an iteration.
    pub async fn run(
        mut self,
        vote_hash: Hash,
        verifier: Option<Arc<dyn CandidateVerifier>>,
    ) -> (Hash, StepVotes) {
        let mut aggregator = Aggregator::new(self.committee.clone(), self.step);
        let mut seen: BTreeSet<PublicKey> = BTreeSet::new();

        // A non-empty hash in the first step is signed only once the chain
        // vouches for the candidate; everything else is signed on entry.
        let mut verification: Option<VerifyFuture> = None;
        match verifier {
            Some(verifier) if !vote_hash.is_zero() => {
                let hash = vote_hash;
                verification = Some(Box::pin(async move {
                    verifier.verify_candidate(hash).await
                }));
            }
            _ => {
                if let Some(own) = self.cast_own_vote(vote_hash, &mut aggregator, &mut seen) {
                    return own;
                }
            }
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        // Replay buffered votes for this slot before touching the inbox.
        let mut backlog = self.queue.drain(self.ru.round, self.step);

        loop {
            // Backlog first, without awaiting.
            if let Some(payload) = backlog.pop_front() {
                if let Some(result) = self.dispatch(payload, &mut aggregator, &mut seen) {
                    return result;
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    trace!(step = self.step, "reduction cancelled");
                    return (Hash::ZERO, StepVotes::empty(self.step));
                }

                verified = async { verification.as_mut().unwrap().await }, if verification.is_some() => {
                    verification = None;
                    match verified {
                        Ok(()) => {
                            if let Some(own) = self.cast_own_vote(vote_hash, &mut aggregator, &mut seen) {
                                return own;
                            }
                        }
                        Err(e) => {
                            // The node withholds its vote; the step keeps
                            // collecting in case the rest of the committee
                            // disagrees with us.
                            warn!(step = self.step, error = %e, "candidate rejected, not signing");
                        }
                    }
                }

                _ = &mut deadline => {
                    debug!(step = self.step, "reduction timeout");
                    return (Hash::ZERO, StepVotes::empty(self.step));
                }

                payload = self.inbound.recv() => {
                    let Some(payload) = payload else {
                        return (Hash::ZERO, StepVotes::empty(self.step));
                    };
                    if let Some(result) = self.route(payload, &mut aggregator, &mut seen).await {
                        return result;
                    }
                }
            }
        }
    }

    /// Sign and publish the node's own vote, then fold it in locally.
    fn cast_own_vote(
        &mut self,
        vote_hash: Hash,
        aggregator: &mut Aggregator,
        seen: &mut BTreeSet<PublicKey>,
    ) -> Option<(Hash, StepVotes)> {
        if self.committee.votes_for(self.keys.public()) == 0 {
            trace!(step = self.step, "not a committee member, not voting");
            return None;
        }
        // Our own vote may already have been collected off the wire (gossip
        // loopback); aggregating it twice would be fatal.
        if seen.contains(self.keys.public()) {
            return None;
        }

        let vote = Reduction::sign(self.keys, self.ru.round, self.step, vote_hash);
        // Best effort: a full outbound queue must not stall the step.
        let _ = self.outbound.try_send(Payload::Reduction(vote.clone()));

        seen.insert(self.keys.public().clone());
        aggregator.collect_vote(&vote)
    }

    /// Route an inbound payload; consensus slots other than ours go back to
    /// the queue, agreements go to the accumulator.
    async fn route(
        &mut self,
        payload: Payload,
        aggregator: &mut Aggregator,
        seen: &mut BTreeSet<PublicKey>,
    ) -> Option<(Hash, StepVotes)> {
        match payload {
            Payload::Agreement(agreement) => {
                if agreement.header.round == self.ru.round {
                    let _ = self.agreements.send(agreement).await;
                } else if agreement.header.round > self.ru.round {
                    let (round, step) = (agreement.header.round, agreement.header.step);
                    self.queue.put(round, step, Payload::Agreement(agreement));
                }
                None
            }
            Payload::Reduction(vote) => {
                let (round, step) = (vote.header.round, vote.header.step);
                if (round, step) == (self.ru.round, self.step) {
                    return self.dispatch(Payload::Reduction(vote), aggregator, seen);
                }
                if (round, step) > (self.ru.round, self.step) {
                    self.queue.put(round, step, Payload::Reduction(vote));
                } else {
                    trace!(round, step, "stale reduction dropped");
                }
                None
            }
            Payload::Score(score) => {
                // The generation window is over; scores for future rounds
                // wait for their selector.
                if score.header.round > self.ru.round {
                    let (round, step) = (score.header.round, score.header.step);
                    self.queue.put(round, step, Payload::Score(score));
                }
                None
            }
            other => {
                trace!(topic = %other.topic(), "non-consensus payload ignored");
                None
            }
        }
    }

    /// Validate and aggregate one vote for this exact slot.
    fn dispatch(
        &mut self,
        payload: Payload,
        aggregator: &mut Aggregator,
        seen: &mut BTreeSet<PublicKey>,
    ) -> Option<(Hash, StepVotes)> {
        let Payload::Reduction(vote) = payload else {
            return None;
        };

        let sender = &vote.header.pubkey;
        if self.committee.votes_for(sender) == 0 {
            trace!(step = self.step, "vote from non-member dropped");
            return None;
        }
        if seen.contains(sender) {
            trace!(step = self.step, "duplicate vote dropped");
            return None;
        }
        if sender
            .verify(&vote.header.signable(), &vote.signed_hash)
            .is_err()
        {
            warn!(step = self.step, sender = ?sender, "invalid vote signature");
            return None;
        }

        seen.insert(sender.clone());
        aggregator.collect_vote(&vote)
    }
}
