//! The per-round consensus loop.

use crate::agreement::Accumulator;
use crate::reduction::ReductionStep;
use crate::selector::Selector;
use crate::traits::{CandidateVerifier, ScoreVerifier};
use crate::{Config, MsgQueue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use umbra_messages::{Agreement, Payload};
use umbra_types::{Certificate, Committee, Hash, Keys, Provisioners, Seed, StepVotes};

/// Everything a round needs from the chain, captured at tip advance.
/// Immutable for the lifetime of the round; the provisioner set is a
/// snapshot owned by the round.
#[derive(Debug, Clone)]
pub struct RoundUpdate {
    pub round: u64,
    pub seed: Seed,
    /// Tip hash the round builds on.
    pub hash: Hash,
    /// Tip timestamp.
    pub timestamp: u64,
    /// Certificate of the tip block.
    pub cert: Certificate,
    pub provisioners: Provisioners,
}

/// The first agreement to reach quorum in a round.
#[derive(Debug, Clone)]
pub struct Winner {
    pub block_hash: Hash,
    pub certificate: Certificate,
}

/// The consensus loop: orchestrates selection, reduction and agreement for
/// one round at a time.
///
/// At most one round is ever active; the owner (the chain acceptor, through
/// the node runner) cancels the current `spin` before starting the next.
pub struct Consensus {
    keys: Keys,
    config: Config,
    selector: Selector,
    candidate_verifier: Arc<dyn CandidateVerifier>,
    inbound: mpsc::Receiver<Payload>,
    outbound: mpsc::Sender<Payload>,
    queue: MsgQueue,
}

impl Consensus {
    pub fn new(
        keys: Keys,
        config: Config,
        score_verifier: Arc<dyn ScoreVerifier>,
        candidate_verifier: Arc<dyn CandidateVerifier>,
        inbound: mpsc::Receiver<Payload>,
        outbound: mpsc::Sender<Payload>,
    ) -> Self {
        let selector = Selector::new(&config, score_verifier);
        Consensus {
            keys,
            config,
            selector,
            candidate_verifier,
            inbound,
            outbound,
            queue: MsgQueue::new(),
        }
    }

    /// Reset the adaptive selection timeout and threshold. The chain calls
    /// this whenever a block is accepted.
    pub fn reset_adaptive(&mut self) {
        self.selector.reset();
    }

    /// Run one round to its winning agreement.
    ///
    /// Returns `None` when cancelled (tip advanced elsewhere, or the node
    /// went out of sync). Iterations advance on agreement timeout: the step
    /// counter grows, committees are resampled and generation restarts.
    #[instrument(skip_all, fields(round = ru.round))]
    pub async fn spin(&mut self, ru: RoundUpdate, cancel: CancellationToken) -> Option<Winner> {
        info!(provisioners = ru.provisioners.len(), "round started");
        self.queue.clear_rounds_below(ru.round);

        let (winner_tx, mut winner_rx) = mpsc::channel::<Winner>(1);
        let agreements = Accumulator::spawn(
            ru.clone(),
            &self.config,
            winner_tx,
            cancel.child_token(),
        );

        // Steps are a u8; 3k + 3 caps the iteration counter.
        for iteration in 0..=84u8 {
            let winner = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                Some(winner) = winner_rx.recv() => Some(winner),
                _ = self.run_iteration(&ru, iteration, &agreements, &cancel) => None,
            };
            if let Some(winner) = winner {
                return Some(winner);
            }
        }

        // Out of steps: only an externally observed agreement can end the
        // round now.
        tokio::select! {
            _ = cancel.cancelled() => None,
            winner = winner_rx.recv() => winner,
        }
    }

    /// One iteration: selection, then both reduction steps, then the
    /// agreement hand-off. Every phase watches the round's cancellation
    /// token and winds down within its own step deadline.
    async fn run_iteration(
        &mut self,
        ru: &RoundUpdate,
        iteration: u8,
        agreements: &mpsc::Sender<Agreement>,
        cancel: &CancellationToken,
    ) {
        let base = iteration * 3;
        debug!(iteration, base, "iteration started");

        let best = self.selection_phase(ru, base, agreements, cancel).await;

        let (first_hash, first_votes) = self
            .reduction_phase(ru, base + 1, best, true, agreements, cancel)
            .await;

        let (second_hash, second_votes) = self
            .reduction_phase(ru, base + 2, first_hash, false, agreements, cancel)
            .await;

        self.emit_agreement(
            ru,
            base + 3,
            first_hash,
            second_hash,
            first_votes,
            second_votes,
            agreements,
        )
        .await;
    }

    /// The generation window: collect scores until the selector's timeout.
    ///
    /// Cancellation ends the window immediately with the empty hash and
    /// leaves the adaptive timeout and threshold untouched; only a window
    /// that genuinely expired empty widens the next one.
    async fn selection_phase(
        &mut self,
        ru: &RoundUpdate,
        step: u8,
        agreements: &mpsc::Sender<Agreement>,
        cancel: &CancellationToken,
    ) -> Hash {
        self.selector.start();
        self.queue.clear_stale(ru.round, step);

        let deadline = tokio::time::sleep(self.selector.timeout());
        tokio::pin!(deadline);

        let mut backlog = self.queue.drain(ru.round, step);

        loop {
            let payload = if let Some(payload) = backlog.pop_front() {
                payload
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        trace!(step, "selection cancelled");
                        return Hash::ZERO;
                    }
                    _ = &mut deadline => break,
                    payload = self.inbound.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                }
            };

            match payload {
                Payload::Score(score) => {
                    if score.header.round != ru.round {
                        if score.header.round > ru.round {
                            let (r, s) = (score.header.round, score.header.step);
                            self.queue.put(r, s, Payload::Score(score));
                        }
                        continue;
                    }
                    match self.selector.process(score, ru.round) {
                        Ok(Some(repropagate)) => {
                            let _ = self.outbound.try_send(repropagate);
                        }
                        Ok(None) => {}
                        Err(e) => trace!(error = %e, "score dropped"),
                    }
                }
                Payload::Agreement(agreement) => {
                    if agreement.header.round == ru.round {
                        let _ = agreements.send(agreement).await;
                    } else if agreement.header.round > ru.round {
                        let (r, s) = (agreement.header.round, agreement.header.step);
                        self.queue.put(r, s, Payload::Agreement(agreement));
                    }
                }
                Payload::Reduction(vote) => {
                    let (r, s) = (vote.header.round, vote.header.step);
                    if (r, s) >= (ru.round, step) {
                        self.queue.put(r, s, Payload::Reduction(vote));
                    }
                }
                other => trace!(topic = %other.topic(), "ignored during selection"),
            }
        }

        let best = self.selector.publish_best();
        debug!(step, block_hash = ?best.block_hash, "best score published");
        best.block_hash
    }

    /// One reduction step; candidate verification only in the first.
    #[allow(clippy::too_many_arguments)]
    async fn reduction_phase(
        &mut self,
        ru: &RoundUpdate,
        step: u8,
        vote_hash: Hash,
        first: bool,
        agreements: &mpsc::Sender<Agreement>,
        cancel: &CancellationToken,
    ) -> (Hash, StepVotes) {
        self.queue.clear_stale(ru.round, step);

        let committee = Committee::sortition(
            &ru.provisioners,
            &ru.seed,
            ru.round,
            step,
            self.config.committee_size,
        );

        let verifier = first.then(|| self.candidate_verifier.clone());

        let step_driver = ReductionStep {
            ru,
            step,
            committee,
            timeout: self.config.reduction_timeout(),
            keys: &self.keys,
            inbound: &mut self.inbound,
            queue: &mut self.queue,
            outbound: &self.outbound,
            agreements,
            cancel,
        };

        let (hash, votes) = step_driver.run(vote_hash, verifier).await;
        debug!(step, quorum = !votes.is_empty(), block_hash = ?hash, "reduction step done");
        (hash, votes)
    }

    /// Bundle both step votes into a signed agreement, when the iteration
    /// produced a coherent non-empty result and we sit in the committee.
    #[allow(clippy::too_many_arguments)]
    async fn emit_agreement(
        &mut self,
        ru: &RoundUpdate,
        step: u8,
        first_hash: Hash,
        second_hash: Hash,
        first_votes: StepVotes,
        second_votes: StepVotes,
        agreements: &mpsc::Sender<Agreement>,
    ) {
        if first_votes.is_empty() || second_votes.is_empty() {
            debug!(step, "no agreement: empty step votes");
            return;
        }
        if first_hash != second_hash || first_hash.is_zero() {
            debug!(step, "no agreement: steps disagree or voted empty");
            return;
        }

        let committee = Committee::sortition(
            &ru.provisioners,
            &ru.seed,
            ru.round,
            step.wrapping_sub(1),
            self.config.committee_size,
        );
        if committee.votes_for(self.keys.public()) == 0 {
            return;
        }

        let agreement = Agreement::sign(
            &self.keys,
            ru.round,
            step,
            first_hash,
            first_votes,
            second_votes,
        );

        if let Err(e) = self
            .outbound
            .try_send(Payload::Agreement(agreement.clone()))
        {
            warn!(error = %e, "agreement broadcast failed");
        }
        let _ = agreements.send(agreement).await;
    }
}
