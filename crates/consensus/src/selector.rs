//! Score selection (generation phase).
//!
//! During the generation window the selector collects blind-bid scores,
//! keeps the best valid one and re-propagates it. When the window expires it
//! publishes the winner's vote hash; with no valid score the empty hash (32
//! zero bytes) goes out instead, the window doubles and the acceptance
//! threshold halves, both resetting when a block is finally accepted.

use crate::config::halve_threshold;
use crate::traits::ScoreVerifier;
use crate::{Config, ConsensusError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use umbra_messages::{Payload, Score};
use umbra_types::Hash;

/// Outcome of one selection window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestScore {
    /// The winning candidate hash; [`Hash::ZERO`] when the window was empty.
    pub block_hash: Hash,
}

/// The score selector. Lives across rounds so the adaptive timeout and
/// threshold survive empty rounds.
pub struct Selector {
    verifier: Arc<dyn ScoreVerifier>,
    timeout: Duration,
    threshold: Hash,
    initial_timeout: Duration,
    initial_threshold: Hash,
    best: Option<Score>,
}

impl Selector {
    pub fn new(config: &Config, verifier: Arc<dyn ScoreVerifier>) -> Self {
        Selector {
            verifier,
            timeout: config.selection_timeout(),
            threshold: config.score_threshold,
            initial_timeout: config.selection_timeout(),
            initial_threshold: config.score_threshold,
            best: None,
        }
    }

    /// The current generation window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The current minimum acceptable score.
    pub fn threshold(&self) -> Hash {
        self.threshold
    }

    /// Reset the adaptive timeout and threshold. Called on block acceptance.
    pub fn reset(&mut self) {
        self.timeout = self.initial_timeout;
        self.threshold = self.initial_threshold;
    }

    /// Enter a new generation window.
    pub fn start(&mut self) {
        self.best = None;
    }

    /// Whether `candidate` takes priority over `best`: the higher score
    /// wins, ties go to the lower vote hash.
    fn has_priority(best: &Score, candidate: &Score) -> bool {
        match candidate.score.cmp(&best.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => candidate.header.block_hash < best.header.block_hash,
        }
    }

    /// Process one incoming score.
    ///
    /// Returns the payload to re-propagate when the score becomes the new
    /// best. Verification failures revert to the previous best, and the
    /// reverted value is never re-propagated.
    pub fn process(&mut self, score: Score, round: u64) -> Result<Option<Payload>, ConsensusError> {
        if score.score < self.threshold {
            return Err(ConsensusError::ScoreBelowThreshold);
        }

        if let Some(best) = &self.best {
            if !Self::has_priority(best, &score) {
                return Ok(None);
            }
        }

        let previous = self.best.replace(score.clone());
        if let Err(e) = self.verifier.verify(&score, round) {
            self.best = previous;
            return Err(e);
        }

        debug!(
            score = ?score.score,
            block_hash = ?score.header.block_hash,
            "swapping best score"
        );
        Ok(Some(Payload::Score(score)))
    }

    /// Close the window and publish the best hash.
    ///
    /// An empty window widens the next one and lowers the bar: the timeout
    /// doubles and the threshold halves.
    pub fn publish_best(&mut self) -> BestScore {
        let block_hash = match self.best.take() {
            Some(score) => score.header.block_hash,
            None => Hash::ZERO,
        };

        if block_hash.is_zero() {
            self.timeout = self.timeout.saturating_mul(2);
            self.threshold = halve_threshold(&self.threshold);
            warn!(
                next_timeout = ?self.timeout,
                "empty selection window"
            );
        }

        BestScore { block_hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Permissive;
    use umbra_messages::ConsensusHeader;
    use umbra_types::test_utils::test_keys;

    struct Rejecting;

    impl ScoreVerifier for Rejecting {
        fn verify(&self, _score: &Score, _round: u64) -> Result<(), ConsensusError> {
            Err(ConsensusError::InvalidScore("bad proof".into()))
        }
    }

    fn score(value: u8, vote_hash: &[u8]) -> Score {
        let keys = test_keys(1);
        let mut score_bytes = [0u8; 32];
        score_bytes[0] = value;
        Score {
            header: ConsensusHeader::new(
                keys.public().clone(),
                1,
                0,
                Hash::digest(vote_hash),
            ),
            proof: vec![],
            score: Hash::from_bytes(score_bytes),
            z: Hash::ZERO,
            bid_list: vec![],
            seed_sig: keys.sign(b"seed"),
            prev_hash: Hash::ZERO,
        }
    }

    fn selector(verifier: impl ScoreVerifier + 'static) -> Selector {
        let config = Config {
            score_threshold: Hash::from_bytes([0u8; 32]),
            ..Default::default()
        };
        let mut s = Selector::new(&config, Arc::new(verifier));
        s.start();
        s
    }

    #[test]
    fn higher_score_wins() {
        let mut s = selector(Permissive);
        assert!(s.process(score(10, b"a"), 1).unwrap().is_some());
        assert!(s.process(score(5, b"b"), 1).unwrap().is_none());
        assert!(s.process(score(20, b"c"), 1).unwrap().is_some());

        assert_eq!(s.publish_best().block_hash, Hash::digest(b"c"));
    }

    #[test]
    fn tie_breaks_to_lower_vote_hash() {
        let mut s = selector(Permissive);
        let (a, b) = (Hash::digest(b"a"), Hash::digest(b"b"));
        let (first, second) = if a < b { (b"b", b"a") } else { (b"a", b"b") };

        assert!(s.process(score(10, first), 1).unwrap().is_some());
        assert!(s.process(score(10, second), 1).unwrap().is_some());
        assert_eq!(s.publish_best().block_hash, a.min(b));
    }

    #[test]
    fn empty_window_publishes_zero_and_adapts() {
        let mut s = selector(Permissive);
        let timeout = s.timeout();
        let threshold = s.threshold();

        let best = s.publish_best();
        assert!(best.block_hash.is_zero());
        assert_eq!(s.timeout(), timeout * 2);
        assert!(s.threshold() <= threshold);

        s.reset();
        assert_eq!(s.timeout(), timeout);
        assert_eq!(s.threshold(), threshold);
    }

    #[test]
    fn verification_failure_reverts_to_previous_best() {
        let mut s = selector(Permissive);
        assert!(s.process(score(10, b"good"), 1).unwrap().is_some());

        s.verifier = Arc::new(Rejecting);
        assert!(s.process(score(20, b"bad"), 1).is_err());

        // The reverted value stays; the failed one is gone.
        assert_eq!(s.publish_best().block_hash, Hash::digest(b"good"));
    }

    #[test]
    fn below_threshold_is_rejected() {
        let config = Config::default();
        let mut s = Selector::new(&config, Arc::new(Permissive));
        s.start();

        let low = score(0, b"low");
        assert!(matches!(
            s.process(low, 1),
            Err(ConsensusError::ScoreBelowThreshold)
        ));
    }
}
