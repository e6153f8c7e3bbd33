//! Seams to the engine's collaborators.

use crate::ConsensusError;
use umbra_messages::Score;
use umbra_types::Hash;

/// Verifier of blind-bid score proofs.
///
/// The scoring circuit itself is external; the engine only asks whether a
/// proof holds for the claimed score under the round's seed. Tests swap in
/// a permissive implementation.
pub trait ScoreVerifier: Send + Sync {
    fn verify(&self, score: &Score, round: u64) -> Result<(), ConsensusError>;
}

/// Callback into the chain for candidate validation.
///
/// Before the first reduction step signs a non-empty hash, the chain is
/// asked to verify the candidate block behind it (header sanity plus a
/// dry-run state transition). The call runs concurrently with vote
/// collection and is bounded by the step timeout.
#[async_trait::async_trait]
pub trait CandidateVerifier: Send + Sync {
    async fn verify_candidate(&self, hash: Hash) -> Result<(), ConsensusError>;
}

/// Accepts everything. For tests and for nodes that trust upstream blocks.
pub struct Permissive;

impl ScoreVerifier for Permissive {
    fn verify(&self, _score: &Score, _round: u64) -> Result<(), ConsensusError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl CandidateVerifier for Permissive {
    async fn verify_candidate(&self, _hash: Hash) -> Result<(), ConsensusError> {
        Ok(())
    }
}
