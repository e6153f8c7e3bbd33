//! The Umbra consensus engine.
//!
//! A round is three phases: score selection over the blind-bid generation
//! window, two-step reduction, and agreement aggregation. The per-round
//! orchestration lives in [`Consensus::spin`]; the chain acceptor creates a
//! [`RoundUpdate`] at every tip advance and restarts the loop with it.
//!
//! # Concurrency
//!
//! Selection and reduction run as cooperative phases inside the round task.
//! The agreement accumulator runs for the whole round with a pool of
//! verification workers, because agreements for any step of the round can
//! arrive at any time. Cancellation is cooperative: the round task is
//! driven by a [`CancellationToken`] and drops all phase state (including
//! the vote aggregator) when it fires.

mod aggregator;
mod agreement;
mod config;
mod queue;
mod reduction;
mod round;
mod selector;
mod traits;

pub use aggregator::Aggregator;
pub use agreement::Accumulator;
pub use config::Config;
pub use queue::MsgQueue;
pub use reduction::ReductionStep;
pub use round::{Consensus, RoundUpdate, Winner};
pub use selector::Selector;
pub use traits::{CandidateVerifier, Permissive, ScoreVerifier};

use thiserror::Error;

/// Errors surfaced by the consensus engine.
///
/// Adversarial input is rejected with one of these, never a panic. Panics
/// are reserved for self-inconsistency (see [`Aggregator`]).
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("sender is not a committee member")]
    NotCommitteeMember,

    #[error("invalid vote signature")]
    InvalidSignature,

    #[error("invalid score proof: {0}")]
    InvalidScore(String),

    #[error("score below threshold")]
    ScoreBelowThreshold,

    #[error("invalid step votes: {0}")]
    InvalidStepVotes(String),

    #[error("candidate verification failed: {0}")]
    CandidateVerification(String),
}

// Re-exported so downstream crates use one token type.
pub use tokio_util::sync::CancellationToken;
