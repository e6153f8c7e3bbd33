//! Chain errors.

use crate::database::DatabaseError;
use crate::executor::ExecutorError;
use thiserror::Error;

/// Errors raised on the acceptance paths.
///
/// Validity failures reject the block and penalise its source; consistency
/// failures ([`ChainError::StateMismatch`]) signal that the node and the
/// executor disagree about the world and recovery has to run.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("discarded block from the past")]
    BlockAlreadyAccepted,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid state hash")]
    InvalidStateHash,

    #[error("node and executor state differ: {0}")]
    StateMismatch(String),

    #[error("unknown candidate {0}")]
    UnknownCandidate(umbra_types::Hash),

    #[error("fallback rejected: {0}")]
    Fallback(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("executor call timed out")]
    ExecutorTimeout,
}
