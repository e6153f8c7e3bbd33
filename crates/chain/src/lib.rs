//! Chain acceptance for the Umbra node.
//!
//! The [`Acceptor`] owns the tip and the live provisioner set. Blocks reach
//! it from consensus (the winning candidate of a round) or from the
//! [`Synchronizer`] while catching up; either way acceptance is one atomic
//! unit: validity checks, the executor state transition, the block-store
//! write (with the periodic executor persist inside the same transaction)
//! and the tip advance.
//!
//! Competing tips at the current height go through the fallback procedure,
//! which rolls the executor back one block, re-accepts the incoming block
//! and blacklists the displaced hash.

mod acceptor;
mod database;
mod error;
mod executor;
mod lite;
mod sync;
mod verifier;

pub use acceptor::{AcceptedBlock, Acceptor, CandidateHook, ChainConfig};
pub use database::{ChainState, Database, DatabaseError, Reader, Writer};
pub use error::ChainError;
pub use executor::{CallParams, CallResult, Executor, ExecutorError, MemoryExecutor};
pub use lite::LiteDb;
pub use sync::{SyncOutcome, SyncStatus, Synchronizer};
pub use verifier::{check_block_certificate, sanity_check_block};
