//! The block-store contract.
//!
//! A transactional key/value store with single-writer, multi-reader
//! semantics. Writers stage into a batch; everything staged lands
//! atomically on [`Writer::commit`] and is discarded when the writer is
//! dropped instead. The acceptor relies on that for the accept transaction:
//! the block write and the executor persist either both happen or neither.
//!
//! Logical key spaces: `blocks` (hash → block), `tx-id → block-hash`,
//! `key-image → block-hash`, `height → block`, `state` (tip and persisted
//! hashes), `candidates` (hash → proposed block), `provisioners@height`,
//! `bid-values@expiry`.

use thiserror::Error;
use umbra_types::{Block, Hash, Provisioners};

/// Errors of the block store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("block not found")]
    BlockNotFound,

    #[error("corrupted entry: {0}")]
    Corrupted(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Tip bookkeeping stored under the `state` key space.
///
/// `tip_hash` moves with every accepted block; `persisted_hash` only when
/// the accept transaction also persisted the executor, and marks where
/// startup recovery re-accepts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainState {
    pub tip_hash: Hash,
    pub persisted_hash: Hash,
}

/// Read operations, shared by readers and writers.
pub trait Reader {
    fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError>;

    fn fetch_block_hash_by_height(&self, height: u64) -> Result<Option<Hash>, DatabaseError>;

    fn fetch_current_height(&self) -> Result<Option<u64>, DatabaseError>;

    /// Secondary index: the block containing a transaction id.
    fn fetch_block_hash_by_tx_id(&self, tx_id: &Hash) -> Result<Option<Hash>, DatabaseError>;

    /// Secondary index: the block that spent an output key image.
    fn fetch_block_hash_by_key_image(&self, key_image: &Hash)
        -> Result<Option<Hash>, DatabaseError>;

    fn fetch_chain_state(&self) -> Result<Option<ChainState>, DatabaseError>;

    fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError>;

    fn fetch_provisioners(&self, height: u64) -> Result<Option<Provisioners>, DatabaseError>;

    fn fetch_bid_values(&self, expiry: u64) -> Result<Option<Vec<u8>>, DatabaseError>;
}

/// Staged write operations. Nothing is visible until [`Writer::commit`].
pub trait Writer: Reader + Send {
    /// Store a block with all its indexes, advance the `state` record, and
    /// prune bid values that expired below the block's height. `persisted`
    /// marks the block as covered by an executor persist.
    fn store_block(&mut self, block: &Block, persisted: bool) -> Result<(), DatabaseError>;

    fn store_candidate_block(&mut self, block: &Block) -> Result<(), DatabaseError>;

    /// Wipe the candidate store after a round concluded.
    fn clear_candidate_messages(&mut self) -> Result<(), DatabaseError>;

    fn store_provisioners(
        &mut self,
        height: u64,
        provisioners: &Provisioners,
    ) -> Result<(), DatabaseError>;

    fn store_bid_values(&mut self, expiry: u64, values: Vec<u8>) -> Result<(), DatabaseError>;

    /// Atomically apply everything staged.
    fn commit(self) -> Result<(), DatabaseError>;
}

/// A handle to the block store.
pub trait Database: Send + Sync + 'static {
    type Reader: Reader;
    type Writer: Writer;

    fn reader(&self) -> Result<Self::Reader, DatabaseError>;

    fn writer(&self) -> Result<Self::Writer, DatabaseError>;
}
