//! In-memory block store.
//!
//! Backs tests and ephemeral nodes. Blocks are serialized exactly as the
//! persistent store would serialize them, so round-trip behaviour matches.

use crate::database::{ChainState, Database, DatabaseError, Reader, Writer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use umbra_types::{Block, Hash, Provisioners};

#[derive(Default, Clone)]
struct Storage {
    blocks: HashMap<Hash, Vec<u8>>,
    heights: HashMap<u64, Hash>,
    tx_ids: HashMap<Hash, Hash>,
    key_images: HashMap<Hash, Hash>,
    candidates: HashMap<Hash, Vec<u8>>,
    provisioners: HashMap<u64, Vec<u8>>,
    bid_values: HashMap<u64, Vec<u8>>,
    state: Option<ChainState>,
    current_height: Option<u64>,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    bincode::serialize(value).map_err(|e| DatabaseError::Storage(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, DatabaseError> {
    bincode::deserialize(bytes).map_err(|e| DatabaseError::Corrupted(e.to_string()))
}

impl Storage {
    fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.blocks.get(hash).map(|b| decode(b)).transpose()
    }

    fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.candidates.get(hash).map(|b| decode(b)).transpose()
    }

    fn fetch_provisioners(&self, height: u64) -> Result<Option<Provisioners>, DatabaseError> {
        self.provisioners
            .get(&height)
            .map(|b| decode(b))
            .transpose()
    }
}

/// Shared in-memory store.
#[derive(Clone, Default)]
pub struct LiteDb {
    storage: Arc<RwLock<Storage>>,
}

impl LiteDb {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Reader over the committed storage.
pub struct LiteReader {
    storage: Arc<RwLock<Storage>>,
}

impl Reader for LiteReader {
    fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.storage.read().fetch_block(hash)
    }

    fn fetch_block_hash_by_height(&self, height: u64) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.storage.read().heights.get(&height).copied())
    }

    fn fetch_current_height(&self) -> Result<Option<u64>, DatabaseError> {
        Ok(self.storage.read().current_height)
    }

    fn fetch_block_hash_by_tx_id(&self, tx_id: &Hash) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.storage.read().tx_ids.get(tx_id).copied())
    }

    fn fetch_block_hash_by_key_image(
        &self,
        key_image: &Hash,
    ) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.storage.read().key_images.get(key_image).copied())
    }

    fn fetch_chain_state(&self) -> Result<Option<ChainState>, DatabaseError> {
        Ok(self.storage.read().state)
    }

    fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.storage.read().fetch_candidate_block(hash)
    }

    fn fetch_provisioners(&self, height: u64) -> Result<Option<Provisioners>, DatabaseError> {
        self.storage.read().fetch_provisioners(height)
    }

    fn fetch_bid_values(&self, expiry: u64) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.storage.read().bid_values.get(&expiry).cloned())
    }
}

/// Staged writer: reads see the staged view, commit swaps it in atomically.
pub struct LiteWriter {
    storage: Arc<RwLock<Storage>>,
    staged: Storage,
}

impl Reader for LiteWriter {
    fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.staged.fetch_block(hash)
    }

    fn fetch_block_hash_by_height(&self, height: u64) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.staged.heights.get(&height).copied())
    }

    fn fetch_current_height(&self) -> Result<Option<u64>, DatabaseError> {
        Ok(self.staged.current_height)
    }

    fn fetch_block_hash_by_tx_id(&self, tx_id: &Hash) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.staged.tx_ids.get(tx_id).copied())
    }

    fn fetch_block_hash_by_key_image(
        &self,
        key_image: &Hash,
    ) -> Result<Option<Hash>, DatabaseError> {
        Ok(self.staged.key_images.get(key_image).copied())
    }

    fn fetch_chain_state(&self) -> Result<Option<ChainState>, DatabaseError> {
        Ok(self.staged.state)
    }

    fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        self.staged.fetch_candidate_block(hash)
    }

    fn fetch_provisioners(&self, height: u64) -> Result<Option<Provisioners>, DatabaseError> {
        self.staged.fetch_provisioners(height)
    }

    fn fetch_bid_values(&self, expiry: u64) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.staged.bid_values.get(&expiry).cloned())
    }
}

impl Writer for LiteWriter {
    fn store_block(&mut self, block: &Block, persisted: bool) -> Result<(), DatabaseError> {
        let hash = block.header.hash;
        let bytes = encode(block)?;

        self.staged.blocks.insert(hash, bytes);
        self.staged.heights.insert(block.header.height, hash);
        for tx in &block.txs {
            self.staged.tx_ids.insert(tx.id(), hash);
            for ki in &tx.key_images {
                self.staged.key_images.insert(*ki, hash);
            }
        }

        let persisted_hash = match (persisted, self.staged.state) {
            (true, _) => hash,
            (false, Some(state)) => state.persisted_hash,
            (false, None) => hash,
        };
        self.staged.state = Some(ChainState {
            tip_hash: hash,
            persisted_hash,
        });
        self.staged.current_height = Some(block.header.height);

        // Expired bid values go with the block that outlived them.
        let height = block.header.height;
        self.staged.bid_values.retain(|expiry, _| *expiry >= height);

        Ok(())
    }

    fn store_candidate_block(&mut self, block: &Block) -> Result<(), DatabaseError> {
        let bytes = encode(block)?;
        self.staged.candidates.insert(block.header.hash, bytes);
        Ok(())
    }

    fn clear_candidate_messages(&mut self) -> Result<(), DatabaseError> {
        self.staged.candidates.clear();
        Ok(())
    }

    fn store_provisioners(
        &mut self,
        height: u64,
        provisioners: &Provisioners,
    ) -> Result<(), DatabaseError> {
        let bytes = encode(provisioners)?;
        self.staged.provisioners.insert(height, bytes);
        Ok(())
    }

    fn store_bid_values(&mut self, expiry: u64, values: Vec<u8>) -> Result<(), DatabaseError> {
        self.staged.bid_values.insert(expiry, values);
        Ok(())
    }

    fn commit(self) -> Result<(), DatabaseError> {
        *self.storage.write() = self.staged;
        Ok(())
    }
}

impl Database for LiteDb {
    type Reader = LiteReader;
    type Writer = LiteWriter;

    fn reader(&self) -> Result<Self::Reader, DatabaseError> {
        Ok(LiteReader {
            storage: self.storage.clone(),
        })
    }

    fn writer(&self) -> Result<Self::Writer, DatabaseError> {
        let staged = self.storage.read().clone();
        Ok(LiteWriter {
            storage: self.storage.clone(),
            staged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_types::test_utils::{test_provisioners, test_transaction};
    use umbra_types::{Block, Certificate, Header, Seed, BLOCK_GAS_LIMIT};

    fn block_at(height: u64, prev: Hash) -> Block {
        let header = Header {
            version: 0,
            height,
            timestamp: 1_700_000_000 + height,
            gas_limit: BLOCK_GAS_LIMIT,
            prev_block_hash: prev,
            seed: Seed::ZERO,
            state_hash: Hash::digest(b"state"),
            tx_root: Hash::ZERO,
            certificate: Certificate::default(),
            hash: Hash::ZERO,
        };
        Block::new(header, vec![test_transaction(height as u8)])
    }

    #[test]
    fn store_and_fetch_block() {
        let db = LiteDb::new();
        let block = block_at(1, Hash::digest(b"genesis"));

        let mut tx = db.writer().unwrap();
        tx.store_block(&block, false).unwrap();
        tx.commit().unwrap();

        let reader = db.reader().unwrap();
        assert_eq!(
            reader.fetch_block(&block.header.hash).unwrap(),
            Some(block.clone())
        );
        assert_eq!(
            reader.fetch_block_hash_by_height(1).unwrap(),
            Some(block.header.hash)
        );
        assert_eq!(reader.fetch_current_height().unwrap(), Some(1));
    }

    #[test]
    fn secondary_indexes() {
        let db = LiteDb::new();
        let tx0 = test_transaction(9).with_key_images(vec![Hash::digest(b"ki")]);
        let tx_id = tx0.id();

        let header = block_at(1, Hash::ZERO).header;
        let block = Block::new(header, vec![tx0]);

        let mut w = db.writer().unwrap();
        w.store_block(&block, false).unwrap();
        w.commit().unwrap();

        let reader = db.reader().unwrap();
        assert_eq!(
            reader.fetch_block_hash_by_tx_id(&tx_id).unwrap(),
            Some(block.header.hash)
        );
        assert_eq!(
            reader
                .fetch_block_hash_by_key_image(&Hash::digest(b"ki"))
                .unwrap(),
            Some(block.header.hash)
        );
    }

    #[test]
    fn uncommitted_writer_changes_nothing() {
        let db = LiteDb::new();
        let block = block_at(1, Hash::ZERO);

        {
            let mut w = db.writer().unwrap();
            w.store_block(&block, false).unwrap();
            // Dropped without commit.
        }

        let reader = db.reader().unwrap();
        assert_eq!(reader.fetch_block(&block.header.hash).unwrap(), None);
        assert_eq!(reader.fetch_current_height().unwrap(), None);
    }

    #[test]
    fn persisted_hash_tracks_persist_flag() {
        let db = LiteDb::new();
        let b1 = block_at(1, Hash::ZERO);
        let b2 = block_at(2, b1.header.hash);

        let mut w = db.writer().unwrap();
        w.store_block(&b1, true).unwrap();
        w.commit().unwrap();

        let mut w = db.writer().unwrap();
        w.store_block(&b2, false).unwrap();
        w.commit().unwrap();

        let state = db.reader().unwrap().fetch_chain_state().unwrap().unwrap();
        assert_eq!(state.tip_hash, b2.header.hash);
        assert_eq!(state.persisted_hash, b1.header.hash);
    }

    #[test]
    fn candidates_can_be_cleared() {
        let db = LiteDb::new();
        let candidate = block_at(5, Hash::ZERO);

        let mut w = db.writer().unwrap();
        w.store_candidate_block(&candidate).unwrap();
        w.commit().unwrap();

        assert!(db
            .reader()
            .unwrap()
            .fetch_candidate_block(&candidate.header.hash)
            .unwrap()
            .is_some());

        let mut w = db.writer().unwrap();
        w.clear_candidate_messages().unwrap();
        w.commit().unwrap();

        assert!(db
            .reader()
            .unwrap()
            .fetch_candidate_block(&candidate.header.hash)
            .unwrap()
            .is_none());
    }

    #[test]
    fn bid_values_expire_with_block_height() {
        let db = LiteDb::new();

        let mut w = db.writer().unwrap();
        w.store_bid_values(3, vec![1]).unwrap();
        w.store_bid_values(10, vec![2]).unwrap();
        w.commit().unwrap();

        let mut w = db.writer().unwrap();
        w.store_block(&block_at(5, Hash::ZERO), false).unwrap();
        w.commit().unwrap();

        let reader = db.reader().unwrap();
        assert_eq!(reader.fetch_bid_values(3).unwrap(), None);
        assert_eq!(reader.fetch_bid_values(10).unwrap(), Some(vec![2]));
    }

    #[test]
    fn provisioner_snapshots_by_height() {
        let db = LiteDb::new();
        let (provisioners, _) = test_provisioners(3);

        let mut w = db.writer().unwrap();
        w.store_provisioners(7, &provisioners).unwrap();
        w.commit().unwrap();

        let reader = db.reader().unwrap();
        assert_eq!(reader.fetch_provisioners(7).unwrap(), Some(provisioners));
        assert_eq!(reader.fetch_provisioners(8).unwrap(), None);
    }
}
