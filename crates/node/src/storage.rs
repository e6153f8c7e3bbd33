//! RocksDB block store.
//!
//! Column families give each logical key space its own namespace; writes
//! stage into a `WriteBatch` and land in one atomic `DB::write`, which is
//! what the accept transaction's rollback semantics rely on. All calls are
//! synchronous blocking I/O; async callers on the hot path go through
//! `spawn_blocking` if contention ever warrants it.

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use umbra_chain::{ChainState, Database, DatabaseError, Reader, Writer};
use umbra_types::{Block, Hash, Provisioners};

const CF_BLOCKS: &str = "blocks";
const CF_HEIGHTS: &str = "heights";
const CF_TX_IDS: &str = "tx_ids";
const CF_KEY_IMAGES: &str = "key_images";
const CF_CANDIDATES: &str = "candidates";
const CF_PROVISIONERS: &str = "provisioners";
const CF_BID_VALUES: &str = "bid_values";
const CF_STATE: &str = "state";

const STATE_KEY: &[u8] = b"chain_state";
const HEIGHT_KEY: &[u8] = b"current_height";

/// Errors from opening the store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
}

/// RocksDB-backed block store.
pub struct RocksDbStorage {
    db: Arc<DB>,
}

impl RocksDbStorage {
    /// Open or create the store at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_max_background_jobs(4);
        opts.set_keep_log_file_num(10);

        let cf_descriptors: Vec<_> = [
            CF_BLOCKS,
            CF_HEIGHTS,
            CF_TX_IDS,
            CF_KEY_IMAGES,
            CF_CANDIDATES,
            CF_PROVISIONERS,
            CF_BID_VALUES,
            CF_STATE,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, DatabaseError> {
    db.cf_handle(name)
        .ok_or_else(|| DatabaseError::Storage(format!("missing column family {name}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, DatabaseError> {
    bincode::serialize(value).map_err(|e| DatabaseError::Storage(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, DatabaseError> {
    bincode::deserialize(bytes).map_err(|e| DatabaseError::Corrupted(e.to_string()))
}

fn get_hash(db: &DB, cf_name: &str, key: &[u8]) -> Result<Option<Hash>, DatabaseError> {
    let handle = cf(db, cf_name)?;
    let Some(bytes) = db
        .get_cf(handle, key)
        .map_err(|e| DatabaseError::Storage(e.to_string()))?
    else {
        return Ok(None);
    };
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| DatabaseError::Corrupted("hash entry of wrong length".into()))?;
    Ok(Some(Hash::from_bytes(arr)))
}

/// Shared read path of readers and writers.
struct Ops {
    db: Arc<DB>,
}

impl Ops {
    fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        let handle = cf(&self.db, CF_BLOCKS)?;
        self.db
            .get_cf(handle, hash.as_bytes())
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
            .map(|b| decode(&b))
            .transpose()
    }

    fn fetch_block_hash_by_height(&self, height: u64) -> Result<Option<Hash>, DatabaseError> {
        get_hash(&self.db, CF_HEIGHTS, &height.to_le_bytes())
    }

    fn fetch_current_height(&self) -> Result<Option<u64>, DatabaseError> {
        let handle = cf(&self.db, CF_STATE)?;
        let Some(bytes) = self
            .db
            .get_cf(handle, HEIGHT_KEY)
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        let arr: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DatabaseError::Corrupted("height entry of wrong length".into()))?;
        Ok(Some(u64::from_le_bytes(arr)))
    }

    fn fetch_block_hash_by_tx_id(&self, tx_id: &Hash) -> Result<Option<Hash>, DatabaseError> {
        get_hash(&self.db, CF_TX_IDS, tx_id.as_bytes())
    }

    fn fetch_block_hash_by_key_image(
        &self,
        key_image: &Hash,
    ) -> Result<Option<Hash>, DatabaseError> {
        get_hash(&self.db, CF_KEY_IMAGES, key_image.as_bytes())
    }

    fn fetch_chain_state(&self) -> Result<Option<ChainState>, DatabaseError> {
        let handle = cf(&self.db, CF_STATE)?;
        let Some(bytes) = self
            .db
            .get_cf(handle, STATE_KEY)
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        if bytes.len() != 64 {
            return Err(DatabaseError::Corrupted("state entry of wrong length".into()));
        }
        let tip: [u8; 32] = bytes[..32].try_into().unwrap();
        let persisted: [u8; 32] = bytes[32..].try_into().unwrap();
        Ok(Some(ChainState {
            tip_hash: Hash::from_bytes(tip),
            persisted_hash: Hash::from_bytes(persisted),
        }))
    }

    fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
        let handle = cf(&self.db, CF_CANDIDATES)?;
        self.db
            .get_cf(handle, hash.as_bytes())
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
            .map(|b| decode(&b))
            .transpose()
    }

    fn fetch_provisioners(&self, height: u64) -> Result<Option<Provisioners>, DatabaseError> {
        let handle = cf(&self.db, CF_PROVISIONERS)?;
        self.db
            .get_cf(handle, height.to_le_bytes())
            .map_err(|e| DatabaseError::Storage(e.to_string()))?
            .map(|b| decode(&b))
            .transpose()
    }

    fn fetch_bid_values(&self, expiry: u64) -> Result<Option<Vec<u8>>, DatabaseError> {
        let handle = cf(&self.db, CF_BID_VALUES)?;
        self.db
            .get_cf(handle, expiry.to_le_bytes())
            .map_err(|e| DatabaseError::Storage(e.to_string()))
    }
}

macro_rules! delegate_reader {
    ($ty:ty, $field:ident) => {
        impl Reader for $ty {
            fn fetch_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
                self.$field.fetch_block(hash)
            }
            fn fetch_block_hash_by_height(
                &self,
                height: u64,
            ) -> Result<Option<Hash>, DatabaseError> {
                self.$field.fetch_block_hash_by_height(height)
            }
            fn fetch_current_height(&self) -> Result<Option<u64>, DatabaseError> {
                self.$field.fetch_current_height()
            }
            fn fetch_block_hash_by_tx_id(
                &self,
                tx_id: &Hash,
            ) -> Result<Option<Hash>, DatabaseError> {
                self.$field.fetch_block_hash_by_tx_id(tx_id)
            }
            fn fetch_block_hash_by_key_image(
                &self,
                key_image: &Hash,
            ) -> Result<Option<Hash>, DatabaseError> {
                self.$field.fetch_block_hash_by_key_image(key_image)
            }
            fn fetch_chain_state(&self) -> Result<Option<ChainState>, DatabaseError> {
                self.$field.fetch_chain_state()
            }
            fn fetch_candidate_block(&self, hash: &Hash) -> Result<Option<Block>, DatabaseError> {
                self.$field.fetch_candidate_block(hash)
            }
            fn fetch_provisioners(
                &self,
                height: u64,
            ) -> Result<Option<Provisioners>, DatabaseError> {
                self.$field.fetch_provisioners(height)
            }
            fn fetch_bid_values(&self, expiry: u64) -> Result<Option<Vec<u8>>, DatabaseError> {
                self.$field.fetch_bid_values(expiry)
            }
        }
    };
}

/// Reader over committed state.
pub struct RocksReader {
    ops: Ops,
}

delegate_reader!(RocksReader, ops);

/// Writer staging into a `WriteBatch`. Reads see committed state only;
/// the accept transaction never reads back what it staged.
pub struct RocksWriter {
    ops: Ops,
    batch: WriteBatch,
}

delegate_reader!(RocksWriter, ops);

impl Writer for RocksWriter {
    fn store_block(&mut self, block: &Block, persisted: bool) -> Result<(), DatabaseError> {
        let db = &self.ops.db;
        let hash = block.header.hash;
        let bytes = encode(block)?;

        self.batch.put_cf(cf(db, CF_BLOCKS)?, hash.as_bytes(), &bytes);
        self.batch.put_cf(
            cf(db, CF_HEIGHTS)?,
            block.header.height.to_le_bytes(),
            hash.as_bytes(),
        );
        for tx in &block.txs {
            self.batch
                .put_cf(cf(db, CF_TX_IDS)?, tx.id().as_bytes(), hash.as_bytes());
            for ki in &tx.key_images {
                self.batch
                    .put_cf(cf(db, CF_KEY_IMAGES)?, ki.as_bytes(), hash.as_bytes());
            }
        }

        let persisted_hash = if persisted {
            hash
        } else {
            match self.ops.fetch_chain_state()? {
                Some(state) => state.persisted_hash,
                None => hash,
            }
        };
        let mut state_bytes = [0u8; 64];
        state_bytes[..32].copy_from_slice(hash.as_bytes());
        state_bytes[32..].copy_from_slice(persisted_hash.as_bytes());
        self.batch.put_cf(cf(db, CF_STATE)?, STATE_KEY, state_bytes);
        self.batch.put_cf(
            cf(db, CF_STATE)?,
            HEIGHT_KEY,
            block.header.height.to_le_bytes(),
        );

        // Prune bid values that expired below the new height.
        let bid_cf = cf(db, CF_BID_VALUES)?;
        let iter = db.iterator_cf(bid_cf, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| DatabaseError::Storage(e.to_string()))?;
            let Ok(arr) = <[u8; 8]>::try_from(key.as_ref()) else {
                continue;
            };
            if u64::from_le_bytes(arr) < block.header.height {
                self.batch.delete_cf(bid_cf, key);
            }
        }

        Ok(())
    }

    fn store_candidate_block(&mut self, block: &Block) -> Result<(), DatabaseError> {
        let bytes = encode(block)?;
        self.batch.put_cf(
            cf(&self.ops.db, CF_CANDIDATES)?,
            block.header.hash.as_bytes(),
            &bytes,
        );
        Ok(())
    }

    fn clear_candidate_messages(&mut self) -> Result<(), DatabaseError> {
        let db = &self.ops.db;
        let handle = cf(db, CF_CANDIDATES)?;
        let iter = db.iterator_cf(handle, rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| DatabaseError::Storage(e.to_string()))?;
            self.batch.delete_cf(handle, key);
        }
        Ok(())
    }

    fn store_provisioners(
        &mut self,
        height: u64,
        provisioners: &Provisioners,
    ) -> Result<(), DatabaseError> {
        let bytes = encode(provisioners)?;
        self.batch.put_cf(
            cf(&self.ops.db, CF_PROVISIONERS)?,
            height.to_le_bytes(),
            &bytes,
        );
        Ok(())
    }

    fn store_bid_values(&mut self, expiry: u64, values: Vec<u8>) -> Result<(), DatabaseError> {
        self.batch.put_cf(
            cf(&self.ops.db, CF_BID_VALUES)?,
            expiry.to_le_bytes(),
            values,
        );
        Ok(())
    }

    fn commit(self) -> Result<(), DatabaseError> {
        self.ops
            .db
            .write(self.batch)
            .map_err(|e| DatabaseError::Storage(e.to_string()))
    }
}

impl Database for RocksDbStorage {
    type Reader = RocksReader;
    type Writer = RocksWriter;

    fn reader(&self) -> Result<Self::Reader, DatabaseError> {
        Ok(RocksReader {
            ops: Ops {
                db: self.db.clone(),
            },
        })
    }

    fn writer(&self) -> Result<Self::Writer, DatabaseError> {
        Ok(RocksWriter {
            ops: Ops {
                db: self.db.clone(),
            },
            batch: WriteBatch::default(),
        })
    }
}
