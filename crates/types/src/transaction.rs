//! Transactions as the consensus core sees them.
//!
//! The core does not interpret contract payloads. It carries transactions
//! into the executor, stores them, and indexes them by id and by the key
//! images of their outputs. Gas accounting is written back by the executor
//! after the state transition (`gas_spent`, `error`); those annotations are
//! excluded from the id so an executed transaction keeps its identity.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};

/// Contract call category.
///
/// `Bid` and `Stake` drive generator eligibility and the provisioner set,
/// but only indirectly: the executor owns that logic and the core treats the
/// returned provisioner set as authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Transfer,
    Bid,
    Stake,
    Distribute,
}

/// Error reported by the executor for a failed contract call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxError {
    pub code: u32,
    pub description: String,
}

/// A contract call carried by a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_type: TxType,
    pub payload: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u64,
    /// Key images of spent outputs, indexed in the block store.
    pub key_images: Vec<Hash>,
    /// Filled in by the executor after the state transition.
    pub gas_spent: Option<u64>,
    /// Set by the executor when the call failed during execution.
    pub error: Option<TxError>,
}

impl Transaction {
    pub fn new(tx_type: TxType, payload: Vec<u8>, gas_limit: u64, gas_price: u64) -> Self {
        Self {
            tx_type,
            payload,
            gas_limit,
            gas_price,
            key_images: Vec::new(),
            gas_spent: None,
            error: None,
        }
    }

    pub fn with_key_images(mut self, key_images: Vec<Hash>) -> Self {
        self.key_images = key_images;
        self
    }

    /// Transaction id: digest over the identity fields only.
    pub fn id(&self) -> Hash {
        let mut buf = Vec::with_capacity(self.payload.len() + 64);
        buf.push(match self.tx_type {
            TxType::Transfer => 0,
            TxType::Bid => 1,
            TxType::Stake => 2,
            TxType::Distribute => 3,
        });
        buf.extend_from_slice(&self.gas_limit.to_le_bytes());
        buf.extend_from_slice(&self.gas_price.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        for ki in &self.key_images {
            buf.extend_from_slice(ki.as_bytes());
        }
        Hash::digest(&buf)
    }

    /// Record the executor's gas accounting for this call.
    pub fn annotate(&mut self, gas_spent: u64, error: Option<TxError>) {
        self.gas_spent = Some(gas_spent);
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ignores_executor_annotations() {
        let mut tx = Transaction::new(TxType::Transfer, vec![1, 2, 3], 1000, 1);
        let before = tx.id();
        tx.annotate(
            42,
            Some(TxError {
                code: 7,
                description: "out of gas".into(),
            }),
        );
        assert_eq!(tx.id(), before);
    }

    #[test]
    fn id_covers_payload_and_key_images() {
        let a = Transaction::new(TxType::Transfer, vec![1], 1000, 1);
        let b = Transaction::new(TxType::Transfer, vec![2], 1000, 1);
        assert_ne!(a.id(), b.id());

        let c = a.clone().with_key_images(vec![Hash::digest(b"ki")]);
        assert_ne!(a.id(), c.id());
    }
}
