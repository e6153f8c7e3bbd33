//! Blocks, certificates and step votes.

use crate::bls::Signature;
use crate::hash::{merkle_root, Hash};
use crate::seed::Seed;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

/// Gas ceiling for a single block.
pub const BLOCK_GAS_LIMIT: u64 = 5_000_000_000;

/// Aggregated votes of one reduction step.
///
/// `bitset` selects the signing members out of the ordered committee for the
/// step; `aggregate` is the group addition of their vote signatures. An empty
/// `StepVotes` (no aggregate, zero bitset) is what a timed-out step yields.
///
/// Invariant: the bitset cardinality equals the number of distinct signers
/// folded into the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepVotes {
    pub aggregate: Option<Signature>,
    pub bitset: u64,
    pub step: u8,
}

impl StepVotes {
    /// The step votes of a step that expired without quorum.
    pub fn empty(step: u8) -> Self {
        StepVotes {
            aggregate: None,
            bitset: 0,
            step,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregate.is_none()
    }
}

/// The pair of step votes sealing a block: one per reduction step of the
/// iteration that reached agreement.
///
/// `step` is the agreement step; `step == 3` marks a first-iteration
/// agreement, which the chain acceptor finalizes rather than tentatively
/// accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Certificate {
    pub first_reduction: StepVotes,
    pub second_reduction: StepVotes,
    pub step: u8,
}

impl Certificate {
    pub fn new(first: StepVotes, second: StepVotes, step: u8) -> Self {
        Certificate {
            first_reduction: first,
            second_reduction: second,
            step,
        }
    }

    /// Genesis and not-yet-agreed candidates carry an empty certificate.
    pub fn is_empty(&self) -> bool {
        self.first_reduction.is_empty() && self.second_reduction.is_empty()
    }
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u8,
    pub height: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    pub gas_limit: u64,
    pub prev_block_hash: Hash,
    pub seed: Seed,
    /// Executor state root after applying this block.
    pub state_hash: Hash,
    /// Merkle root over the transaction ids.
    pub tx_root: Hash,
    /// Filled once agreement is reached; empty on fresh candidates.
    pub certificate: Certificate,
    /// Digest over the identity fields, excluding itself and the certificate.
    pub hash: Hash,
}

impl Header {
    /// Compute the header hash over the identity fields.
    ///
    /// The certificate is excluded: it is attached after agreement, and the
    /// hash the committee votes on must not change when it lands.
    pub fn compute_hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(128);
        buf.push(self.version);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.gas_limit.to_le_bytes());
        buf.extend_from_slice(self.prev_block_hash.as_bytes());
        buf.extend_from_slice(self.seed.as_bytes());
        buf.extend_from_slice(self.state_hash.as_bytes());
        buf.extend_from_slice(self.tx_root.as_bytes());
        Hash::digest(&buf)
    }
}

/// A block: header plus the transactions it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Build a block, computing the transaction root and header hash.
    pub fn new(mut header: Header, txs: Vec<Transaction>) -> Self {
        let ids: Vec<Hash> = txs.iter().map(Transaction::id).collect();
        header.tx_root = merkle_root(&ids);
        header.hash = header.compute_hash();
        Block { header, txs }
    }

    /// The genesis block: height 0, zero parent, fixed timestamp, the given
    /// state root, no certificate.
    pub fn genesis(state_hash: Hash) -> Self {
        let header = Header {
            version: 0,
            height: 0,
            timestamp: 1_600_000_000,
            gas_limit: BLOCK_GAS_LIMIT,
            prev_block_hash: Hash::ZERO,
            seed: Seed::ZERO,
            state_hash,
            tx_root: Hash::ZERO,
            certificate: Certificate::default(),
            hash: Hash::ZERO,
        };
        Block::new(header, Vec::new())
    }

    /// Merkle root recomputed from the body.
    pub fn tx_root(&self) -> Hash {
        let ids: Vec<Hash> = self.txs.iter().map(Transaction::id).collect();
        merkle_root(&ids)
    }

    /// Replace the executed form of a transaction (gas spent, error) without
    /// touching its identity. Returns false if `id` is not in the body.
    pub fn annotate_transaction(&mut self, id: Hash, gas_spent: u64, error: Option<crate::TxError>) -> bool {
        for tx in &mut self.txs {
            if tx.id() == id {
                tx.annotate(gas_spent, error);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxType;

    fn sample_header(height: u64) -> Header {
        Header {
            version: 0,
            height,
            timestamp: 1_700_000_000,
            gas_limit: BLOCK_GAS_LIMIT,
            prev_block_hash: Hash::digest(b"parent"),
            seed: Seed::ZERO,
            state_hash: Hash::digest(b"state"),
            tx_root: Hash::ZERO,
            certificate: Certificate::default(),
            hash: Hash::ZERO,
        }
    }

    #[test]
    fn header_hash_excludes_certificate() {
        let txs = vec![Transaction::new(TxType::Transfer, vec![1], 1000, 1)];
        let mut block = Block::new(sample_header(1), txs);
        let before = block.header.hash;

        block.header.certificate = Certificate::new(StepVotes::empty(1), StepVotes::empty(2), 3);
        assert_eq!(block.header.compute_hash(), before);
    }

    #[test]
    fn tx_root_matches_body() {
        let txs = vec![
            Transaction::new(TxType::Transfer, vec![1], 1000, 1),
            Transaction::new(TxType::Stake, vec![2], 1000, 1),
        ];
        let block = Block::new(sample_header(1), txs);
        assert_eq!(block.header.tx_root, block.tx_root());
    }

    #[test]
    fn annotation_does_not_change_root() {
        let txs = vec![Transaction::new(TxType::Transfer, vec![1], 1000, 1)];
        let id = txs[0].id();
        let mut block = Block::new(sample_header(2), txs);

        assert!(block.annotate_transaction(id, 99, None));
        assert_eq!(block.header.tx_root, block.tx_root());
        assert!(!block.annotate_transaction(Hash::digest(b"missing"), 1, None));
    }

    #[test]
    fn empty_step_votes() {
        let sv = StepVotes::empty(4);
        assert!(sv.is_empty());
        assert_eq!(sv.bitset, 0);
        assert_eq!(sv.step, 4);
    }
}
