//! Consensus message payloads.

use serde::{Deserialize, Serialize};
use umbra_types::{reduction_message, Hash, Keys, PublicKey, Signature, StepVotes};

/// Routing header borne by every consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusHeader {
    /// BLS identity of the sender.
    pub pubkey: PublicKey,
    pub round: u64,
    pub step: u8,
    /// The block hash the message is about (the "vote hash").
    pub block_hash: Hash,
}

impl ConsensusHeader {
    pub fn new(pubkey: PublicKey, round: u64, step: u8, block_hash: Hash) -> Self {
        Self {
            pubkey,
            round,
            step,
            block_hash,
        }
    }

    /// The signable form of this header.
    pub fn signable(&self) -> [u8; 41] {
        reduction_message(self.round, self.step, &self.block_hash)
    }
}

/// A blind-bid score submitted during the generation phase.
///
/// The core verifies the zero-knowledge proof through a supplied verifier;
/// it never evaluates the scoring circuit itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub header: ConsensusHeader,
    /// Zero-knowledge proof blob.
    pub proof: Vec<u8>,
    /// 32-byte score value; higher wins.
    pub score: Hash,
    /// Z commitment of the proof.
    pub z: Hash,
    /// Commitment to the bid list the proof ranges over.
    pub bid_list: Vec<u8>,
    /// Seed-advance signature by the generator.
    pub seed_sig: Signature,
    /// Hash of the chain tip the candidate extends.
    pub prev_hash: Hash,
}

/// A reduction vote: the sender's signature over the signable form of
/// `(round, step, block_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    pub header: ConsensusHeader,
    pub signed_hash: Signature,
}

impl Reduction {
    /// Sign a reduction vote for `block_hash` at `(round, step)`.
    pub fn sign(keys: &Keys, round: u64, step: u8, block_hash: Hash) -> Self {
        let header = ConsensusHeader::new(keys.public().clone(), round, step, block_hash);
        let signed_hash = keys.sign(&header.signable());
        Reduction {
            header,
            signed_hash,
        }
    }
}

/// A cross-committee agreement: both reduction step votes of one iteration,
/// countersigned by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub header: ConsensusHeader,
    pub first_step: StepVotes,
    pub second_step: StepVotes,
    pub signature: Signature,
}

impl Agreement {
    /// Assemble and sign an agreement at the agreement step of an iteration.
    pub fn sign(
        keys: &Keys,
        round: u64,
        step: u8,
        block_hash: Hash,
        first_step: StepVotes,
        second_step: StepVotes,
    ) -> Self {
        let header = ConsensusHeader::new(keys.public().clone(), round, step, block_hash);
        let signature = keys.sign(&header.signable());
        Agreement {
            header,
            first_step,
            second_step,
            signature,
        }
    }

    /// Verify the sender's own signature over the header.
    pub fn verify_signature(&self) -> Result<(), umbra_types::CryptoError> {
        self.header
            .pubkey
            .verify(&self.header.signable(), &self.signature)
    }
}
