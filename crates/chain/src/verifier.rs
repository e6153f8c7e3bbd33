//! Block validity.
//!
//! Stateless checks compare a block against its parent; the certificate
//! check reconstructs both reduction committees from the parent's seed and
//! verifies the aggregated signatures. Failures are final: a block that
//! fails here is rejected and its source penalised, it is never retried.

use crate::ChainError;
use tracing::debug;
use umbra_types::{
    quorum, reduction_message, Block, Committee, Provisioners, PublicKey, Seed, StepVotes,
    BLOCK_GAS_LIMIT,
};

/// Stateless validity of `block` against its parent.
pub fn sanity_check_block(prev: &Block, block: &Block) -> Result<(), ChainError> {
    let header = &block.header;
    let parent = &prev.header;

    if header.version != parent.version {
        return Err(ChainError::InvalidBlock(format!(
            "version {} differs from chain version {}",
            header.version, parent.version
        )));
    }

    if header.height != parent.height + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "height {} does not follow {}",
            header.height, parent.height
        )));
    }

    if header.prev_block_hash != parent.hash {
        return Err(ChainError::InvalidBlock(
            "prev_block_hash does not match parent".into(),
        ));
    }

    if header.timestamp <= parent.timestamp {
        return Err(ChainError::InvalidBlock(format!(
            "timestamp {} not after parent's {}",
            header.timestamp, parent.timestamp
        )));
    }

    if header.gas_limit == 0 || header.gas_limit > BLOCK_GAS_LIMIT {
        return Err(ChainError::InvalidBlock(format!(
            "gas limit {} out of bounds",
            header.gas_limit
        )));
    }

    if header.hash != header.compute_hash() {
        return Err(ChainError::InvalidBlock("header hash mismatch".into()));
    }

    if header.tx_root != block.tx_root() {
        return Err(ChainError::InvalidBlock(
            "transaction root does not match body".into(),
        ));
    }

    Ok(())
}

/// Verify a block's certificate against the provisioner snapshot and the
/// parent's sortition seed.
///
/// Both step votes must cover the block hash at consecutive reduction
/// steps, carry at least quorum weight, and their aggregated signatures
/// must verify against the aggregate key of the bitset-selected committee
/// members.
pub fn check_block_certificate(
    provisioners: &Provisioners,
    block: &Block,
    prev_seed: &Seed,
    committee_size: usize,
) -> Result<(), ChainError> {
    // Genesis carries no certificate.
    if block.header.height == 0 {
        return Ok(());
    }

    let certificate = &block.header.certificate;
    if certificate.is_empty() {
        return Err(ChainError::InvalidCertificate("empty certificate".into()));
    }

    let first = &certificate.first_reduction;
    let second = &certificate.second_reduction;

    if first.step + 1 != second.step || second.step + 1 != certificate.step {
        return Err(ChainError::InvalidCertificate(format!(
            "steps {}/{}/{} are not consecutive",
            first.step, second.step, certificate.step
        )));
    }

    let round = block.header.height;
    for votes in [first, second] {
        check_step_votes(
            provisioners,
            prev_seed,
            round,
            votes,
            &block.header.hash,
            committee_size,
        )?;
    }

    debug!(height = round, step = certificate.step, "certificate ok");
    Ok(())
}

fn check_step_votes(
    provisioners: &Provisioners,
    seed: &Seed,
    round: u64,
    votes: &StepVotes,
    block_hash: &umbra_types::Hash,
    committee_size: usize,
) -> Result<(), ChainError> {
    let Some(aggregate) = &votes.aggregate else {
        return Err(ChainError::InvalidCertificate(format!(
            "empty step votes at step {}",
            votes.step
        )));
    };

    let committee = Committee::sortition(provisioners, seed, round, votes.step, committee_size);
    let signers: Vec<PublicKey> = committee.intersect(votes.bitset);
    if signers.is_empty() {
        return Err(ChainError::InvalidCertificate(format!(
            "empty committee bitset at step {}",
            votes.step
        )));
    }

    let weight: usize = signers.iter().map(|pk| committee.votes_for(pk)).sum();
    if weight < quorum(committee.total_occurrences()) {
        return Err(ChainError::InvalidCertificate(format!(
            "step {} signers hold {weight} of {} required votes",
            votes.step,
            quorum(committee.total_occurrences())
        )));
    }

    let apk = PublicKey::aggregate(&signers)
        .map_err(|e| ChainError::InvalidCertificate(e.to_string()))?;

    apk.verify(&reduction_message(round, votes.step, block_hash), aggregate)
        .map_err(|_| {
            ChainError::InvalidCertificate(format!(
                "aggregate signature does not verify at step {}",
                votes.step
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use umbra_types::test_utils::test_provisioners;
    use umbra_types::{Block, Certificate, Hash, Header, Keys, Signature};

    fn chained_blocks() -> (Block, Block) {
        let genesis = Block::genesis(Hash::digest(b"root"));
        let header = Header {
            version: 0,
            height: 1,
            timestamp: genesis.header.timestamp + 10,
            gas_limit: BLOCK_GAS_LIMIT,
            prev_block_hash: genesis.header.hash,
            seed: Seed::ZERO,
            state_hash: Hash::digest(b"next root"),
            tx_root: Hash::ZERO,
            certificate: Certificate::default(),
            hash: Hash::ZERO,
        };
        (genesis.clone(), Block::new(header, vec![]))
    }

    #[test]
    fn valid_successor_passes_sanity() {
        let (genesis, block) = chained_blocks();
        assert!(sanity_check_block(&genesis, &block).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let (genesis, block) = chained_blocks();
        let mut header = block.header.clone();
        header.timestamp = genesis.header.timestamp;
        let bad = Block::new(header, vec![]);
        assert!(sanity_check_block(&genesis, &bad).is_err());
    }

    #[test]
    fn wrong_parent_is_rejected() {
        let (genesis, block) = chained_blocks();
        let mut header = block.header.clone();
        header.prev_block_hash = Hash::digest(b"someone else");
        let bad = Block::new(header, vec![]);
        assert!(sanity_check_block(&genesis, &bad).is_err());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let (genesis, block) = chained_blocks();
        let mut tampered = block.clone();
        tampered
            .txs
            .push(umbra_types::test_utils::test_transaction(1));
        assert!(sanity_check_block(&genesis, &tampered).is_err());
    }

    fn votes_by_all(
        provisioners: &Provisioners,
        keys: &[Keys],
        seed: &Seed,
        round: u64,
        step: u8,
        hash: &Hash,
        size: usize,
    ) -> StepVotes {
        let committee = Committee::sortition(provisioners, seed, round, step, size);
        let mut aggregate: Option<Signature> = None;
        let mut signers = BTreeSet::new();
        for k in keys {
            if committee.votes_for(k.public()) == 0 {
                continue;
            }
            let sig = k.sign(&reduction_message(round, step, hash));
            aggregate = Some(match aggregate {
                None => sig,
                Some(agg) => agg.combine(&sig).unwrap(),
            });
            signers.insert(k.public().clone());
        }
        StepVotes {
            aggregate,
            bitset: committee.bits(&signers),
            step,
        }
    }

    #[test]
    fn full_certificate_verifies() {
        let (provisioners, keys) = test_provisioners(4);
        let (genesis, mut block) = chained_blocks();
        let size = 4;

        let hash = block.header.hash;
        block.header.certificate = Certificate::new(
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 1, &hash, size),
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 2, &hash, size),
            3,
        );

        assert!(check_block_certificate(
            &provisioners,
            &block,
            &genesis.header.seed,
            size
        )
        .is_ok());
    }

    #[test]
    fn certificate_for_other_hash_fails() {
        let (provisioners, keys) = test_provisioners(4);
        let (genesis, mut block) = chained_blocks();
        let size = 4;

        let other = Hash::digest(b"a different block");
        block.header.certificate = Certificate::new(
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 1, &other, size),
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 2, &other, size),
            3,
        );

        assert!(check_block_certificate(
            &provisioners,
            &block,
            &genesis.header.seed,
            size
        )
        .is_err());
    }

    #[test]
    fn empty_certificate_fails() {
        let (provisioners, _) = test_provisioners(4);
        let (genesis, block) = chained_blocks();
        assert!(check_block_certificate(&provisioners, &block, &genesis.header.seed, 4).is_err());
    }

    #[test]
    fn non_consecutive_steps_fail() {
        let (provisioners, keys) = test_provisioners(4);
        let (genesis, mut block) = chained_blocks();
        let size = 4;

        let hash = block.header.hash;
        block.header.certificate = Certificate::new(
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 1, &hash, size),
            votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 4, &hash, size),
            3,
        );

        assert!(check_block_certificate(
            &provisioners,
            &block,
            &genesis.header.seed,
            size
        )
        .is_err());
    }
}
