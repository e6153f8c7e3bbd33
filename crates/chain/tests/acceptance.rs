//! Chain acceptance scenarios: the happy path, fallback on a competing tip,
//! startup recovery, and the synchroniser's catch-up states.

use std::collections::BTreeSet;
use std::sync::Arc;
use umbra_chain::{
    Acceptor, ChainConfig, Database, Executor, LiteDb, MemoryExecutor, Reader, SyncStatus,
    Synchronizer,
};
use umbra_types::test_utils::{test_provisioners, test_transaction};
use umbra_types::{
    reduction_message, Block, Certificate, Committee, Hash, Header, Keys, Provisioners, Seed,
    Signature, StepVotes, BLOCK_GAS_LIMIT,
};

const COMMITTEE_SIZE: usize = 4;

fn config() -> ChainConfig {
    ChainConfig {
        committee_size: COMMITTEE_SIZE,
        persist_every: 2,
        consensus_time_threshold: 0,
        throttle_millis: 0,
        ..Default::default()
    }
}

fn votes_by_all(
    provisioners: &Provisioners,
    keys: &[Keys],
    seed: &Seed,
    round: u64,
    step: u8,
    hash: &Hash,
) -> StepVotes {
    let committee = Committee::sortition(provisioners, seed, round, step, COMMITTEE_SIZE);
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

/// A valid, fully certified successor of `parent`.
fn next_block(
    parent: &Block,
    provisioners: &Provisioners,
    keys: &[Keys],
    timestamp_offset: u64,
) -> Block {
    let height = parent.header.height + 1;
    let header = Header {
        version: 0,
        height,
        timestamp: parent.header.timestamp + timestamp_offset,
        gas_limit: BLOCK_GAS_LIMIT,
        prev_block_hash: parent.header.hash,
        seed: parent.header.seed,
        state_hash: MemoryExecutor::next_root(&parent.header.state_hash, height),
        tx_root: Hash::ZERO,
        certificate: Certificate::default(),
        hash: Hash::ZERO,
    };
    let mut block = Block::new(header, vec![test_transaction(height as u8)]);
    let hash = block.header.hash;
    block.header.certificate = Certificate::new(
        votes_by_all(provisioners, keys, &parent.header.seed, height, 1, &hash),
        votes_by_all(provisioners, keys, &parent.header.seed, height, 2, &hash),
        3,
    );
    block
}

async fn setup() -> (Arc<Acceptor<LiteDb, MemoryExecutor>>, LiteDb, Vec<Keys>, Provisioners) {
    let (provisioners, keys) = test_provisioners(4);
    let genesis_root = Hash::digest(b"genesis root");
    let executor = Arc::new(MemoryExecutor::new(genesis_root, provisioners.clone()));
    let db = LiteDb::new();
    let acceptor = Arc::new(
        Acceptor::new(db.clone(), executor, config())
            .await
            .expect("chain starts"),
    );
    (acceptor, db, keys, provisioners)
}

#[tokio::test]
async fn happy_path_advances_tip() {
    let (acceptor, db, keys, provisioners) = setup().await;
    let mut accepted_rx = acceptor.subscribe();

    let genesis = acceptor.tip();
    assert_eq!(genesis.header.height, 0);

    let block = next_block(&genesis, &provisioners, &keys, 30);
    let accepted = acceptor
        .accept_successive_block(block.clone())
        .await
        .expect("block accepted");

    assert_eq!(acceptor.tip().header.hash, block.header.hash);

    let reader = db.reader().unwrap();
    assert_eq!(reader.fetch_current_height().unwrap(), Some(1));
    assert_eq!(
        reader.fetch_block_hash_by_height(1).unwrap(),
        Some(block.header.hash)
    );

    // Executor annotations landed in the stored block.
    assert_eq!(
        accepted.txs[0].gas_spent,
        Some(MemoryExecutor::GAS_PER_CALL)
    );

    // Exactly one fan-out event.
    let event = accepted_rx.try_recv().expect("accepted event");
    assert_eq!(event.block.header.hash, block.header.hash);
    assert!(accepted_rx.try_recv().is_err());
}

#[tokio::test]
async fn wrong_state_hash_is_rejected() {
    let (acceptor, _db, keys, provisioners) = setup().await;
    let genesis = acceptor.tip();

    // Declared state hash disagrees with what the executor will return;
    // header hash and certificate are otherwise fully valid.
    let mut header = next_block(&genesis, &provisioners, &keys, 30).header;
    header.state_hash = Hash::digest(b"not what the executor returns");
    let mut block = Block::new(header, vec![test_transaction(1)]);
    let hash = block.header.hash;
    block.header.certificate = Certificate::new(
        votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 1, &hash),
        votes_by_all(&provisioners, &keys, &genesis.header.seed, 1, 2, &hash),
        3,
    );

    let err = acceptor.accept_successive_block(block).await.unwrap_err();
    assert!(matches!(err, umbra_chain::ChainError::InvalidStateHash));
    assert_eq!(acceptor.tip().header.height, 0);
}

#[tokio::test]
async fn fallback_replaces_tip_once_and_blacklists() {
    let (acceptor, _db, keys, provisioners) = setup().await;
    let sync = Synchronizer::new(acceptor.clone());

    let genesis = acceptor.tip();
    let displaced = next_block(&genesis, &provisioners, &keys, 30);
    acceptor
        .accept_successive_block(displaced.clone())
        .await
        .unwrap();

    // A competing block at the same height with a valid certificate.
    let competing = next_block(&genesis, &provisioners, &keys, 60);
    assert_ne!(competing.header.hash, displaced.header.hash);
    assert_eq!(competing.header.height, displaced.header.height);

    let outcome = sync
        .process_block("peer-1", competing.clone())
        .await
        .expect("fallback succeeded");
    assert!(outcome.restart_consensus);

    assert_eq!(acceptor.tip().header.hash, competing.header.hash);
    assert!(acceptor.is_blacklisted(&displaced.header.hash));

    // Re-propagations of the displaced tip die without verification.
    let replay = sync.process_block("peer-2", displaced).await.unwrap();
    assert_eq!(replay, umbra_chain::SyncOutcome::default());
    assert_eq!(acceptor.tip().header.hash, competing.header.hash);
}

#[tokio::test]
async fn startup_recovery_replays_unpersisted_blocks() {
    let (provisioners, keys) = test_provisioners(4);
    let genesis_root = Hash::digest(b"genesis root");
    let db = LiteDb::new();

    // First life: accept three blocks; persist_every = 2 leaves block 3
    // unpersisted in the executor.
    let executor = Arc::new(MemoryExecutor::new(genesis_root, provisioners.clone()));
    let acceptor = Acceptor::new(db.clone(), executor.clone(), config())
        .await
        .unwrap();

    let mut parent = acceptor.tip();
    let mut persisted_root = parent.header.state_hash;
    for _ in 0..3 {
        let block = next_block(&parent, &provisioners, &keys, 30);
        acceptor
            .accept_successive_block(block.clone())
            .await
            .unwrap();
        if block.header.height % 2 == 0 {
            persisted_root = block.header.state_hash;
        }
        parent = block;
    }
    assert_eq!(acceptor.tip().header.height, 3);
    assert_eq!(executor.persisted_root(), persisted_root);
    drop(acceptor);

    // Second life: the executor restarts from its persisted state (height
    // 2) while the store's tip is at height 3. Recovery re-accepts block 3.
    let recovered_executor = Arc::new(MemoryExecutor::new(persisted_root, provisioners.clone()));
    let acceptor = Acceptor::new(db.clone(), recovered_executor.clone(), config())
        .await
        .expect("recovery succeeds");

    assert_eq!(acceptor.tip().header.height, 3);
    assert_eq!(
        recovered_executor.get_state_root().await.unwrap(),
        acceptor.tip().header.state_hash
    );
}

#[tokio::test]
async fn synchroniser_catches_up_and_returns_in_sync() {
    let (acceptor, _db, keys, provisioners) = setup().await;
    let sync = Synchronizer::new(acceptor.clone());

    // Pre-build the chain 1..=3 that the "network" already has.
    let mut blocks = Vec::new();
    let mut parent = acceptor.tip();
    for _ in 0..3 {
        let block = next_block(&parent, &provisioners, &keys, 30);
        blocks.push(block.clone());
        parent = block;
    }

    // Block 3 lands first: we are behind, a range request goes out.
    let outcome = sync
        .process_block("peer-9", blocks[2].clone())
        .await
        .unwrap();
    let (peer, request) = outcome.request.expect("range request");
    assert_eq!(peer, "peer-9");
    assert_eq!(request.from, 0);
    assert_eq!(request.to, 3);
    assert!(matches!(sync.status(), SyncStatus::OutOfSync { target: 3 }));
    assert_eq!(acceptor.sync_progress(), 0.0);

    // The peer streams 1 and 2; 3 is already pooled. No consensus restart
    // until the target is reached.
    let outcome = sync
        .process_block("peer-9", blocks[0].clone())
        .await
        .unwrap();
    assert!(!outcome.restart_consensus);
    assert!(outcome.rearm_timer);

    let outcome = sync
        .process_block("peer-9", blocks[1].clone())
        .await
        .unwrap();
    assert!(outcome.restart_consensus);
    assert!(outcome.stop_timer);
    assert_eq!(sync.status(), SyncStatus::InSync);
    assert_eq!(acceptor.tip().header.height, 3);
    assert_eq!(acceptor.sync_progress(), 100.0);
}

#[tokio::test]
async fn sync_progress_follows_highest_seen() {
    let (acceptor, _db, keys, provisioners) = setup().await;

    // Nothing observed on the network yet.
    assert_eq!(acceptor.sync_progress(), 0.0);

    // The network shows a block at height 4 while we sit at genesis.
    acceptor.note_seen_height(4);
    assert_eq!(acceptor.sync_progress(), 0.0);

    let mut parent = acceptor.tip();
    for expected in [25.0, 50.0, 75.0, 100.0] {
        let block = next_block(&parent, &provisioners, &keys, 30);
        acceptor
            .accept_successive_block(block.clone())
            .await
            .unwrap();
        assert_eq!(acceptor.sync_progress(), expected);
        parent = block;
    }

    // Progress is capped even if the tip overtakes a stale observation.
    let block = next_block(&parent, &provisioners, &keys, 30);
    acceptor.accept_successive_block(block).await.unwrap();
    assert_eq!(acceptor.sync_progress(), 100.0);
}

#[tokio::test]
async fn sync_timer_expiry_restores_in_sync() {
    let (acceptor, _db, keys, provisioners) = setup().await;
    let sync = Synchronizer::new(acceptor.clone());

    // Jump ahead to go out of sync.
    let mut parent = acceptor.tip();
    for _ in 0..4 {
        parent = next_block(&parent, &provisioners, &keys, 30);
    }
    sync.process_block("peer-3", parent).await.unwrap();
    assert!(matches!(sync.status(), SyncStatus::OutOfSync { .. }));

    // The peer never delivers; the timer expires.
    let outcome = sync.on_timer_expired();
    assert!(outcome.restart_consensus);
    assert_eq!(sync.status(), SyncStatus::InSync);
    assert_eq!(acceptor.tip().header.height, 0);
}

#[tokio::test]
async fn consensus_winner_is_accepted_from_candidate_store() {
    let (acceptor, db, keys, provisioners) = setup().await;
    let genesis = acceptor.tip();

    // A candidate proposed during the round, without a certificate yet.
    let block = next_block(&genesis, &provisioners, &keys, 30);
    let mut candidate = block.clone();
    candidate.header.certificate = Certificate::default();
    acceptor.store_candidate(&candidate).unwrap();

    // Agreement seals the certificate for the candidate's hash.
    let winner = umbra_consensus::Winner {
        block_hash: candidate.header.hash,
        certificate: block.header.certificate.clone(),
    };

    let accepted = acceptor.accept_winning_candidate(winner).await.unwrap();
    assert_eq!(accepted.header.hash, candidate.header.hash);
    assert_eq!(acceptor.tip().header.height, 1);

    // Candidate storage is cleared by post-acceptance work.
    let reader = db.reader().unwrap();
    assert!(reader
        .fetch_candidate_block(&candidate.header.hash)
        .unwrap()
        .is_none());
}
