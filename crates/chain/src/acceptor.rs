//! The chain acceptor.
//!
//! Owns the tip and the live provisioner set. Every acceptance path
//! (consensus winner, in-sync successor, sync replay, fallback, startup
//! recovery) is serialised on one async lock; the tip itself sits behind a
//! read/write lock so verification callbacks and progress queries can take
//! cheap snapshots while an accept transaction is in flight.

use crate::database::{Database, Reader, Writer};
use crate::executor::{CallParams, CallResult, Executor, ExecutorError};
use crate::verifier::{check_block_certificate, sanity_check_block};
use crate::ChainError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use umbra_consensus::{ConsensusError, RoundUpdate, Winner};
use umbra_messages::DupeMap;
use umbra_types::{Block, Hash, Provisioners};

/// Chain tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Committee sample size, shared with the consensus engine.
    pub committee_size: usize,

    /// Persist the executor every N blocks (0 disables periodic persists).
    pub persist_every: u64,

    /// Minimum block time in seconds under which acceptance is throttled.
    pub consensus_time_threshold: u64,

    /// Floor of the accept duration when throttling, in milliseconds.
    pub throttle_millis: u64,

    /// Deadline of a single executor call, in milliseconds.
    pub executor_timeout_ms: u64,

    /// Mirror accepted provisioner snapshots under their height.
    pub api_mirror: bool,

    /// Capacity of the fallback blacklist filter.
    pub blacklist_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            committee_size: 64,
            persist_every: 3,
            consensus_time_threshold: 10,
            throttle_millis: 2_000,
            executor_timeout_ms: 10_000,
            api_mirror: false,
            blacklist_capacity: 1_000,
        }
    }
}

impl ChainConfig {
    fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }
}

/// Fan-out payload published after every accepted block. The mempool hook
/// drops the block's transactions on it, metrics follow the tip with it.
#[derive(Debug, Clone)]
pub struct AcceptedBlock {
    pub block: Block,
    /// Size of the provisioner set after the state transition.
    pub provisioners: usize,
}

/// The chain acceptor.
pub struct Acceptor<DB: Database, E: Executor> {
    db: DB,
    executor: Arc<E>,
    config: ChainConfig,

    /// Acceptance paths are serialised here.
    accept_lock: tokio::sync::Mutex<()>,

    /// The current tip. Writers: the accept transaction only.
    tip: RwLock<Block>,

    /// The live provisioner set; consensus rounds get clones.
    provisioners: RwLock<Provisioners>,

    /// Hashes of tips displaced by fallback.
    blacklist: Mutex<DupeMap>,

    accepted_tx: broadcast::Sender<AcceptedBlock>,

    /// Highest block height observed on the network.
    highest_seen: AtomicU64,
}

impl<DB: Database, E: Executor> Acceptor<DB, E> {
    /// Bring up the chain against the executor.
    ///
    /// An empty store is seeded with a genesis block at the executor's
    /// current root. Otherwise the persisted block must match the executor
    /// root exactly; blocks accepted after the last persist are replayed
    /// through the executor so both ends meet at the stored tip again.
    pub async fn new(db: DB, executor: Arc<E>, config: ChainConfig) -> Result<Self, ChainError> {
        let executor_root = executor
            .get_state_root()
            .await
            .map_err(ChainError::Executor)?;
        let provisioners = executor
            .get_provisioners()
            .await
            .map_err(ChainError::Executor)?;

        let state = db.reader()?.fetch_chain_state()?;
        let (start_tip, replay_to) = match state {
            None => {
                let genesis = Block::genesis(executor_root);
                info!(hash = ?genesis.header.hash, "storing genesis block");
                let mut w = db.writer()?;
                w.store_block(&genesis, true)?;
                w.commit()?;
                (genesis, None)
            }
            Some(state) => {
                let reader = db.reader()?;
                let tip = reader
                    .fetch_block(&state.tip_hash)?
                    .ok_or(ChainError::StateMismatch("tip block missing".into()))?;
                let persisted = reader
                    .fetch_block(&state.persisted_hash)?
                    .ok_or(ChainError::StateMismatch("persisted block missing".into()))?;

                if persisted.header.state_hash != executor_root {
                    error!(
                        executor = ?executor_root,
                        node = ?persisted.header.state_hash,
                        "invalid state detected"
                    );
                    return Err(ChainError::StateMismatch(
                        "persisted block does not match executor root".into(),
                    ));
                }

                let replay_to = (tip.header.hash != persisted.header.hash)
                    .then_some(tip.header.height);
                (persisted, replay_to)
            }
        };

        let blacklist = DupeMap::new(start_tip.header.height, config.blacklist_capacity);
        let (accepted_tx, _) = broadcast::channel(64);

        let acceptor = Acceptor {
            db,
            executor,
            config,
            accept_lock: tokio::sync::Mutex::new(()),
            tip: RwLock::new(start_tip),
            provisioners: RwLock::new(provisioners),
            blacklist: Mutex::new(blacklist),
            accepted_tx,
            highest_seen: AtomicU64::new(0),
        };

        // Re-accept everything the executor never saw persisted.
        if let Some(target) = replay_to {
            acceptor.recover_to(target).await?;
        }

        Ok(acceptor)
    }

    /// Replay stored blocks above the persisted height through the executor.
    async fn recover_to(&self, target_height: u64) -> Result<(), ChainError> {
        let _guard = self.accept_lock.lock().await;
        let from = self.tip.read().header.height + 1;
        info!(from, to = target_height, "recovering unpersisted blocks");

        for height in from..=target_height {
            let reader = self.db.reader()?;
            let hash = reader
                .fetch_block_hash_by_height(height)?
                .ok_or(ChainError::StateMismatch(format!(
                    "missing block at height {height} during recovery"
                )))?;
            let block = reader
                .fetch_block(&hash)?
                .ok_or(ChainError::StateMismatch(format!(
                    "missing block {hash} during recovery"
                )))?;

            self.accept_block_inner(block, false).await?;
        }
        Ok(())
    }

    /// Subscribe to accepted-block fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<AcceptedBlock> {
        self.accepted_tx.subscribe()
    }

    /// A read handle on the block store, for serving peer requests.
    pub fn db_reader(&self) -> Result<DB::Reader, ChainError> {
        Ok(self.db.reader()?)
    }

    /// Snapshot of the current tip.
    pub fn tip(&self) -> Block {
        self.tip.read().clone()
    }

    /// Snapshot of the live provisioner set.
    pub fn provisioners(&self) -> Provisioners {
        self.provisioners.read().clone()
    }

    /// The round update for the round on top of the current tip.
    pub fn round_update(&self) -> RoundUpdate {
        let tip = self.tip.read();
        RoundUpdate {
            round: tip.header.height + 1,
            seed: tip.header.seed,
            hash: tip.header.hash,
            timestamp: tip.header.timestamp,
            cert: tip.header.certificate.clone(),
            provisioners: self.provisioners.read().clone(),
        }
    }

    /// Record a network-observed height for sync progress.
    pub fn note_seen_height(&self, height: u64) {
        self.highest_seen.fetch_max(height, Ordering::Relaxed);
    }

    /// How close the tip is to the highest height seen, as a percentage.
    pub fn sync_progress(&self) -> f64 {
        let highest = self.highest_seen.load(Ordering::Relaxed);
        if highest == 0 {
            return 0.0;
        }
        let tip = self.tip.read().header.height;
        (tip as f64 / highest as f64 * 100.0).min(100.0)
    }

    /// Whether a hash was blacklisted by a fallback.
    pub fn is_blacklisted(&self, hash: &Hash) -> bool {
        self.blacklist.lock().contains(hash.as_bytes())
    }

    /// Store a candidate block proposed for the current round.
    pub fn store_candidate(&self, block: &Block) -> Result<(), ChainError> {
        let mut w = self.db.writer()?;
        w.store_candidate_block(block)?;
        w.commit()?;
        Ok(())
    }

    /// Verify a potential winning candidate without touching state: header
    /// sanity against the tip, then a dry-run of its transactions.
    pub async fn verify_candidate(&self, hash: Hash) -> Result<(), ChainError> {
        let candidate = self
            .db
            .reader()?
            .fetch_candidate_block(&hash)?
            .ok_or(ChainError::UnknownCandidate(hash))?;

        let tip = self.tip.read().clone();
        sanity_check_block(&tip, &candidate)?;

        self.executor
            .verify_state_transition(
                &candidate.txs,
                candidate.header.gas_limit,
                candidate.header.height,
            )
            .await
            .map_err(ChainError::Executor)
    }

    /// Accept the winning candidate of a consensus round: attach the sealed
    /// certificate and run the full accept transaction.
    pub async fn accept_winning_candidate(&self, winner: Winner) -> Result<Block, ChainError> {
        let mut block = self
            .db
            .reader()?
            .fetch_candidate_block(&winner.block_hash)?
            .ok_or(ChainError::UnknownCandidate(winner.block_hash))?;
        block.header.certificate = winner.certificate;

        let _guard = self.accept_lock.lock().await;
        self.accept_block_inner(block, true).await
    }

    /// Accept a block that directly follows the tip while in sync.
    ///
    /// Applies the block-time throttle: when the previous block is younger
    /// than the consensus time threshold, the whole procedure is stretched
    /// to at least `throttle_millis`.
    pub async fn accept_successive_block(&self, block: Block) -> Result<Block, ChainError> {
        let _guard = self.accept_lock.lock().await;
        let started = Instant::now();
        let prev_timestamp = self.tip.read().header.timestamp;

        let accepted = self.accept_block_inner(block, true).await?;
        self.note_seen_height(accepted.header.height);

        if prev_timestamp + self.config.consensus_time_threshold > accepted.header.timestamp {
            let floor = Duration::from_millis(self.config.throttle_millis);
            let elapsed = started.elapsed();
            if elapsed < floor {
                debug!(sleep_for = ?(floor - elapsed), "throttled");
                tokio::time::sleep(floor - elapsed).await;
            }
        }

        Ok(accepted)
    }

    /// Accept the next consecutive block while out of sync. No throttle, no
    /// consensus restart.
    pub async fn accept_sync_block(&self, block: Block) -> Result<Block, ChainError> {
        let _guard = self.accept_lock.lock().await;
        self.accept_block_inner(block, true).await
    }

    /// Replace the tip with a competing block at the same height.
    ///
    /// The executor is rolled back to the parent's root, the incoming block
    /// is accepted in the tip's place and the displaced hash is blacklisted
    /// so later re-propagations die at ingress.
    #[instrument(skip_all, fields(height = block.header.height, hash = ?block.header.hash))]
    pub async fn try_fallback(&self, block: Block) -> Result<Block, ChainError> {
        let _guard = self.accept_lock.lock().await;

        let displaced = self.tip.read().clone();
        if block.header.height != displaced.header.height {
            return Err(ChainError::Fallback("height does not match tip".into()));
        }
        if block.header.hash == displaced.header.hash {
            return Err(ChainError::BlockAlreadyAccepted);
        }

        let parent = self
            .db
            .reader()?
            .fetch_block(&displaced.header.prev_block_hash)?
            .ok_or(ChainError::Fallback("tip parent missing".into()))?;

        // Validate before any state is touched.
        sanity_check_block(&parent, &block)?;
        check_block_certificate(
            &self.provisioners.read().clone(),
            &block,
            &parent.header.seed,
            self.config.committee_size,
        )?;

        warn!(
            displaced = ?displaced.header.hash,
            incoming = ?block.header.hash,
            "falling back to competing tip"
        );

        self.executor
            .revert(parent.header.state_hash)
            .await
            .map_err(ChainError::Executor)?;
        let provisioners = self
            .executor
            .get_provisioners()
            .await
            .map_err(ChainError::Executor)?;

        *self.tip.write() = parent;
        *self.provisioners.write() = provisioners;

        let accepted = self.accept_block_inner(block, true).await?;

        // The displaced hash came from a fork; filter out re-propagations.
        self.blacklist
            .lock()
            .add(displaced.header.hash.as_bytes());

        Ok(accepted)
    }

    /// The accept transaction. Caller holds `accept_lock`.
    #[instrument(skip_all, fields(
        height = block.header.height,
        cert_step = block.header.certificate.step,
        hash = ?block.header.hash,
    ))]
    async fn accept_block_inner(
        &self,
        mut block: Block,
        with_sanity: bool,
    ) -> Result<Block, ChainError> {
        let tip = self.tip.read().clone();

        // 1. The node and the executor must agree on the world.
        self.sanity_check_state_hash(&tip).await?;

        // 2. Validity: stateless checks, then the certificate against the
        //    current snapshot under the parent's seed.
        if with_sanity {
            sanity_check_block(&tip, &block)?;
        }
        check_block_certificate(
            &self.provisioners.read().clone(),
            &block,
            &tip.header.seed,
            self.config.committee_size,
        )?;

        // 3. State transition.
        let result = self.run_state_transition(&tip, &block).await?;
        if result.state_root != block.header.state_hash {
            error!(
                executor = ?result.state_root,
                node = ?block.header.state_hash,
                "inconsistency with state_hash"
            );
            return Err(ChainError::InvalidStateHash);
        }
        for tx in &result.txs {
            let gas_spent = tx.gas_spent.unwrap_or_default();
            if !block.annotate_transaction(tx.id(), gas_spent, tx.error.clone()) {
                warn!(tx = ?tx.id(), "executed transaction not found in block");
            }
        }

        // 4. Atomic persist: block write and, on persist heights, the
        //    executor flush, in one store transaction. A failed flush drops
        //    the staged write.
        let persist = self.config.persist_every > 0
            && block.header.height % self.config.persist_every == 0;

        let mut writer = self.db.writer()?;
        writer.store_block(&block, persist)?;
        if persist {
            tokio::time::timeout(
                self.config.executor_timeout(),
                self.executor.persist(result.state_root),
            )
            .await
            .map_err(|_| ChainError::ExecutorTimeout)?
            .map_err(ChainError::Executor)?;
            debug!("persisting contract state completed");
        }
        writer.commit()?;

        // 5. Advance the tip and fan out.
        let provisioner_count = result.provisioners.len();
        *self.provisioners.write() = result.provisioners;
        *self.tip.write() = block.clone();
        self.blacklist.lock().advance(block.header.height);

        info!(
            provisioners = provisioner_count,
            state_hash = ?block.header.state_hash,
            "block accepted"
        );

        self.post_accept(&block, provisioner_count);
        Ok(block)
    }

    /// Ensure the tip's state hash equals the executor's root.
    async fn sanity_check_state_hash(&self, tip: &Block) -> Result<(), ChainError> {
        let executor_root = self
            .executor
            .get_state_root()
            .await
            .map_err(ChainError::Executor)?;

        if executor_root != tip.header.state_hash {
            error!(
                executor = ?executor_root,
                node = ?tip.header.state_hash,
                "check state_hash failed"
            );
            return Err(ChainError::StateMismatch(
                "tip state hash differs from executor root".into(),
            ));
        }
        Ok(())
    }

    /// Route the block through `finalize` (first-iteration certificate) or
    /// `accept`, with bounded retries on transport failures.
    async fn run_state_transition(
        &self,
        tip: &Block,
        block: &Block,
    ) -> Result<CallResult, ChainError> {
        let params = CallParams {
            txs: block.txs.clone(),
            prev_state_root: tip.header.state_hash,
            block_height: block.header.height,
            block_gas_limit: block.header.gas_limit,
        };
        let finalize = block.header.certificate.step == 3;

        let mut attempt = 0u32;
        loop {
            let call = async {
                if finalize {
                    self.executor.finalize(params.clone()).await
                } else {
                    self.executor.accept(params.clone()).await
                }
            };

            match tokio::time::timeout(self.config.executor_timeout(), call).await {
                Err(_) => return Err(ChainError::ExecutorTimeout),
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(ExecutorError::Transport(e))) if attempt < 2 => {
                    attempt += 1;
                    warn!(attempt, error = %e, "executor transport error, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                Ok(Err(e)) => return Err(ChainError::Executor(e)),
            }
        }
    }

    /// Post-acceptance work; failures here are logged, never fatal.
    fn post_accept(&self, block: &Block, provisioner_count: usize) {
        let _ = self.accepted_tx.send(AcceptedBlock {
            block: block.clone(),
            provisioners: provisioner_count,
        });

        // Candidates of the finished round are obsolete.
        match self.db.writer() {
            Ok(mut w) => {
                if w.clear_candidate_messages().is_ok() {
                    if let Err(e) = w.commit() {
                        warn!(error = %e, "candidate deletion failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "candidate deletion failed"),
        }

        if self.config.api_mirror {
            let snapshot = self.provisioners.read().clone();
            match self.db.writer() {
                Ok(mut w) => {
                    let stored = w
                        .store_provisioners(block.header.height, &snapshot)
                        .and_then(|_| w.commit());
                    if let Err(e) = stored {
                        warn!(error = %e, "provisioner mirror failed");
                    }
                }
                Err(e) => warn!(error = %e, "provisioner mirror failed"),
            }
        }
    }
}

/// Adapter exposing the acceptor as the consensus candidate-verification
/// callback without handing consensus the chain itself.
pub struct CandidateHook<DB: Database, E: Executor>(pub Arc<Acceptor<DB, E>>);

#[async_trait::async_trait]
impl<DB: Database, E: Executor> umbra_consensus::CandidateVerifier for CandidateHook<DB, E> {
    async fn verify_candidate(&self, hash: Hash) -> Result<(), ConsensusError> {
        self.0
            .verify_candidate(hash)
            .await
            .map_err(|e| ConsensusError::CandidateVerification(e.to_string()))
    }
}
