//! The synchroniser.
//!
//! A two-state machine deciding what happens to blocks arriving from the
//! network. In sync, the next consecutive block is accepted and consensus
//! restarted; a block further ahead flips the node out of sync and asks the
//! source for the missing range. Out of sync, consecutive blocks are
//! replayed without restarting consensus until the target (or the sync
//! timer) brings the node back.
//!
//! The synchroniser never touches chain state itself; every accept goes
//! through the [`Acceptor`]. Timer arming and the actual network send are
//! the runner's job, driven by the returned [`SyncOutcome`].

use crate::acceptor::Acceptor;
use crate::database::Database;
use crate::executor::Executor;
use crate::ChainError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use umbra_messages::GetBlocks;
use umbra_types::Block;

/// What the runner must do after feeding a block in.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Restart the consensus loop on the new tip.
    pub restart_consensus: bool,
    /// Send a range request to this peer and arm the sync timer.
    pub request: Option<(String, GetBlocks)>,
    /// Disarm the sync timer (target reached).
    pub stop_timer: bool,
    /// Rearm the sync timer (progress was made out of sync).
    pub rearm_timer: bool,
}

/// Synchroniser state, exposed for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    InSync,
    /// Catching up to `target` served by the named peer.
    OutOfSync { target: u64 },
}

struct SyncState {
    status: SyncStatus,
    /// Peer serving the current catch-up range.
    source: Option<String>,
    /// Out-of-order arrivals waiting for their predecessor.
    pool: BTreeMap<u64, Block>,
}

/// The synchroniser.
pub struct Synchronizer<DB: Database, E: Executor> {
    chain: Arc<Acceptor<DB, E>>,
    state: Mutex<SyncState>,
}

impl<DB: Database, E: Executor> Synchronizer<DB, E> {
    pub fn new(chain: Arc<Acceptor<DB, E>>) -> Self {
        Synchronizer {
            chain,
            state: Mutex::new(SyncState {
                status: SyncStatus::InSync,
                source: None,
                pool: BTreeMap::new(),
            }),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.lock().status
    }

    /// Feed a network block in. Returns what the runner has to do next;
    /// `Err` means the block was invalid and the source should be
    /// penalised.
    pub async fn process_block(
        &self,
        source: &str,
        block: Block,
    ) -> Result<SyncOutcome, ChainError> {
        let hash = block.header.hash;
        if self.chain.is_blacklisted(&hash) {
            warn!(?hash, "filter out blacklisted block");
            return Ok(SyncOutcome::default());
        }

        let tip = self.chain.tip();
        let height = block.header.height;
        self.chain.note_seen_height(height);

        // Past and present tips are short-circuited before verification.
        if height < tip.header.height
            || (height == tip.header.height && hash == tip.header.hash)
        {
            debug!(height, "discarded block from the past");
            return Ok(SyncOutcome::default());
        }

        if height == tip.header.height {
            // Competing tip: the fallback procedure decides.
            self.chain.try_fallback(block).await?;
            return Ok(SyncOutcome {
                restart_consensus: true,
                ..Default::default()
            });
        }

        let status = self.state.lock().status;
        match status {
            SyncStatus::InSync => self.process_in_sync(source, block, tip.header.height).await,
            SyncStatus::OutOfSync { target } => {
                self.process_out_of_sync(source, block, target).await
            }
        }
    }

    async fn process_in_sync(
        &self,
        source: &str,
        block: Block,
        tip_height: u64,
    ) -> Result<SyncOutcome, ChainError> {
        let height = block.header.height;

        if height == tip_height + 1 {
            // The successor: accept, stay in sync, restart consensus.
            self.chain.accept_successive_block(block).await?;
            return Ok(SyncOutcome {
                restart_consensus: true,
                ..Default::default()
            });
        }

        // A gap: go out of sync and ask the source for the range.
        let tip = self.chain.tip();
        info!(
            from = tip.header.height,
            to = height,
            source,
            "out of sync, requesting blocks"
        );

        let mut state = self.state.lock();
        state.status = SyncStatus::OutOfSync { target: height };
        state.source = Some(source.to_string());
        state.pool.insert(height, block);

        Ok(SyncOutcome {
            request: Some((
                source.to_string(),
                GetBlocks {
                    locator: tip.header.hash,
                    from: tip.header.height,
                    to: height,
                },
            )),
            ..Default::default()
        })
    }

    async fn process_out_of_sync(
        &self,
        _source: &str,
        block: Block,
        target: u64,
    ) -> Result<SyncOutcome, ChainError> {
        let height = block.header.height;
        let tip_height = self.chain.tip().header.height;

        if height > tip_height + 1 {
            // Not consecutive yet; pool it for later.
            self.state.lock().pool.insert(height, block);
            return Ok(SyncOutcome::default());
        }

        // Consecutive: accept without restarting consensus, then drain the
        // pool as far as it goes.
        self.chain.accept_sync_block(block).await?;
        let mut accepted_to = height;

        loop {
            let next = {
                let mut state = self.state.lock();
                state.pool.remove(&(accepted_to + 1))
            };
            let Some(next) = next else { break };
            match self.chain.accept_sync_block(next).await {
                Ok(block) => accepted_to = block.header.height,
                Err(e) => {
                    warn!(error = %e, "pooled sync block rejected");
                    break;
                }
            }
        }

        if accepted_to >= target {
            info!(height = accepted_to, "sync target reached");
            let mut state = self.state.lock();
            state.status = SyncStatus::InSync;
            state.source = None;
            state.pool.clear();
            return Ok(SyncOutcome {
                restart_consensus: true,
                stop_timer: true,
                ..Default::default()
            });
        }

        Ok(SyncOutcome {
            rearm_timer: true,
            ..Default::default()
        })
    }

    /// The sync timer expired: the serving peer went silent. Back to
    /// in-sync; consensus restarts at the current tip.
    pub fn on_timer_expired(&self) -> SyncOutcome {
        let mut state = self.state.lock();
        if state.status == SyncStatus::InSync {
            return SyncOutcome::default();
        }

        warn!(
            tip = self.chain.tip().header.height,
            source = state.source.as_deref().unwrap_or(""),
            "sync timer expired"
        );
        state.status = SyncStatus::InSync;
        state.source = None;
        state.pool.clear();

        SyncOutcome {
            restart_consensus: true,
            ..Default::default()
        }
    }
}
