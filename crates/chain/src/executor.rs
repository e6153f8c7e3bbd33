//! The execution engine seam.
//!
//! The executor is a co-deployed service holding contract storage. The
//! chain drives it through this trait and treats the provisioner set it
//! returns as authoritative: stake and bid calls change eligibility inside
//! the executor, never in the chain itself.

use async_trait::async_trait;
use thiserror::Error;
use umbra_types::{Hash, Provisioners, Transaction};

/// Errors from executor calls.
///
/// Transport errors are worth retrying with backoff; domain errors are
/// final for the current block.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor unreachable: {0}")]
    Transport(String),

    #[error("state transition failed: {0}")]
    Domain(String),
}

/// Inputs of a state-transition call.
#[derive(Debug, Clone)]
pub struct CallParams {
    pub txs: Vec<Transaction>,
    pub prev_state_root: Hash,
    pub block_height: u64,
    pub block_gas_limit: u64,
}

/// Outputs of a state-transition call: the transactions with gas accounting
/// filled in, the updated provisioner set and the new state root.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub txs: Vec<Transaction>,
    pub provisioners: Provisioners,
    pub state_root: Hash,
}

/// State-transition interface of the execution engine.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// The provisioner set at the executor's current state.
    async fn get_provisioners(&self) -> Result<Provisioners, ExecutorError>;

    /// The executor's current state root.
    async fn get_state_root(&self) -> Result<Hash, ExecutorError>;

    /// Dry-run a candidate's transactions without touching state.
    async fn verify_state_transition(
        &self,
        txs: &[Transaction],
        block_gas_limit: u64,
        block_height: u64,
    ) -> Result<(), ExecutorError>;

    /// Execute transactions against the current state without committing;
    /// used by block generators to fill in the state hash.
    async fn execute_state_transition(
        &self,
        txs: Vec<Transaction>,
        block_gas_limit: u64,
        block_height: u64,
    ) -> Result<(Vec<Transaction>, Hash), ExecutorError>;

    /// Apply a tentatively agreed block (certificate beyond the first
    /// iteration).
    async fn accept(&self, params: CallParams) -> Result<CallResult, ExecutorError>;

    /// Apply a finalized block (first-iteration agreement).
    async fn finalize(&self, params: CallParams) -> Result<CallResult, ExecutorError>;

    /// Flush unpersisted state up to `state_root` to the executor's disk.
    async fn persist(&self, state_root: Hash) -> Result<(), ExecutorError>;

    /// Roll unpersisted state back to `state_root`. Used by the fallback
    /// procedure to return to the parent of a displaced tip.
    async fn revert(&self, state_root: Hash) -> Result<(), ExecutorError>;
}

/// In-memory executor with deterministic state roots.
///
/// The root after applying height `h` on top of `prev` is
/// `digest(prev || h)`, so tests can compute the expected chain of roots
/// with [`MemoryExecutor::next_root`]. Gas spent is a flat per-call cost,
/// the provisioner set only changes when a test mutates it directly.
pub struct MemoryExecutor {
    state: parking_lot::Mutex<MemoryState>,
}

struct MemoryState {
    root: Hash,
    persisted_root: Hash,
    provisioners: Provisioners,
}

impl MemoryExecutor {
    pub const GAS_PER_CALL: u64 = 21_000;

    pub fn new(genesis_root: Hash, provisioners: Provisioners) -> Self {
        MemoryExecutor {
            state: parking_lot::Mutex::new(MemoryState {
                root: genesis_root,
                persisted_root: genesis_root,
                provisioners,
            }),
        }
    }

    /// The root this executor reports after applying `height` on `prev`.
    pub fn next_root(prev: &Hash, height: u64) -> Hash {
        let mut buf = [0u8; 40];
        buf[..32].copy_from_slice(prev.as_bytes());
        buf[32..].copy_from_slice(&height.to_le_bytes());
        Hash::digest(&buf)
    }

    /// The root most recently flushed through [`Executor::persist`].
    pub fn persisted_root(&self) -> Hash {
        self.state.lock().persisted_root
    }

    /// Replace the provisioner set reported by subsequent calls.
    pub fn set_provisioners(&self, provisioners: Provisioners) {
        self.state.lock().provisioners = provisioners;
    }

    fn transition(&self, params: CallParams) -> CallResult {
        let mut state = self.state.lock();
        let new_root = Self::next_root(&params.prev_state_root, params.block_height);
        state.root = new_root;

        let txs = params
            .txs
            .into_iter()
            .map(|mut tx| {
                tx.annotate(Self::GAS_PER_CALL, None);
                tx
            })
            .collect();

        CallResult {
            txs,
            provisioners: state.provisioners.clone(),
            state_root: new_root,
        }
    }
}

#[async_trait]
impl Executor for MemoryExecutor {
    async fn get_provisioners(&self) -> Result<Provisioners, ExecutorError> {
        Ok(self.state.lock().provisioners.clone())
    }

    async fn get_state_root(&self) -> Result<Hash, ExecutorError> {
        Ok(self.state.lock().root)
    }

    async fn verify_state_transition(
        &self,
        _txs: &[Transaction],
        _block_gas_limit: u64,
        _block_height: u64,
    ) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute_state_transition(
        &self,
        txs: Vec<Transaction>,
        _block_gas_limit: u64,
        block_height: u64,
    ) -> Result<(Vec<Transaction>, Hash), ExecutorError> {
        let root = {
            let state = self.state.lock();
            Self::next_root(&state.root, block_height)
        };
        Ok((txs, root))
    }

    async fn accept(&self, params: CallParams) -> Result<CallResult, ExecutorError> {
        Ok(self.transition(params))
    }

    async fn finalize(&self, params: CallParams) -> Result<CallResult, ExecutorError> {
        Ok(self.transition(params))
    }

    async fn persist(&self, state_root: Hash) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        if state.root != state_root {
            return Err(ExecutorError::Domain(format!(
                "persist of unknown root {state_root}"
            )));
        }
        state.persisted_root = state_root;
        Ok(())
    }

    async fn revert(&self, state_root: Hash) -> Result<(), ExecutorError> {
        self.state.lock().root = state_root;
        Ok(())
    }
}
