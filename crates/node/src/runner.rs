//! Node runner.
//!
//! Owns the channel mesh between the network collaborator and the core:
//! ingress envelopes pass the duplicate filter, get decoded and routed to
//! the consensus loop or the synchroniser; outbound consensus traffic and
//! block propagation leave through the egress channel. The consensus loop
//! runs as its own task, restarted (or stopped, while out of sync) through
//! a control channel driven by chain and sync events.

use crate::config::NodeConfig;
use crate::metrics;
use crate::stall::StallDetector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use umbra_chain::{
    Acceptor, CandidateHook, Database, Executor, Reader, SyncOutcome, Synchronizer,
};
use umbra_consensus::{Consensus, ScoreVerifier};
use umbra_messages::{decode_message, encode_message, DupeMap, GetData, Inv, Payload, Topic};
use umbra_types::Keys;

/// How a broadcast leaves the node. Selected by configuration; the block
/// producer does not know which transport it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    #[default]
    Gossip,
    Kadcast,
}

/// A categorised envelope off the wire.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    /// Identifier of the delivering peer.
    pub source: String,
    pub topic: Topic,
    /// Opaque transport header bytes (kadcast hop height etc.).
    pub header: Vec<u8>,
    /// Wire payload bytes.
    pub payload: Vec<u8>,
}

/// An envelope handed to the network for sending.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// Direct send to one peer, or a network-wide publication.
    pub to: Option<String>,
    pub propagation: Propagation,
    pub topic: Topic,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Control messages of the consensus task.
enum ConsensusCtl {
    /// Cancel the current round and start over on the new tip.
    /// `accepted` resets the adaptive selection timeout and threshold.
    Restart { accepted: bool },
    /// Cancel the current round and idle until the next restart.
    Stop,
}

/// Serving cap for one `GetBlocks` request.
const MAX_INV_ITEMS: usize = 500;

/// The assembled node.
pub struct Runner<DB: Database, E: Executor> {
    config: NodeConfig,
    acceptor: Arc<Acceptor<DB, E>>,
    synchronizer: Synchronizer<DB, E>,
    dupemap: DupeMap,

    ingress: mpsc::Receiver<RawEnvelope>,
    egress: mpsc::Sender<Broadcast>,
    consensus_tx: mpsc::Sender<Payload>,
    ctl_tx: mpsc::Sender<ConsensusCtl>,

    sync_timer: Option<JoinHandle<()>>,
    timer_tx: mpsc::Sender<()>,
    timer_rx: mpsc::Receiver<()>,

    stall: HashMap<String, StallDetector>,

    consensus_task: JoinHandle<()>,
    outbound_task: JoinHandle<()>,
}

impl<DB: Database, E: Executor> Runner<DB, E> {
    /// Wire the node together on top of an initialised chain.
    pub async fn new(
        config: NodeConfig,
        db: DB,
        executor: Arc<E>,
        keys: Keys,
        score_verifier: Arc<dyn ScoreVerifier>,
        ingress: mpsc::Receiver<RawEnvelope>,
        egress: mpsc::Sender<Broadcast>,
    ) -> Result<Self, umbra_chain::ChainError> {
        let acceptor = Arc::new(Acceptor::new(db, executor, config.chain.clone()).await?);
        let synchronizer = Synchronizer::new(acceptor.clone());

        let (consensus_tx, consensus_rx) = mpsc::channel::<Payload>(1024);
        let (consensus_out_tx, consensus_out_rx) = mpsc::channel::<Payload>(1024);
        let (ctl_tx, ctl_rx) = mpsc::channel::<ConsensusCtl>(16);
        let (timer_tx, timer_rx) = mpsc::channel::<()>(4);

        let consensus = Consensus::new(
            keys,
            config.consensus.clone(),
            score_verifier,
            Arc::new(CandidateHook(acceptor.clone())),
            consensus_rx,
            consensus_out_tx,
        );

        let consensus_task = tokio::spawn(consensus_loop(consensus, acceptor.clone(), ctl_rx));
        let outbound_task = tokio::spawn(outbound_pump(
            consensus_out_rx,
            egress.clone(),
            config.propagation,
        ));

        let dupemap = {
            let tip = acceptor.tip().header.height;
            let mut map = DupeMap::new(tip, config.dupemap.capacity);
            map.set_tolerance(config.dupemap.tolerance);
            map
        };

        Ok(Runner {
            config,
            acceptor,
            synchronizer,
            dupemap,
            ingress,
            egress,
            consensus_tx,
            ctl_tx,
            sync_timer: None,
            timer_tx,
            timer_rx,
            stall: HashMap::new(),
            consensus_task,
            outbound_task,
        })
    }

    /// Chain handle for observers (metrics, RPC mirrors).
    pub fn acceptor(&self) -> Arc<Acceptor<DB, E>> {
        self.acceptor.clone()
    }

    /// Drive the node until the ingress channel closes or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(tip = self.acceptor.tip().header.height, "node running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                envelope = self.ingress.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.on_envelope(envelope).await;
                }

                Some(()) = self.timer_rx.recv() => {
                    let outcome = self.synchronizer.on_timer_expired();
                    self.apply_sync_outcome("", outcome).await;
                }
            }
        }

        self.consensus_task.abort();
        self.outbound_task.abort();
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
        info!("node stopped");
    }

    async fn on_envelope(&mut self, envelope: RawEnvelope) {
        metrics::get().messages_received.inc();

        if !self.dupemap.can_forward(&envelope.payload) {
            metrics::get().messages_dropped_duplicate.inc();
            trace!(topic = %envelope.topic, "duplicate envelope dropped");
            return;
        }

        let payload = match decode_message(envelope.topic, &envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "undecodable envelope");
                return;
            }
        };

        // Replies settle the source's stall bookkeeping.
        if let Some(detector) = self.stall.get(&envelope.source) {
            detector.remove_message(envelope.topic);
            if detector.exit().is_cancelled() {
                metrics::get().peers_stalled.inc();
                self.stall.remove(&envelope.source);
            }
        }

        match payload {
            Payload::Score(_) | Payload::Reduction(_) | Payload::Agreement(_) => {
                if self.consensus_tx.send(payload).await.is_err() {
                    warn!("consensus loop gone, dropping message");
                }
            }

            Payload::Candidate(block) => {
                if let Err(e) = self.acceptor.store_candidate(&block) {
                    warn!(error = %e, "candidate not stored");
                }
            }

            Payload::Block(block) => {
                let source = envelope.source.clone();
                match self.synchronizer.process_block(&source, *block).await {
                    Ok(outcome) => self.apply_sync_outcome(&source, outcome).await,
                    Err(e) => {
                        metrics::get().invalid_blocks.inc();
                        warn!(source, error = %e, "invalid block from peer");
                    }
                }
            }

            Payload::GetBlocks(request) => self.serve_get_blocks(&envelope.source, request).await,

            Payload::GetData(request) => self.serve_get_data(&envelope.source, request).await,

            Payload::Inv(inv) => self.request_missing(&envelope.source, inv).await,

            Payload::Tx(_) => {
                // Mempool admission lives outside the core.
                trace!("transaction envelope ignored");
            }

            Payload::Addr(_) | Payload::NotFound(_) => {}
        }
    }

    async fn apply_sync_outcome(&mut self, _source: &str, outcome: SyncOutcome) {
        if let Some((peer, request)) = outcome.request {
            // Entering catch-up: freeze the local consensus loop, ask the
            // peer for the range, arm the stall and sync timers.
            let _ = self.ctl_tx.send(ConsensusCtl::Stop).await;
            metrics::get().sync_in_progress.set(1.0);
            metrics::get()
                .sync_blocks_behind
                .set(request.to.saturating_sub(request.from) as f64);

            self.send(Some(peer.clone()), Payload::GetBlocks(request)).await;

            self.stall_detector(&peer).add_message(Topic::GetBlocks);
            self.arm_sync_timer();
        } else if outcome.rearm_timer {
            self.arm_sync_timer();
        }

        if outcome.stop_timer {
            if let Some(timer) = self.sync_timer.take() {
                timer.abort();
            }
            metrics::get().sync_in_progress.set(0.0);
        }

        if outcome.restart_consensus {
            metrics::get().sync_in_progress.set(0.0);
            let tip = self.acceptor.tip();
            metrics::get().tip_height.set(tip.header.height as f64);
            self.dupemap.advance(tip.header.height);
            let _ = self
                .ctl_tx
                .send(ConsensusCtl::Restart { accepted: true })
                .await;
            self.propagate_block_inv(&tip).await;
        }

        metrics::get()
            .sync_progress
            .set(self.acceptor.sync_progress());
    }

    fn stall_detector(&mut self, peer: &str) -> &StallDetector {
        let sync = &self.config.sync;
        self.stall.entry(peer.to_string()).or_insert_with(|| {
            StallDetector::new(
                Duration::from_millis(sync.response_time_ms),
                Duration::from_millis(sync.stall_tick_ms),
            )
        })
    }

    fn arm_sync_timer(&mut self) {
        if let Some(timer) = self.sync_timer.take() {
            timer.abort();
        }
        let timeout = Duration::from_millis(self.config.sync.response_time_ms);
        let timer_tx = self.timer_tx.clone();
        self.sync_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx.send(()).await;
        }));
    }

    /// Answer a range request with an inventory of known block hashes.
    async fn serve_get_blocks(&mut self, source: &str, request: umbra_messages::GetBlocks) {
        let mut inv = Inv::default();
        let reader = match self.acceptor_reader() {
            Some(reader) => reader,
            None => return,
        };

        let to = request.to.min(request.from + MAX_INV_ITEMS as u64);
        for height in (request.from + 1)..=to {
            match reader.fetch_block_hash_by_height(height) {
                Ok(Some(hash)) => inv.add_block(hash),
                _ => break,
            }
        }

        if !inv.items.is_empty() {
            self.send(Some(source.to_string()), Payload::Inv(inv)).await;
        }
    }

    /// Answer a data request with blocks, or `NotFound` for the misses.
    async fn serve_get_data(&mut self, source: &str, request: GetData) {
        let reader = match self.acceptor_reader() {
            Some(reader) => reader,
            None => return,
        };

        let mut missing = Inv::default();
        for item in request.items {
            match reader.fetch_block(&item.hash) {
                Ok(Some(block)) => {
                    self.send(
                        Some(source.to_string()),
                        Payload::Block(Box::new(block)),
                    )
                    .await;
                }
                _ => missing.items.push(item),
            }
        }

        if !missing.items.is_empty() {
            self.send(Some(source.to_string()), Payload::NotFound(missing))
                .await;
        }
    }

    /// Fetch announced blocks we do not have yet.
    async fn request_missing(&mut self, source: &str, inv: Inv) {
        let reader = match self.acceptor_reader() {
            Some(reader) => reader,
            None => return,
        };

        let mut wanted = GetData { items: Vec::new() };
        for item in inv.items {
            if matches!(reader.fetch_block(&item.hash), Ok(None)) {
                wanted.items.push(item);
            }
        }

        if !wanted.items.is_empty() {
            self.send(Some(source.to_string()), Payload::GetData(wanted))
                .await;
            self.stall_detector(source).add_message(Topic::GetData);
        }
    }

    /// Advertise an accepted block: an inventory entry over gossip, the raw
    /// block over kadcast.
    async fn propagate_block_inv(&mut self, block: &umbra_types::Block) {
        match self.config.propagation {
            Propagation::Gossip => {
                let mut inv = Inv::default();
                inv.add_block(block.header.hash);
                self.send(None, Payload::Inv(inv)).await;
            }
            Propagation::Kadcast => {
                self.send(None, Payload::Block(Box::new(block.clone()))).await;
            }
        }
    }

    async fn send(&self, to: Option<String>, payload: Payload) {
        let topic = payload.topic();
        let bytes = match encode_message(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%topic, error = %e, "encode failed");
                return;
            }
        };
        let broadcast = Broadcast {
            to,
            propagation: self.config.propagation,
            topic,
            header: Vec::new(),
            payload: bytes,
        };
        if self.egress.send(broadcast).await.is_ok() {
            metrics::get().messages_published.inc();
        }
    }

    fn acceptor_reader(&self) -> Option<<DB as Database>::Reader> {
        match self.acceptor.db_reader() {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(error = %e, "block store unavailable");
                None
            }
        }
    }
}

/// The consensus task: one round at a time, controlled by the runner.
async fn consensus_loop<DB: Database, E: Executor>(
    mut consensus: Consensus,
    acceptor: Arc<Acceptor<DB, E>>,
    mut ctl_rx: mpsc::Receiver<ConsensusCtl>,
) {
    let mut pending_reset = false;

    'rounds: loop {
        if pending_reset {
            consensus.reset_adaptive();
            pending_reset = false;
        }

        let ru = acceptor.round_update();
        metrics::get().rounds_started.inc();
        let token = CancellationToken::new();

        tokio::select! {
            winner = consensus.spin(ru, token.clone()) => {
                let Some(winner) = winner else { continue };
                metrics::get().winning_agreements.inc();

                let started = std::time::Instant::now();
                match acceptor.accept_winning_candidate(winner).await {
                    Ok(block) => {
                        metrics::get().blocks_accepted.inc();
                        metrics::get()
                            .accept_latency
                            .observe(started.elapsed().as_secs_f64());
                        metrics::get().tip_height.set(block.header.height as f64);
                        pending_reset = true;
                        debug!(height = block.header.height, "winning candidate accepted");
                    }
                    Err(e) => {
                        warn!(error = %e, "winning candidate rejected");
                    }
                }
            }

            ctl = ctl_rx.recv() => {
                token.cancel();
                match ctl {
                    None => break 'rounds,
                    Some(ConsensusCtl::Restart { accepted }) => {
                        pending_reset = accepted;
                    }
                    Some(ConsensusCtl::Stop) => {
                        // Parked until the next restart.
                        loop {
                            match ctl_rx.recv().await {
                                None => break 'rounds,
                                Some(ConsensusCtl::Restart { accepted }) => {
                                    pending_reset = accepted;
                                    break;
                                }
                                Some(ConsensusCtl::Stop) => continue,
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Encode consensus output and hand it to the network.
async fn outbound_pump(
    mut consensus_out: mpsc::Receiver<Payload>,
    egress: mpsc::Sender<Broadcast>,
    propagation: Propagation,
) {
    while let Some(payload) = consensus_out.recv().await {
        let topic = payload.topic();
        let bytes = match encode_message(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%topic, error = %e, "encode failed");
                continue;
            }
        };
        let broadcast = Broadcast {
            to: None,
            propagation,
            topic,
            header: Vec::new(),
            payload: bytes,
        };
        if egress.send(broadcast).await.is_err() {
            return;
        }
        metrics::get().messages_published.inc();
    }
}
