//! Node metrics.
//!
//! Domain-specific gauges and counters registered against the default
//! Prometheus registry; the scrape endpoint in [`crate::telemetry`] serves
//! them. Use traces for event-level granularity.

use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub struct Metrics {
    // Chain
    pub blocks_accepted: Counter,
    pub accept_latency: Histogram,
    pub tip_height: Gauge,
    pub invalid_blocks: Counter,

    // Consensus
    pub rounds_started: Counter,
    pub winning_agreements: Counter,

    // Sync
    pub sync_in_progress: Gauge,
    pub sync_blocks_behind: Gauge,
    pub sync_progress: Gauge,

    // Network
    pub messages_received: Counter,
    pub messages_dropped_duplicate: Counter,
    pub messages_published: Counter,
    pub peers_stalled: Counter,
}

impl Metrics {
    fn new() -> Self {
        let latency_buckets = vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

        Metrics {
            blocks_accepted: register_counter!(
                "umbra_blocks_accepted_total",
                "Blocks accepted onto the chain"
            )
            .unwrap(),
            accept_latency: register_histogram!(
                "umbra_accept_latency_seconds",
                "Wall time of the accept transaction",
                latency_buckets
            )
            .unwrap(),
            tip_height: register_gauge!("umbra_tip_height", "Height of the current tip").unwrap(),
            invalid_blocks: register_counter!(
                "umbra_invalid_blocks_total",
                "Blocks rejected by validity checks"
            )
            .unwrap(),
            rounds_started: register_counter!(
                "umbra_rounds_started_total",
                "Consensus rounds started"
            )
            .unwrap(),
            winning_agreements: register_counter!(
                "umbra_winning_agreements_total",
                "Rounds concluded with a winning agreement"
            )
            .unwrap(),
            sync_in_progress: register_gauge!(
                "umbra_sync_in_progress",
                "1 while the synchroniser is out of sync"
            )
            .unwrap(),
            sync_blocks_behind: register_gauge!(
                "umbra_sync_blocks_behind",
                "Blocks between the tip and the sync target"
            )
            .unwrap(),
            sync_progress: register_gauge!(
                "umbra_sync_progress_percent",
                "Tip height as a percentage of the highest height seen on the network"
            )
            .unwrap(),
            messages_received: register_counter!(
                "umbra_messages_received_total",
                "Envelopes taken off the network"
            )
            .unwrap(),
            messages_dropped_duplicate: register_counter!(
                "umbra_messages_dropped_duplicate_total",
                "Envelopes dropped by the duplicate filter"
            )
            .unwrap(),
            messages_published: register_counter!(
                "umbra_messages_published_total",
                "Envelopes handed to the network for broadcast"
            )
            .unwrap(),
            peers_stalled: register_counter!(
                "umbra_peers_stalled_total",
                "Peer connections dropped by the stall detector"
            )
            .unwrap(),
        }
    }
}

/// The process-wide metrics handle.
pub fn get() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
