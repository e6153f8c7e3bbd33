//! Production wiring for the Umbra node.
//!
//! Everything here is I/O: the RocksDB block store, the stall detector,
//! telemetry and metrics, and the runner that connects the network
//! collaborator to the consensus loop, the chain acceptor and the
//! synchroniser through tokio channels.

pub mod config;
pub mod metrics;
pub mod runner;
pub mod stall;
pub mod storage;
pub mod telemetry;

pub use config::NodeConfig;
pub use runner::{Broadcast, Propagation, RawEnvelope, Runner};
pub use stall::StallDetector;
pub use storage::{RocksDbStorage, StorageError};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
