//! Node configuration.

use crate::runner::Propagation;
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use umbra_chain::ChainConfig;

/// Synchronisation and peer-health tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a peer has to answer a request, in milliseconds.
    pub response_time_ms: u64,
    /// Stall-detector scan interval, in milliseconds.
    pub stall_tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            response_time_ms: 20_000,
            stall_tick_ms: 2_000,
        }
    }
}

/// Duplicate-filter tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DupeMapConfig {
    /// Elements per height bucket.
    pub capacity: usize,
    /// Height window retained behind the tip.
    pub tolerance: u64,
}

impl Default for DupeMapConfig {
    fn default() -> Self {
        DupeMapConfig {
            capacity: 300_000,
            tolerance: 3,
        }
    }
}

/// Top-level node configuration, TOML-loadable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub db_path: PathBuf,
    pub propagation: Propagation,
    pub consensus: umbra_consensus::Config,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    pub dupemap: DupeMapConfig,
    pub telemetry: TelemetryConfig,
}

impl NodeConfig {
    /// Load from a TOML file; missing sections fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
