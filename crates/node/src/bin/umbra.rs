//! Umbra node binary.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use umbra_chain::{Database, MemoryExecutor, Reader};
use umbra_node::{config::NodeConfig, telemetry, RocksDbStorage, Runner};
use umbra_types::{Hash, Keys, Provisioners};

#[derive(Parser)]
#[command(name = "umbra", about = "Umbra proof-of-stake node", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node.
    Run {
        /// Hex-encoded 32-byte seed of the consensus BLS key. Random when
        /// omitted.
        #[arg(long)]
        key_seed: Option<String>,
    },

    /// Serve the Prometheus scrape endpoint on its own.
    Metrics {
        #[arg(long, default_value_t = 9099)]
        port: u16,
    },

    /// Look a transaction up in the local block store.
    Transactions {
        /// Block store path (defaults to the configured one).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Hex-encoded transaction id.
        #[arg(long)]
        id: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path).context("loading configuration"),
        None => Ok(NodeConfig::default()),
    }
}

fn parse_key_seed(hex_seed: Option<&str>) -> anyhow::Result<Keys> {
    match hex_seed {
        None => Ok(Keys::generate()),
        Some(hex_seed) => {
            let bytes = hex::decode(hex_seed).context("key seed is not valid hex")?;
            let seed: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("key seed must be 32 bytes"))?;
            Ok(Keys::from_seed(&seed))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run { key_seed } => {
            let _telemetry = telemetry::init_telemetry(&config.telemetry)?;
            let keys = parse_key_seed(key_seed.as_deref())?;

            let db = RocksDbStorage::open(&config.db_path).context("opening block store")?;

            // This build runs the executor in-process; a deployment with a
            // remote execution engine plugs its client in here instead.
            let executor = Arc::new(MemoryExecutor::new(
                Hash::digest(b"umbra devnet genesis"),
                Provisioners::new(),
            ));

            let (_ingress_tx, ingress_rx) = mpsc::channel(1024);
            let (egress_tx, mut egress_rx) = mpsc::channel(1024);

            // Without a transport the egress is drained and dropped.
            tokio::spawn(async move { while egress_rx.recv().await.is_some() {} });

            let runner = Runner::new(
                config,
                db,
                executor,
                keys,
                Arc::new(umbra_consensus::Permissive),
                ingress_rx,
                egress_tx,
            )
            .await?;

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                signal.cancel();
            });

            runner.run(shutdown).await;
            Ok(())
        }

        Command::Metrics { port } => {
            let _telemetry = telemetry::init_telemetry(&config.telemetry)?;
            let handle = telemetry::serve_metrics(port);
            let _ = tokio::signal::ctrl_c().await;
            handle.abort();
            Ok(())
        }

        Command::Transactions { db, id } => {
            let path = db.unwrap_or(config.db_path);
            let storage = RocksDbStorage::open(&path).context("opening block store")?;

            let bytes = hex::decode(&id).context("transaction id is not valid hex")?;
            let arr: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("transaction id must be 32 bytes"))?;
            let tx_id = Hash::from_bytes(arr);

            let reader = storage.reader().map_err(|e| anyhow::anyhow!("{e}"))?;
            match reader
                .fetch_block_hash_by_tx_id(&tx_id)
                .map_err(|e| anyhow::anyhow!("{e}"))?
            {
                Some(block_hash) => println!("transaction {id} in block {block_hash}"),
                None => println!("transaction {id} not found"),
            }
            Ok(())
        }
    }
}
