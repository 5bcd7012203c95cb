//! btc-node - an outbound-only Bitcoin-protocol node.
//!
//! This binary wires the P2P engine to a chain store, resolves bootstrap
//! candidates, and runs the event loop until the admin `KILL` command or
//! the autoexit timer stops it.

use anyhow::Result;
use btc_network::{Engine, MemoryChain};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod bootstrap;
mod config;

use config::NodeConfig;

/// Outbound-only Bitcoin-protocol node.
#[derive(Parser, Debug)]
#[command(name = "btc-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "btc-node.toml")]
    config: PathBuf,

    /// Network to connect to
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// Admin TCP port override
    #[arg(long)]
    operation_port: Option<u16>,

    /// Stop automatically after this many minutes (0 disables)
    #[arg(long)]
    autoexit_minutes: Option<u64>,

    /// Bootstrap seeds, `ip:port` or hostname (repeatable)
    #[arg(long = "seed")]
    seed: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

// The engine relies on single-threaded cooperative scheduling; every task
// this binary spawns shares the one runtime thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting btc-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    let params = config.params();
    info!(network = %config.network, operation_port = config.operation_port, "configured");

    let seeds = bootstrap::resolve_seed_peers(&config.seed_peers, params.default_port).await;

    let chain = MemoryChain::new(params.genesis_hash);
    let engine = Engine::new(config.engine_config(), chain, seeds);
    engine.run().await?;

    info!("btc-node stopped");
    Ok(())
}
