//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use btc_network::{Periods, Tolerances};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete node configuration, loadable from TOML with CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network to dial (mainnet, testnet).
    pub network: String,
    /// Value advertised in outbound `version`.
    pub protocol_version: i32,
    /// Service bits advertised.
    pub services: u64,
    /// User agent advertised.
    pub user_agent: String,
    /// Peer slots outside initial block download.
    pub max_outgoing: usize,
    /// Peer slots during initial block download.
    pub max_outgoing_ibd: usize,
    /// Candidate count below which a fresh handshake triggers `getaddr`.
    pub getaddr_threshold: usize,
    /// Full-block availability ratio above which IBD switches off.
    pub ibd_mode_availability_threshold: f64,
    /// Liveness thresholds (ms).
    pub tolerances: Tolerances,
    /// Scheduler intervals (ms); zero disables a task.
    pub periods: Periods,
    /// Admin listener backlog.
    pub backlog: u32,
    /// Admin TCP port.
    pub operation_port: u16,
    /// Max candidate age in seconds before it is eligible for eviction.
    /// Accepted for the address-book layer; the engine does not enforce it.
    pub addr_life: u64,
    /// Inbound commands whose logging is suppressed.
    pub silent_incoming_message_commands: Vec<String>,
    /// Bootstrap addresses, literal `ip:port` or resolvable hostnames.
    pub seed_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::default_for_network("mainnet")
    }
}

impl NodeConfig {
    /// Load configuration from `config_path`, falling back to network
    /// defaults, then apply CLI overrides.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read config file")?;
            toml::from_str(&content).context("failed to parse config file")?
        } else {
            Self::default_for_network(&args.network)
        };

        config.network = args.network.clone();
        if let Some(port) = args.operation_port {
            config.operation_port = port;
        }
        if let Some(minutes) = args.autoexit_minutes {
            config.periods.autoexit = minutes * 60 * 1000;
        }
        if !args.seed.is_empty() {
            config.seed_peers = args.seed.clone();
        }

        Ok(config)
    }

    /// Defaults for a named network.
    pub fn default_for_network(network: &str) -> Self {
        let seed_peers = match network {
            "testnet" => testnet_seed_peers(),
            _ => mainnet_seed_peers(),
        };
        Self {
            network: network.to_string(),
            protocol_version: 70015,
            services: btc_wire::SERVICE_NODE_NETWORK,
            user_agent: "/btc-node:0.1.0/".to_string(),
            max_outgoing: 8,
            max_outgoing_ibd: 64,
            getaddr_threshold: 1000,
            ibd_mode_availability_threshold: 0.95,
            tolerances: Tolerances::default(),
            periods: Periods::default(),
            backlog: 32,
            operation_port: btc_network::DEFAULT_OPERATION_PORT,
            addr_life: 14 * 24 * 60 * 60,
            silent_incoming_message_commands: vec!["ping".to_string(), "pong".to_string()],
            seed_peers,
        }
    }

    /// Wire parameters for the configured network.
    pub fn params(&self) -> btc_wire::NetworkParams {
        match self.network.as_str() {
            "testnet" => btc_wire::TESTNET,
            _ => btc_wire::MAINNET,
        }
    }

    /// Project the engine's slice of this configuration.
    pub fn engine_config(&self) -> btc_network::EngineConfig {
        btc_network::EngineConfig {
            params: self.params(),
            protocol_version: self.protocol_version,
            services: self.services,
            user_agent: self.user_agent.clone(),
            max_outgoing: self.max_outgoing,
            max_outgoing_ibd: self.max_outgoing_ibd,
            getaddr_threshold: self.getaddr_threshold,
            ibd_availability_threshold: self.ibd_mode_availability_threshold,
            tolerances: self.tolerances,
            periods: self.periods,
            operation_port: self.operation_port,
            backlog: self.backlog,
            silent_commands: self.silent_incoming_message_commands.clone(),
        }
    }
}

/// Bootstrap hostnames for mainnet.
fn mainnet_seed_peers() -> Vec<String> {
    vec![
        "seed.bitcoin.sipa.be:8333".to_string(),
        "dnsseed.bluematt.me:8333".to_string(),
        "seed.bitcoinstats.com:8333".to_string(),
        "seed.btc.petertodd.org:8333".to_string(),
    ]
}

/// Bootstrap hostnames for testnet.
fn testnet_seed_peers() -> Vec<String> {
    vec![
        "testnet-seed.bitcoin.jonasschnelli.ch:18333".to_string(),
        "seed.tbtc.petertodd.org:18333".to_string(),
    ]
}
