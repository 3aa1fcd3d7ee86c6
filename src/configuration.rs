//! Configuration and CLI entrypoint for the beacon backend
//!
//! Uses serde for config files and clap for CLI parsing. Network presets
//! adjust quorum defaults; regtest runs against a single local node.

use crate::model::Network;
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Observed Bitcoin block propagation time; the ceiling for requery jitter.
pub const BLOCK_PROPAGATION_TIME_SECS: u64 = 30;
/// How long a freshly broadcast pledge transaction needs to spread before a
/// UTXO lookup will see its dependencies.
pub const TX_PROPAGATION_TIME_SECS: u64 = 5;
/// Hard deadline on one fan-out UTXO query round.
pub const UTXO_ROUND_DEADLINE: Duration = Duration::from_secs(10);
/// Per-transaction deadline when broadcasting pledge dependencies.
pub const DEPENDENCY_BROADCAST_DEADLINE: Duration = Duration::from_secs(30);
/// Most dependency transactions a pledge may carry.
pub const MAX_DEPENDENCIES: usize = 5;

/// Whether this backend trusts a remote project server or serves one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Mode {
    /// Pledging user: non-empty wallet, trusts the project server when the
    /// project has one.
    Client,
    /// Project owner: typically empty wallet, watches the app data
    /// directory, indexes projects by payment-URL path.
    Server,
}

/// Command-line arguments for the daemon.
#[derive(Parser, Debug)]
#[command(name = "beacon")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Operating mode
    #[arg(long, value_enum, default_value = "server")]
    pub mode: Mode,
    /// Network to operate on [main, test, regtest]
    #[arg(long, default_value = "test")]
    pub network: String,
    /// Application data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Socket address to bind the REST API (server mode)
    #[arg(long)]
    pub listen: Option<String>,
}

/// Backend configuration loaded from file, with CLI overrides applied on
/// top.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub network: Network,
    /// Application data directory; in server mode it is watched for
    /// project files.
    pub data_dir: PathBuf,
    pub peers: PeerConfig,
    pub timing: TimingConfig,
    pub api: ApiConfig,
}

/// Peer quorum configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerConfig {
    /// Peers that must agree before a UTXO answer is accepted.
    pub min_peers_for_utxo_query: usize,
    /// Broadcast announcements before a pending claim counts as propagated.
    pub min_broadcast_peers: usize,
}

/// Delays and jitter ceilings. Tests zero these out.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimingConfig {
    /// Base delay before verifying a pledge that appeared on disk.
    pub tx_propagation_secs: u64,
    /// Clamp on randomised requery delays.
    pub max_jitter_secs: u64,
}

/// REST API configuration (server mode).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            min_peers_for_utxo_query: 2,
            min_broadcast_peers: 2,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tx_propagation_secs: TX_PROPAGATION_TIME_SECS,
            max_jitter_secs: BLOCK_PROPAGATION_TIME_SECS,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:8884".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            network: Network::Test,
            data_dir: PathBuf::from("./data"),
            peers: PeerConfig::default(),
            timing: TimingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read config {path:?}"))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse config {path:?}"))
    }

    /// Override config with CLI options and apply the network preset.
    pub fn apply_cli_overrides(&mut self, cli: &Cli) {
        self.mode = cli.mode;
        if let Some(data_dir) = &cli.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(listen) = &cli.listen {
            self.api.bind_addr = listen.clone();
        }
        match cli.network.as_str() {
            "main" => self.network = Network::Main,
            "test" => self.network = Network::Test,
            "regtest" => self.network = Network::Regtest,
            _ => {}
        }
        if self.network == Network::Regtest {
            // One local node is the whole network there.
            self.peers.min_peers_for_utxo_query = 1;
            self.peers.min_broadcast_peers = 1;
        }
    }
}

/// Initialise the global tracing subscriber. `RUST_LOG` wins when set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.peers.min_peers_for_utxo_query, 2);
        assert_eq!(config.timing.max_jitter_secs, BLOCK_PROPAGATION_TIME_SECS);
        assert_eq!(config.timing.tx_propagation_secs, TX_PROPAGATION_TIME_SECS);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_load_config() {
        let json = r#"{
            "mode": "Client",
            "network": "Test",
            "data_dir": "/tmp/beacon",
            "peers": {"min_peers_for_utxo_query": 3, "min_broadcast_peers": 2},
            "timing": {"tx_propagation_secs": 5, "max_jitter_secs": 30},
            "api": {"enabled": false, "bind_addr": "127.0.0.1:9999"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.peers.min_peers_for_utxo_query, 3);
        assert!(!config.api.enabled);
    }

    #[test]
    fn test_regtest_preset_drops_quorum() {
        let cli = Cli::parse_from(["beacon", "--network", "regtest", "--mode", "client"]);
        let mut config = Config::default();
        config.apply_cli_overrides(&cli);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.peers.min_peers_for_utxo_query, 1);
        assert_eq!(config.peers.min_broadcast_peers, 1);
        assert_eq!(config.mode, Mode::Client);
    }
}
