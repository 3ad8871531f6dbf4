//! Configuration management for the Proof-of-Indexing node
//!
//! Options come from command line arguments with `POI_*` environment
//! fallbacks, optionally completed by a configuration file (YAML, JSON or
//! TOML) loaded through the `config` crate.

use crate::crypto::NodeIdentity;
use crate::difficulty::DifficultyParams;
use crate::gossip::GossipConfig;
use crate::types::{validate_miner_address, validate_token_id, Target};
use crate::{Error, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Complete configuration for the node
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "poi-node",
    version = env!("CARGO_PKG_VERSION"),
    about = "Proof-of-Indexing node",
    long_about = "Peer-to-peer Proof-of-Indexing node: relays gossip, mines blocks over claimed indexing work and submits mints to the settlement layer"
)]
pub struct Config {
    /// Generate a new node identity and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_key: bool,

    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML, JSON or TOML)
    #[arg(long, value_name = "FILE", env = "POI_CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Interface the gossip listener binds to
    #[arg(long, env = "POI_LISTEN_INTERFACE", default_value = "0.0.0.0")]
    pub listen_interface: String,

    /// Gossip TCP port
    #[arg(short = 'p', long, env = "POI_GOSSIP_PORT", default_value_t = 4020)]
    pub gossip_port: u16,

    /// Comma separated `host:port` peers to dial at startup
    #[arg(short = 'b', long, env = "POI_BOOTSTRAP_PEERS", value_delimiter = ',')]
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Maximum simultaneous peer connections
    #[arg(long, env = "POI_MAX_PEERS", default_value_t = 50)]
    pub max_peers: usize,

    /// Interface the mint API binds to
    #[arg(long, env = "POI_HTTP_INTERFACE", default_value = "127.0.0.1")]
    pub http_interface: String,

    /// Mint API port
    #[arg(long, env = "POI_HTTP_PORT", default_value_t = 4021)]
    pub http_port: u16,

    /// Payout address for mined blocks
    #[arg(short = 'a', long, env = "POI_MINER_ADDRESS")]
    pub miner_address: Option<String>,

    /// Token being mined (`$path` or `<txid>_<vout>`)
    #[arg(short = 't', long, env = "POI_TOKEN_ID")]
    pub token_id: Option<String>,

    /// Base URL of the settlement collaborator that broadcasts mints
    #[arg(long, env = "POI_SETTLEMENT_URL")]
    pub settlement_url: Option<String>,

    /// Run the mining loop
    #[arg(long, env = "POI_MINE", default_value_t = true, action = ArgAction::Set)]
    pub mine: bool,

    /// Mine blocks even when the mempool is empty
    #[arg(long, env = "POI_MINE_EMPTY_BLOCKS", default_value_t = true, action = ArgAction::Set)]
    pub mine_empty_blocks: bool,

    /// Mining threads (0 uses every core)
    #[arg(short = 'c', long, env = "POI_THREADS", default_value_t = 2)]
    pub threads: usize,

    /// Hash budget per template before a fresh one is built
    #[arg(long, env = "POI_MAX_ITERATIONS", default_value_t = 1_000_000)]
    pub max_iterations: u64,

    /// Iterations between timestamp refreshes and cancellation checks
    #[arg(long, env = "POI_TIMESTAMP_REFRESH_INTERVAL", default_value_t = 10_000)]
    pub timestamp_refresh_interval: u64,

    /// Work items committed per block
    #[arg(long, env = "POI_ITEMS_PER_BLOCK", default_value_t = 1_000)]
    pub items_per_block: usize,

    #[arg(long, env = "POI_MEMPOOL_CAPACITY", default_value_t = 10_000)]
    pub mempool_capacity: usize,

    /// Blocks between difficulty retargets
    #[arg(long, env = "POI_ADJUSTMENT_PERIOD", default_value_t = 144)]
    pub adjustment_period: usize,

    /// Desired block spacing in milliseconds
    #[arg(long, env = "POI_TARGET_BLOCK_TIME", default_value_t = 600_000)]
    pub target_block_time: u64,

    /// Leading hex zeros of the starting target
    #[arg(long, env = "POI_INITIAL_DIFFICULTY", default_value_t = 4)]
    pub initial_difficulty: u32,

    /// Lifetime of cached mint outcomes (e.g. `60s`, `2m`)
    #[arg(long, env = "POI_MINT_CACHE_TTL", default_value = "60s")]
    pub mint_cache_ttl: String,

    /// Resubmissions after a `retry` outcome
    #[arg(long, env = "POI_MINT_MAX_RETRIES", default_value_t = 3)]
    pub mint_max_retries: u32,

    /// Concurrent sends per gossip flood
    #[arg(long, env = "POI_RELAY_CONCURRENCY", default_value_t = 8)]
    pub relay_concurrency: usize,

    /// Recently seen message fingerprints kept for deduplication
    #[arg(long, env = "POI_DEDUP_CAPACITY", default_value_t = 10_000)]
    pub dedup_capacity: usize,

    /// HTTP timeout for settlement calls in milliseconds
    #[arg(long, env = "POI_HTTP_TIMEOUT", default_value_t = 30_000)]
    pub http_timeout: u64,

    /// JSON file holding difficulty state across restarts
    #[arg(long, env = "POI_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Hex ed25519 seed for a stable node id
    #[arg(long, env = "POI_IDENTITY_SEED", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub identity_seed: Option<String>,

    #[arg(short = 'l', long, env = "POI_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    #[arg(long, env = "POI_LOG_FORMAT", default_value = "plain")]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stdout
    #[arg(long, env = "POI_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Values a configuration file may supply
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    miner_address: Option<String>,
    token_id: Option<String>,
    settlement_url: Option<String>,
    #[serde(default)]
    bootstrap_peers: Vec<String>,
    state_file: Option<PathBuf>,
    identity_seed: Option<String>,
    log_file: Option<PathBuf>,
}

impl Config {
    /// Parse the command line, merge the config file and validate
    pub fn load() -> Result<Self> {
        Self::parse().resolve()
    }

    /// Like [`Config::load`] with explicit arguments
    pub fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args)
            .map_err(|e| Error::config(e.to_string()))?
            .resolve()
    }

    /// Merge the config file, if any, then validate
    pub fn resolve(self) -> Result<Self> {
        let config = match &self.config_file {
            Some(path) => {
                let file_config = Self::load_from_file(path)?;
                self.merge_with_file(file_config)
            }
            None => self,
        };
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<FileConfig> {
        if !path.exists() {
            return Err(Error::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("POI")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("bootstrap_peers"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<FileConfig>())
            .map_err(|e| Error::config(format!("Failed to load {}: {}", path.display(), e)))
    }

    /// Fill options the command line left unset (command line wins)
    fn merge_with_file(mut self, file_config: FileConfig) -> Self {
        if self.miner_address.is_none() {
            self.miner_address = file_config.miner_address;
        }
        if self.token_id.is_none() {
            self.token_id = file_config.token_id;
        }
        if self.settlement_url.is_none() {
            self.settlement_url = file_config.settlement_url;
        }
        if self.bootstrap_peers.is_empty() {
            self.bootstrap_peers = file_config.bootstrap_peers;
        }
        if self.state_file.is_none() {
            self.state_file = file_config.state_file;
        }
        if self.identity_seed.is_none() {
            self.identity_seed = file_config.identity_seed;
        }
        if self.log_file.is_none() {
            self.log_file = file_config.log_file;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(address) = &self.miner_address {
            validate_miner_address(address)?;
        }

        if let Some(token_id) = &self.token_id {
            validate_token_id(token_id)?;
        }

        if let Some(url) = &self.settlement_url {
            Url::parse(url).map_err(|e| Error::config(format!("Invalid settlement URL: {}", e)))?;
            if self.token_id.is_none() || self.miner_address.is_none() {
                return Err(Error::config(
                    "Settlement URL requires both a miner address and a token id",
                ));
            }
        }

        if self.listen_interface.parse::<IpAddr>().is_err() {
            return Err(Error::config("Invalid listen interface address"));
        }

        if self.http_interface.parse::<IpAddr>().is_err() {
            return Err(Error::config("Invalid HTTP interface address"));
        }

        if self.mine && self.miner_address.is_none() {
            return Err(Error::config(
                "Mining requires a miner address. Use --miner-address or --mine false",
            ));
        }

        if self.max_iterations == 0 {
            return Err(Error::config("Max iterations must be greater than 0"));
        }

        if self.timestamp_refresh_interval == 0 {
            return Err(Error::config(
                "Timestamp refresh interval must be greater than 0",
            ));
        }

        if self.items_per_block == 0 || self.mempool_capacity == 0 {
            return Err(Error::config(
                "Items per block and mempool capacity must be greater than 0",
            ));
        }

        if self.adjustment_period == 0 || self.target_block_time == 0 {
            return Err(Error::config(
                "Adjustment period and target block time must be greater than 0",
            ));
        }

        if !(1..=32).contains(&self.initial_difficulty) {
            return Err(Error::config("Initial difficulty must be between 1 and 32"));
        }

        if self.relay_concurrency == 0 {
            return Err(Error::config("Relay concurrency must be greater than 0"));
        }

        self.mint_cache_ttl()?;

        if let Some(seed) = &self.identity_seed {
            NodeIdentity::from_seed_hex(seed)?;
        }

        Ok(())
    }

    /// Gossip listener address
    pub fn gossip_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_interface
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen interface: {}", e)))?;
        Ok(SocketAddr::new(ip, self.gossip_port))
    }

    /// Mint API address
    pub fn http_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .http_interface
            .parse()
            .map_err(|e| Error::config(format!("Invalid HTTP interface: {}", e)))?;
        Ok(SocketAddr::new(ip, self.http_port))
    }

    pub fn mint_cache_ttl(&self) -> Result<Duration> {
        humantime::parse_duration(&self.mint_cache_ttl)
            .map_err(|e| Error::config(format!("Invalid mint cache ttl: {}", e)))
    }

    pub fn http_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.http_timeout)
    }

    /// Node identity from the configured seed, or a fresh one
    pub fn identity(&self) -> Result<NodeIdentity> {
        match &self.identity_seed {
            Some(seed) => NodeIdentity::from_seed_hex(seed),
            None => Ok(NodeIdentity::generate()),
        }
    }

    pub fn difficulty_params(&self) -> DifficultyParams {
        DifficultyParams {
            adjustment_period: self.adjustment_period,
            target_block_time_ms: self.target_block_time,
            initial_target: Target::from_difficulty(self.initial_difficulty),
            ..DifficultyParams::default()
        }
    }

    pub fn to_gossip_config(&self) -> Result<GossipConfig> {
        let mut capabilities = vec!["relay".to_string()];
        if self.mine {
            capabilities.push("mining".to_string());
        }
        Ok(GossipConfig {
            listen_addr: self.gossip_socket_addr()?,
            bootstrap_peers: self.bootstrap_peers.clone(),
            max_peers: self.max_peers,
            relay_concurrency: self.relay_concurrency,
            dedup_capacity: self.dedup_capacity,
            capabilities,
            ..GossipConfig::default()
        })
    }

    /// Configuration as YAML, for `--print-config`
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    const MINER: &str = "1BoatSLRHtKNngkdXEeobR76b53LETtpyT";

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["poi-node"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--miner-address", MINER]);
        assert_eq!(config.gossip_port, 4020);
        assert_eq!(config.max_iterations, 1_000_000);
        assert_eq!(config.timestamp_refresh_interval, 10_000);
        assert!(config.mine);
        assert_eq!(config.mint_cache_ttl().unwrap(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_peer_list() {
        let config = parse(&[
            "--miner-address",
            MINER,
            "--bootstrap-peers",
            "10.0.0.1:4020,10.0.0.2:4020",
        ]);
        assert_eq!(config.bootstrap_peers.len(), 2);
        assert_eq!(config.to_gossip_config().unwrap().bootstrap_peers.len(), 2);
    }

    #[test]
    fn test_mining_requires_miner_address() {
        let config = parse(&[]);
        assert_matches!(config.validate(), Err(Error::Config { .. }));

        let config = parse(&["--mine", "false"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let config = parse(&["--miner-address", MINER, "--token-id", "no-format"]);
        assert!(config.validate().is_err());

        let config = parse(&["--miner-address", MINER, "--max-iterations", "0"]);
        assert!(config.validate().is_err());

        let config = parse(&["--miner-address", MINER, "--listen-interface", "nowhere"]);
        assert!(config.validate().is_err());

        let config = parse(&["--miner-address", MINER, "--mint-cache-ttl", "soon"]);
        assert!(config.validate().is_err());

        let config = parse(&["--mine", "false", "--settlement-url", "http://localhost:8402"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_fills_unset_values() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "miner_address: {}\ntoken_id: \"$402/tokens/test\"\nbootstrap_peers:\n  - 10.0.0.9:4020",
            MINER
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load_from(["poi-node", "--config-file", path.as_str()]).unwrap();
        assert_eq!(config.miner_address.as_deref(), Some(MINER));
        assert_eq!(config.token_id.as_deref(), Some("$402/tokens/test"));
        assert_eq!(config.bootstrap_peers, vec!["10.0.0.9:4020".to_string()]);
    }

    #[test]
    fn test_cli_wins_over_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "miner_address: 1FileAddress").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::load_from([
            "poi-node",
            "--config-file",
            path.as_str(),
            "--miner-address",
            MINER,
        ])
        .unwrap();
        assert_eq!(config.miner_address.as_deref(), Some(MINER));
    }

    #[test]
    fn test_missing_config_file() {
        let result = Config::load_from(["poi-node", "--config-file", "/nonexistent/poi.yaml"]);
        assert_matches!(result, Err(Error::Config { .. }));
    }

    #[test]
    fn test_print_config_hides_seed() {
        let config = parse(&["--miner-address", MINER, "--identity-seed", &"11".repeat(32)]);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("gossip_port: 4020"));
        assert!(!yaml.contains(&"11".repeat(32)));
    }

    #[test]
    fn test_difficulty_params() {
        let config = parse(&["--miner-address", MINER, "--initial-difficulty", "2"]);
        let params = config.difficulty_params();
        assert_eq!(params.initial_target, Target::from_difficulty(2));
        assert_eq!(params.adjustment_period, 144);
    }
}
