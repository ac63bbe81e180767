//! Configuration management for the header-sync daemon.
//!
//! A single TOML file with one section per concern. On first run the file
//! is generated with network defaults. Every runtime object (client, sync,
//! supervisor) is built from this struct; there is no global state.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::headers::sync::{StalePolicy, SyncSettings, BATCH_THRESHOLD, REWIND, TIP_QUEUE_DEPTH};
use crate::network::client::ClientSettings;
use crate::network::session_cost::CostConfig;
use crate::network::transport::{ConnectError, ServerAddress};
use crate::network_type::{NetworkType, RETARGET_CHUNK};
use crate::reconnect::ReconnectPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Platform-specific base data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\electrumx-sync
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("electrumx-sync")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".electrumx-sync")
    }
}

/// Every network gets its own subdirectory, mainnet included.
pub fn get_network_data_dir(network: NetworkType) -> PathBuf {
    get_data_dir().join(network.data_subdir())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub headers: HeadersConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub network: NetworkType,
    /// Empty means the platform default for the network
    #[serde(default)]
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `ssl://host:port`, `tcp://host:port` or `host[:port]`
    pub address: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Off for self-signed servers
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    /// Extra PEM CA bundle
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Fetch and hash the network's canary transaction on connect
    #[serde(default = "default_true")]
    pub check_canary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersConfig {
    /// Checkpoint height; `None` uses the network default
    #[serde(default)]
    pub start_point: Option<u64>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_rewind")]
    pub rewind: u64,
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default)]
    pub stale_subscribe: StalePolicy,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            start_point: None,
            chunk_size: default_chunk_size(),
            rewind: default_rewind(),
            batch_threshold: default_batch_threshold(),
            queue_depth: default_queue_depth(),
            stale_subscribe: StalePolicy::Ignore,
        }
    }
}

/// Local mirror of the server's session cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cost_per_byte: f64,
    pub error_penalty: f64,
    pub decay_amount: f64,
    pub decay_interval_ms: u64,
    pub soft_limit: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let cost = CostConfig::default();
        Self {
            cost_per_byte: cost.cost_per_byte,
            error_penalty: cost.error_penalty,
            decay_amount: cost.decay_amount,
            decay_interval_ms: cost.decay_interval.as_millis() as u64,
            soft_limit: cost.soft_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
    /// 0 = retry forever
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 2,
            max_backoff_secs: 300, // 5 minutes max
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
    /// `stdout` or `file`
    pub output: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Scripthashes (reversed sha256 of the output script, hex) to watch
    #[serde(default)]
    pub watch_scripthashes: Vec<String>,
    /// Seconds between status lines; 0 disables them
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            watch_scripthashes: Vec::new(),
            status_interval_secs: default_status_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_protocol_version() -> String {
    "1.4".to_string()
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    25
}

fn default_chunk_size() -> usize {
    RETARGET_CHUNK
}

fn default_rewind() -> u64 {
    REWIND
}

fn default_batch_threshold() -> u64 {
    BATCH_THRESHOLD
}

fn default_queue_depth() -> usize {
    TIP_QUEUE_DEPTH
}

fn default_status_interval() -> u64 {
    60
}

fn default_server(network: NetworkType) -> &'static str {
    match network {
        NetworkType::Mainnet => "ssl://electrum.blockstream.info:50002",
        NetworkType::Testnet => "ssl://electrum.blockstream.info:60002",
        NetworkType::Regtest => "tcp://127.0.0.1:50001",
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_for(NetworkType::Mainnet)
    }
}

impl Config {
    pub fn default_for(network: NetworkType) -> Self {
        Self {
            node: NodeConfig {
                name: "exsyncd".to_string(),
                network,
                data_dir: String::new(), // Will be auto-configured
            },
            server: ServerConfig {
                address: default_server(network).to_string(),
                tls: network != NetworkType::Regtest,
                tls_verify: true,
                ca_file: None,
                protocol_version: default_protocol_version(),
                dial_timeout_secs: default_dial_timeout(),
                request_timeout_secs: default_request_timeout(),
                keepalive_interval_secs: default_keepalive(),
                read_timeout_secs: default_read_timeout(),
                check_canary: true,
            },
            headers: HeadersConfig::default(),
            session: SessionConfig::default(),
            reconnect: ReconnectConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                output: "stdout".to_string(),
                file_path: "./logs/exsyncd.log".to_string(),
            },
            wallet: WalletConfig::default(),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or write network defaults there on first run.
    pub fn load_or_create(path: &Path, network: NetworkType) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        let config = Self::default_for(network);
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default config to {}", path.display());
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.server.read_timeout_secs <= self.server.keepalive_interval_secs {
            return invalid(format!(
                "server.read_timeout_secs ({}) must exceed keepalive_interval_secs ({})",
                self.server.read_timeout_secs, self.server.keepalive_interval_secs
            ));
        }
        if self.server.keepalive_interval_secs == 0 || self.server.request_timeout_secs == 0 {
            return invalid("server timeouts must be positive".to_string());
        }
        if self.headers.chunk_size == 0 || self.headers.rewind == 0 || self.headers.queue_depth == 0 {
            return invalid("headers.chunk_size, rewind and queue_depth must be positive".to_string());
        }
        if self.session.decay_interval_ms == 0 {
            return invalid("session.decay_interval_ms must be positive".to_string());
        }
        if self.reconnect.multiplier < 1.0 || !(0.0..1.0).contains(&self.reconnect.jitter) {
            return invalid("reconnect.multiplier must be >= 1 and jitter in [0, 1)".to_string());
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return invalid(format!("unknown logging.format {:?}", self.logging.format));
        }
        if !matches!(self.logging.output.as_str(), "stdout" | "file") {
            return invalid(format!("unknown logging.output {:?}", self.logging.output));
        }
        for sh in &self.wallet.watch_scripthashes {
            if sh.len() != 64 || hex::decode(sh).is_err() {
                return invalid(format!("watch scripthash {:?} is not 32 bytes of hex", sh));
            }
        }
        self.server_address()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn network(&self) -> NetworkType {
        self.node.network
    }

    /// Configured data directory, or the platform default.
    pub fn data_dir(&self) -> PathBuf {
        if self.node.data_dir.is_empty() {
            get_network_data_dir(self.node.network)
        } else {
            PathBuf::from(&self.node.data_dir)
        }
    }

    pub fn header_path(&self) -> PathBuf {
        self.data_dir().join("headers.bin")
    }

    pub fn start_point(&self) -> u64 {
        self.headers
            .start_point
            .unwrap_or_else(|| self.node.network.default_start_point())
    }

    pub fn server_address(&self) -> Result<ServerAddress, ConnectError> {
        ServerAddress::parse(&self.server.address, self.node.network, self.server.tls)
    }

    pub fn cost_config(&self) -> CostConfig {
        CostConfig {
            cost_per_byte: self.session.cost_per_byte,
            error_penalty: self.session.error_penalty,
            decay_amount: self.session.decay_amount,
            decay_interval: Duration::from_millis(self.session.decay_interval_ms),
            soft_limit: self.session.soft_limit,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            client_name: format!("{}/{}", self.node.name, env!("CARGO_PKG_VERSION")),
            protocol_version: self.server.protocol_version.clone(),
            dial_timeout: Duration::from_secs(self.server.dial_timeout_secs),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            keepalive_interval: Duration::from_secs(self.server.keepalive_interval_secs),
            read_timeout: Duration::from_secs(self.server.read_timeout_secs),
            cost: self.cost_config(),
            ..ClientSettings::default()
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            chunk_size: self.headers.chunk_size,
            rewind: self.headers.rewind,
            batch_threshold: self.headers.batch_threshold,
            queue_depth: self.headers.queue_depth,
            stale_policy: self.headers.stale_subscribe,
            ..SyncSettings::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_secs(self.reconnect.initial_backoff_secs),
            max: Duration::from_secs(self.reconnect.max_backoff_secs),
            multiplier: self.reconnect.multiplier,
            jitter: self.reconnect.jitter,
            max_attempts: self.reconnect.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/exsyncd.toml");

        let created = Config::load_or_create(&path, NetworkType::Testnet).unwrap();
        assert!(path.exists());
        assert_eq!(created.network(), NetworkType::Testnet);

        let loaded = Config::load_or_create(&path, NetworkType::Mainnet).unwrap();
        assert_eq!(loaded.network(), NetworkType::Testnet);
        assert_eq!(loaded.server.address, created.server.address);
        assert_eq!(loaded.start_point(), NetworkType::Testnet.default_start_point());
    }

    #[test]
    fn test_minimal_file_gets_defaults() {
        let toml_src = r#"
            [node]
            name = "test"
            network = "regtest"
            data_dir = "/tmp/exsync-test"

            [server]
            address = "127.0.0.1:50001"
            tls = false

            [logging]
            level = "debug"
            format = "json"
            output = "stdout"
            file_path = ""

            [headers]
            start_point = 100
            stale_subscribe = "disconnect"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();

        assert_eq!(config.start_point(), 100);
        assert_eq!(config.headers.chunk_size, 2016);
        assert_eq!(config.headers.stale_subscribe, StalePolicy::Disconnect);
        assert_eq!(config.header_path(), PathBuf::from("/tmp/exsync-test/headers.bin"));
        assert_eq!(config.server.read_timeout_secs, 25);
        assert!(config.wallet.watch_scripthashes.is_empty());

        let addr = config.server_address().unwrap();
        assert!(!addr.is_tls());
        assert_eq!(addr.port, 50001);

        let sync = config.sync_settings();
        assert_eq!(sync.rewind, 8);
        assert_eq!(sync.stale_policy, StalePolicy::Disconnect);
    }

    #[test]
    fn test_validate_rejects_racing_deadline() {
        let mut config = Config::default_for(NetworkType::Regtest);
        config.server.read_timeout_secs = config.server.keepalive_interval_secs;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_scripthash() {
        let mut config = Config::default_for(NetworkType::Regtest);
        config.wallet.watch_scripthashes = vec!["abcd".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        for network in [NetworkType::Mainnet, NetworkType::Testnet, NetworkType::Regtest] {
            let config = Config::default_for(network);
            config.validate().unwrap();
            assert!(config.data_dir().ends_with(network.data_subdir()));
        }
    }
}
