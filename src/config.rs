//! Configuration management for ForkLedger

use crate::blockchain::MAX_DIFFICULTY;
use crate::crypto::KeyPair;
use crate::error::ChainError;
use crate::participant::{Participant, ParticipantRegistry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub miner: MinerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub participants: Vec<ParticipantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Hex-encoded secp256k1 secret key. Without it the node cannot mine.
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            secret_key: None,
            listen_port: default_listen_port(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_transactions_per_block")]
    pub transactions_per_block: usize,
    #[serde(default = "default_trials_per_block")]
    pub trials_per_block: u64,
    /// Pause before every mining attempt.
    #[serde(default = "default_miner_sleep", deserialize_with = "deserialize_duration")]
    pub sleep: Duration,
    #[serde(default = "default_enabled")]
    pub mine_empty_blocks: bool,
    /// Nonce trials between two checks of the stop flag.
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            difficulty: default_difficulty(),
            transactions_per_block: default_transactions_per_block(),
            trials_per_block: default_trials_per_block(),
            sleep: default_miner_sleep(),
            mine_empty_blocks: default_enabled(),
            cancel_check_interval: default_cancel_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_block_request_offset")]
    pub block_request_offset: u64,
    #[serde(default = "default_request_timeout", deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    #[serde(default = "default_socket_timeout", deserialize_with = "deserialize_duration")]
    pub socket_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_request_offset: default_block_request_offset(),
            request_timeout: default_request_timeout(),
            socket_timeout: default_socket_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub name: String,
    /// Base64 of the 33-byte compressed public key.
    pub public_key: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_role: Option<String>,
}

impl ParticipantConfig {
    pub fn from_keypair(name: impl Into<String>, keypair: &KeyPair, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            public_key: BASE64.encode(keypair.public_key_bytes()),
            address: address.into(),
            port,
            special_role: None,
        }
    }

    pub fn to_participant(&self) -> Result<Participant, ChainError> {
        let public_key = BASE64.decode(self.public_key.trim()).map_err(|e| {
            ChainError::ConfigError(format!("Invalid public key for participant {}: {}", self.name, e))
        })?;
        let participant = Participant::new(self.name.clone(), public_key, self.address.clone(), self.port);
        Ok(match &self.special_role {
            Some(role) => participant.with_special_role(role.clone()),
            None => participant,
        })
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.node.name.trim().is_empty() {
            return Err(ChainError::ConfigError("node.name must be set".to_string()));
        }
        if self.node.data_dir.is_empty() {
            return Err(ChainError::ConfigError("node.data_dir must be set".to_string()));
        }
        if self.miner.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "miner.difficulty must be at most {}, got {}",
                MAX_DIFFICULTY, self.miner.difficulty
            )));
        }
        if self.miner.transactions_per_block == 0 {
            return Err(ChainError::ConfigError(
                "miner.transactions_per_block must be at least 1".to_string(),
            ));
        }
        if self.miner.cancel_check_interval == 0 {
            return Err(ChainError::ConfigError(
                "miner.cancel_check_interval must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for participant in &self.participants {
            if !names.insert(participant.name.as_str()) {
                return Err(ChainError::ConfigError(format!(
                    "Participant {} is configured twice",
                    participant.name
                )));
            }
        }
        Ok(())
    }

    /// The node's signing key, `None` if no secret key is configured.
    pub fn keypair(&self) -> Result<Option<KeyPair>, ChainError> {
        self.node
            .secret_key
            .as_deref()
            .map(|hex| {
                KeyPair::from_secret_hex(hex.trim())
                    .map_err(|e| ChainError::ConfigError(format!("Invalid node.secret_key: {}", e)))
            })
            .transpose()
    }

    pub fn registry(&self) -> Result<ParticipantRegistry, ChainError> {
        let mut registry = ParticipantRegistry::new();
        for participant in &self.participants {
            registry.register(participant.to_participant()?)?;
        }
        Ok(registry)
    }

    pub fn database_path(&self) -> std::path::PathBuf {
        Path::new(&self.node.data_dir).join("chainstate.db")
    }
}

/// Reads the TOML file at `path`; a missing or empty file yields defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let config_str = fs::read_to_string(path.as_ref()).unwrap_or_default();
    let config: Config = if config_str.trim().is_empty() {
        tracing::warn!("No configuration at {}, using defaults", path.as_ref().display());
        Config::default()
    } else {
        toml::from_str(&config_str).map_err(|e| ChainError::ConfigError(e.to_string()))?
    };

    config.validate()?;
    Ok(config)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_listen_port() -> u16 {
    9000
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_difficulty() -> u32 {
    22
}

fn default_transactions_per_block() -> usize {
    300
}

fn default_trials_per_block() -> u64 {
    0x0FFF_FFFF
}

fn default_miner_sleep() -> Duration {
    Duration::from_millis(10)
}

fn default_cancel_check_interval() -> u64 {
    100
}

fn default_block_request_offset() -> u64 {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}
