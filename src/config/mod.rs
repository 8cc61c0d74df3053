use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upkeep: UpkeepConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Hex private key for upkeep transactions - loaded from env LOTTERY_PRIVATE_KEY
    #[serde(skip)]
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Streaming-capable node endpoint (ws:// or wss://)
    #[serde(default)]
    pub ws_url: String,
    /// Lottery contract address (0x-prefixed hex)
    #[serde(default)]
    pub contract_address: String,
    /// First block scanned by the backfill pass
    #[serde(default)]
    pub start_block: u64,
    /// Max block span per eth_getLogs request during backfill
    #[serde(default = "default_log_chunk_size")]
    pub log_chunk_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `redis://host:port` for Valkey/Redis, `memory://` for a throwaway projection
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Key namespace, so several deployments can share one Valkey.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpkeepConfig {
    /// Evaluate checkUpkeep on every join event.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Max concurrent upkeep evaluations (0 = unbounded).
    #[serde(default)]
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_chunk_size() -> u64 {
    10_000
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_prefix() -> String {
    "lottery".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
        }
    }
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Build a config from environment variables only (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            node: NodeConfig {
                ws_url: String::new(),
                contract_address: String::new(),
                start_block: 0,
                log_chunk_size: default_log_chunk_size(),
            },
            store: StoreConfig::default(),
            upkeep: UpkeepConfig::default(),
            logging: LoggingConfig::default(),
            private_key: String::new(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("LOTTERY_WS_URL") {
            self.node.ws_url = url;
        }
        if let Ok(addr) = std::env::var("LOTTERY_CONTRACT_ADDRESS") {
            self.node.contract_address = addr;
        }
        if let Ok(block) = std::env::var("LOTTERY_START_BLOCK") {
            self.node.start_block = block.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "LOTTERY_START_BLOCK",
                reason: format!("not a block number: {block}"),
            })?;
        }
        if let Ok(url) = std::env::var("LOTTERY_STORE_URL") {
            self.store.url = url;
        }
        // Never read from the config file
        if let Ok(key) = std::env::var("LOTTERY_PRIVATE_KEY") {
            self.private_key = key;
        }
        Ok(())
    }

    /// Reject configs the listener cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.ws_url.is_empty() {
            return Err(ConfigError::MissingEnv("LOTTERY_WS_URL".to_string()));
        }
        if self.node.contract_address.is_empty() {
            return Err(ConfigError::MissingEnv(
                "LOTTERY_CONTRACT_ADDRESS".to_string(),
            ));
        }
        self.contract_address()?;
        if self.node.log_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "node.log_chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn contract_address(&self) -> Result<Address, ConfigError> {
        Address::from_str(self.node.contract_address.trim()).map_err(|e| ConfigError::Invalid {
            field: "node.contract_address",
            reason: e.to_string(),
        })
    }

    pub fn has_credentials(&self) -> bool {
        !self.private_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_file() {
        let config: Config = toml::from_str(
            r#"
            [node]
            ws_url = "ws://127.0.0.1:8545"
            contract_address = "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.start_block, 0);
        assert_eq!(config.node.log_chunk_size, 10_000);
        assert_eq!(config.store.prefix, "lottery");
        assert!(config.upkeep.enabled);
        assert_eq!(config.upkeep.max_in_flight, 0);
        assert_eq!(config.logging.level, "info");
        assert!(config.private_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_address() {
        let config: Config = toml::from_str(
            r#"
            [node]
            ws_url = "ws://127.0.0.1:8545"
            contract_address = "not-an-address"
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "node.contract_address", .. })
        ));
    }

    #[test]
    fn test_validate_requires_endpoint() {
        let config: Config = toml::from_str(
            r#"
            [node]
            contract_address = "0xCf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9"
            "#,
        )
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(_))));
    }
}
