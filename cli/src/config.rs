//! TOML configuration file for `marketindex run`.
//!
//! ```toml
//! network_mapping = "./networkMapping.json"   # optional
//!
//! [indexer]
//! chain_id = 31337
//! contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
//! confirmation_depth = 2
//!
//! [rpc]
//! url = "http://127.0.0.1:8545"
//! timeout_ms = 30000
//!
//! [storage]
//! path = "./marketindex.db"
//!
//! [log]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use marketindex_core::config::{IndexerConfig, NetworkMapping};
use marketindex_evm::HttpSourceConfig;

use crate::logging::LogConfig;

/// Environment variable overriding `[rpc].url`.
pub const RPC_URL_ENV: &str = "MARKETINDEX_RPC_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".into(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./marketindex.db".into(),
        }
    }
}

/// Everything `marketindex run` needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub indexer: IndexerConfig,
    pub rpc: RpcConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
    /// Deployment registry used when `indexer.contract_address` is empty.
    /// Relative paths resolve against the config file's directory.
    pub network_mapping: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid config file")
    }

    /// Load `path`, apply the environment override and resolve the
    /// contract address.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env(std::env::var(RPC_URL_ENV).ok());

        if config.indexer.contract_address.is_empty() {
            let mapping_path = config
                .network_mapping
                .clone()
                .context("indexer.contract_address is empty and no network_mapping is configured")?;
            let mapping_path = match path.parent() {
                Some(dir) if mapping_path.is_relative() => dir.join(mapping_path),
                _ => mapping_path,
            };
            let json = std::fs::read_to_string(&mapping_path)
                .with_context(|| format!("reading {}", mapping_path.display()))?;
            config.indexer.resolve_contract(&NetworkMapping::from_json(&json)?)?;
        }
        config.indexer.validate()?;
        Ok(config)
    }

    /// Replace the RPC URL with `url` when it is set and non-empty.
    pub fn apply_env(&mut self, url: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.rpc.url = url;
        }
    }

    pub fn source_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            request_timeout: Duration::from_millis(self.rpc.timeout_ms),
            poll_interval: Duration::from_millis(self.indexer.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    #[test]
    fn defaults_fill_missing_sections() {
        let config = AppConfig::from_toml("[indexer]\nchain_id = 11155111\n").unwrap();
        assert_eq!(config.indexer.chain_id, 11155111);
        assert_eq!(config.indexer.batch_size, 1000);
        assert_eq!(config.rpc, RpcConfig::default());
        assert_eq!(config.storage.path, "./marketindex.db");
        assert_eq!(config.log.level, "info");
        assert!(config.network_mapping.is_none());
    }

    #[test]
    fn parses_all_sections() {
        let text = format!(
            r#"
            [indexer]
            contract_address = "{MARKET}"
            confirmation_depth = 3
            [indexer.backoff]
            max_retries = 5
            [rpc]
            url = "https://rpc.example"
            timeout_ms = 5000
            [storage]
            path = "/tmp/m.db"
            [log]
            level = "debug"
            json = true
            "#
        );
        let config = AppConfig::from_toml(&text).unwrap();
        assert_eq!(config.indexer.confirmation_depth, 3);
        assert_eq!(config.indexer.backoff.max_retries, Some(5));
        assert_eq!(config.rpc.url, "https://rpc.example");
        assert_eq!(config.source_config().request_timeout, Duration::from_secs(5));
        assert_eq!(config.storage.path, "/tmp/m.db");
        assert!(config.log.json);
    }

    #[test]
    fn env_overrides_rpc_url() {
        let mut config = AppConfig::default();
        config.apply_env(Some("http://node:8545".into()));
        assert_eq!(config.rpc.url, "http://node:8545");
        config.apply_env(Some("  ".into()));
        assert_eq!(config.rpc.url, "http://node:8545");
        config.apply_env(None);
        assert_eq!(config.rpc.url, "http://node:8545");
    }

    #[test]
    fn empty_contract_resolves_from_mapping() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("networkMapping.json"),
            format!(r#"{{"31337": {{"NftMarketplace": ["0x0000000000000000000000000000000000000001", "{MARKET}"]}}}}"#),
        )
        .unwrap();
        let path = dir.path().join("marketindex.toml");
        std::fs::write(&path, "network_mapping = \"networkMapping.json\"\n[indexer]\nchain_id = 31337\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.indexer.contract_address, MARKET);
    }

    #[test]
    fn empty_contract_without_mapping_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketindex.toml");
        std::fs::write(&path, "[indexer]\n").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
