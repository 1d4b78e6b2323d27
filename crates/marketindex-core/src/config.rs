//! Indexer configuration and state types.

use std::collections::BTreeMap;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::IndexerError;
use crate::types::lower_hex;

/// Contract name used in deployment network mappings.
pub const MARKETPLACE_CONTRACT: &str = "NftMarketplace";

/// Configuration for an ingestion pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Unique name for this indexer (log field).
    pub id: String,
    /// EVM chain id the contract lives on.
    pub chain_id: u64,
    /// Watched marketplace contract (`0x…`). May be left empty and resolved
    /// from a [`NetworkMapping`].
    pub contract_address: String,
    /// First block to index (contract deployment block).
    pub start_block: u64,
    /// Optional end block (bounded backfill). `None` = keep tailing.
    pub to_block: Option<u64>,
    /// Blocks per log query range.
    pub batch_size: u64,
    /// Floor for the range when it shrinks under repeated failures.
    pub min_batch_size: u64,
    /// Blocks behind the head before a block is processed.
    pub confirmation_depth: u64,
    /// How far back the common-ancestor search walks on a reorg.
    pub max_reorg_depth: u64,
    /// Head polling interval for sources without push notifications (ms).
    pub poll_interval_ms: u64,
    /// Retry policy for transient log-source errors.
    pub backoff: BackoffConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "marketplace".into(),
            chain_id: 31337,
            contract_address: String::new(),
            start_block: 0,
            to_block: None,
            batch_size: 1000,
            min_batch_size: 10,
            confirmation_depth: 0,
            max_reorg_depth: 64,
            poll_interval_ms: 2000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// The watched contract as a typed address.
    pub fn contract(&self) -> Result<Address, IndexerError> {
        self.contract_address
            .parse::<Address>()
            .map_err(|e| IndexerError::Config(format!("contract_address {:?}: {e}", self.contract_address)))
    }

    /// Lowercase `0x…` form used in log filters.
    pub fn contract_hex(&self) -> Result<String, IndexerError> {
        Ok(lower_hex(self.contract()?.as_slice()))
    }

    /// Fill `contract_address` from a deployment mapping when it is unset.
    pub fn resolve_contract(&mut self, mapping: &NetworkMapping) -> Result<(), IndexerError> {
        if !self.contract_address.is_empty() {
            return Ok(());
        }
        let latest = mapping.latest(self.chain_id, MARKETPLACE_CONTRACT).ok_or_else(|| {
            IndexerError::Config(format!(
                "no {MARKETPLACE_CONTRACT} deployment for chain {}",
                self.chain_id
            ))
        })?;
        self.contract_address = latest.to_string();
        Ok(())
    }

    /// Check the configuration before building a pipeline.
    pub fn validate(&self) -> Result<(), IndexerError> {
        self.contract()?;
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be > 0".into()));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.batch_size {
            return Err(IndexerError::Config(format!(
                "min_batch_size must be in 1..={}",
                self.batch_size
            )));
        }
        if self.max_reorg_depth == 0 {
            return Err(IndexerError::Config("max_reorg_depth must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IndexerError::Config("poll_interval_ms must be > 0".into()));
        }
        if let Some(to) = self.to_block {
            if to < self.start_block {
                return Err(IndexerError::Config(format!(
                    "to_block {to} is before start_block {}",
                    self.start_block
                )));
            }
        }
        Ok(())
    }
}

/// Runtime state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Catching up to the chain head observed at start.
    Backfilling,
    /// Following new blocks.
    LiveTailing,
    /// Rolling back to a common ancestor after a reorg.
    ReorgRecovery,
    /// Terminated cleanly.
    Stopped,
    /// Halted on an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::LiveTailing => write!(f, "live-tailing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ─── NetworkMapping ──────────────────────────────────────────────────────────

/// Deployment registry: `{"<chainId>": {"<Contract>": ["0x…", …]}}`.
///
/// Addresses are appended on each deployment, so the last entry is the live
/// contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkMapping(BTreeMap<String, BTreeMap<String, Vec<String>>>);

impl NetworkMapping {
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        serde_json::from_str(json).map_err(|e| IndexerError::Config(format!("network mapping: {e}")))
    }

    /// Most recent deployment of `contract` on `chain_id`.
    pub fn latest(&self, chain_id: u64, contract: &str) -> Option<&str> {
        self.0
            .get(&chain_id.to_string())?
            .get(contract)?
            .last()
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn config() -> IndexerConfig {
        IndexerConfig {
            contract_address: MARKET.into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate_once_contract_is_set() {
        assert!(IndexerConfig::default().validate().is_err());
        config().validate().unwrap();
    }

    #[test]
    fn contract_hex_is_lowercase() {
        assert_eq!(config().contract_hex().unwrap(), MARKET.to_lowercase());
    }

    #[test]
    fn rejects_bad_batch_sizes() {
        let mut c = config();
        c.batch_size = 0;
        assert!(matches!(c.validate(), Err(IndexerError::Config(_))));

        let mut c = config();
        c.min_batch_size = c.batch_size + 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let mut c = config();
        c.start_block = 100;
        c.to_block = Some(50);
        assert!(c.validate().is_err());
    }

    #[test]
    fn mapping_picks_latest_deployment() {
        let mapping = NetworkMapping::from_json(
            r#"{"31337":{"NftMarketplace":["0x1111111111111111111111111111111111111111","0x2222222222222222222222222222222222222222"]}}"#,
        )
        .unwrap();
        assert_eq!(
            mapping.latest(31337, MARKETPLACE_CONTRACT),
            Some("0x2222222222222222222222222222222222222222")
        );
        assert!(mapping.latest(1, MARKETPLACE_CONTRACT).is_none());

        let mut c = IndexerConfig::default();
        c.resolve_contract(&mapping).unwrap();
        assert_eq!(c.contract_address, "0x2222222222222222222222222222222222222222");
        c.validate().unwrap();
    }

    #[test]
    fn explicit_contract_wins_over_mapping() {
        let mapping = NetworkMapping::default();
        let mut c = config();
        c.resolve_contract(&mapping).unwrap();
        assert_eq!(c.contract_address, MARKET);

        let mut unresolved = IndexerConfig::default();
        assert!(unresolved.resolve_contract(&mapping).is_err());
    }

    #[test]
    fn config_from_partial_json() {
        let c: IndexerConfig =
            serde_json::from_str(r#"{"contract_address":"0x5FbDB2315678afecb367f032d93F642f64180aa3","batch_size":50}"#)
                .unwrap();
        assert_eq!(c.batch_size, 50);
        assert_eq!(c.max_reorg_depth, 64);
    }
}
