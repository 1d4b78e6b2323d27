//! Fluent builder API for creating marketplace pipelines.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marketindex_evm::{HttpLogSource, HttpSourceConfig, IndexerBuilder};
//! use marketindex_storage::InMemoryStorage;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = HttpLogSource::new("http://127.0.0.1:8545", HttpSourceConfig::default())?;
//! let pipeline = IndexerBuilder::new()
//!     .contract("0x5FbDB2315678afecb367f032d93F642f64180aa3")
//!     .start_block(0)
//!     .confirmation_depth(2)
//!     .batch_size(500)
//!     .build(Arc::new(source), Arc::new(InMemoryStorage::new()))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use marketindex_core::backoff::BackoffConfig;
use marketindex_core::config::IndexerConfig;
use marketindex_core::error::IndexerError;
use marketindex_core::store::ListingStore;

use crate::pipeline::Pipeline;
use crate::source::LogSource;

/// Fluent builder for `IndexerConfig` and [`Pipeline`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the indexer ID (log field).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// Set the watched marketplace contract.
    pub fn contract(mut self, address: impl Into<String>) -> Self {
        self.config.contract_address = address.into();
        self
    }

    /// Set the start block (contract deployment block).
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set confirmation depth (blocks behind head before processing).
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.config.confirmation_depth = depth;
        self
    }

    /// Set the number of blocks per `eth_getLogs` batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the floor the batch may shrink to under repeated failures.
    pub fn min_batch_size(mut self, size: u64) -> Self {
        self.config.min_batch_size = size;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set head polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the configuration and build a pipeline.
    pub fn build(
        self,
        source: Arc<dyn LogSource>,
        store: Arc<dyn ListingStore>,
    ) -> Result<Pipeline, IndexerError> {
        Pipeline::new(self.config, source, store)
    }
}
