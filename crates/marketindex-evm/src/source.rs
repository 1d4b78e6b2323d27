//! The chain log source seam and the JSON-RPC wire shapes it decodes.
//!
//! Uses `eth_blockNumber`, `eth_getBlockByNumber` and `eth_getLogs` shapes;
//! any provider that can answer those three (plus a new-block stream) can
//! drive the pipeline.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use marketindex_core::error::IndexerError;
use marketindex_core::reorg::CanonicalChain;
use marketindex_core::types::{BlockSummary, RawLog};

/// Stream of new chain-head block numbers.
pub type BlockStream = Pin<Box<dyn Stream<Item = u64> + Send>>;

/// Read access to an EVM chain's logs and headers.
///
/// Delivery of new-block notifications is at-least-once; duplicates and gaps
/// are tolerated by the pipeline.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Current chain head.
    async fn head_block_number(&self) -> Result<u64, IndexerError>;

    /// Header of block `number`, or `None` if the chain is shorter.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    /// Logs emitted by `address` with signature `topic0` in `[from, to]`.
    async fn get_logs(&self, address: &str, topic0: &str, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError>;

    /// Subscribe to new chain heads.
    async fn subscribe_new_blocks(&self) -> Result<BlockStream, IndexerError>;
}

/// Adapts a [`LogSource`] to the reorg detector's view of the chain.
pub struct SourceChain<'a>(pub &'a dyn LogSource);

#[async_trait]
impl CanonicalChain for SourceChain<'_> {
    async fn canonical_hash(&self, number: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.0.block(number).await?.map(|b| b.hash))
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

/// A log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed")]
    pub removed: Option<bool>,
}

impl RpcLog {
    /// Convert hex quantities into a typed [`RawLog`].
    pub fn into_raw(self) -> Result<RawLog, IndexerError> {
        Ok(RawLog {
            block_number: parse_hex_u64(&self.block_number)?,
            log_index: u32::try_from(parse_hex_u64(&self.log_index)?)
                .map_err(|_| IndexerError::Source(format!("logIndex {} out of range", self.log_index)))?,
            block_hash: self.block_hash,
            tx_hash: self.tx_hash,
            address: self.address,
            topics: self.topics,
            data: self.data,
            removed: self.removed.unwrap_or(false),
        })
    }
}

/// The header fields read from `eth_getBlockByNumber`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcBlock {
    pub number: String,
    pub hash: String,
    #[serde(rename = "parentHash")]
    pub parent_hash: String,
}

impl RpcBlock {
    pub fn into_summary(self) -> Result<BlockSummary, IndexerError> {
        Ok(BlockSummary {
            number: parse_hex_u64(&self.number)?,
            hash: self.hash,
            parent_hash: self.parent_hash,
        })
    }
}

/// Parse a hex quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, IndexerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| IndexerError::Source(format!("bad hex quantity {s:?}: {e}")))
}

/// Render a block number as a JSON-RPC hex quantity.
pub fn hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
        assert!(parse_hex_u64("0xzz").is_err());
        assert_eq!(hex_quantity(255), "0xff");
    }

    #[test]
    fn rpc_log_into_raw() {
        let json = serde_json::json!({
            "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "topics": ["0x01"],
            "data": "0x",
            "blockNumber": "0x12a05f200",
            "blockHash": "0xabc",
            "transactionHash": "0xdef",
            "logIndex": "0x5"
        });
        let log: RpcLog = serde_json::from_value(json).unwrap();
        let raw = log.into_raw().unwrap();
        assert_eq!(raw.block_number, 5_000_000_000);
        assert_eq!(raw.log_index, 5);
        assert!(!raw.removed);
    }

    #[test]
    fn rpc_block_into_summary() {
        let block: RpcBlock = serde_json::from_value(serde_json::json!({
            "number": "0x64",
            "hash": "0xaa",
            "parentHash": "0x99",
            "transactions": []
        }))
        .unwrap();
        let summary = block.into_summary().unwrap();
        assert_eq!(summary.number, 100);
        assert_eq!(summary.parent_hash, "0x99");
    }
}
