//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal block header, enough to track progress and detect reorgs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
}

// ─── RawLog ──────────────────────────────────────────────────────────────────

/// A contract log as produced by the chain log source.
///
/// Uniquely identified by `(block_number, tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub block_number: u64,
    pub block_hash: String,
    pub log_index: u32,
    pub tx_hash: String,
    /// Emitting contract (`0x…`).
    pub address: String,
    /// `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed parameters (`0x…`).
    pub data: String,
    /// Set by the node when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// The event signature hash, if any.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    /// Provenance of this log.
    pub fn provenance(&self) -> EventRef {
        EventRef {
            block_number: self.block_number,
            log_index: self.log_index,
            tx_hash: self.tx_hash.clone(),
        }
    }
}

// ─── EventRef ────────────────────────────────────────────────────────────────

/// Where an event came from. Orders by `(block_number, log_index)`, which is
/// the emission order on a single chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub block_number: u64,
    pub log_index: u32,
    pub tx_hash: String,
}

impl EventRef {
    pub fn new(block_number: u64, log_index: u32, tx_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            log_index,
            tx_hash: tx_hash.into(),
        }
    }
}

impl std::fmt::Display for EventRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.block_number, self.log_index, self.tx_hash)
    }
}

// ─── IndexPhase ──────────────────────────────────────────────────────────────

/// The current phase of the ingestion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up to the chain head (processing historical blocks).
    Backfill,
    /// Following the chain tip in real-time.
    Live,
}

// ─── Serde helpers ───────────────────────────────────────────────────────────

/// Serializes a `U256` as a base-10 string, the shape API consumers expect
/// for token ids and wei amounts.
pub mod decimal_u256 {
    use alloy_primitives::U256;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(D::Error::custom)
    }
}

/// Lowercase `0x…` rendering used for addresses in storage keys and filters.
pub fn lower_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
