//! Ingestion cursor, the persisted progress marker.

use serde::{Deserialize, Serialize};

/// The pipeline's position in the chain.
///
/// Written in the same atomic store operation that applies a batch, so the
/// cursor never runs ahead of the listing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Last block whose logs have been durably applied.
    pub block_number: u64,
    /// Hash of that block at the time it was processed.
    pub block_hash: String,
    /// Unix timestamp of the write.
    pub updated_at: i64,
}

impl Cursor {
    /// Create a cursor at the given block, stamped with the current time.
    pub fn new(block_number: u64, block_hash: impl Into<String>) -> Self {
        Self {
            block_number,
            block_hash: block_hash.into(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Returns the next block to process (cursor + 1).
    pub fn next_block(&self) -> u64 {
        self.block_number + 1
    }
}

/// First block the pipeline still has to process.
pub fn next_block(cursor: Option<&Cursor>, start_block: u64) -> u64 {
    cursor.map_or(start_block, |c| c.next_block().max(start_block))
}
