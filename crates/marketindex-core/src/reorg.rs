//! Reorg detection and common-ancestor search.
//!
//! The cursor records the hash of the last processed block. Because block
//! hashes chain through their parents, an unchanged hash at the cursor height
//! proves every earlier processed block is still canonical; a changed (or
//! missing) one means a reorg happened somewhere at or below the cursor.
//!
//! On a mismatch the detector walks the recorded block hashes downward and
//! asks the chain for its current hash at each height. The first height where
//! they agree is the common ancestor.

use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::store::ListingStore;

/// Read access to the chain's current canonical hashes.
#[async_trait]
pub trait CanonicalChain: Send + Sync {
    /// Current hash at `number`, or `None` if the chain is shorter.
    async fn canonical_hash(&self, number: u64) -> Result<Option<String>, IndexerError>;
}

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Cursor height where the mismatch was observed.
    pub detected_at: u64,
    /// Hash recorded when the block was processed.
    pub expected: String,
    /// Hash the chain reports now (`None` if the block vanished).
    pub actual: Option<String>,
    /// Highest block still shared with the new chain.
    pub common_ancestor: u64,
    /// Canonical hash of the common ancestor.
    pub ancestor_hash: String,
    /// Number of blocks rolled back.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

impl ReorgEvent {
    /// The equivalent error value, for logging and callers that surface it.
    pub fn to_error(&self) -> IndexerError {
        IndexerError::ReorgDetected {
            block_number: self.detected_at,
            expected: self.expected.clone(),
            actual: self.actual.clone().unwrap_or_else(|| "<missing>".into()),
        }
    }
}

/// Classification of the reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Common ancestor found within 3 blocks.
    ShortReorg,
    /// Common ancestor found deeper in the search window.
    DeepReorg,
    /// No recorded block in the window matched; rolled back to the window floor.
    BeyondWindow,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortReorg => write!(f, "short reorg"),
            Self::DeepReorg => write!(f, "deep reorg"),
            Self::BeyondWindow => write!(f, "reorg beyond search window"),
        }
    }
}

/// Detects reorgs against the persisted cursor.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
    /// How far below the cursor the ancestor search may go.
    max_depth: u64,
}

impl ReorgDetector {
    pub fn new(max_depth: u64) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Compare the cursor against the chain; on mismatch, locate the common
    /// ancestor. Returns `None` when the cursor block is still canonical.
    pub async fn check(
        &self,
        cursor: &Cursor,
        store: &dyn ListingStore,
        chain: &dyn CanonicalChain,
    ) -> Result<Option<ReorgEvent>, IndexerError> {
        let actual = chain.canonical_hash(cursor.block_number).await?;
        if actual.as_deref() == Some(cursor.block_hash.as_str()) {
            return Ok(None);
        }

        let floor = cursor.block_number.saturating_sub(self.max_depth);
        let candidates = match cursor.block_number.checked_sub(1) {
            Some(below) if below >= floor => store.recorded_blocks(floor, below).await?,
            _ => vec![],
        };

        let mut found = None;
        for (number, recorded) in candidates {
            match chain.canonical_hash(number).await? {
                Some(hash) if hash.eq_ignore_ascii_case(&recorded) => {
                    found = Some((number, hash));
                    break;
                }
                _ => tracing::debug!(block = number, "recorded block no longer canonical"),
            }
        }

        let (common_ancestor, ancestor_hash, reorg_type) = match found {
            Some((number, hash)) => {
                let depth = cursor.block_number - number;
                let kind = if depth <= 3 {
                    ReorgType::ShortReorg
                } else {
                    ReorgType::DeepReorg
                };
                (number, hash, kind)
            }
            None => {
                let hash = chain.canonical_hash(floor).await?.unwrap_or_default();
                (floor, hash, ReorgType::BeyondWindow)
            }
        };

        let event = ReorgEvent {
            detected_at: cursor.block_number,
            expected: cursor.block_hash.clone(),
            actual,
            common_ancestor,
            ancestor_hash,
            depth: cursor.block_number - common_ancestor,
            reorg_type,
        };
        tracing::warn!(
            at = event.detected_at,
            ancestor = event.common_ancestor,
            depth = event.depth,
            reorg_type = %event.reorg_type,
            "Reorg detected"
        );
        Ok(Some(event))
    }
}
