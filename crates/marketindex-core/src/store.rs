//! The `ListingStore` trait: persistence seam for listings, the event
//! journal, recorded block hashes and the cursor.
//!
//! Implementations: `InMemoryStorage` and `SqliteStorage` in
//! `marketindex-storage`.

use std::collections::BTreeMap;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::event::DomainEvent;
use crate::listing::{Listing, ListingKey};

/// One unit of pipeline progress, applied atomically.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// Decoded events, sorted by provenance.
    pub events: Vec<DomainEvent>,
    /// Block hashes observed while fetching this batch.
    pub blocks: BTreeMap<u64, String>,
    /// Cursor to persist once the events are applied.
    pub cursor: Cursor,
}

impl EventBatch {
    /// Build a batch, recording the hash of every block that carried an event
    /// plus the batch end block.
    pub fn new(mut events: Vec<DomainEvent>, block_hashes: BTreeMap<u64, String>, cursor: Cursor) -> Self {
        events.sort_by(|a, b| a.provenance.cmp(&b.provenance));
        let mut blocks = block_hashes;
        blocks.insert(cursor.block_number, cursor.block_hash.clone());
        Self {
            events,
            blocks,
            cursor,
        }
    }
}

/// Result of applying a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Events newly written to the journal.
    pub applied: usize,
    /// Events already present in the journal (ignored).
    pub duplicates: usize,
}

/// Result of a reorg rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Journal entries above the common ancestor that were removed.
    pub removed_events: usize,
    /// Listing keys whose state was re-derived from the remaining journal.
    pub rederived_keys: usize,
}

/// Single-writer, multi-reader listing store.
///
/// Readers must never observe a partially applied batch or rollback.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Apply one event outside of any batch. Idempotent per provenance;
    /// returns `true` if the event was new.
    async fn apply_event(&self, event: &DomainEvent) -> Result<bool, IndexerError>;

    /// Atomically apply events, record block hashes and advance the cursor.
    async fn apply_batch(&self, batch: &EventBatch) -> Result<BatchOutcome, IndexerError>;

    /// Look up one listing.
    async fn get(&self, nft_address: &Address, token_id: U256) -> Result<Option<Listing>, IndexerError>;

    /// Active listings, most recently listed first.
    async fn active(&self) -> Result<Vec<Listing>, IndexerError>;

    /// All listings ordered by token id descending, ties by NFT address.
    async fn by_token_desc(&self) -> Result<Vec<Listing>, IndexerError>;

    /// Journal of one key in causal order.
    async fn history(&self, key: &ListingKey) -> Result<Vec<DomainEvent>, IndexerError>;

    /// The persisted cursor, if any batch was ever applied.
    async fn cursor(&self) -> Result<Option<Cursor>, IndexerError>;

    /// Recorded hash for a block height.
    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, IndexerError>;

    /// Recorded `(number, hash)` pairs in `[from, to]`, highest first.
    async fn recorded_blocks(&self, from: u64, to: u64) -> Result<Vec<(u64, String)>, IndexerError>;

    /// Drop everything above `ancestor`, re-derive the affected listings from
    /// the remaining journal and rewind the cursor to `ancestor`.
    async fn rollback_to(&self, ancestor: u64, ancestor_hash: &str) -> Result<RollbackOutcome, IndexerError>;
}

/// Order listings for [`ListingStore::active`]: newest listing event first.
pub fn sort_active(listings: &mut [Listing]) {
    listings.sort_by(|a, b| b.last_event.cmp(&a.last_event));
}

/// Order listings for [`ListingStore::by_token_desc`].
pub fn sort_by_token_desc(listings: &mut [Listing]) {
    listings.sort_by(|a, b| {
        b.token_id
            .cmp(&a.token_id)
            .then_with(|| a.nft_address.cmp(&b.nft_address))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventRef;

    fn listing(nft: u8, token: u64, block: u64) -> Listing {
        Listing {
            nft_address: Address::repeat_byte(nft),
            token_id: U256::from(token),
            seller: Address::repeat_byte(0xaa),
            buyer: None,
            price: U256::from(1u64),
            active: true,
            last_event: EventRef::new(block, 0, "0x"),
        }
    }

    #[test]
    fn batch_records_cursor_block() {
        let batch = EventBatch::new(vec![], BTreeMap::new(), Cursor::new(77, "0x77"));
        assert_eq!(batch.blocks.get(&77).map(String::as_str), Some("0x77"));
    }

    #[test]
    fn token_desc_ordering() {
        let mut ls = vec![listing(2, 1, 1), listing(1, 9, 2), listing(1, 1, 3)];
        sort_by_token_desc(&mut ls);
        let order: Vec<_> = ls.iter().map(|l| (l.token_id.to::<u64>(), l.nft_address)).collect();
        assert_eq!(
            order,
            vec![
                (9, Address::repeat_byte(1)),
                (1, Address::repeat_byte(1)),
                (1, Address::repeat_byte(2)),
            ]
        );
    }

    #[test]
    fn active_ordering_newest_first() {
        let mut ls = vec![listing(1, 1, 5), listing(1, 2, 9), listing(1, 3, 7)];
        sort_active(&mut ls);
        let blocks: Vec<_> = ls.iter().map(|l| l.last_event.block_number).collect();
        assert_eq!(blocks, vec![9, 7, 5]);
    }
}
