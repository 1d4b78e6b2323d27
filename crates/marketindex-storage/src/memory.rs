//! In-memory storage backend.
//!
//! Keeps listings, the event journal, block hashes and the cursor in RAM
//! behind a single `RwLock`, so a batch or rollback is applied under one
//! write guard and readers see either the state before it or after it.
//! All data is lost when the process exits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;

use marketindex_core::cursor::Cursor;
use marketindex_core::error::IndexerError;
use marketindex_core::event::DomainEvent;
use marketindex_core::listing::{Listing, ListingKey};
use marketindex_core::store::{
    sort_active, sort_by_token_desc, BatchOutcome, EventBatch, ListingStore, RollbackOutcome,
};
use marketindex_core::types::EventRef;

#[derive(Default)]
struct State {
    listings: BTreeMap<ListingKey, Listing>,
    journal: BTreeMap<EventRef, DomainEvent>,
    block_hashes: BTreeMap<u64, String>,
    cursor: Option<Cursor>,
}

impl State {
    /// Journal the event and fold it into its listing. Returns `false` for a
    /// provenance already in the journal.
    fn apply(&mut self, event: &DomainEvent) -> bool {
        if self.journal.contains_key(&event.provenance) {
            return false;
        }
        self.journal.insert(event.provenance.clone(), event.clone());
        let key = event.key();
        if let Some(next) = Listing::fold(self.listings.get(&key), event) {
            self.listings.insert(key, next);
        }
        true
    }
}

/// In-memory listing store.
#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of journaled events.
    pub fn event_count(&self) -> usize {
        self.read().map(|s| s.journal.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, IndexerError> {
        self.state
            .read()
            .map_err(|_| IndexerError::Persistence("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, IndexerError> {
        self.state
            .write()
            .map_err(|_| IndexerError::Persistence("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl ListingStore for InMemoryStorage {
    async fn apply_event(&self, event: &DomainEvent) -> Result<bool, IndexerError> {
        Ok(self.write()?.apply(event))
    }

    async fn apply_batch(&self, batch: &EventBatch) -> Result<BatchOutcome, IndexerError> {
        let mut state = self.write()?;
        let mut outcome = BatchOutcome::default();
        for event in &batch.events {
            if state.apply(event) {
                outcome.applied += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        for (number, hash) in &batch.blocks {
            state.block_hashes.insert(*number, hash.clone());
        }
        state.cursor = Some(batch.cursor.clone());
        Ok(outcome)
    }

    async fn get(&self, nft_address: &Address, token_id: U256) -> Result<Option<Listing>, IndexerError> {
        let key = ListingKey::new(*nft_address, token_id);
        Ok(self.read()?.listings.get(&key).cloned())
    }

    async fn active(&self) -> Result<Vec<Listing>, IndexerError> {
        let mut out: Vec<Listing> = self
            .read()?
            .listings
            .values()
            .filter(|l| l.active)
            .cloned()
            .collect();
        sort_active(&mut out);
        Ok(out)
    }

    async fn by_token_desc(&self) -> Result<Vec<Listing>, IndexerError> {
        let mut out: Vec<Listing> = self.read()?.listings.values().cloned().collect();
        sort_by_token_desc(&mut out);
        Ok(out)
    }

    async fn history(&self, key: &ListingKey) -> Result<Vec<DomainEvent>, IndexerError> {
        Ok(self
            .read()?
            .journal
            .values()
            .filter(|e| e.key() == *key)
            .cloned()
            .collect())
    }

    async fn cursor(&self) -> Result<Option<Cursor>, IndexerError> {
        Ok(self.read()?.cursor.clone())
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, IndexerError> {
        Ok(self.read()?.block_hashes.get(&block_number).cloned())
    }

    async fn recorded_blocks(&self, from: u64, to: u64) -> Result<Vec<(u64, String)>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        Ok(self
            .read()?
            .block_hashes
            .range(from..=to)
            .rev()
            .map(|(n, h)| (*n, h.clone()))
            .collect())
    }

    async fn rollback_to(&self, ancestor: u64, ancestor_hash: &str) -> Result<RollbackOutcome, IndexerError> {
        let mut state = self.write()?;

        let first_dropped = EventRef::new(ancestor + 1, 0, "");
        let dropped: Vec<EventRef> = state.journal.range(first_dropped..).map(|(r, _)| r.clone()).collect();

        let mut affected = BTreeSet::new();
        for provenance in &dropped {
            if let Some(event) = state.journal.remove(provenance) {
                affected.insert(event.key());
            }
        }

        for key in &affected {
            let rebuilt = Listing::replay(state.journal.values().filter(|e| e.key() == *key));
            match rebuilt {
                Some(listing) => state.listings.insert(*key, listing),
                None => state.listings.remove(key),
            };
        }

        state.block_hashes.split_off(&(ancestor + 1));
        state.cursor = Some(Cursor::new(ancestor, ancestor_hash));

        tracing::debug!(
            ancestor,
            removed = dropped.len(),
            rederived = affected.len(),
            "rolled back memory store"
        );
        Ok(RollbackOutcome {
            removed_events: dropped.len(),
            rederived_keys: affected.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketindex_core::event::MarketEvent;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn at(event: MarketEvent, block: u64, log_index: u32) -> DomainEvent {
        DomainEvent::new(event, EventRef::new(block, log_index, format!("0xtx{block}-{log_index}")))
    }

    fn listed(token: u64, price: u64, block: u64) -> DomainEvent {
        at(
            MarketEvent::ItemListed {
                seller: addr(0xaa),
                nft_address: addr(0xbb),
                token_id: U256::from(token),
                price: U256::from(price),
            },
            block,
            0,
        )
    }

    fn bought(token: u64, block: u64) -> DomainEvent {
        at(
            MarketEvent::ItemBought {
                buyer: addr(0xcc),
                nft_address: addr(0xbb),
                token_id: U256::from(token),
                price: U256::from(1000u64),
            },
            block,
            0,
        )
    }

    fn batch(events: Vec<DomainEvent>, cursor: u64) -> EventBatch {
        EventBatch::new(events, BTreeMap::new(), Cursor::new(cursor, format!("0x{cursor}")))
    }

    #[tokio::test]
    async fn listed_then_bought() {
        let store = InMemoryStorage::new();
        assert!(store.apply_event(&listed(1, 1000, 10)).await.unwrap());

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].seller, addr(0xaa));
        assert_eq!(active[0].price, U256::from(1000u64));

        store.apply_event(&bought(1, 12)).await.unwrap();
        let l = store.get(&addr(0xbb), U256::from(1u64)).await.unwrap().unwrap();
        assert!(!l.active);
        assert!(store.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let store = InMemoryStorage::new();
        let e = listed(1, 1000, 10);
        assert!(store.apply_event(&e).await.unwrap());
        let before = store.by_token_desc().await.unwrap();
        assert!(!store.apply_event(&e).await.unwrap());
        assert_eq!(store.by_token_desc().await.unwrap(), before);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn batch_counts_duplicates_and_sets_cursor() {
        let store = InMemoryStorage::new();
        let first = store.apply_batch(&batch(vec![listed(1, 5, 10)], 10)).await.unwrap();
        assert_eq!(first, BatchOutcome { applied: 1, duplicates: 0 });

        let again = store
            .apply_batch(&batch(vec![listed(1, 5, 10), bought(1, 11)], 11))
            .await
            .unwrap();
        assert_eq!(again, BatchOutcome { applied: 1, duplicates: 1 });
        assert_eq!(store.cursor().await.unwrap().unwrap().block_number, 11);
        assert_eq!(store.block_hash(11).await.unwrap().as_deref(), Some("0x11"));
    }

    #[tokio::test]
    async fn rollback_rederives_affected_keys() {
        let store = InMemoryStorage::new();
        store.apply_batch(&batch(vec![listed(1, 1000, 99)], 99)).await.unwrap();
        store.apply_batch(&batch(vec![bought(1, 100), listed(2, 7, 100)], 100)).await.unwrap();
        assert!(store.active().await.unwrap().iter().all(|l| l.token_id == U256::from(2u64)));

        let outcome = store.rollback_to(99, "0x99").await.unwrap();
        assert_eq!(outcome.removed_events, 2);
        assert_eq!(outcome.rederived_keys, 2);

        let one = store.get(&addr(0xbb), U256::from(1u64)).await.unwrap().unwrap();
        assert!(one.active);
        assert_eq!(one.last_event.block_number, 99);
        assert!(store.get(&addr(0xbb), U256::from(2u64)).await.unwrap().is_none());
        assert!(store.block_hash(100).await.unwrap().is_none());
        assert_eq!(store.cursor().await.unwrap().unwrap().block_number, 99);
    }

    #[tokio::test]
    async fn recorded_blocks_descending() {
        let store = InMemoryStorage::new();
        for n in [5u64, 8, 12] {
            store.apply_batch(&batch(vec![], n)).await.unwrap();
        }
        let blocks: Vec<u64> = store.recorded_blocks(6, 12).await.unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(blocks, vec![12, 8]);
        assert!(store.recorded_blocks(10, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_causal() {
        let store = InMemoryStorage::new();
        store.apply_event(&bought(1, 12)).await.unwrap();
        store.apply_event(&listed(1, 1000, 10)).await.unwrap();
        let h = store.history(&ListingKey::new(addr(0xbb), U256::from(1u64))).await.unwrap();
        let blocks: Vec<u64> = h.iter().map(|e| e.block_number()).collect();
        assert_eq!(blocks, vec![10, 12]);
    }
}
