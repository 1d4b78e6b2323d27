//! SQLite storage backend for MarketIndex.
//!
//! Persists listings, the event journal, block hashes and the cursor to a
//! single SQLite file. Uses `sqlx` with WAL mode so queries keep reading the
//! last committed state while the pipeline writes.
//!
//! Every batch and every rollback runs in one transaction, so the cursor
//! never moves without the events that justify it.
//!
//! # Usage
//! ```rust,no_run
//! use marketindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./market.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use marketindex_core::cursor::Cursor;
use marketindex_core::error::IndexerError;
use marketindex_core::event::{DomainEvent, EventKind, MarketEvent};
use marketindex_core::listing::{Listing, ListingKey};
use marketindex_core::store::{
    sort_active, sort_by_token_desc, BatchOutcome, EventBatch, ListingStore, RollbackOutcome,
};
use marketindex_core::types::{lower_hex, EventRef};

fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Persistence(e.to_string())
}

fn corrupt(what: &str, value: &str) -> IndexerError {
    IndexerError::Persistence(format!("corrupt {what} in database: {value:?}"))
}

fn addr_hex(address: &Address) -> String {
    lower_hex(address.as_slice())
}

/// Fixed-width hex so that `ORDER BY token_sort` is numeric order.
fn token_sort(token_id: &U256) -> String {
    lower_hex(&token_id.to_be_bytes::<32>())
}

fn parse_addr(s: &str) -> Result<Address, IndexerError> {
    s.parse().map_err(|_| corrupt("address", s))
}

fn parse_u256(s: &str) -> Result<U256, IndexerError> {
    U256::from_str_radix(s, 10).map_err(|_| corrupt("uint256", s))
}

/// SQLite-backed listing store.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./market.db"`) or a full
    /// SQLite URL (`"sqlite:./market.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(db)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(path, "opened sqlite store");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Limited to one connection: every `:memory:` connection is its own
    /// database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Close the pool, waiting for open connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS cursor (
                id           INTEGER PRIMARY KEY CHECK (id = 1),
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS block_hashes (
                block_number INTEGER PRIMARY KEY,
                block_hash   TEXT    NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS events (
                kind         TEXT    NOT NULL,
                account      TEXT    NOT NULL,
                nft_address  TEXT    NOT NULL,
                token_id     TEXT    NOT NULL,
                price        TEXT,
                block_number INTEGER NOT NULL,
                log_index    INTEGER NOT NULL,
                tx_hash      TEXT    NOT NULL,
                PRIMARY KEY (block_number, tx_hash, log_index)
            );",
            "CREATE INDEX IF NOT EXISTS idx_events_key ON events (nft_address, token_id);",
            "CREATE TABLE IF NOT EXISTS listings (
                nft_address    TEXT    NOT NULL,
                token_id       TEXT    NOT NULL,
                token_sort     TEXT    NOT NULL,
                seller         TEXT    NOT NULL,
                buyer          TEXT,
                price          TEXT    NOT NULL,
                active         INTEGER NOT NULL,
                last_block     INTEGER NOT NULL,
                last_log_index INTEGER NOT NULL,
                last_tx_hash   TEXT    NOT NULL,
                PRIMARY KEY (nft_address, token_id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_listings_active ON listings (active);",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    /// Total number of journaled events.
    pub async fn event_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    async fn load_listings(&self, sql: &str) -> Result<Vec<Listing>, IndexerError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(db)?;
        rows.iter().map(listing_from_row).collect()
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn listing_from_row(row: &SqliteRow) -> Result<Listing, IndexerError> {
    let buyer: Option<String> = row.get("buyer");
    Ok(Listing {
        nft_address: parse_addr(row.get("nft_address"))?,
        token_id: parse_u256(row.get("token_id"))?,
        seller: parse_addr(row.get("seller"))?,
        buyer: buyer.as_deref().map(parse_addr).transpose()?,
        price: parse_u256(row.get("price"))?,
        active: row.get::<i64, _>("active") != 0,
        last_event: EventRef::new(
            row.get::<i64, _>("last_block") as u64,
            row.get::<i64, _>("last_log_index") as u32,
            row.get::<String, _>("last_tx_hash"),
        ),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<DomainEvent, IndexerError> {
    let kind_name: String = row.get("kind");
    let kind = EventKind::from_name(&kind_name).ok_or_else(|| corrupt("event kind", &kind_name))?;
    let account = parse_addr(row.get("account"))?;
    let nft_address = parse_addr(row.get("nft_address"))?;
    let token_id = parse_u256(row.get("token_id"))?;
    let price: Option<String> = row.get("price");
    let price = price.as_deref().map(parse_u256).transpose()?;

    let event = match (kind, price) {
        (EventKind::ItemListed, Some(price)) => MarketEvent::ItemListed {
            seller: account,
            nft_address,
            token_id,
            price,
        },
        (EventKind::ItemBought, Some(price)) => MarketEvent::ItemBought {
            buyer: account,
            nft_address,
            token_id,
            price,
        },
        (EventKind::ItemCancelled, _) => MarketEvent::ItemCancelled {
            seller: account,
            nft_address,
            token_id,
        },
        (kind, None) => return Err(corrupt("price", kind.name())),
    };

    Ok(DomainEvent::new(
        event,
        EventRef::new(
            row.get::<i64, _>("block_number") as u64,
            row.get::<i64, _>("log_index") as u32,
            row.get::<String, _>("tx_hash"),
        ),
    ))
}

// ─── Transaction helpers ─────────────────────────────────────────────────────

/// Journal an event. Returns `false` when its provenance is already stored.
async fn insert_event(conn: &mut SqliteConnection, event: &DomainEvent) -> Result<bool, IndexerError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO events
         (kind, account, nft_address, token_id, price, block_number, log_index, tx_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.kind().name())
    .bind(addr_hex(&event.event.account()))
    .bind(addr_hex(&event.event.nft_address()))
    .bind(event.event.token_id().to_string())
    .bind(event.event.price().map(|p| p.to_string()))
    .bind(event.provenance.block_number as i64)
    .bind(event.provenance.log_index as i64)
    .bind(&event.provenance.tx_hash)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(result.rows_affected() > 0)
}

async fn load_listing(conn: &mut SqliteConnection, key: &ListingKey) -> Result<Option<Listing>, IndexerError> {
    let row = sqlx::query("SELECT * FROM listings WHERE nft_address = ? AND token_id = ?")
        .bind(key.nft_hex())
        .bind(key.token_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    row.as_ref().map(listing_from_row).transpose()
}

async fn upsert_listing(conn: &mut SqliteConnection, listing: &Listing) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT OR REPLACE INTO listings
         (nft_address, token_id, token_sort, seller, buyer, price, active,
          last_block, last_log_index, last_tx_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(addr_hex(&listing.nft_address))
    .bind(listing.token_id.to_string())
    .bind(token_sort(&listing.token_id))
    .bind(addr_hex(&listing.seller))
    .bind(listing.buyer.as_ref().map(addr_hex))
    .bind(listing.price.to_string())
    .bind(listing.active as i64)
    .bind(listing.last_event.block_number as i64)
    .bind(listing.last_event.log_index as i64)
    .bind(&listing.last_event.tx_hash)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn delete_listing(conn: &mut SqliteConnection, key: &ListingKey) -> Result<(), IndexerError> {
    sqlx::query("DELETE FROM listings WHERE nft_address = ? AND token_id = ?")
        .bind(key.nft_hex())
        .bind(key.token_id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

async fn key_history(conn: &mut SqliteConnection, key: &ListingKey) -> Result<Vec<DomainEvent>, IndexerError> {
    let rows = sqlx::query(
        "SELECT * FROM events WHERE nft_address = ? AND token_id = ?
         ORDER BY block_number, log_index, tx_hash",
    )
    .bind(key.nft_hex())
    .bind(key.token_id.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(db)?;
    rows.iter().map(event_from_row).collect()
}

/// Journal and fold one event. Returns `false` for a duplicate.
async fn apply_in(conn: &mut SqliteConnection, event: &DomainEvent) -> Result<bool, IndexerError> {
    if !insert_event(conn, event).await? {
        return Ok(false);
    }
    let current = load_listing(conn, &event.key()).await?;
    if let Some(next) = Listing::fold(current.as_ref(), event) {
        upsert_listing(conn, &next).await?;
    }
    Ok(true)
}

async fn write_cursor(conn: &mut SqliteConnection, cursor: &Cursor) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT OR REPLACE INTO cursor (id, block_number, block_hash, updated_at)
         VALUES (1, ?, ?, ?)",
    )
    .bind(cursor.block_number as i64)
    .bind(&cursor.block_hash)
    .bind(cursor.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

// ─── ListingStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl ListingStore for SqliteStorage {
    async fn apply_event(&self, event: &DomainEvent) -> Result<bool, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let applied = apply_in(&mut tx, event).await?;
        tx.commit().await.map_err(db)?;
        Ok(applied)
    }

    async fn apply_batch(&self, batch: &EventBatch) -> Result<BatchOutcome, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        let mut outcome = BatchOutcome::default();

        for event in &batch.events {
            if apply_in(&mut tx, event).await? {
                outcome.applied += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        for (number, hash) in &batch.blocks {
            sqlx::query("INSERT OR REPLACE INTO block_hashes (block_number, block_hash) VALUES (?, ?)")
                .bind(*number as i64)
                .bind(hash)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        write_cursor(&mut tx, &batch.cursor).await?;

        tx.commit().await.map_err(db)?;
        debug!(
            cursor = batch.cursor.block_number,
            applied = outcome.applied,
            duplicates = outcome.duplicates,
            "batch committed"
        );
        Ok(outcome)
    }

    async fn get(&self, nft_address: &Address, token_id: U256) -> Result<Option<Listing>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        load_listing(&mut conn, &ListingKey::new(*nft_address, token_id)).await
    }

    async fn active(&self) -> Result<Vec<Listing>, IndexerError> {
        let mut out = self.load_listings("SELECT * FROM listings WHERE active = 1").await?;
        sort_active(&mut out);
        Ok(out)
    }

    async fn by_token_desc(&self) -> Result<Vec<Listing>, IndexerError> {
        let mut out = self
            .load_listings("SELECT * FROM listings ORDER BY token_sort DESC, nft_address ASC")
            .await?;
        sort_by_token_desc(&mut out);
        Ok(out)
    }

    async fn history(&self, key: &ListingKey) -> Result<Vec<DomainEvent>, IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        key_history(&mut conn, key).await
    }

    async fn cursor(&self) -> Result<Option<Cursor>, IndexerError> {
        let row = sqlx::query("SELECT block_number, block_hash, updated_at FROM cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.map(|r| Cursor {
            block_number: r.get::<i64, _>("block_number") as u64,
            block_hash: r.get("block_hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn block_hash(&self, block_number: u64) -> Result<Option<String>, IndexerError> {
        let row = sqlx::query("SELECT block_hash FROM block_hashes WHERE block_number = ?")
            .bind(block_number as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.map(|r| r.get::<String, _>("block_hash")))
    }

    async fn recorded_blocks(&self, from: u64, to: u64) -> Result<Vec<(u64, String)>, IndexerError> {
        if from > to {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT block_number, block_hash FROM block_hashes
             WHERE block_number BETWEEN ? AND ? ORDER BY block_number DESC",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("block_number") as u64, r.get::<String, _>("block_hash")))
            .collect())
    }

    async fn rollback_to(&self, ancestor: u64, ancestor_hash: &str) -> Result<RollbackOutcome, IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let dropped = sqlx::query("SELECT * FROM events WHERE block_number > ?")
            .bind(ancestor as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        let mut affected = BTreeSet::new();
        for row in &dropped {
            affected.insert(event_from_row(row)?.key());
        }

        sqlx::query("DELETE FROM events WHERE block_number > ?")
            .bind(ancestor as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        for key in &affected {
            let remaining = key_history(&mut tx, key).await?;
            match Listing::replay(&remaining) {
                Some(listing) => upsert_listing(&mut tx, &listing).await?,
                None => delete_listing(&mut tx, key).await?,
            }
        }

        sqlx::query("DELETE FROM block_hashes WHERE block_number > ?")
            .bind(ancestor as i64)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        write_cursor(&mut tx, &Cursor::new(ancestor, ancestor_hash)).await?;

        tx.commit().await.map_err(db)?;
        debug!(
            ancestor,
            removed = dropped.len(),
            rederived = affected.len(),
            "rolled back sqlite store"
        );
        Ok(RollbackOutcome {
            removed_events: dropped.len(),
            rederived_keys: affected.len(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn nft() -> Address {
        Address::repeat_byte(0xbb)
    }

    fn listed(token: u64, price: u64, block: u64, log_index: u32) -> DomainEvent {
        DomainEvent::new(
            MarketEvent::ItemListed {
                seller: Address::repeat_byte(0xaa),
                nft_address: nft(),
                token_id: U256::from(token),
                price: U256::from(price),
            },
            EventRef::new(block, log_index, format!("0x{block:064x}")),
        )
    }

    fn bought(token: u64, block: u64) -> DomainEvent {
        DomainEvent::new(
            MarketEvent::ItemBought {
                buyer: Address::repeat_byte(0xcc),
                nft_address: nft(),
                token_id: U256::from(token),
                price: U256::from(1000u64),
            },
            EventRef::new(block, 0, format!("0x{block:064x}")),
        )
    }

    fn cancelled(token: u64, block: u64) -> DomainEvent {
        DomainEvent::new(
            MarketEvent::ItemCancelled {
                seller: Address::repeat_byte(0xaa),
                nft_address: nft(),
                token_id: U256::from(token),
            },
            EventRef::new(block, 0, format!("0x{block:064x}")),
        )
    }

    fn batch(events: Vec<DomainEvent>, cursor: u64) -> EventBatch {
        EventBatch::new(events, BTreeMap::new(), Cursor::new(cursor, format!("0x{cursor:x}")))
    }

    #[tokio::test]
    async fn listing_lifecycle() {
        let store = SqliteStorage::in_memory().await.unwrap();

        store.apply_batch(&batch(vec![listed(1, 1000, 10, 0)], 10)).await.unwrap();
        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].price, U256::from(1000u64));

        store.apply_batch(&batch(vec![bought(1, 12)], 12)).await.unwrap();
        let l = store.get(&nft(), U256::from(1u64)).await.unwrap().unwrap();
        assert!(!l.active);
        assert_eq!(l.buyer, Some(Address::repeat_byte(0xcc)));
        assert!(store.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_events_are_ignored() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let e = listed(1, 1000, 10, 0);

        assert!(store.apply_event(&e).await.unwrap());
        assert!(!store.apply_event(&e).await.unwrap());

        let outcome = store.apply_batch(&batch(vec![e], 10)).await.unwrap();
        assert_eq!(outcome, BatchOutcome { applied: 0, duplicates: 1 });
        assert_eq!(store.event_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_event_does_not_regress_listing() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.apply_event(&cancelled(1, 20)).await.unwrap();
        store.apply_event(&listed(1, 1000, 10, 0)).await.unwrap();
        store.apply_event(&cancelled(1, 12)).await.unwrap();
        store.apply_event(&listed(1, 500, 11, 0)).await.unwrap();

        let l = store.get(&nft(), U256::from(1u64)).await.unwrap().unwrap();
        assert!(!l.active);
        assert_eq!(l.last_event.block_number, 12);
        assert_eq!(l.price, U256::from(1000u64));
    }

    #[tokio::test]
    async fn by_token_desc_orders_numerically() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let events = vec![listed(9, 1, 10, 0), listed(10, 1, 10, 1), listed(100, 1, 10, 2)];
        store.apply_batch(&batch(events, 10)).await.unwrap();

        let ids: Vec<U256> = store.by_token_desc().await.unwrap().iter().map(|l| l.token_id).collect();
        assert_eq!(ids, vec![U256::from(100u64), U256::from(10u64), U256::from(9u64)]);
    }

    #[tokio::test]
    async fn rollback_restores_prior_state() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut hashes = BTreeMap::new();
        hashes.insert(99, "0x63".to_string());
        store
            .apply_batch(&EventBatch::new(vec![listed(1, 1000, 99, 0)], hashes, Cursor::new(99, "0x63")))
            .await
            .unwrap();
        store.apply_batch(&batch(vec![bought(1, 100), listed(2, 5, 100, 1)], 100)).await.unwrap();

        let outcome = store.rollback_to(99, "0x63").await.unwrap();
        assert_eq!(outcome.removed_events, 2);

        let one = store.get(&nft(), U256::from(1u64)).await.unwrap().unwrap();
        assert!(one.active);
        assert_eq!(one.buyer, None);
        assert!(store.get(&nft(), U256::from(2u64)).await.unwrap().is_none());
        assert!(store.block_hash(100).await.unwrap().is_none());
        assert_eq!(store.block_hash(99).await.unwrap().as_deref(), Some("0x63"));

        let cursor = store.cursor().await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 99);
        assert_eq!(cursor.block_hash, "0x63");
    }

    #[tokio::test]
    async fn history_roundtrips_every_kind() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let events = vec![listed(1, 1000, 10, 0), cancelled(1, 11), listed(1, 7, 12, 0), bought(1, 13)];
        store.apply_batch(&batch(events.clone(), 13)).await.unwrap();

        let history = store.history(&ListingKey::new(nft(), U256::from(1u64))).await.unwrap();
        assert_eq!(history, events);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStorage::open(path).await.unwrap();
            store.apply_batch(&batch(vec![listed(1, 1000, 10, 0)], 15)).await.unwrap();
            store.close().await;
        }

        let store = SqliteStorage::open(path).await.unwrap();
        assert_eq!(store.cursor().await.unwrap().unwrap().block_number, 15);
        assert_eq!(store.active().await.unwrap().len(), 1);
        assert_eq!(store.block_hash(15).await.unwrap().as_deref(), Some("0xf"));
    }
}
