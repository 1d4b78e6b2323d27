//! marketindex-core — foundation for the NFT marketplace event indexer.
//!
//! # Architecture
//!
//! ```text
//! LogSource → Pipeline (marketindex-evm)
//!                 ├── event::decode    (ItemListed / ItemBought / ItemCancelled)
//!                 ├── ReorgDetector    (cursor hash check, ancestor search)
//!                 ├── BackoffPolicy    (transient source errors, batch shrinking)
//!                 └── ListingStore     (listings, journal, block hashes, cursor)
//!                                          └── QueryFacade (active / by token desc)
//! ```

pub mod backoff;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod listing;
pub mod query;
pub mod reorg;
pub mod store;
pub mod types;

pub use backoff::{BackoffConfig, BackoffPolicy, BatchSizer};
pub use config::{IndexerConfig, IndexerState, NetworkMapping};
pub use cursor::Cursor;
pub use error::{DecodeError, IndexerError};
pub use event::{decode, DomainEvent, EventKind, MarketEvent};
pub use listing::{Listing, ListingKey};
pub use query::{ActiveListing, QueryFacade};
pub use reorg::{CanonicalChain, ReorgDetector, ReorgEvent};
pub use store::{BatchOutcome, EventBatch, ListingStore, RollbackOutcome};
pub use types::{BlockSummary, EventRef, IndexPhase, RawLog};
