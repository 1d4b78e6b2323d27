//! Read-only query façade for API / UI consumers.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::listing::Listing;
use crate::store::ListingStore;
use crate::types::decimal_u256;

/// Number of active listings returned when the caller gives no limit.
pub const DEFAULT_ACTIVE_LIMIT: usize = 5;

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;

/// The shape a marketplace front end renders for an active listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveListing {
    pub nft_address: Address,
    #[serde(with = "decimal_u256")]
    pub token_id: U256,
    pub seller: Address,
    /// Price in wei.
    #[serde(with = "decimal_u256")]
    pub price: U256,
}

impl ActiveListing {
    /// Price rendered in ether units.
    pub fn price_ether(&self) -> String {
        format_ether(self.price)
    }
}

impl From<&Listing> for ActiveListing {
    fn from(l: &Listing) -> Self {
        Self {
            nft_address: l.nft_address,
            token_id: l.token_id,
            seller: l.seller,
            price: l.price,
        }
    }
}

/// Thin read-only projection over a [`ListingStore`].
#[derive(Clone)]
pub struct QueryFacade {
    store: Arc<dyn ListingStore>,
}

impl QueryFacade {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    /// Active listings, newest first, at most `limit` (default 5).
    pub async fn active_listings(&self, limit: Option<usize>) -> Result<Vec<ActiveListing>, IndexerError> {
        let limit = limit.unwrap_or(DEFAULT_ACTIVE_LIMIT);
        Ok(self
            .store
            .active()
            .await?
            .iter()
            .take(limit)
            .map(ActiveListing::from)
            .collect())
    }

    /// Every listing ever created, ordered by token id descending.
    pub async fn listings_by_token_desc(&self) -> Result<Vec<Listing>, IndexerError> {
        self.store.by_token_desc().await
    }
}

/// Format a wei amount as a decimal ether string, trimming trailing zeros
/// (`1500000000000000000` → `"1.5"`).
pub fn format_ether(wei: U256) -> String {
    let unit = U256::from(WEI_PER_ETHER);
    let whole = wei / unit;
    let frac = wei % unit;
    if frac.is_zero() {
        return format!("{whole}.0");
    }
    let frac = format!("{:0>18}", frac.to_string());
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

/// Shorten a long string by replacing its middle with `...`, keeping the
/// result at `max_len` characters.
pub fn truncate_middle(s: &str, max_len: usize) -> String {
    const SEP: &str = "...";
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_len || max_len <= SEP.len() {
        return s.to_string();
    }
    let shown = max_len - SEP.len();
    let front = shown.div_ceil(2);
    let back = shown / 2;
    let head: String = chars[..front].iter().collect();
    let tail: String = chars[chars.len() - back..].iter().collect();
    format!("{head}{SEP}{tail}")
}
