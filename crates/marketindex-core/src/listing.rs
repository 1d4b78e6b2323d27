//! Listing state and the event fold that derives it.
//!
//! Both storage backends share [`Listing::fold`], so the in-memory and SQLite
//! stores cannot disagree on how an event changes a listing.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::event::{DomainEvent, MarketEvent};
use crate::types::{decimal_u256, lower_hex, EventRef};

/// `(nftAddress, tokenId)` identifies a listing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub nft_address: Address,
    #[serde(with = "decimal_u256")]
    pub token_id: U256,
}

impl ListingKey {
    pub fn new(nft_address: Address, token_id: U256) -> Self {
        Self {
            nft_address,
            token_id,
        }
    }

    /// Lowercase `0x…` NFT contract address, the form persisted by backends.
    pub fn nft_hex(&self) -> String {
        lower_hex(self.nft_address.as_slice())
    }
}

impl std::fmt::Display for ListingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.nft_hex(), self.token_id)
    }
}

/// Current state of one `(nftAddress, tokenId)` slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub nft_address: Address,
    #[serde(with = "decimal_u256")]
    pub token_id: U256,
    pub seller: Address,
    /// Set by `ItemBought`, cleared when the token is listed again.
    pub buyer: Option<Address>,
    #[serde(with = "decimal_u256")]
    pub price: U256,
    pub active: bool,
    /// Provenance of the last event that changed this listing.
    pub last_event: EventRef,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.nft_address, self.token_id)
    }

    /// Apply one event to the current state of its key.
    ///
    /// Returns the new state, or `None` when the event leaves the slot
    /// unchanged: it is not newer than `last_event`, or it is a purchase or
    /// cancellation of a token that was never listed.
    pub fn fold(current: Option<&Listing>, event: &DomainEvent) -> Option<Listing> {
        if let Some(existing) = current {
            if event.provenance <= existing.last_event {
                return None;
            }
        }

        match (&event.event, current) {
            (
                MarketEvent::ItemListed {
                    seller,
                    nft_address,
                    token_id,
                    price,
                },
                _,
            ) => Some(Listing {
                nft_address: *nft_address,
                token_id: *token_id,
                seller: *seller,
                buyer: None,
                price: *price,
                active: true,
                last_event: event.provenance.clone(),
            }),
            (MarketEvent::ItemBought { buyer, .. }, Some(existing)) => Some(Listing {
                buyer: Some(*buyer),
                active: false,
                last_event: event.provenance.clone(),
                ..existing.clone()
            }),
            (MarketEvent::ItemCancelled { .. }, Some(existing)) => Some(Listing {
                active: false,
                last_event: event.provenance.clone(),
                ..existing.clone()
            }),
            (MarketEvent::ItemBought { .. } | MarketEvent::ItemCancelled { .. }, None) => {
                tracing::debug!(
                    key = %event.key(),
                    kind = %event.kind(),
                    at = %event.provenance,
                    "event for a token that was never listed"
                );
                None
            }
        }
    }

    /// Re-derive a listing from its full event history (any order).
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a DomainEvent>) -> Option<Listing> {
        let mut ordered: Vec<&DomainEvent> = events.into_iter().collect();
        ordered.sort_by(|a, b| a.provenance.cmp(&b.provenance));
        ordered
            .into_iter()
            .fold(None, |state, event| Listing::fold(state.as_ref(), event).or(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn ev(event: MarketEvent, block: u64, log_index: u32) -> DomainEvent {
        DomainEvent::new(event, EventRef::new(block, log_index, format!("0x{block:x}{log_index:x}")))
    }

    fn listed(price: u64, block: u64) -> DomainEvent {
        ev(
            MarketEvent::ItemListed {
                seller: addr(0xaa),
                nft_address: addr(0xbb),
                token_id: U256::from(1u64),
                price: U256::from(price),
            },
            block,
            0,
        )
    }

    fn bought(block: u64) -> DomainEvent {
        ev(
            MarketEvent::ItemBought {
                buyer: addr(0xcc),
                nft_address: addr(0xbb),
                token_id: U256::from(1u64),
                price: U256::from(1000u64),
            },
            block,
            0,
        )
    }

    fn cancelled(block: u64) -> DomainEvent {
        ev(
            MarketEvent::ItemCancelled {
                seller: addr(0xaa),
                nft_address: addr(0xbb),
                token_id: U256::from(1u64),
            },
            block,
            0,
        )
    }

    #[test]
    fn listed_creates_active_listing() {
        let l = Listing::fold(None, &listed(1000, 10)).unwrap();
        assert!(l.active);
        assert_eq!(l.seller, addr(0xaa));
        assert_eq!(l.price, U256::from(1000u64));
        assert_eq!(l.buyer, None);
    }

    #[test]
    fn bought_deactivates_and_records_buyer() {
        let l = Listing::fold(None, &listed(1000, 10)).unwrap();
        let l = Listing::fold(Some(&l), &bought(12)).unwrap();
        assert!(!l.active);
        assert_eq!(l.buyer, Some(addr(0xcc)));
        assert_eq!(l.last_event.block_number, 12);
    }

    #[test]
    fn relisting_clears_buyer() {
        let l = Listing::fold(None, &listed(1000, 10)).unwrap();
        let l = Listing::fold(Some(&l), &bought(12)).unwrap();
        let l = Listing::fold(Some(&l), &listed(2000, 14)).unwrap();
        assert!(l.active);
        assert_eq!(l.buyer, None);
        assert_eq!(l.price, U256::from(2000u64));
    }

    #[test]
    fn cancel_without_listing_is_noop() {
        assert!(Listing::fold(None, &cancelled(5)).is_none());
        assert!(Listing::fold(None, &bought(5)).is_none());
    }

    #[test]
    fn stale_and_duplicate_events_are_ignored() {
        let l = Listing::fold(None, &listed(1000, 10)).unwrap();
        assert!(Listing::fold(Some(&l), &listed(1000, 10)).is_none());
        assert!(Listing::fold(Some(&l), &cancelled(9)).is_none());
    }

    #[test]
    fn replay_sorts_before_folding() {
        // Listed(p1) -> Bought -> Listed(p2), received out of order.
        let history = [listed(2000, 30), listed(1000, 10), bought(20)];
        let l = Listing::replay(history.iter()).unwrap();
        assert!(l.active);
        assert_eq!(l.price, U256::from(2000u64));
        assert_eq!(l.last_event.block_number, 30);
    }

    #[test]
    fn replay_of_empty_history_is_none() {
        assert!(Listing::replay(std::iter::empty()).is_none());
    }
}
