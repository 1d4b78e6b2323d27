//! Marketplace event decoder.
//!
//! The marketplace contract emits exactly three events:
//!
//! ```text
//! ItemListed(address indexed seller, address indexed nftAddress, uint256 indexed tokenId, uint256 price)
//! ItemBought(address indexed buyer, address indexed nftAddress, uint256 indexed tokenId, uint256 price)
//! ItemCancelled(address indexed seller, address indexed nftAddress, uint256 indexed tokenId)
//! ```
//!
//! `topics[0]` is the keccak256 of the canonical signature, `topics[1..=3]`
//! hold the indexed parameters as 32-byte words, and `data` holds the
//! ABI-encoded price (or nothing, for `ItemCancelled`).

use std::sync::OnceLock;

use alloy_core::dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::DecodeError;
use crate::listing::ListingKey;
use crate::types::{decimal_u256, lower_hex, EventRef, RawLog};

const WORD: usize = 32;

// ─── EventKind ───────────────────────────────────────────────────────────────

/// The three known event shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ItemListed,
    ItemBought,
    ItemCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::ItemListed, Self::ItemBought, Self::ItemCancelled];

    /// Canonical ABI signature.
    pub fn signature(self) -> &'static str {
        match self {
            Self::ItemListed => "ItemListed(address,address,uint256,uint256)",
            Self::ItemBought => "ItemBought(address,address,uint256,uint256)",
            Self::ItemCancelled => "ItemCancelled(address,address,uint256)",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ItemListed => "ItemListed",
            Self::ItemBought => "ItemBought",
            Self::ItemCancelled => "ItemCancelled",
        }
    }

    /// `topics[0]` for this event (`0x…`, lowercase).
    pub fn topic0(self) -> &'static str {
        static TOPICS: OnceLock<[String; 3]> = OnceLock::new();
        let topics = TOPICS.get_or_init(|| EventKind::ALL.map(|k| keccak256_signature(k.signature())));
        &topics[self as usize]
    }

    /// Match a signature hash against the known events (case-insensitive).
    pub fn from_topic0(topic0: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.topic0().eq_ignore_ascii_case(topic0))
    }

    /// Parse the event name as stored by persistence backends.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    fn has_price(self) -> bool {
        !matches!(self, Self::ItemCancelled)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// keccak256 of an event signature string, as a `0x`-prefixed hex topic.
pub fn keccak256_signature(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    lower_hex(&output)
}

// ─── MarketEvent / DomainEvent ───────────────────────────────────────────────

/// A decoded marketplace event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarketEvent {
    ItemListed {
        seller: Address,
        nft_address: Address,
        #[serde(with = "decimal_u256")]
        token_id: U256,
        #[serde(with = "decimal_u256")]
        price: U256,
    },
    ItemBought {
        buyer: Address,
        nft_address: Address,
        #[serde(with = "decimal_u256")]
        token_id: U256,
        #[serde(with = "decimal_u256")]
        price: U256,
    },
    ItemCancelled {
        seller: Address,
        nft_address: Address,
        #[serde(with = "decimal_u256")]
        token_id: U256,
    },
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ItemListed { .. } => EventKind::ItemListed,
            Self::ItemBought { .. } => EventKind::ItemBought,
            Self::ItemCancelled { .. } => EventKind::ItemCancelled,
        }
    }

    /// Seller for listings and cancellations, buyer for purchases.
    pub fn account(&self) -> Address {
        match self {
            Self::ItemListed { seller, .. } | Self::ItemCancelled { seller, .. } => *seller,
            Self::ItemBought { buyer, .. } => *buyer,
        }
    }

    pub fn nft_address(&self) -> Address {
        match self {
            Self::ItemListed { nft_address, .. }
            | Self::ItemBought { nft_address, .. }
            | Self::ItemCancelled { nft_address, .. } => *nft_address,
        }
    }

    pub fn token_id(&self) -> U256 {
        match self {
            Self::ItemListed { token_id, .. }
            | Self::ItemBought { token_id, .. }
            | Self::ItemCancelled { token_id, .. } => *token_id,
        }
    }

    pub fn price(&self) -> Option<U256> {
        match self {
            Self::ItemListed { price, .. } | Self::ItemBought { price, .. } => Some(*price),
            Self::ItemCancelled { .. } => None,
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.nft_address(), self.token_id())
    }
}

/// A decoded event together with its on-chain provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event: MarketEvent,
    pub provenance: EventRef,
}

impl DomainEvent {
    pub fn new(event: MarketEvent, provenance: EventRef) -> Self {
        Self { event, provenance }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn key(&self) -> ListingKey {
        self.event.key()
    }

    pub fn block_number(&self) -> u64 {
        self.provenance.block_number
    }
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode a raw log into a typed marketplace event.
pub fn decode(raw: &RawLog) -> Result<DomainEvent, DecodeError> {
    let topic0 = raw
        .topic0()
        .ok_or_else(|| DecodeError::malformed("log has no topics"))?;
    let kind = EventKind::from_topic0(topic0).ok_or_else(|| DecodeError::UnknownSignature {
        topic0: topic0.to_string(),
    })?;

    if raw.topics.len() != 4 {
        return Err(DecodeError::malformed(format!(
            "{kind} expects 4 topics, got {}",
            raw.topics.len()
        )));
    }

    let account = topic_address(&raw.topics[1])?;
    let nft_address = topic_address(&raw.topics[2])?;
    let token_id = topic_uint(&raw.topics[3])?;

    let data = hex_bytes(&raw.data).map_err(|e| DecodeError::malformed(format!("data: {e}")))?;
    let expected_len = if kind.has_price() { WORD } else { 0 };
    if data.len() != expected_len {
        return Err(DecodeError::malformed(format!(
            "{kind} expects {expected_len} data bytes, got {}",
            data.len()
        )));
    }

    let event = match kind {
        EventKind::ItemListed => MarketEvent::ItemListed {
            seller: account,
            nft_address,
            token_id,
            price: data_price(&data)?,
        },
        EventKind::ItemBought => MarketEvent::ItemBought {
            buyer: account,
            nft_address,
            token_id,
            price: data_price(&data)?,
        },
        EventKind::ItemCancelled => MarketEvent::ItemCancelled {
            seller: account,
            nft_address,
            token_id,
        },
    };

    Ok(DomainEvent::new(event, raw.provenance()))
}

/// Encode a typed event back into the log shape the contract emits.
///
/// Used by the simulated chain and by tests.
pub fn encode(event: &MarketEvent, contract: &str, provenance: &EventRef, block_hash: &str) -> RawLog {
    let data = match event.price() {
        Some(price) => lower_hex(&DynSolValue::Tuple(vec![DynSolValue::Uint(price, 256)]).abi_encode()),
        None => "0x".to_string(),
    };

    RawLog {
        block_number: provenance.block_number,
        block_hash: block_hash.to_string(),
        log_index: provenance.log_index,
        tx_hash: provenance.tx_hash.clone(),
        address: contract.to_lowercase(),
        topics: vec![
            event.kind().topic0().to_string(),
            lower_hex(&DynSolValue::Address(event.account()).abi_encode()),
            lower_hex(&DynSolValue::Address(event.nft_address()).abi_encode()),
            lower_hex(&DynSolValue::Uint(event.token_id(), 256).abi_encode()),
        ],
        data,
        removed: false,
    }
}

fn hex_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
}

/// An indexed parameter: exactly one 32-byte word.
fn topic_word(topic: &str) -> Result<Vec<u8>, DecodeError> {
    let bytes = hex_bytes(topic).map_err(|e| DecodeError::malformed(format!("topic {topic}: {e}")))?;
    if bytes.len() != WORD {
        return Err(DecodeError::malformed(format!(
            "topic {topic} is {} bytes, expected {WORD}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn abi_decode(ty: &DynSolType, bytes: &[u8], what: &str) -> Result<DynSolValue, DecodeError> {
    ty.abi_decode(bytes)
        .map_err(|e| DecodeError::malformed(format!("{what}: {e}")))
}

fn topic_address(topic: &str) -> Result<Address, DecodeError> {
    let word = topic_word(topic)?;
    // The ABI decoder truncates silently; dirty high bytes mean a wrong layout.
    if word[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::malformed(format!(
            "topic {topic} is not a left-padded address"
        )));
    }
    match abi_decode(&DynSolType::Address, &word, "address topic")? {
        DynSolValue::Address(address) => Ok(address),
        other => Err(DecodeError::malformed(format!("address topic decoded as {other:?}"))),
    }
}

fn topic_uint(topic: &str) -> Result<U256, DecodeError> {
    match abi_decode(&DynSolType::Uint(256), &topic_word(topic)?, "uint256 topic")? {
        DynSolValue::Uint(value, _) => Ok(value),
        other => Err(DecodeError::malformed(format!("uint256 topic decoded as {other:?}"))),
    }
}

/// The non-indexed `(uint256 price)` tuple.
fn data_price(data: &[u8]) -> Result<U256, DecodeError> {
    let decoded = abi_decode(&DynSolType::Tuple(vec![DynSolType::Uint(256)]), data, "price data")?;
    let values = match decoded {
        DynSolValue::Tuple(values) => values,
        other => vec![other],
    };
    match values.as_slice() {
        [DynSolValue::Uint(price, _)] => Ok(*price),
        other => Err(DecodeError::malformed(format!("price data decoded as {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn listed(token: u64, price: u64) -> MarketEvent {
        MarketEvent::ItemListed {
            seller: addr(0xaa),
            nft_address: addr(0xbb),
            token_id: U256::from(token),
            price: U256::from(price),
        }
    }

    fn raw(event: &MarketEvent) -> RawLog {
        encode(event, "0x00000000000000000000000000000000000000ff", &EventRef::new(10, 0, "0xt1"), "0xb10")
    }

    #[test]
    fn keccak_matches_known_transfer_topic() {
        assert_eq!(
            keccak256_signature("Transfer(address,address,uint256)"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn topics_are_distinct_and_resolvable() {
        for kind in EventKind::ALL {
            assert_eq!(kind.topic0().len(), 66);
            assert_eq!(EventKind::from_topic0(kind.topic0()), Some(kind));
            assert_eq!(EventKind::from_topic0(&kind.topic0().to_uppercase().replace("0X", "0x")), Some(kind));
        }
        assert_ne!(EventKind::ItemListed.topic0(), EventKind::ItemBought.topic0());
    }

    #[test]
    fn decodes_every_known_shape() {
        let events = [
            listed(1, 1000),
            MarketEvent::ItemBought {
                buyer: addr(0xcc),
                nft_address: addr(0xbb),
                token_id: U256::from(1u64),
                price: U256::from(1000u64),
            },
            MarketEvent::ItemCancelled {
                seller: addr(0xaa),
                nft_address: addr(0xbb),
                token_id: U256::from(7u64),
            },
        ];
        for event in events {
            let decoded = decode(&raw(&event)).unwrap();
            assert_eq!(decoded.event, event);
            assert_eq!(decoded.provenance, EventRef::new(10, 0, "0xt1"));
        }
    }

    #[test]
    fn price_keeps_full_precision() {
        let price = U256::MAX - U256::from(1u64);
        let event = MarketEvent::ItemListed {
            seller: addr(1),
            nft_address: addr(2),
            token_id: U256::MAX,
            price,
        };
        let decoded = decode(&raw(&event)).unwrap();
        assert_eq!(decoded.event.price(), Some(price));
        assert_eq!(decoded.event.token_id(), U256::MAX);
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let mut log = raw(&listed(1, 1));
        log.topics[0] = keccak256_signature("Transfer(address,address,uint256)");
        assert!(matches!(decode(&log), Err(DecodeError::UnknownSignature { .. })));
    }

    #[test]
    fn missing_topics_are_malformed() {
        let mut log = raw(&listed(1, 1));
        log.topics.truncate(3);
        assert!(matches!(decode(&log), Err(DecodeError::MalformedLog { .. })));

        log.topics.clear();
        assert!(matches!(decode(&log), Err(DecodeError::MalformedLog { .. })));
    }

    #[test]
    fn wrong_data_length_is_malformed() {
        let mut log = raw(&listed(1, 1));
        log.data = "0x01".into();
        assert!(matches!(decode(&log), Err(DecodeError::MalformedLog { .. })));

        let mut cancel = raw(&MarketEvent::ItemCancelled {
            seller: addr(1),
            nft_address: addr(2),
            token_id: U256::from(3u64),
        });
        cancel.data = lower_hex(&[0u8; 32]);
        assert!(matches!(decode(&cancel), Err(DecodeError::MalformedLog { .. })));
    }

    #[test]
    fn dirty_address_padding_is_malformed() {
        let mut log = raw(&listed(1, 1));
        log.topics[1] = format!("0x{}", "ff".repeat(32));
        assert!(matches!(decode(&log), Err(DecodeError::MalformedLog { .. })));
    }

    #[test]
    fn short_topic_is_malformed() {
        let mut log = raw(&listed(1, 1));
        log.topics[3] = "0x01".into();
        assert!(matches!(decode(&log), Err(DecodeError::MalformedLog { .. })));
    }

    #[test]
    fn encoded_words_follow_abi_layout() {
        let log = raw(&listed(7, 1000));
        assert_eq!(log.topics[1], format!("0x{}{}", "00".repeat(12), "aa".repeat(20)));
        assert_eq!(log.topics[3], format!("0x{}07", "00".repeat(31)));
        assert_eq!(log.data, format!("0x{}03e8", "00".repeat(30)));
    }
}
