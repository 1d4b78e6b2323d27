//! In-process simulated chain.
//!
//! Mines blocks carrying marketplace events, replaces blocks to simulate
//! reorgs, injects log-source failures and pushes new-head notifications on
//! demand. Hashes are deterministic keccak digests of `(parent, number,
//! fork)`, so a replaced block always gets a new hash.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;

use marketindex_core::error::IndexerError;
use marketindex_core::event::{encode, keccak256_signature, MarketEvent};
use marketindex_core::types::{BlockSummary, EventRef, RawLog};

use crate::source::{BlockStream, LogSource};

/// Kind of failure returned by the next `get_logs` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Timeout-like; the pipeline retries.
    Transient,
    /// Rejected request; the pipeline halts.
    Fatal,
}

struct MockBlock {
    summary: BlockSummary,
    logs: Vec<RawLog>,
}

struct ChainState {
    blocks: Vec<MockBlock>,
    fork: u64,
    failures: VecDeque<Failure>,
    reverse_logs: bool,
    log_calls: Vec<(u64, u64)>,
}

/// Simulated EVM chain implementing [`LogSource`].
pub struct MockChain {
    contract: String,
    state: Mutex<ChainState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<u64>>>,
}

fn block_hash(parent: &str, number: u64, fork: u64) -> String {
    keccak256_signature(&format!("{parent}/{number}/{fork}"))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChainState {
    fn push_block(&mut self, contract: &str, events: &[MarketEvent], raw: Vec<RawLog>) -> u64 {
        let number = self.blocks.len() as u64;
        let parent_hash = self
            .blocks
            .last()
            .map(|b| b.summary.hash.clone())
            .unwrap_or_else(|| format!("0x{}", "0".repeat(64)));
        let hash = block_hash(&parent_hash, number, self.fork);

        let mut logs: Vec<RawLog> = events
            .iter()
            .enumerate()
            .map(|(i, event)| {
                let tx_hash = keccak256_signature(&format!("{hash}/tx/{i}"));
                encode(event, contract, &EventRef::new(number, i as u32, tx_hash), &hash)
            })
            .collect();
        for mut log in raw {
            log.block_number = number;
            log.block_hash = hash.clone();
            logs.push(log);
        }

        self.blocks.push(MockBlock {
            summary: BlockSummary {
                number,
                hash,
                parent_hash,
            },
            logs,
        });
        number
    }
}

impl MockChain {
    /// A chain holding only an empty genesis block.
    pub fn new(contract: &str) -> Self {
        let chain = Self {
            contract: contract.to_lowercase(),
            state: Mutex::new(ChainState {
                blocks: Vec::new(),
                fork: 0,
                failures: VecDeque::new(),
                reverse_logs: false,
                log_calls: Vec::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
        };
        chain.mine(vec![]);
        chain
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Mine one block emitting `events` in order. Returns its number.
    pub fn mine(&self, events: Vec<MarketEvent>) -> u64 {
        lock(&self.state).push_block(&self.contract, &events, vec![])
    }

    /// Mine `count` empty blocks. Returns the new head.
    pub fn mine_empty(&self, count: u64) -> u64 {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.push_block(&self.contract, &[], vec![]);
        }
        state.blocks.len() as u64 - 1
    }

    /// Mine one block holding hand-built logs. Block number and hash are
    /// overwritten; everything else is served as given.
    pub fn mine_raw(&self, logs: Vec<RawLog>) -> u64 {
        lock(&self.state).push_block(&self.contract, &[], logs)
    }

    /// Replace every block from `number` upward with `replacement` (one
    /// entry per new block). Returns the new head.
    pub fn reorg_from(&self, number: u64, replacement: Vec<Vec<MarketEvent>>) -> u64 {
        let mut state = lock(&self.state);
        state.blocks.truncate(number.max(1) as usize);
        state.fork += 1;
        for events in &replacement {
            state.push_block(&self.contract, events, vec![]);
        }
        state.blocks.len() as u64 - 1
    }

    pub fn head(&self) -> u64 {
        lock(&self.state).blocks.len() as u64 - 1
    }

    pub fn hash_of(&self, number: u64) -> Option<String> {
        lock(&self.state)
            .blocks
            .get(number as usize)
            .map(|b| b.summary.hash.clone())
    }

    /// Fail the next `n` `get_logs` calls with `failure`.
    pub fn fail_next(&self, n: usize, failure: Failure) {
        lock(&self.state).failures.extend(std::iter::repeat(failure).take(n));
    }

    /// Serve logs newest first, to exercise ordering in consumers.
    pub fn set_reverse_log_order(&self, reverse: bool) {
        lock(&self.state).reverse_logs = reverse;
    }

    /// Every `(from, to)` passed to `get_logs`, failed calls included.
    pub fn log_calls(&self) -> Vec<(u64, u64)> {
        lock(&self.state).log_calls.clone()
    }

    /// Push a new-head notification to every subscriber.
    pub fn notify(&self, number: u64) {
        lock(&self.subscribers).retain(|tx| tx.unbounded_send(number).is_ok());
    }

    /// Notify the current head.
    pub fn notify_head(&self) {
        self.notify(self.head());
    }
}

#[async_trait]
impl LogSource for MockChain {
    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        Ok(self.head())
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        Ok(lock(&self.state)
            .blocks
            .get(number as usize)
            .map(|b| b.summary.clone()))
    }

    async fn get_logs(&self, address: &str, topic0: &str, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let mut state = lock(&self.state);
        state.log_calls.push((from, to));
        match state.failures.pop_front() {
            Some(Failure::Transient) => {
                return Err(IndexerError::TransientSource(format!("simulated timeout for {from}..={to}")))
            }
            Some(Failure::Fatal) => return Err(IndexerError::Source("simulated invalid request".into())),
            None => {}
        }

        let mut logs: Vec<RawLog> = state
            .blocks
            .iter()
            .filter(|b| b.summary.number >= from && b.summary.number <= to)
            .flat_map(|b| b.logs.iter())
            .filter(|l| l.address.eq_ignore_ascii_case(address))
            .filter(|l| l.topic0().is_some_and(|t| t.eq_ignore_ascii_case(topic0)))
            .cloned()
            .collect();
        if state.reverse_logs {
            logs.reverse();
        }
        Ok(logs)
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockStream, IndexerError> {
        let (tx, rx) = mpsc::unbounded();
        lock(&self.subscribers).push(tx);
        Ok(Box::pin(rx))
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Address, U256};
    use futures::StreamExt;
    use marketindex_core::event::EventKind;

    use super::*;

    const MARKET: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn listed(token: u64) -> MarketEvent {
        MarketEvent::ItemListed {
            seller: Address::repeat_byte(0xaa),
            nft_address: Address::repeat_byte(0xbb),
            token_id: U256::from(token),
            price: U256::from(1000u64),
        }
    }

    #[tokio::test]
    async fn mined_blocks_chain_together() {
        let chain = MockChain::new(MARKET);
        chain.mine(vec![listed(1)]);
        chain.mine_empty(3);
        assert_eq!(chain.head(), 4);

        let b3 = chain.block(3).await.unwrap().unwrap();
        let b4 = chain.block(4).await.unwrap().unwrap();
        assert_eq!(b4.number, b3.number + 1);
        assert_eq!(b4.parent_hash, b3.hash);
        assert!(chain.block(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_filtered_by_topic_and_range() {
        let chain = MockChain::new(MARKET);
        chain.mine(vec![listed(1), listed(2)]);
        chain.mine(vec![listed(3)]);

        let topic = EventKind::ItemListed.topic0();
        let logs = chain.get_logs(MARKET, topic, 1, 1).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].log_index, 1);

        let bought = chain.get_logs(MARKET, EventKind::ItemBought.topic0(), 0, 2).await.unwrap();
        assert!(bought.is_empty());
        assert_eq!(chain.log_calls(), vec![(1, 1), (0, 2)]);
    }

    #[tokio::test]
    async fn reorg_replaces_hashes() {
        let chain = MockChain::new(MARKET);
        chain.mine_empty(5);
        let old = chain.hash_of(4).unwrap();
        let kept = chain.hash_of(3).unwrap();

        assert_eq!(chain.reorg_from(4, vec![vec![], vec![], vec![]]), 6);
        assert_ne!(chain.hash_of(4).unwrap(), old);
        assert_eq!(chain.hash_of(3).unwrap(), kept);
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let chain = MockChain::new(MARKET);
        chain.fail_next(1, Failure::Transient);
        let topic = EventKind::ItemListed.topic0();
        assert!(chain.get_logs(MARKET, topic, 0, 0).await.unwrap_err().is_transient());
        assert!(chain.get_logs(MARKET, topic, 0, 0).await.is_ok());
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let chain = MockChain::new(MARKET);
        let mut heads = chain.subscribe_new_blocks().await.unwrap();
        chain.mine_empty(2);
        chain.notify_head();
        assert_eq!(heads.next().await, Some(2));
    }
}
