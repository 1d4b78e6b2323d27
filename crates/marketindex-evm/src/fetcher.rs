//! Marketplace log fetcher.
//!
//! Queries the three marketplace topics for a block range and merges the
//! results into one deduplicated stream ordered by `(block, log index)`.

use std::sync::Arc;

use marketindex_core::error::IndexerError;
use marketindex_core::event::EventKind;
use marketindex_core::types::RawLog;

use crate::source::LogSource;

/// Fetches every marketplace log of one contract for a block range.
#[derive(Clone)]
pub struct LogFetcher {
    source: Arc<dyn LogSource>,
    contract: String,
}

impl LogFetcher {
    /// `contract` is the lowercase `0x…` address used in the log filter.
    pub fn new(source: Arc<dyn LogSource>, contract: impl Into<String>) -> Self {
        Self {
            source,
            contract: contract.into(),
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// All marketplace logs in `[from, to]`, merged and sorted.
    ///
    /// Fails as a whole if any topic query fails, so a range is never
    /// applied with one topic missing.
    pub async fn fetch(&self, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let mut all_logs = Vec::new();
        for kind in EventKind::ALL {
            let chunk = self.source.get_logs(&self.contract, kind.topic0(), from, to).await?;
            all_logs.extend(chunk);
        }
        Ok(merge_logs(all_logs, &self.contract, from, to))
    }
}

/// Drop removed, foreign and out-of-range logs, then sort by provenance and
/// remove duplicates.
pub fn merge_logs(logs: Vec<RawLog>, contract: &str, from: u64, to: u64) -> Vec<RawLog> {
    let mut kept: Vec<RawLog> = logs
        .into_iter()
        .filter(|l| !l.removed)
        .filter(|l| l.address.eq_ignore_ascii_case(contract))
        .filter(|l| l.block_number >= from && l.block_number <= to)
        .collect();
    kept.sort_by(|a, b| {
        (a.block_number, a.log_index, &a.tx_hash).cmp(&(b.block_number, b.log_index, &b.tx_hash))
    });
    kept.dedup_by(|a, b| a.block_number == b.block_number && a.log_index == b.log_index && a.tx_hash == b.tx_hash);
    kept
}
