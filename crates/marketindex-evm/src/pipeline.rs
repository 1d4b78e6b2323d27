//! Ingestion pipeline: backfill, live tail and reorg recovery.
//!
//! # Phase 1: BACKFILL
//! Process `[next, head - confirmation_depth]` (or up to `to_block`) in
//! batches. For each batch: fetch logs of all three topics → merge and sort →
//! decode → apply events, block hashes and cursor in one store write.
//! A batch whose blocks are replaced while it is being fetched is fetched
//! again; only logs of canonical blocks are applied.
//!
//! # Phase 2: LIVE
//! For every new-head notification:
//!   - Verify the cursor block is still canonical (reorg check)
//!   - On a reorg, roll the store back to the common ancestor
//!   - Process `[next, head - confirmation_depth]` in batches
//!
//! The new-block subscription is opened before backfill, so heads announced
//! during backfill queue up and are handled afterwards. Queued heads are
//! coalesced to the highest one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use marketindex_core::backoff::{BackoffPolicy, BatchSizer};
use marketindex_core::config::{IndexerConfig, IndexerState};
use marketindex_core::cursor::{next_block, Cursor};
use marketindex_core::error::IndexerError;
use marketindex_core::event::decode;
use marketindex_core::query::QueryFacade;
use marketindex_core::reorg::ReorgDetector;
use marketindex_core::store::{EventBatch, ListingStore};
use marketindex_core::types::{BlockSummary, IndexPhase, RawLog};

use crate::fetcher::LogFetcher;
use crate::source::{BlockStream, LogSource, SourceChain};

/// Counters accumulated over one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches: u64,
    pub events_applied: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    pub retries: u64,
    pub reorgs: u64,
}

/// Requests a graceful stop. Takes effect at the next batch boundary, or
/// immediately while the pipeline is waiting for a head or backing off.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Single-writer ingestion pipeline for one marketplace contract.
pub struct Pipeline {
    config: IndexerConfig,
    source: Arc<dyn LogSource>,
    store: Arc<dyn ListingStore>,
    fetcher: LogFetcher,
    detector: ReorgDetector,
    backoff: BackoffPolicy,
    sizer: BatchSizer,
    cursor: Option<Cursor>,
    state: IndexerState,
    stats: PipelineStats,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(
        config: IndexerConfig,
        source: Arc<dyn LogSource>,
        store: Arc<dyn ListingStore>,
    ) -> Result<Self, IndexerError> {
        config.validate()?;
        let contract = config.contract_hex()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            fetcher: LogFetcher::new(source.clone(), contract),
            detector: ReorgDetector::new(config.max_reorg_depth),
            backoff: BackoffPolicy::new(config.backoff.clone()),
            sizer: BatchSizer::new(config.batch_size, config.min_batch_size),
            cursor: None,
            state: IndexerState::Idle,
            stats: PipelineStats::default(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            source,
            store,
            config,
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// The cursor as last written by this pipeline.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Read-only view over the same store, safe to use while running.
    pub fn query(&self) -> QueryFacade {
        QueryFacade::new(self.store.clone())
    }

    /// Run until stopped, until `to_block` is reached, or until a fatal
    /// error.
    pub async fn run(&mut self) -> Result<(), IndexerError> {
        let result = self.run_phases().await;
        match &result {
            Ok(()) => {
                self.state = IndexerState::Stopped;
                info!(
                    id = %self.config.id,
                    cursor = self.cursor.as_ref().map(|c| c.block_number),
                    batches = self.stats.batches,
                    events = self.stats.events_applied,
                    "Pipeline stopped"
                );
            }
            Err(e) => {
                self.state = IndexerState::Error;
                error!(id = %self.config.id, error = %e, "Pipeline halted");
            }
        }
        result
    }

    async fn run_phases(&mut self) -> Result<(), IndexerError> {
        let source = self.source.clone();
        let subscribed = self
            .retrying("subscribe", false, move |_| {
                let source = source.clone();
                async move { source.subscribe_new_blocks().await }
            })
            .await?;
        let Some(mut heads) = subscribed else {
            return Ok(());
        };

        self.cursor = self.store.cursor().await?;
        match &self.cursor {
            Some(c) => info!(block = c.block_number, hash = %c.block_hash, "Resuming from cursor"),
            None => info!(start_block = self.config.start_block, "No cursor, starting fresh"),
        }

        // The chain may have reorganised while we were not running.
        if self.recover_reorg().await? == Flow::Stop {
            return Ok(());
        }

        // Phase 1: Backfill
        self.state = IndexerState::Backfilling;
        let source = self.source.clone();
        let head = self
            .retrying("eth_blockNumber", false, move |_| {
                let source = source.clone();
                async move { source.head_block_number().await }
            })
            .await?;
        let Some(head) = head else {
            return Ok(());
        };
        let target = self.limit_for(head);

        info!(from = self.next(), target, "Starting backfill phase");
        if self.process_until(target, IndexPhase::Backfill).await? == Flow::Stop {
            return Ok(());
        }
        info!(at = target, "Backfill complete");

        if self.reached_end() {
            return Ok(());
        }

        // Phase 2: Live
        self.state = IndexerState::LiveTailing;
        self.live_tail(&mut heads).await
    }

    async fn live_tail(&mut self, heads: &mut BlockStream) -> Result<(), IndexerError> {
        info!(next = self.next(), "Live tailing");
        loop {
            if self.stop_requested() {
                return Ok(());
            }
            let notified = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => return Ok(()),
                n = heads.next() => n,
            };
            let Some(mut head) = notified else {
                warn!("New-block stream closed");
                return Ok(());
            };
            while let Some(Some(more)) = heads.next().now_or_never() {
                head = head.max(more);
            }
            debug!(head, "New head");

            if self.recover_reorg().await? == Flow::Stop {
                return Ok(());
            }
            if self.process_until(self.limit_for(head), IndexPhase::Live).await? == Flow::Stop {
                return Ok(());
            }
            if self.reached_end() {
                info!(to_block = self.config.to_block, "Reached end block");
                return Ok(());
            }
        }
    }

    /// Apply batches until the cursor reaches `limit`.
    async fn process_until(&mut self, limit: u64, phase: IndexPhase) -> Result<Flow, IndexerError> {
        loop {
            if self.stop_requested() {
                return Ok(Flow::Stop);
            }
            let from = self.next();
            if from > limit {
                return Ok(Flow::Continue);
            }

            let fetcher = self.fetcher.clone();
            let source = self.source.clone();
            let parent = self.cursor.clone();
            let fetched = self
                .retrying("eth_getLogs", true, move |size| {
                    let to = from.saturating_add(size - 1).min(limit);
                    let (fetcher, source, parent) = (fetcher.clone(), source.clone(), parent.clone());
                    async move { fetch_range(&fetcher, &*source, parent.as_ref(), from, to).await }
                })
                .await;
            let (logs, end) = match fetched {
                Ok(Some(range)) => range,
                Ok(None) => return Ok(Flow::Stop),
                Err(e) if e.is_reorg() => {
                    warn!(error = %e, "Chain reorganised below the next batch");
                    if self.recover_reorg().await? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.apply(from, logs, end, phase).await?;
        }
    }

    async fn apply(
        &mut self,
        from: u64,
        logs: Vec<RawLog>,
        end: BlockSummary,
        phase: IndexPhase,
    ) -> Result<(), IndexerError> {
        let to = end.number;
        let mut events = Vec::with_capacity(logs.len());
        let mut blocks = BTreeMap::new();
        for log in &logs {
            match decode(log) {
                Ok(event) => {
                    blocks.insert(log.block_number, log.block_hash.clone());
                    events.push(event);
                }
                Err(e) => {
                    self.stats.decode_failures += 1;
                    warn!(
                        block = log.block_number,
                        log_index = log.log_index,
                        tx = %log.tx_hash,
                        error = %e,
                        "Skipping undecodable log"
                    );
                }
            }
        }

        let cursor = Cursor::new(to, end.hash);
        let batch = EventBatch::new(events, blocks, cursor.clone());
        let outcome = self.store.apply_batch(&batch).await?;
        self.cursor = Some(cursor);

        self.stats.batches += 1;
        self.stats.events_applied += outcome.applied as u64;
        self.stats.duplicates += outcome.duplicates as u64;
        info!(
            phase = ?phase,
            from,
            to,
            events = outcome.applied,
            duplicates = outcome.duplicates,
            "Batch applied"
        );
        Ok(())
    }

    /// Check the cursor against the chain and roll back on a reorg.
    async fn recover_reorg(&mut self) -> Result<Flow, IndexerError> {
        let Some(cursor) = self.cursor.clone() else {
            return Ok(Flow::Continue);
        };
        let (detector, store, source) = (self.detector.clone(), self.store.clone(), self.source.clone());
        let checked = self
            .retrying("reorg check", false, move |_| {
                let (detector, store, source, cursor) =
                    (detector.clone(), store.clone(), source.clone(), cursor.clone());
                async move { detector.check(&cursor, &*store, &SourceChain(&*source)).await }
            })
            .await?;
        let reorg = match checked {
            None => return Ok(Flow::Stop),
            Some(None) => return Ok(Flow::Continue),
            Some(Some(reorg)) => reorg,
        };

        let previous = self.state;
        self.state = IndexerState::ReorgRecovery;
        let outcome = self
            .store
            .rollback_to(reorg.common_ancestor, &reorg.ancestor_hash)
            .await?;
        self.cursor = self.store.cursor().await?;
        self.stats.reorgs += 1;
        warn!(
            ancestor = reorg.common_ancestor,
            depth = reorg.depth,
            removed = outcome.removed_events,
            rederived = outcome.rederived_keys,
            cause = %reorg.to_error(),
            "Rolled back to common ancestor"
        );
        self.state = previous;
        Ok(Flow::Continue)
    }

    /// Run `op` until it succeeds, retrying transient errors with backoff.
    ///
    /// `op` receives the current batch size. With `shrink` set, repeated
    /// failures halve it and a success grows it back. Returns `None` if a
    /// stop was requested first.
    async fn retrying<T, F, Fut>(&mut self, what: &'static str, shrink: bool, mut op: F) -> Result<Option<T>, IndexerError>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.stop_requested() {
                return Ok(None);
            }
            match op(self.sizer.current()).await {
                Ok(value) => {
                    if shrink {
                        self.sizer.grow();
                    }
                    return Ok(Some(value));
                }
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    self.stats.retries += 1;
                    let Some(delay) = self.backoff.next_delay(attempt) else {
                        error!(what, attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    };
                    if shrink && self.backoff.should_shrink(attempt) {
                        let batch_size = self.sizer.shrink();
                        warn!(what, batch_size, "Shrinking batch");
                    }
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient source error, retrying"
                    );
                    if !self.pause(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if a stop arrived first.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stop_rx.changed() => false,
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn next(&self) -> u64 {
        next_block(self.cursor.as_ref(), self.config.start_block)
    }

    fn limit_for(&self, head: u64) -> u64 {
        let confirmed = head.saturating_sub(self.config.confirmation_depth);
        self.config.to_block.map_or(confirmed, |to| confirmed.min(to))
    }

    fn reached_end(&self) -> bool {
        self.config.to_block.is_some_and(|to| self.next() > to)
    }
}

/// Fetch the logs of `[from, to]` together with the header of `to`.
///
/// The end header is read before and after the logs, and every log must
/// carry the canonical hash of its block. Otherwise the chain moved during
/// the fetch and the range is fetched again. When `parent` is the block right
/// below the range, the first block must link to it; a broken link is a reorg
/// below the range.
async fn fetch_range(
    fetcher: &LogFetcher,
    source: &dyn LogSource,
    parent: Option<&Cursor>,
    from: u64,
    to: u64,
) -> Result<(Vec<RawLog>, BlockSummary), IndexerError> {
    let pinned = header(source, to).await?;

    if let Some(parent) = parent.filter(|c| c.block_number + 1 == from) {
        let first = if from == to { pinned.clone() } else { header(source, from).await? };
        if !first.parent_hash.eq_ignore_ascii_case(&parent.block_hash) {
            return Err(IndexerError::ReorgDetected {
                block_number: parent.block_number,
                expected: parent.block_hash.clone(),
                actual: first.parent_hash,
            });
        }
    }

    let logs = fetcher.fetch(from, to).await?;

    let settled = header(source, to).await?;
    if !settled.hash.eq_ignore_ascii_case(&pinned.hash) {
        return Err(IndexerError::TransientSource(format!(
            "block {to} changed during fetch ({} -> {})",
            pinned.hash, settled.hash
        )));
    }

    let mut canonical = BTreeMap::from([(to, pinned.hash.clone())]);
    for log in &logs {
        let hash = match canonical.get(&log.block_number) {
            Some(hash) => hash.clone(),
            None => {
                let hash = header(source, log.block_number).await?.hash;
                canonical.insert(log.block_number, hash.clone());
                hash
            }
        };
        if !log.block_hash.eq_ignore_ascii_case(&hash) {
            return Err(IndexerError::TransientSource(format!(
                "log {}/{} belongs to replaced block {} ({} != {hash})",
                log.tx_hash, log.log_index, log.block_number, log.block_hash
            )));
        }
    }
    Ok((logs, pinned))
}

async fn header(source: &dyn LogSource, number: u64) -> Result<BlockSummary, IndexerError> {
    source
        .block(number)
        .await?
        .ok_or_else(|| IndexerError::TransientSource(format!("block {number} not available yet")))
}
