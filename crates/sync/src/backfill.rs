//! Historical backfill with pruning recovery.
//!
//! Heights `[start, head]` are fetched in fixed-size batches. A pruned height
//! triggers a binary search for the lowest height the node still serves; the
//! gap is recorded in the skipped-range ledger and the backfill resumes there.
//! Transient failures retry the batch with backoff. A batch that keeps failing
//! is recorded as skipped and the backfill moves on.

use std::sync::Arc;

use stakeidx_chain_index::{Clock, IndexStore, SkipReason, SkippedRange};
use tokio::sync::watch;

use crate::client::{ChainClient, RawTransaction};
use crate::coordinator::{cancelled, SyncSettings};
use crate::error::{ClientError, SyncError, SyncResult};
use crate::ingest::Ingestor;
use crate::status::StatusHandle;

/// Summary of one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub from: u64,
    pub target: u64,
    /// Last height fully handled, ingested or skipped.
    pub reached: Option<u64>,
    pub batches: u64,
    pub inserted: usize,
    pub skipped: Vec<SkippedRange>,
    pub cancelled: bool,
}

enum BatchFetch {
    Complete(Vec<RawTransaction>),
    /// `height` is pruned; `fetched` holds everything below it.
    Pruned {
        height: u64,
        fetched: Vec<RawTransaction>,
    },
    Failed(ClientError),
    Cancelled,
}

pub struct Backfill<C, S> {
    client: Arc<C>,
    ingestor: Arc<Ingestor<S>>,
    settings: SyncSettings,
    status: StatusHandle,
    clock: Arc<dyn Clock>,
}

impl<C, S> Backfill<C, S>
where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    pub fn new(
        client: Arc<C>,
        ingestor: Arc<Ingestor<S>>,
        settings: SyncSettings,
        status: StatusHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            ingestor,
            settings,
            status,
            clock,
        }
    }

    fn network(&self) -> &str {
        self.ingestor.network()
    }

    /// Height the next backfill begins at, given the chain head.
    ///
    /// Prefers the persisted cursor, then the last logged transaction, then a
    /// bootstrap window below the head.
    pub async fn start_height(&self, head: u64) -> SyncResult<u64> {
        let store = Arc::clone(self.ingestor.store());
        let (cursor, last_tx) = tokio::task::spawn_blocking(move || {
            Ok::<_, SyncError>((store.sync_cursor()?, store.latest_transaction_height()?))
        })
        .await??;

        Ok(match (cursor, last_tx) {
            (Some(cursor), _) => cursor + 1,
            (None, Some(height)) => height + 1,
            (None, None) => head.saturating_sub(self.settings.bootstrap_window).max(1),
        })
    }

    /// Run until the head observed at start is reached or `cancel` flips.
    ///
    /// Cancellation is observed between batches and during backoff sleeps; a
    /// batch that is being ingested always finishes.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> SyncResult<BackfillReport> {
        let target = self
            .settings
            .retry
            .run(|| self.client.current_height(), ClientError::is_retryable)
            .await?;
        let from = self.start_height(target).await?;

        let mut report = BackfillReport {
            from,
            target,
            ..BackfillReport::default()
        };
        self.status.update(|s| {
            s.backfill_from = Some(from);
            s.backfill_target = Some(target);
            s.backfill_done = false;
        });

        if from > target {
            tracing::info!(network = %self.network(), from, target, "Backfill already up to date");
            self.status.update(|s| s.backfill_done = true);
            return Ok(report);
        }
        tracing::info!(network = %self.network(), from, target, "Starting backfill");

        let mut next = from;
        while next <= target {
            if *cancel.borrow() {
                report.cancelled = true;
                break;
            }
            let end = next
                .saturating_add(self.settings.batch_size.saturating_sub(1))
                .min(target);

            let done_through = match self.fetch_with_retry(next, end, &mut cancel).await {
                BatchFetch::Complete(txs) => {
                    report.inserted += self.ingest(txs).await?;
                    end
                }
                BatchFetch::Pruned { height, fetched } => {
                    report.inserted += self.ingest(fetched).await?;
                    let resume = self.lowest_available(height, target).await?;
                    let skip_to = resume.map_or(target, |h| h - 1);
                    let range = self
                        .record_skip(height, skip_to, SkipReason::Pruned)
                        .await?;
                    tracing::warn!(
                        network = %self.network(),
                        from = range.from_height,
                        to = range.to_height,
                        "Heights pruned on the node; skipping ahead"
                    );
                    report.skipped.push(range);
                    skip_to
                }
                BatchFetch::Failed(error) => {
                    let range = self
                        .record_skip(next, end, SkipReason::RetriesExhausted)
                        .await?;
                    if error.is_retryable() {
                        tracing::warn!(
                            network = %self.network(),
                            from = next,
                            to = end,
                            error = %error,
                            "Batch retries exhausted; skipping"
                        );
                    } else {
                        tracing::error!(
                            network = %self.network(),
                            from = next,
                            to = end,
                            error = %error,
                            "Batch failed with a non-retryable error; skipping"
                        );
                    }
                    if let Some(metrics) = self.ingestor.metrics() {
                        metrics.batch_retries_exhausted.inc();
                    }
                    self.status.update(|s| s.last_error = Some(error.to_string()));
                    report.skipped.push(range);
                    end
                }
                BatchFetch::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            };

            self.advance_cursor(done_through).await?;
            report.batches += 1;
            report.reached = Some(done_through);
            next = done_through + 1;
        }

        if !report.cancelled {
            self.status.update(|s| s.backfill_done = true);
            tracing::info!(
                network = %self.network(),
                target,
                batches = report.batches,
                inserted = report.inserted,
                skipped_ranges = report.skipped.len(),
                "Backfill complete"
            );
        } else {
            tracing::info!(network = %self.network(), reached = ?report.reached, "Backfill cancelled");
        }
        Ok(report)
    }

    async fn fetch_with_retry(
        &self,
        from: u64,
        to: u64,
        cancel: &mut watch::Receiver<bool>,
    ) -> BatchFetch {
        let policy = &self.settings.retry;
        let mut attempt = 1;
        loop {
            match self.fetch_batch(from, to).await {
                Ok(txs) => return BatchFetch::Complete(txs),
                Err((ClientError::Pruned { height }, fetched)) => {
                    return BatchFetch::Pruned { height, fetched }
                }
                Err((error, _)) if error.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(
                        network = %self.network(),
                        from,
                        to,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Batch fetch failed; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancelled(cancel) => return BatchFetch::Cancelled,
                    }
                    attempt += 1;
                }
                Err((error, _)) => return BatchFetch::Failed(error),
            }
        }
    }

    async fn ingest(&self, txs: Vec<RawTransaction>) -> SyncResult<usize> {
        let report = self.ingestor.ingest(txs).await?;
        self.status.record_ingest(&report);
        Ok(report.inserted)
    }

    /// Fetch every transaction in `[from, to]`, filling missing block times.
    ///
    /// On error, returns what was fetched below the failing height.
    async fn fetch_batch(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawTransaction>, (ClientError, Vec<RawTransaction>)> {
        let mut out = Vec::new();
        for height in from..=to {
            let mut txs = match self.client.block_transactions(height).await {
                Ok(txs) => txs,
                Err(e) => return Err((e, out)),
            };
            if txs.iter().any(|tx| tx.timestamp.is_none()) {
                let block = match self.client.block(height).await {
                    Ok(block) => block,
                    Err(e) => return Err((e, out)),
                };
                for tx in &mut txs {
                    tx.timestamp.get_or_insert(block.timestamp);
                }
            }
            out.extend(txs);
        }
        Ok(out)
    }

    /// Lowest height in `(pruned, head]` the node still serves.
    ///
    /// Availability is monotone: everything below the pruning floor is gone,
    /// everything at or above it is served.
    pub async fn lowest_available(&self, pruned: u64, head: u64) -> SyncResult<Option<u64>> {
        if pruned >= head || !self.is_available(head).await? {
            return Ok(None);
        }
        // Invariant: `lo` is unavailable, `hi` is available.
        let (mut lo, mut hi) = (pruned, head);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.is_available(mid).await? {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(Some(hi))
    }

    async fn is_available(&self, height: u64) -> SyncResult<bool> {
        match self
            .settings
            .retry
            .run(|| self.client.block(height), ClientError::is_retryable)
            .await
        {
            Ok(_) => Ok(true),
            Err(ClientError::Pruned { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_skip(&self, from: u64, to: u64, reason: SkipReason) -> SyncResult<SkippedRange> {
        let range = SkippedRange {
            from_height: from,
            to_height: to,
            reason,
            recorded_at: self.clock.now_secs(),
        };
        let store = Arc::clone(self.ingestor.store());
        let stored = range.clone();
        tokio::task::spawn_blocking(move || store.record_skipped_range(&stored)).await??;

        if let Some(metrics) = self.ingestor.metrics() {
            metrics.record_skipped_heights(to - from + 1);
        }
        self.status.update(|s| s.skipped_ranges += 1);
        Ok(range)
    }

    async fn advance_cursor(&self, height: u64) -> SyncResult<()> {
        let store = Arc::clone(self.ingestor.store());
        tokio::task::spawn_blocking(move || store.set_sync_cursor(height)).await??;
        if let Some(metrics) = self.ingestor.metrics() {
            metrics.set_backfill_height(height);
        }
        self.status.update(|s| s.backfill_height = Some(height));
        Ok(())
    }
}
