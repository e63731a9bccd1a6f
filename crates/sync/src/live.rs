//! Live subscription path.
//!
//! Pushed transactions are drained in small batches and handed to the same
//! [`Ingestor`] the backfill uses. A dropped or failed subscription is retried
//! after a delay for as long as the feed runs. Heights missed while
//! disconnected are picked up by the cursor-driven backfill on the next start.

use std::sync::Arc;

use stakeidx_chain_index::IndexStore;
use tokio::sync::{mpsc, watch};

use crate::client::{ChainClient, RawTransaction};
use crate::coordinator::{cancelled, SyncSettings};
use crate::error::ClientError;
use crate::ingest::Ingestor;
use crate::status::StatusHandle;

pub struct LiveFeed<C, S> {
    client: Arc<C>,
    ingestor: Arc<Ingestor<S>>,
    settings: SyncSettings,
    status: StatusHandle,
}

impl<C, S> LiveFeed<C, S>
where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    pub fn new(
        client: Arc<C>,
        ingestor: Arc<Ingestor<S>>,
        settings: SyncSettings,
        status: StatusHandle,
    ) -> Self {
        Self {
            client,
            ingestor,
            settings,
            status,
        }
    }

    fn network(&self) -> &str {
        self.ingestor.network()
    }

    /// Consume the feed until `cancel` flips.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        loop {
            let subscription = tokio::select! {
                result = self.client.subscribe() => result,
                _ = cancelled(&mut cancel) => break,
            };

            match subscription {
                Ok(rx) => {
                    tracing::info!(network = %self.network(), "Live subscription established");
                    self.status.update(|s| s.live_connected = true);
                    let stopped = self.consume(rx, &mut cancel).await;
                    self.status.update(|s| s.live_connected = false);
                    if stopped {
                        break;
                    }
                    tracing::warn!(network = %self.network(), "Live subscription closed; resubscribing");
                }
                Err(e) => {
                    tracing::warn!(network = %self.network(), error = %e, "Failed to subscribe; retrying");
                    self.status.update(|s| s.last_error = Some(e.to_string()));
                }
            }

            if let Some(metrics) = self.ingestor.metrics() {
                metrics.live_resubscriptions.inc();
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.resubscribe_delay) => {}
                _ = cancelled(&mut cancel) => break,
            }
        }
        self.status.update(|s| s.live_connected = false);
        tracing::info!(network = %self.network(), "Live subscription stopped");
    }

    /// Returns true when stopped by `cancel`, false when the feed closed.
    async fn consume(
        &self,
        mut rx: mpsc::Receiver<RawTransaction>,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            let first = tokio::select! {
                biased;
                _ = cancelled(cancel) => return true,
                tx = rx.recv() => match tx {
                    Some(tx) => tx,
                    None => return false,
                },
            };

            let mut batch = vec![first];
            let limit = usize::try_from(self.settings.batch_size).unwrap_or(usize::MAX);
            while batch.len() < limit {
                match rx.try_recv() {
                    Ok(tx) => batch.push(tx),
                    Err(_) => break,
                }
            }
            self.handle(batch).await;
        }
    }

    async fn handle(&self, mut batch: Vec<RawTransaction>) {
        for tx in &mut batch {
            if tx.timestamp.is_some() {
                continue;
            }
            let height = tx.height;
            match self
                .settings
                .retry
                .run(|| self.client.block(height), ClientError::is_retryable)
                .await
            {
                Ok(block) => tx.timestamp = Some(block.timestamp),
                Err(e) => {
                    tracing::warn!(network = %self.network(), height, tx_id = %tx.hash, error = %e, "Could not resolve block time");
                }
            }
        }

        match self.ingestor.ingest(batch).await {
            Ok(report) => self.status.record_ingest(&report),
            Err(e) => {
                tracing::error!(network = %self.network(), error = %e, "Failed to ingest live transactions");
                self.status.update(|s| s.last_error = Some(e.to_string()));
            }
        }
    }
}
