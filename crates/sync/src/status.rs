//! Per-network sync progress, published on a watch channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::ingest::IngestReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub network: String,
    pub running: bool,
    /// First height of the current backfill.
    pub backfill_from: Option<u64>,
    /// Chain height the backfill is catching up to.
    pub backfill_target: Option<u64>,
    /// Last height the backfill completed.
    pub backfill_height: Option<u64>,
    pub backfill_done: bool,
    pub live_connected: bool,
    pub transactions_ingested: u64,
    pub duplicates_skipped: u64,
    pub overflow_transactions: u64,
    pub decode_failures: u64,
    pub skipped_ranges: u64,
    pub last_error: Option<String>,
}

/// Shared writer side of a network's status channel.
#[derive(Clone)]
pub struct StatusHandle {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusHandle {
    pub fn new(network: &str) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus {
            network: network.to_string(),
            ..SyncStatus::default()
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }

    /// Add one ingested batch to the running counters.
    pub fn record_ingest(&self, report: &IngestReport) {
        self.update(|s| {
            s.transactions_ingested += report.inserted as u64;
            s.duplicates_skipped += report.duplicates as u64;
            s.overflow_transactions += report.overflow as u64;
            s.decode_failures += report.decode_failures as u64;
        });
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}
