//! Ingestion step shared by backfill and the live feed.
//!
//! A batch of raw transactions is decoded, reduced to stake transactions,
//! grouped by phase and admitted one phase at a time. Each newly logged row is
//! then folded into its aggregates and the affected cache entries are dropped.
//!
//! ```text
//!   RawTransaction ──decode──▶ Stake ──resolve phase──▶ Transaction
//!                                                          │
//!            group by phase, admit_and_apply (blocking pool)
//!                                                          │
//!         on_transaction (retried) ──▶ cache invalidation ──▶ metrics
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use stakeidx_chain_index::{
    AdmissionOutcome, AggregateReindexer, CacheInvalidation, ChainIndexError, IndexStore,
    PhaseCapAccountant, Transaction,
};
use stakeidx_operations::IndexerMetrics;

use crate::client::RawTransaction;
use crate::decoder::{DecodedMessage, MessageDecoder};
use crate::error::SyncResult;
use crate::retry::RetryPolicy;

/// Counts for one ingested batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub stakes: usize,
    pub irrelevant: usize,
    pub decode_failures: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub overflow: usize,
    /// Phase batches marked overflow as a unit.
    pub rejected_batches: usize,
    /// Rows whose aggregate update failed after retries; repaired by catch-up.
    pub aggregate_failures: usize,
}

impl IngestReport {
    fn absorb(&mut self, outcome: &AdmissionOutcome) {
        self.inserted += outcome.inserted.len();
        self.duplicates += outcome.duplicates.len();
        self.overflow += outcome.inserted.iter().filter(|t| t.is_overflow).count();
        if outcome.rejected_as_unit {
            self.rejected_batches += 1;
        }
    }
}

/// Writes decoded stakes into one network's index.
pub struct Ingestor<S> {
    network: String,
    store: Arc<S>,
    accountant: Arc<PhaseCapAccountant<S>>,
    reindexer: Arc<AggregateReindexer<S>>,
    decoder: Arc<dyn MessageDecoder>,
    invalidation: Option<Arc<dyn CacheInvalidation>>,
    metrics: Option<Arc<IndexerMetrics>>,
    aggregate_retry: RetryPolicy,
}

impl<S: IndexStore + 'static> Ingestor<S> {
    pub fn new(
        network: impl Into<String>,
        store: Arc<S>,
        accountant: Arc<PhaseCapAccountant<S>>,
        reindexer: Arc<AggregateReindexer<S>>,
        decoder: Arc<dyn MessageDecoder>,
    ) -> Self {
        Self {
            network: network.into(),
            store,
            accountant,
            reindexer,
            decoder,
            invalidation: None,
            metrics: None,
            aggregate_retry: RetryPolicy::default(),
        }
    }

    pub fn with_invalidation(mut self, invalidation: Arc<dyn CacheInvalidation>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IndexerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_aggregate_retry(mut self, policy: RetryPolicy) -> Self {
        self.aggregate_retry = policy;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn accountant(&self) -> &Arc<PhaseCapAccountant<S>> {
        &self.accountant
    }

    pub fn reindexer(&self) -> &Arc<AggregateReindexer<S>> {
        &self.reindexer
    }

    pub fn invalidation(&self) -> Option<&Arc<dyn CacheInvalidation>> {
        self.invalidation.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<IndexerMetrics>> {
        self.metrics.as_ref()
    }

    /// Ingest a batch of raw transactions.
    ///
    /// Storage failures during admission abort the batch and are returned;
    /// nothing of the failing phase group was committed. Aggregate update
    /// failures are logged and left for catch-up.
    pub async fn ingest(&self, raw: Vec<RawTransaction>) -> SyncResult<IngestReport> {
        let started = Instant::now();
        let mut report = IngestReport {
            received: raw.len(),
            ..IngestReport::default()
        };

        let mut by_phase: BTreeMap<u32, Vec<Transaction>> = BTreeMap::new();
        for tx in &raw {
            match self.decoder.decode(tx) {
                Ok(message) => match self.to_transaction(message) {
                    Some(tx) => {
                        report.stakes += 1;
                        by_phase.entry(tx.phase).or_default().push(tx);
                    }
                    None => report.irrelevant += 1,
                },
                Err(e) => {
                    report.decode_failures += 1;
                    tracing::debug!(network = %self.network, tx_id = %tx.hash, height = tx.height, error = %e, "failed to decode transaction");
                }
            }
        }
        if report.decode_failures > 0 {
            tracing::warn!(
                network = %self.network,
                failures = report.decode_failures,
                received = report.received,
                "batch contained undecodable transactions"
            );
        }

        let mut applied = Vec::new();
        for (phase, batch) in by_phase {
            let accountant = Arc::clone(&self.accountant);
            let outcome =
                tokio::task::spawn_blocking(move || accountant.admit_and_apply(phase, batch))
                    .await??;
            report.absorb(&outcome);
            applied.extend(outcome.inserted);
        }

        for tx in &applied {
            if !self.apply_aggregates(tx).await {
                report.aggregate_failures += 1;
            }
        }

        if let Some(invalidation) = &self.invalidation {
            invalidation.on_transactions_applied(&applied);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_batch(
                report.inserted as u64,
                report.duplicates as u64,
                report.overflow as u64,
                started.elapsed().as_secs_f64(),
            );
            metrics.decode_failures.inc_by(report.decode_failures as u64);
            metrics.irrelevant_messages.inc_by(report.irrelevant as u64);
            metrics.cap_conflicts.inc_by(report.rejected_batches as u64);
        }

        if report.inserted > 0 {
            tracing::debug!(
                network = %self.network,
                inserted = report.inserted,
                duplicates = report.duplicates,
                overflow = report.overflow,
                "ingested batch"
            );
        }
        Ok(report)
    }

    fn to_transaction(&self, message: DecodedMessage) -> Option<Transaction> {
        let stake = message.as_stake()?.clone();
        let def = self.accountant.phases().resolve(message.height);
        Some(Transaction {
            tx_id: message.tx_id,
            block_height: message.height,
            timestamp: message.timestamp,
            stake_amount: stake.amount,
            staker_address: stake.staker,
            finality_providers: stake.finality_providers,
            protocol_version: def.protocol_version,
            phase: def.phase,
            is_overflow: false,
            overflow_amount: 0,
        })
    }

    /// Fold one row into its aggregates, retrying storage failures.
    async fn apply_aggregates(&self, tx: &Transaction) -> bool {
        let result = self
            .aggregate_retry
            .run(
                || {
                    let reindexer = Arc::clone(&self.reindexer);
                    let tx = tx.clone();
                    async move {
                        tokio::task::spawn_blocking(move || reindexer.on_transaction(&tx))
                            .await
                            .map_err(|e| ChainIndexError::Storage(e.to_string()))?
                    }
                },
                |_| true,
            )
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    network = %self.network,
                    tx_id = %tx.tx_id,
                    error = %e,
                    "aggregate update failed; left for catch-up"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RawEvent, TxOrigin};
    use crate::decoder::EventDecoder;
    use stakeidx_chain_index::{
        AggregateStore, PersistentIndex, PhaseDefinition, PhaseTable, TransactionLog,
    };

    fn stake(id: &str, height: u64, ts: u64, staker: &str, amount: u64) -> RawTransaction {
        RawTransaction {
            hash: id.to_string(),
            height,
            timestamp: Some(ts),
            events: vec![RawEvent::new(
                "stake",
                &[
                    ("staker", staker),
                    ("finality_provider", "fp1"),
                    ("amount", &format!("{amount}ubbn")),
                ],
            )],
            origin: TxOrigin::Backfill,
        }
    }

    fn ingestor() -> Ingestor<PersistentIndex> {
        let store = Arc::new(PersistentIndex::in_memory().unwrap());
        let phases = Arc::new(
            PhaseTable::new(vec![
                PhaseDefinition::uncapped(1, 100, 1).with_cap(1_000),
                PhaseDefinition::uncapped(2, 500, 2),
            ])
            .unwrap(),
        );
        Ingestor::new(
            "localnet",
            Arc::clone(&store),
            Arc::new(PhaseCapAccountant::new(Arc::clone(&store), phases)),
            Arc::new(AggregateReindexer::new(Arc::clone(&store))),
            Arc::new(EventDecoder::default()),
        )
    }

    #[tokio::test]
    async fn test_ingest_routes_by_phase_and_enforces_cap() {
        let ingestor = ingestor();
        let report = ingestor
            .ingest(vec![
                stake("b", 120, 20, "bob", 400),
                stake("a", 110, 10, "alice", 700),
                stake("c", 600, 30, "carol", 5_000),
                stake("g", 50, 5, "gene", 1),
            ])
            .await
            .unwrap();

        assert_eq!(report.stakes, 4);
        assert_eq!(report.inserted, 4);
        assert_eq!(report.overflow, 1);

        let store = ingestor.store();
        let b = store.get_transaction("b").unwrap().unwrap();
        assert!(b.is_overflow);
        assert_eq!(b.protocol_version, 1);
        assert_eq!(store.get_transaction("c").unwrap().unwrap().phase, 2);
        assert_eq!(store.get_transaction("g").unwrap().unwrap().phase, 0);

        let alice = store.get_staker("alice").unwrap().unwrap();
        assert_eq!(alice.total_stake, 700);
        let bob = store.get_staker("bob").unwrap().unwrap();
        assert_eq!(bob.total_stake, 0);
        assert_eq!(bob.transaction_count, 1);
    }

    #[tokio::test]
    async fn test_reingesting_is_idempotent() {
        let ingestor = ingestor();
        let batch = vec![stake("a", 110, 10, "alice", 700)];
        ingestor.ingest(batch.clone()).await.unwrap();
        let second = ingestor.ingest(batch).await.unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
        let alice = ingestor.store().get_staker("alice").unwrap().unwrap();
        assert_eq!(alice.total_stake, 700);
        assert_eq!(alice.transaction_count, 1);
    }

    #[tokio::test]
    async fn test_irrelevant_and_broken_transactions_are_counted() {
        let ingestor = ingestor();
        let mut broken = stake("x", 110, 10, "alice", 1);
        broken.timestamp = None;
        let transfer = RawTransaction {
            events: vec![RawEvent::new(
                "transfer",
                &[("sender", "a"), ("recipient", "b"), ("amount", "1ubbn")],
            )],
            ..stake("t", 111, 11, "alice", 1)
        };

        let report = ingestor.ingest(vec![broken, transfer]).await.unwrap();
        assert_eq!(report.decode_failures, 1);
        assert_eq!(report.irrelevant, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(ingestor.store().transaction_count().unwrap(), 0);
    }
}
