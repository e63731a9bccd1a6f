//! Incremental and full-rebuild maintenance of address aggregates.
//!
//! Both paths fold log rows through the same `record` functions. The
//! incremental path claims a row's aggregation marker in the same write that
//! bumps the documents; the rebuild folds exactly the rows whose marker is set
//! and then replays the unmarked ones through the incremental path.

use std::collections::HashSet;
use std::sync::Arc;

use crate::aggregate::{FinalityProviderAggregate, StakerAggregate};
use crate::error::{ChainIndexError, ChainIndexResult};
use crate::store::{AggregateStore, TransactionLog};
use crate::types::Transaction;

const CATCH_UP_PAGE: usize = 500;

/// Summary of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Log rows scanned.
    pub transactions: u64,
    pub stakers: usize,
    pub finality_providers: usize,
    /// Unmarked rows applied through the incremental path afterwards.
    pub replayed: usize,
    /// Addresses (or transaction ids, for replay) that could not be rebuilt.
    pub failed: Vec<String>,
}

/// Outcome of applying every pending row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub applied: usize,
    pub failed: Vec<String>,
}

trait Foldable {
    fn fold(&mut self, tx: &Transaction) -> ChainIndexResult<()>;
}

impl Foldable for StakerAggregate {
    fn fold(&mut self, tx: &Transaction) -> ChainIndexResult<()> {
        self.record(tx)
    }
}

impl Foldable for FinalityProviderAggregate {
    fn fold(&mut self, tx: &Transaction) -> ChainIndexResult<()> {
        self.record(tx)
    }
}

struct Fold<A> {
    aggregate: A,
    folded: HashSet<String>,
    error: Option<ChainIndexError>,
}

impl<A: Foldable> Fold<A> {
    fn new(aggregate: A) -> Self {
        Self {
            aggregate,
            folded: HashSet::new(),
            error: None,
        }
    }

    fn push(&mut self, tx: &Transaction) {
        if self.error.is_some() {
            return;
        }
        match self.aggregate.fold(tx) {
            Ok(()) => {
                self.folded.insert(tx.tx_id.clone());
            }
            Err(e) => self.error = Some(e),
        }
    }
}

/// Keeps staker and finality provider aggregates in step with the log.
pub struct AggregateReindexer<S> {
    store: Arc<S>,
}

impl<S: TransactionLog + AggregateStore> AggregateReindexer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Fold one newly logged transaction into its aggregates.
    ///
    /// Returns `false` if the row had already been applied.
    pub fn on_transaction(&self, tx: &Transaction) -> ChainIndexResult<bool> {
        self.store.apply_incremental(&tx.tx_id)
    }

    /// Apply every row whose aggregate update has not run yet.
    pub fn catch_up(&self) -> ChainIndexResult<CatchUpReport> {
        let mut report = CatchUpReport::default();
        let mut failed = HashSet::new();
        loop {
            let pending: Vec<String> = self
                .store
                .pending_aggregation(CATCH_UP_PAGE + failed.len())?
                .into_iter()
                .filter(|id| !failed.contains(id))
                .collect();
            if pending.is_empty() {
                break;
            }
            for tx_id in pending {
                match self.store.apply_incremental(&tx_id) {
                    Ok(true) => report.applied += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(tx_id = %tx_id, error = %e, "Failed to apply transaction to aggregates");
                        failed.insert(tx_id);
                    }
                }
            }
        }
        report.failed = failed.into_iter().collect();
        report.failed.sort();
        if report.applied > 0 {
            tracing::info!(applied = report.applied, "Applied pending transactions to aggregates");
        }
        Ok(report)
    }

    /// Recompute every aggregate from the log and replace the stored documents.
    ///
    /// Addresses are rebuilt one at a time, so only one address's rows are
    /// held in memory. A failure for one address is logged and that address
    /// is skipped.
    pub fn rebuild_all(&self) -> ChainIndexResult<RebuildReport> {
        let mut report = RebuildReport {
            transactions: self.store.transaction_count()?,
            ..RebuildReport::default()
        };

        for address in self.store.staker_addresses()? {
            match self.rebuild_staker(&address) {
                Ok(_) => report.stakers += 1,
                Err(e) => {
                    tracing::error!(address = %address, error = %e, "Skipping staker in rebuild");
                    report.failed.push(address);
                }
            }
        }

        for address in self.store.provider_addresses()? {
            match self.rebuild_finality_provider(&address) {
                Ok(_) => report.finality_providers += 1,
                Err(e) => {
                    tracing::error!(address = %address, error = %e, "Skipping finality provider in rebuild");
                    report.failed.push(address);
                }
            }
        }

        let replay = self.catch_up()?;
        report.replayed = replay.applied;
        report.failed.extend(replay.failed);

        tracing::info!(
            transactions = report.transactions,
            stakers = report.stakers,
            finality_providers = report.finality_providers,
            replayed = report.replayed,
            failed = report.failed.len(),
            "Aggregate rebuild finished"
        );
        Ok(report)
    }

    /// Rebuild one staker's aggregate from its log rows.
    pub fn rebuild_staker(&self, address: &str) -> ChainIndexResult<StakerAggregate> {
        let entries = self.store.staker_entries(address)?;
        if entries.is_empty() {
            return Err(ChainIndexError::StakerNotFound(address.to_string()));
        }
        let mut fold = Fold::new(StakerAggregate::new(address));
        entries
            .iter()
            .filter(|e| e.aggregated)
            .for_each(|e| fold.push(&e.transaction));
        if let Some(e) = fold.error {
            return Err(e);
        }
        self.store.swap_staker(fold.aggregate, &fold.folded)
    }

    /// Rebuild one finality provider's aggregate from its log rows.
    pub fn rebuild_finality_provider(
        &self,
        address: &str,
    ) -> ChainIndexResult<FinalityProviderAggregate> {
        let entries = self.store.provider_entries(address)?;
        if entries.is_empty() {
            return Err(ChainIndexError::FinalityProviderNotFound(address.to_string()));
        }
        let mut fold = Fold::new(FinalityProviderAggregate::new(address));
        entries
            .iter()
            .filter(|e| e.aggregated)
            .for_each(|e| fold.push(&e.transaction));
        if let Some(e) = fold.error {
            return Err(e);
        }
        self.store.swap_finality_provider(fold.aggregate, &fold.folded)
    }
}


// ==================== Model-based tests ====================
#[cfg(test)]
mod model_tests {
    use super::*;
    use crate::aggregate::distinct_providers;
    use std::collections::BTreeMap;
    use crate::accountant::PhaseCapAccountant;
    use crate::phase::{PhaseDefinition, PhaseTable};
    use crate::store::PersistentIndex;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    struct Arrival {
        staker: u8,
        providers: Vec<u8>,
        amount: u64,
        timestamp: u64,
        height: u64,
    }

    fn arb_arrival() -> impl Strategy<Value = Arrival> {
        (
            0u8..5,
            proptest::collection::vec(0u8..4, 1..3),
            0u64..500,
            0u64..100,
            0u64..300,
        )
            .prop_map(|(staker, providers, amount, timestamp, height)| Arrival {
                staker,
                providers,
                amount,
                timestamp,
                height,
            })
    }

    fn to_transactions(arrivals: Vec<Arrival>, table: &PhaseTable) -> Vec<Transaction> {
        arrivals
            .into_iter()
            .enumerate()
            .map(|(i, a)| {
                let def = table.resolve(a.height);
                Transaction {
                    tx_id: format!("tx{i:04}"),
                    block_height: a.height,
                    timestamp: a.timestamp,
                    stake_amount: a.amount,
                    staker_address: format!("staker{}", a.staker),
                    finality_providers: a.providers.iter().map(|p| format!("fp{p}")).collect(),
                    protocol_version: def.protocol_version,
                    phase: def.phase,
                    is_overflow: false,
                    overflow_amount: 0,
                }
            })
            .collect()
    }

    proptest! {
        /// rebuild(log) == fold(on_transaction, log) for every address.
        #[test]
        fn prop_rebuild_equals_incremental_fold(
            batches in proptest::collection::vec(proptest::collection::vec(arb_arrival(), 0..6), 1..6),
            skip_incremental in proptest::collection::vec(any::<bool>(), 30),
        ) {
            let table = Arc::new(PhaseTable::new(vec![
                PhaseDefinition::uncapped(1, 100, 0).with_cap(1_500),
                PhaseDefinition::uncapped(2, 200, 1),
            ]).unwrap());
            let store = Arc::new(PersistentIndex::in_memory().unwrap());
            let accountant = PhaseCapAccountant::new(Arc::clone(&store), Arc::clone(&table));
            let reindexer = AggregateReindexer::new(Arc::clone(&store));

            let mut logged = Vec::new();
            let mut counter = 0usize;
            for batch in batches {
                let txs = to_transactions(batch, &table);
                let mut by_phase: BTreeMap<u32, Vec<Transaction>> = BTreeMap::new();
                for mut tx in txs {
                    tx.tx_id = format!("{}-{counter}", tx.tx_id);
                    counter += 1;
                    by_phase.entry(tx.phase).or_default().push(tx);
                }
                for (phase, txs) in by_phase {
                    let outcome = accountant.admit_and_apply(phase, txs).unwrap();
                    for tx in outcome.inserted {
                        if !skip_incremental[logged.len() % skip_incremental.len()] {
                            reindexer.on_transaction(&tx).unwrap();
                        }
                        logged.push(tx);
                    }
                }
            }
            reindexer.catch_up().unwrap();

            // Reference fold over the log in admission order.
            logged.sort_by(Transaction::admission_order);
            let mut expected_stakers: BTreeMap<String, StakerAggregate> = BTreeMap::new();
            let mut expected_providers: BTreeMap<String, FinalityProviderAggregate> = BTreeMap::new();
            for tx in &logged {
                expected_stakers
                    .entry(tx.staker_address.clone())
                    .or_insert_with(|| StakerAggregate::new(tx.staker_address.clone()))
                    .record(tx)
                    .unwrap();
                for provider in distinct_providers(tx) {
                    expected_providers
                        .entry(provider.to_string())
                        .or_insert_with(|| FinalityProviderAggregate::new(provider))
                        .record(tx)
                        .unwrap();
                }
            }

            for (address, expected) in &expected_stakers {
                prop_assert_eq!(&store.get_staker(address).unwrap().unwrap(), expected);
            }
            for (address, expected) in &expected_providers {
                prop_assert_eq!(&store.get_finality_provider(address).unwrap().unwrap(), expected);
            }

            let report = reindexer.rebuild_all().unwrap();
            prop_assert!(report.failed.is_empty());
            prop_assert_eq!(report.replayed, 0);

            for (address, expected) in &expected_stakers {
                prop_assert_eq!(&store.get_staker(address).unwrap().unwrap(), expected);
            }
            for (address, expected) in &expected_providers {
                prop_assert_eq!(&store.get_finality_provider(address).unwrap().unwrap(), expected);
            }
        }
    }
}
