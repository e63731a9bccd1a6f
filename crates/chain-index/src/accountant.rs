//! Phase-capped stake admission.
//!
//! Admission for one phase is a critical section: the accountant reads the
//! phase's live active total, marks the batch and commits it while holding a
//! per-phase lock. Different phases proceed in parallel. No network call ever
//! happens under these locks; callers fetch first and admit afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ChainIndexError, ChainIndexResult};
use crate::phase::{PhaseDefinition, PhaseTable};
use crate::store::{AdmissionCommit, AggregateStore, TransactionLog};
use crate::types::{CompletionReason, PhaseStats, Transaction};

/// How the admission pass treated a batch as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    /// Transactions were marked one by one against the running total.
    Admitted,
    /// The cap was already exhausted; the whole batch is overflow.
    CapExhausted,
    /// The capped phase is completed and takes no more active stake.
    PhaseClosed,
}

/// Result of admitting and persisting one batch.
#[derive(Debug, Clone)]
pub struct AdmissionOutcome {
    pub phase: u32,
    /// Newly logged transactions with their final overflow marks.
    pub inserted: Vec<Transaction>,
    /// Ids skipped because they were already logged.
    pub duplicates: Vec<String>,
    /// The batch was marked overflow as a unit.
    pub rejected_as_unit: bool,
    /// Phase statistics after the commit.
    pub stats: PhaseStats,
}

/// Enforces the global cap of the capped phase and keeps phase statistics.
pub struct PhaseCapAccountant<S> {
    store: Arc<S>,
    phases: Arc<PhaseTable>,
    locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl<S: TransactionLog + AggregateStore> PhaseCapAccountant<S> {
    pub fn new(store: Arc<S>, phases: Arc<PhaseTable>) -> Self {
        Self {
            store,
            phases,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn phases(&self) -> &PhaseTable {
        &self.phases
    }

    fn phase_lock(&self, phase: u32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(phase).or_default())
    }

    fn definition(&self, phase: u32) -> ChainIndexResult<&PhaseDefinition> {
        self.phases
            .get(phase)
            .ok_or(ChainIndexError::PhaseNotFound(phase))
    }

    /// Every transaction must be tagged with `phase` and sit at a height the
    /// table resolves to `phase`.
    fn check_membership(&self, phase: u32, batch: &[Transaction]) -> ChainIndexResult<()> {
        self.definition(phase)?;
        for tx in batch {
            if tx.phase != phase || self.phases.resolve(tx.block_height).phase != phase {
                return Err(ChainIndexError::PhaseMismatch {
                    tx_id: tx.tx_id.clone(),
                    expected: phase,
                    found: tx.phase,
                    height: tx.block_height,
                });
            }
        }
        Ok(())
    }

    /// Mark a batch against the phase's live active total.
    ///
    /// Returns the same transactions sorted in admission order with
    /// `is_overflow`/`overflow_amount` populated. Nothing is persisted.
    pub fn admit(&self, phase: u32, batch: Vec<Transaction>) -> ChainIndexResult<Vec<Transaction>> {
        self.check_membership(phase, &batch)?;
        let lock = self.phase_lock(phase);
        let _guard = lock.lock();
        let (admitted, _) = self.admit_locked(phase, batch)?;
        Ok(admitted)
    }

    /// Persist an admitted batch and update the phase statistics atomically.
    pub fn apply_to(
        &self,
        phase: u32,
        admitted: Vec<Transaction>,
    ) -> ChainIndexResult<AdmissionOutcome> {
        self.check_membership(phase, &admitted)?;
        let lock = self.phase_lock(phase);
        let _guard = lock.lock();
        self.apply_locked(phase, admitted, BatchVerdict::Admitted)
    }

    /// Admit and persist under one hold of the phase lock.
    ///
    /// Ids already in the log, or repeated within the batch, are set aside
    /// before marking so they never consume cap. A transaction that belongs
    /// to another phase fails the whole batch with `PhaseMismatch`.
    pub fn admit_and_apply(
        &self,
        phase: u32,
        batch: Vec<Transaction>,
    ) -> ChainIndexResult<AdmissionOutcome> {
        self.check_membership(phase, &batch)?;
        let lock = self.phase_lock(phase);
        let _guard = lock.lock();

        let mut seen = HashSet::new();
        let mut known = Vec::new();
        let mut fresh = Vec::with_capacity(batch.len());
        for tx in batch {
            if !seen.insert(tx.tx_id.clone()) || self.store.contains(&tx.tx_id)? {
                known.push(tx.tx_id);
            } else {
                fresh.push(tx);
            }
        }

        let (admitted, verdict) = self.admit_locked(phase, fresh)?;
        let mut outcome = self.apply_locked(phase, admitted, verdict)?;
        outcome.duplicates.extend(known);
        Ok(outcome)
    }

    fn admit_locked(
        &self,
        phase: u32,
        batch: Vec<Transaction>,
    ) -> ChainIndexResult<(Vec<Transaction>, BatchVerdict)> {
        let def = self.definition(phase)?;
        let stats = self.store.get_phase_stats(phase)?;
        let current_active = stats.as_ref().map_or(0, |s| s.active_stake_amount);
        let completed = stats.as_ref().is_some_and(PhaseStats::is_completed);
        Ok(mark_batch(def, current_active, completed, batch))
    }

    fn apply_locked(
        &self,
        phase: u32,
        admitted: Vec<Transaction>,
        verdict: BatchVerdict,
    ) -> ChainIndexResult<AdmissionOutcome> {
        let def = self.definition(phase)?.clone();
        let cap = def.cap;
        let receipt = self.store.commit_admission(AdmissionCommit {
            phase: def,
            transactions: admitted,
        })?;

        let batch_amount: u64 = receipt
            .inserted
            .iter()
            .map(|tx| tx.stake_amount)
            .fold(0, u64::saturating_add);

        if receipt.cap_conflict {
            tracing::error!(
                phase,
                cap,
                transactions = receipt.inserted.len(),
                amount = batch_amount,
                active = receipt.stats.active_stake_amount,
                "Active stake moved during admission; batch marked overflow as a unit"
            );
        } else if verdict == BatchVerdict::CapExhausted && !receipt.inserted.is_empty() {
            tracing::error!(
                phase,
                cap,
                transactions = receipt.inserted.len(),
                amount = batch_amount,
                "Batch arrived after the phase cap was exhausted; marked overflow as a unit"
            );
        } else if verdict == BatchVerdict::PhaseClosed && !receipt.inserted.is_empty() {
            tracing::debug!(
                phase,
                transactions = receipt.inserted.len(),
                "Capped phase is completed; batch recorded as overflow"
            );
        }

        let rejected_as_unit = !receipt.inserted.is_empty()
            && (receipt.cap_conflict || verdict != BatchVerdict::Admitted);

        Ok(AdmissionOutcome {
            phase,
            inserted: receipt.inserted,
            duplicates: receipt.duplicates,
            rejected_as_unit,
            stats: receipt.stats,
        })
    }

    /// Current statistics of a phase, empty if nothing was admitted yet.
    pub fn phase_stats(&self, phase: u32) -> ChainIndexResult<PhaseStats> {
        let def = self.definition(phase)?;
        Ok(self
            .store
            .get_phase_stats(phase)?
            .unwrap_or_else(|| PhaseStats::new(def.phase, def.start_height)))
    }

    /// Move a phase to `completed`. Terminal.
    pub fn complete_phase(
        &self,
        phase: u32,
        reason: CompletionReason,
        at: u64,
    ) -> ChainIndexResult<PhaseStats> {
        let lock = self.phase_lock(phase);
        let _guard = lock.lock();
        let def = self.definition(phase)?;
        let stats = self.store.complete_phase(def, reason, at)?;
        tracing::info!(
            phase,
            reason = %reason,
            active = stats.active_stake_amount,
            overflow = stats.overflow_stake_amount,
            "Phase completed"
        );
        Ok(stats)
    }

    /// First completion trigger that holds for `phase`, if any.
    ///
    /// Checked in order: target reached, block height, timeout, inactivity.
    pub fn evaluate_completion(
        &self,
        phase: u32,
        now: u64,
        chain_height: u64,
    ) -> ChainIndexResult<Option<CompletionReason>> {
        let def = self.definition(phase)?;
        let stats = self.phase_stats(phase)?;
        Ok(completion_reason(def, &stats, now, chain_height))
    }

    /// Complete every phase whose trigger holds. Returns the phases completed.
    pub fn check_completion(&self, now: u64, chain_height: u64) -> ChainIndexResult<Vec<PhaseStats>> {
        let mut completed = Vec::new();
        for def in self.phases.phases() {
            let Some(reason) = self.evaluate_completion(def.phase, now, chain_height)? else {
                continue;
            };
            match self.complete_phase(def.phase, reason, now) {
                Ok(stats) => completed.push(stats),
                Err(ChainIndexError::PhaseAlreadyCompleted(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(completed)
    }
}

/// Pure admission pass over one batch.
///
/// Sorts by (timestamp, height, id) and marks each transaction against a
/// running active total that starts at `current_active`.
pub fn mark_batch(
    def: &PhaseDefinition,
    current_active: u64,
    completed: bool,
    mut batch: Vec<Transaction>,
) -> (Vec<Transaction>, BatchVerdict) {
    batch.sort_by(Transaction::admission_order);

    let Some(cap) = def.cap else {
        batch.iter_mut().for_each(Transaction::mark_active);
        return (batch, BatchVerdict::Admitted);
    };

    let verdict = if completed {
        BatchVerdict::PhaseClosed
    } else if current_active >= cap && batch.iter().any(|tx| tx.stake_amount > 0) {
        BatchVerdict::CapExhausted
    } else {
        BatchVerdict::Admitted
    };
    if verdict != BatchVerdict::Admitted {
        batch.iter_mut().for_each(Transaction::mark_overflow);
        return (batch, verdict);
    }

    let mut running = current_active;
    for tx in &mut batch {
        match running.checked_add(tx.stake_amount) {
            Some(would_be) if would_be <= cap => {
                tx.mark_active();
                running = would_be;
            }
            _ => tx.mark_overflow(),
        }
    }
    (batch, BatchVerdict::Admitted)
}

fn completion_reason(
    def: &PhaseDefinition,
    stats: &PhaseStats,
    now: u64,
    chain_height: u64,
) -> Option<CompletionReason> {
    if stats.is_completed() || chain_height < def.start_height {
        return None;
    }
    if def
        .completion_target()
        .is_some_and(|target| stats.active_stake_amount >= target)
    {
        return Some(CompletionReason::TargetReached);
    }
    if def.end_height.is_some_and(|end| chain_height >= end) {
        return Some(CompletionReason::BlockHeight);
    }
    if let (Some(timeout), Some(started)) = (def.timeout_secs, stats.started_at) {
        if now.saturating_sub(started) >= timeout {
            return Some(CompletionReason::Timeout);
        }
    }
    if let (Some(inactivity), Some(last)) = (def.inactivity_secs, stats.last_activity_at) {
        if now.saturating_sub(last) >= inactivity {
            return Some(CompletionReason::Inactivity);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PersistentIndex;
    use crate::types::test_utils::make_tx;

    fn accountant(cap: u64) -> PhaseCapAccountant<PersistentIndex> {
        let table = PhaseTable::new(vec![
            PhaseDefinition::uncapped(1, 100, 0).with_cap(cap),
            PhaseDefinition::uncapped(2, 10_000, 1),
        ])
        .unwrap();
        PhaseCapAccountant::new(
            Arc::new(PersistentIndex::in_memory().unwrap()),
            Arc::new(table),
        )
    }

    #[test]
    fn test_end_to_end_cap_scenario() {
        let accountant = accountant(1000);
        let outcome = accountant
            .admit_and_apply(
                1,
                vec![
                    make_tx("b", "B", "fp", 400, 2),
                    make_tx("a", "A", "fp", 700, 1),
                ],
            )
            .unwrap();

        let a = outcome.inserted.iter().find(|t| t.tx_id == "a").unwrap();
        let b = outcome.inserted.iter().find(|t| t.tx_id == "b").unwrap();
        assert!(!a.is_overflow);
        assert!(b.is_overflow);
        assert_eq!(b.overflow_amount, 400);
        assert!(!outcome.rejected_as_unit);
        assert_eq!(outcome.stats.active_stake_amount, 700);
        assert_eq!(outcome.stats.overflow_stake_amount, 400);
        assert_eq!(outcome.stats.total_stake_amount, 1100);
    }

    #[test]
    fn test_batch_order_does_not_change_marks() {
        let def = PhaseDefinition::uncapped(1, 0, 0).with_cap(10);
        let t1 = make_tx("t1", "s", "fp", 8, 5);
        let t2 = make_tx("t2", "s", "fp", 6, 3);

        let (forward, _) = mark_batch(&def, 0, false, vec![t1.clone(), t2.clone()]);
        let (reverse, _) = mark_batch(&def, 0, false, vec![t2, t1]);

        assert_eq!(forward, reverse);
        assert_eq!(forward[0].tx_id, "t2");
        assert!(!forward[0].is_overflow);
        assert!(forward[1].is_overflow);
    }

    #[test]
    fn test_smaller_later_transaction_still_fits() {
        let def = PhaseDefinition::uncapped(1, 0, 0).with_cap(10);
        let (marked, verdict) = mark_batch(
            &def,
            0,
            false,
            vec![
                make_tx("a", "s", "fp", 6, 1),
                make_tx("b", "s", "fp", 6, 2),
                make_tx("c", "s", "fp", 4, 3),
            ],
        );
        assert_eq!(verdict, BatchVerdict::Admitted);
        let flags: Vec<bool> = marked.iter().map(|t| t.is_overflow).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn test_exhausted_cap_rejects_batch_as_unit() {
        let accountant = accountant(100);
        accountant
            .admit_and_apply(1, vec![make_tx("a", "A", "fp", 100, 1)])
            .unwrap();

        let outcome = accountant
            .admit_and_apply(
                1,
                vec![make_tx("b", "B", "fp", 1, 2), make_tx("c", "C", "fp", 0, 3)],
            )
            .unwrap();

        assert!(outcome.rejected_as_unit);
        assert!(outcome.inserted.iter().all(|t| t.is_overflow));
        assert_eq!(outcome.stats.active_stake_amount, 100);
        assert_eq!(outcome.stats.overflow_stake_amount, 1);
        assert_eq!(outcome.stats.overflow_transaction_count, 2);
    }

    #[test]
    fn test_stale_admission_is_flipped_on_apply() {
        let accountant = accountant(1000);
        let admitted = accountant
            .admit(1, vec![make_tx("late", "L", "fp", 300, 9)])
            .unwrap();
        assert!(!admitted[0].is_overflow);

        accountant
            .admit_and_apply(1, vec![make_tx("first", "F", "fp", 800, 1)])
            .unwrap();

        let outcome = accountant.apply_to(1, admitted).unwrap();
        assert!(outcome.rejected_as_unit);
        assert!(outcome.inserted[0].is_overflow);
        assert_eq!(outcome.stats.active_stake_amount, 800);
        assert_eq!(outcome.stats.total_stake_amount, 1100);
    }

    fn phase_two_tx(id: &str, staker: &str, amount: u64, timestamp: u64) -> Transaction {
        let mut tx = make_tx(id, staker, "fp", amount, timestamp);
        tx.block_height = 10_000 + timestamp;
        tx.phase = 2;
        tx
    }

    #[test]
    fn test_uncapped_phase_is_always_active() {
        let accountant = accountant(1);
        let outcome = accountant
            .admit_and_apply(
                2,
                vec![phase_two_tx("a", "A", 5000, 1), phase_two_tx("b", "B", 9000, 2)],
            )
            .unwrap();
        assert!(outcome.inserted.iter().all(|t| !t.is_overflow));
        assert_eq!(outcome.stats.active_stake_amount, 14_000);
        assert_eq!(outcome.stats.unique_staker_count, 2);
    }

    #[test]
    fn test_reingestion_leaves_stats_unchanged() {
        let accountant = accountant(1000);
        let batch = vec![make_tx("a", "A", "fp", 700, 1)];
        let first = accountant.admit_and_apply(1, batch.clone()).unwrap();
        let second = accountant.admit_and_apply(1, batch).unwrap();

        assert!(second.inserted.is_empty());
        assert_eq!(second.duplicates, vec!["a".to_string()]);
        assert_eq!(first.stats, accountant.phase_stats(1).unwrap());
    }

    #[test]
    fn test_known_ids_do_not_consume_cap() {
        let accountant = accountant(1000);
        accountant
            .admit_and_apply(1, vec![make_tx("a", "A", "fp", 600, 1)])
            .unwrap();

        // "a" again (already logged) and "b" twice would otherwise push "c" over.
        let outcome = accountant
            .admit_and_apply(
                1,
                vec![
                    make_tx("a", "A", "fp", 600, 1),
                    make_tx("b", "B", "fp", 300, 2),
                    make_tx("b", "B", "fp", 300, 2),
                    make_tx("c", "C", "fp", 100, 3),
                ],
            )
            .unwrap();

        assert_eq!(outcome.inserted.len(), 2);
        assert!(outcome.inserted.iter().all(|t| !t.is_overflow));
        assert_eq!(outcome.duplicates.len(), 2);
        assert_eq!(outcome.stats.active_stake_amount, 1000);
    }

    #[test]
    fn test_transactions_of_another_phase_are_rejected() {
        let accountant = accountant(1000);

        // Tagged phase 1 but submitted for phase 2.
        let err = accountant
            .admit_and_apply(2, vec![make_tx("a", "A", "fp", 5, 1)])
            .unwrap_err();
        assert!(matches!(
            err,
            ChainIndexError::PhaseMismatch { ref tx_id, expected: 2, found: 1, height: 101 } if tx_id == "a"
        ));

        // Tagged phase 2 but at a phase 1 height.
        let mut low = make_tx("b", "B", "fp", 5, 2);
        low.phase = 2;
        assert!(matches!(
            accountant.admit_and_apply(2, vec![phase_two_tx("ok", "C", 1, 1), low]),
            Err(ChainIndexError::PhaseMismatch { expected: 2, found: 2, .. })
        ));
        assert!(matches!(
            accountant.apply_to(1, vec![phase_two_tx("c", "C", 1, 3)]),
            Err(ChainIndexError::PhaseMismatch { expected: 1, found: 2, .. })
        ));

        // Nothing was committed.
        assert_eq!(accountant.phase_stats(2).unwrap().total_transaction_count, 0);
        assert_eq!(accountant.phase_stats(1).unwrap().total_transaction_count, 0);
    }

    #[test]
    fn test_unknown_phase_is_an_error() {
        let accountant = accountant(10);
        assert!(matches!(
            accountant.admit(9, vec![]),
            Err(ChainIndexError::PhaseNotFound(9))
        ));
    }

    #[test]
    fn test_completion_triggers_in_order() {
        let table = PhaseTable::new(vec![PhaseDefinition {
            phase: 1,
            start_height: 100,
            end_height: Some(500),
            protocol_version: 0,
            cap: Some(1000),
            target_stake: None,
            timeout_secs: Some(1_000),
            inactivity_secs: Some(50),
        }])
        .unwrap();
        let accountant = PhaseCapAccountant::new(
            Arc::new(PersistentIndex::in_memory().unwrap()),
            Arc::new(table),
        );

        // Not started yet.
        assert_eq!(accountant.evaluate_completion(1, 10_000, 99).unwrap(), None);
        // Started, no activity recorded: only block height applies.
        assert_eq!(accountant.evaluate_completion(1, 10_000, 200).unwrap(), None);
        assert_eq!(
            accountant.evaluate_completion(1, 10_000, 500).unwrap(),
            Some(CompletionReason::BlockHeight)
        );

        accountant
            .admit_and_apply(1, vec![make_tx("a", "A", "fp", 10, 100)])
            .unwrap();
        assert_eq!(accountant.evaluate_completion(1, 120, 300).unwrap(), None);
        assert_eq!(
            accountant.evaluate_completion(1, 150, 300).unwrap(),
            Some(CompletionReason::Inactivity)
        );
        assert_eq!(
            accountant.evaluate_completion(1, 1_100, 300).unwrap(),
            Some(CompletionReason::Timeout)
        );

        accountant
            .admit_and_apply(1, vec![make_tx("b", "B", "fp", 990, 101)])
            .unwrap();
        assert_eq!(
            accountant.evaluate_completion(1, 1_100, 500).unwrap(),
            Some(CompletionReason::TargetReached)
        );

        let completed = accountant.check_completion(1_100, 500).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].completion_reason, Some(CompletionReason::TargetReached));
        assert!(accountant.check_completion(2_000, 600).unwrap().is_empty());
    }

    #[test]
    fn test_completed_capped_phase_takes_no_more_active_stake() {
        let accountant = accountant(1000);
        accountant
            .complete_phase(1, CompletionReason::Timeout, 5)
            .unwrap();
        let outcome = accountant
            .admit_and_apply(1, vec![make_tx("a", "A", "fp", 1, 10)])
            .unwrap();
        assert!(outcome.inserted[0].is_overflow);
        assert_eq!(outcome.stats.active_stake_amount, 0);
        assert!(matches!(
            accountant.complete_phase(1, CompletionReason::Inactivity, 6),
            Err(ChainIndexError::PhaseAlreadyCompleted(1))
        ));
    }

    #[test]
    fn test_concurrent_admission_respects_cap() {
        let accountant = Arc::new(accountant(1_000));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let accountant = Arc::clone(&accountant);
                std::thread::spawn(move || {
                    for round in 0..5u64 {
                        let id = format!("w{worker}-r{round}");
                        let staker = format!("s{worker}");
                        accountant
                            .admit_and_apply(1, vec![make_tx(&id, &staker, "fp", 60, round)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = accountant.phase_stats(1).unwrap();
        assert_eq!(stats.total_transaction_count, 40);
        assert!(stats.active_stake_amount <= 1_000);
        assert_eq!(stats.active_stake_amount, 960);
        assert_eq!(
            stats.active_stake_amount + stats.overflow_stake_amount,
            stats.total_stake_amount
        );
    }
}
