//! Types for the append-only transaction log and per-phase statistics.
//!
//! Amounts are integers in the smallest unit of the staked asset. Timestamps
//! are Unix seconds taken from the block that carried the transaction.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{ChainIndexError, ChainIndexResult};

/// Accepted staking transaction as stored in the log.
///
/// Immutable once written except for the overflow fields, which admission
/// sets exactly once before the row is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Natural dedup key.
    pub tx_id: String,
    /// Height of the block that included the transaction.
    pub block_height: u64,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
    /// Staked amount in the smallest unit.
    pub stake_amount: u64,
    /// Staker address.
    pub staker_address: String,
    /// Finality providers the stake is delegated to (at least one).
    pub finality_providers: Vec<String>,
    /// Staking protocol version of the phase the transaction landed in.
    pub protocol_version: u32,
    /// Phase number derived from `block_height`.
    pub phase: u32,
    /// Excluded from active stake by the phase cap.
    #[serde(default)]
    pub is_overflow: bool,
    /// Equals `stake_amount` when `is_overflow`, zero otherwise.
    #[serde(default)]
    pub overflow_amount: u64,
}

impl Transaction {
    /// Amount that counts toward active stake.
    pub fn active_amount(&self) -> u64 {
        if self.is_overflow {
            0
        } else {
            self.stake_amount
        }
    }

    /// Mark the transaction as overflow.
    pub fn mark_overflow(&mut self) {
        self.is_overflow = true;
        self.overflow_amount = self.stake_amount;
    }

    /// Mark the transaction as active.
    pub fn mark_active(&mut self) {
        self.is_overflow = false;
        self.overflow_amount = 0;
    }

    /// Order used for admission and rebuilds: timestamp, then height, then id.
    pub fn admission_order(a: &Transaction, b: &Transaction) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.block_height.cmp(&b.block_height))
            .then_with(|| a.tx_id.cmp(&b.tx_id))
    }
}

/// Lifecycle of a phase. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Active,
    Completed,
}

/// Why a phase was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    TargetReached,
    Timeout,
    Inactivity,
    BlockHeight,
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionReason::TargetReached => "target_reached",
            CompletionReason::Timeout => "timeout",
            CompletionReason::Inactivity => "inactivity",
            CompletionReason::BlockHeight => "block_height",
        };
        f.write_str(s)
    }
}

/// Running totals for one phase.
///
/// `active_stake_amount + overflow_stake_amount == total_stake_amount` holds
/// after every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStats {
    pub phase: u32,
    pub start_height: u64,
    pub current_height: u64,
    pub total_stake_amount: u64,
    pub active_stake_amount: u64,
    pub overflow_stake_amount: u64,
    pub total_transaction_count: u64,
    pub active_transaction_count: u64,
    pub overflow_transaction_count: u64,
    pub unique_staker_count: u64,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    /// Timestamp of the earliest transaction recorded in the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Timestamp of the latest transaction recorded in the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl PhaseStats {
    /// Empty statistics for a phase starting at `start_height`.
    pub fn new(phase: u32, start_height: u64) -> Self {
        Self {
            phase,
            start_height,
            current_height: start_height,
            total_stake_amount: 0,
            active_stake_amount: 0,
            overflow_stake_amount: 0,
            total_transaction_count: 0,
            active_transaction_count: 0,
            overflow_transaction_count: 0,
            unique_staker_count: 0,
            status: PhaseStatus::Active,
            completion_reason: None,
            started_at: None,
            last_activity_at: None,
            completed_at: None,
        }
    }

    /// Add one admitted transaction to the counters.
    ///
    /// `unique_staker_count` is left alone; it is recomputed from the log.
    pub fn record(&mut self, tx: &Transaction) -> ChainIndexResult<()> {
        self.total_stake_amount =
            checked_add(self.total_stake_amount, tx.stake_amount, "total_stake_amount")?;
        self.total_transaction_count += 1;
        if tx.is_overflow {
            self.overflow_stake_amount =
                checked_add(self.overflow_stake_amount, tx.overflow_amount, "overflow_stake_amount")?;
            self.overflow_transaction_count += 1;
        } else {
            self.active_stake_amount =
                checked_add(self.active_stake_amount, tx.stake_amount, "active_stake_amount")?;
            self.active_transaction_count += 1;
        }
        self.current_height = self.current_height.max(tx.block_height);
        self.started_at = Some(self.started_at.map_or(tx.timestamp, |t| t.min(tx.timestamp)));
        self.last_activity_at =
            Some(self.last_activity_at.map_or(tx.timestamp, |t| t.max(tx.timestamp)));
        Ok(())
    }

    /// Transition `active -> completed`.
    pub fn complete(&mut self, reason: CompletionReason, at: u64) -> ChainIndexResult<()> {
        if self.status == PhaseStatus::Completed {
            return Err(ChainIndexError::PhaseAlreadyCompleted(self.phase));
        }
        self.status = PhaseStatus::Completed;
        self.completion_reason = Some(reason);
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }
}

/// Range of heights the sync could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRange {
    /// First skipped height (inclusive).
    pub from_height: u64,
    /// Last skipped height (inclusive).
    pub to_height: u64,
    pub reason: SkipReason,
    /// Wall-clock Unix seconds when the skip was recorded.
    pub recorded_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Node pruned the heights.
    Pruned,
    /// Batch kept failing after all retries.
    RetriesExhausted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Pruned => "pruned",
            SkipReason::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pruned" => Some(SkipReason::Pruned),
            "retries_exhausted" => Some(SkipReason::RetriesExhausted),
            _ => None,
        }
    }
}

pub(crate) fn checked_add(a: u64, b: u64, field: &'static str) -> ChainIndexResult<u64> {
    a.checked_add(b).ok_or(ChainIndexError::ArithmeticOverflow(field))
}


#[cfg(test)]
mod tests {
    use super::test_utils::make_tx;
    use super::*;

    #[test]
    fn test_overflow_marking_sets_amount() {
        let mut tx = make_tx("a", "s", "p", 50, 1);
        assert_eq!(tx.active_amount(), 50);

        tx.mark_overflow();
        assert!(tx.is_overflow);
        assert_eq!(tx.overflow_amount, 50);
        assert_eq!(tx.active_amount(), 0);
    }

    #[test]
    fn test_admission_order_breaks_timestamp_ties() {
        let mut a = make_tx("b", "s", "p", 1, 5);
        let mut b = make_tx("a", "s", "p", 1, 5);
        a.block_height = 10;
        b.block_height = 10;
        assert_eq!(Transaction::admission_order(&a, &b), Ordering::Greater);

        let later = make_tx("0", "s", "p", 1, 6);
        assert_eq!(Transaction::admission_order(&later, &a), Ordering::Greater);
    }

    #[test]
    fn test_phase_stats_record_keeps_sum_invariant() {
        let mut stats = PhaseStats::new(1, 100);
        let active = make_tx("a", "s", "p", 700, 1);
        let mut overflow = make_tx("b", "s", "p", 400, 2);
        overflow.mark_overflow();

        stats.record(&active).unwrap();
        stats.record(&overflow).unwrap();

        assert_eq!(stats.active_stake_amount, 700);
        assert_eq!(stats.overflow_stake_amount, 400);
        assert_eq!(stats.total_stake_amount, 1100);
        assert_eq!(stats.total_transaction_count, 2);
        assert_eq!(stats.active_transaction_count, 1);
        assert_eq!(stats.overflow_transaction_count, 1);
        assert_eq!(stats.started_at, Some(1));
        assert_eq!(stats.last_activity_at, Some(2));
        assert_eq!(stats.current_height, 102);
    }

    #[test]
    fn test_completion_is_terminal() {
        let mut stats = PhaseStats::new(2, 0);
        stats.complete(CompletionReason::Timeout, 10).unwrap();
        assert!(stats.is_completed());

        let err = stats.complete(CompletionReason::TargetReached, 11).unwrap_err();
        assert!(matches!(err, ChainIndexError::PhaseAlreadyCompleted(2)));
        assert_eq!(stats.completion_reason, Some(CompletionReason::Timeout));
        assert_eq!(stats.completed_at, Some(10));
    }

    #[test]
    fn test_record_detects_overflow() {
        let mut stats = PhaseStats::new(1, 0);
        stats.total_stake_amount = u64::MAX;
        let tx = make_tx("a", "s", "p", 1, 1);
        assert!(matches!(
            stats.record(&tx),
            Err(ChainIndexError::ArithmeticOverflow("total_stake_amount"))
        ));
    }
}
