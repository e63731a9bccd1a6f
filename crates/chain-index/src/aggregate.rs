//! Per-staker and per-finality-provider aggregate documents.
//!
//! Both the incremental path and the full rebuild fold transactions through
//! [`StakerAggregate::record`] and [`FinalityProviderAggregate::record`]. Every
//! update is a sum, a count, a set union or a min/max, so the result does not
//! depend on the order transactions are folded in.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ChainIndexResult;
use crate::types::{checked_add, Transaction};

/// Per-phase slice of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseBreakdown {
    pub phase: u32,
    /// Active stake only.
    pub total_stake: u64,
    /// All transactions, active and overflow.
    pub transaction_count: u64,
    /// Active stake per counterparty: providers for a staker, stakers for a
    /// provider.
    pub stakes: BTreeMap<String, u64>,
}

impl PhaseBreakdown {
    fn new(phase: u32) -> Self {
        Self {
            phase,
            total_stake: 0,
            transaction_count: 0,
            stakes: BTreeMap::new(),
        }
    }

    fn record<'a>(
        &mut self,
        tx: &Transaction,
        counterparties: impl Iterator<Item = &'a str>,
    ) -> ChainIndexResult<()> {
        let active = tx.active_amount();
        self.total_stake = checked_add(self.total_stake, active, "phase_breakdown.total_stake")?;
        self.transaction_count += 1;
        for counterparty in counterparties {
            let entry = self.stakes.entry(counterparty.to_string()).or_insert(0);
            *entry = checked_add(*entry, active, "phase_breakdown.stakes")?;
        }
        Ok(())
    }
}

fn breakdown_for(breakdowns: &mut Vec<PhaseBreakdown>, phase: u32) -> &mut PhaseBreakdown {
    let idx = match breakdowns.binary_search_by_key(&phase, |b| b.phase) {
        Ok(idx) => idx,
        Err(idx) => {
            breakdowns.insert(idx, PhaseBreakdown::new(phase));
            idx
        }
    };
    &mut breakdowns[idx]
}

/// Derived totals for one staker address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakerAggregate {
    pub address: String,
    /// Sum over active transactions only.
    pub total_stake: u64,
    pub transaction_count: u64,
    pub active_stake_count: u64,
    pub finality_providers: BTreeSet<String>,
    pub protocol_versions: BTreeSet<u32>,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Sorted by phase.
    pub phase_breakdown: Vec<PhaseBreakdown>,
}

impl StakerAggregate {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            total_stake: 0,
            transaction_count: 0,
            active_stake_count: 0,
            finality_providers: BTreeSet::new(),
            protocol_versions: BTreeSet::new(),
            first_seen: 0,
            last_seen: 0,
            phase_breakdown: Vec::new(),
        }
    }

    /// Fold one transaction into the aggregate.
    pub fn record(&mut self, tx: &Transaction) -> ChainIndexResult<()> {
        self.total_stake =
            checked_add(self.total_stake, tx.active_amount(), "staker.total_stake")?;
        if !tx.is_overflow {
            self.active_stake_count += 1;
        }
        self.finality_providers
            .extend(tx.finality_providers.iter().cloned());
        self.protocol_versions.insert(tx.protocol_version);
        (self.first_seen, self.last_seen) =
            seen_window(self.transaction_count, self.first_seen, self.last_seen, tx.timestamp);
        self.transaction_count += 1;

        breakdown_for(&mut self.phase_breakdown, tx.phase)
            .record(tx, distinct_providers(tx).into_iter())
    }

    pub fn phase(&self, phase: u32) -> Option<&PhaseBreakdown> {
        self.phase_breakdown
            .binary_search_by_key(&phase, |b| b.phase)
            .ok()
            .map(|idx| &self.phase_breakdown[idx])
    }
}

/// Derived totals for one finality provider address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalityProviderAggregate {
    pub address: String,
    /// Sum over active transactions only.
    pub total_stake: u64,
    pub transaction_count: u64,
    pub active_stake_count: u64,
    pub stakers: BTreeSet<String>,
    pub protocol_versions: BTreeSet<u32>,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Sorted by phase.
    pub phase_breakdown: Vec<PhaseBreakdown>,
}

impl FinalityProviderAggregate {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            total_stake: 0,
            transaction_count: 0,
            active_stake_count: 0,
            stakers: BTreeSet::new(),
            protocol_versions: BTreeSet::new(),
            first_seen: 0,
            last_seen: 0,
            phase_breakdown: Vec::new(),
        }
    }

    /// Fold one transaction delegated to this provider.
    ///
    /// The full active amount is attributed to every provider the
    /// transaction names.
    pub fn record(&mut self, tx: &Transaction) -> ChainIndexResult<()> {
        self.total_stake =
            checked_add(self.total_stake, tx.active_amount(), "provider.total_stake")?;
        if !tx.is_overflow {
            self.active_stake_count += 1;
        }
        self.stakers.insert(tx.staker_address.clone());
        self.protocol_versions.insert(tx.protocol_version);
        (self.first_seen, self.last_seen) =
            seen_window(self.transaction_count, self.first_seen, self.last_seen, tx.timestamp);
        self.transaction_count += 1;

        breakdown_for(&mut self.phase_breakdown, tx.phase)
            .record(tx, std::iter::once(tx.staker_address.as_str()))
    }

    pub fn phase(&self, phase: u32) -> Option<&PhaseBreakdown> {
        self.phase_breakdown
            .binary_search_by_key(&phase, |b| b.phase)
            .ok()
            .map(|idx| &self.phase_breakdown[idx])
    }
}

fn seen_window(count: u64, first: u64, last: u64, timestamp: u64) -> (u64, u64) {
    if count == 0 {
        (timestamp, timestamp)
    } else {
        (first.min(timestamp), last.max(timestamp))
    }
}

/// Distinct provider addresses named by a transaction.
pub fn distinct_providers(tx: &Transaction) -> BTreeSet<&str> {
    tx.finality_providers.iter().map(String::as_str).collect()
}
