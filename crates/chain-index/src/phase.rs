//! Static phase boundary table.
//!
//! A phase is a contiguous range of block heights. Phase `n` covers
//! `[start_n, start_{n+1})`; the last configured phase is open-ended. Heights
//! below the first boundary belong to an implicit, uncapped phase 0.

use serde::{Deserialize, Serialize};

use crate::error::{ChainIndexError, ChainIndexResult};

/// One row of the phase boundary table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseDefinition {
    pub phase: u32,
    pub start_height: u64,
    /// Height at which the phase completes with `block_height`.
    #[serde(default)]
    pub end_height: Option<u64>,
    pub protocol_version: u32,
    /// Global cap on active stake. `None` means every transaction is active.
    #[serde(default)]
    pub cap: Option<u64>,
    /// Active stake at which the phase completes with `target_reached`.
    /// Falls back to `cap` when unset.
    #[serde(default)]
    pub target_stake: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub inactivity_secs: Option<u64>,
}

impl PhaseDefinition {
    /// Uncapped phase with no completion triggers.
    pub fn uncapped(phase: u32, start_height: u64, protocol_version: u32) -> Self {
        Self {
            phase,
            start_height,
            end_height: None,
            protocol_version,
            cap: None,
            target_stake: None,
            timeout_secs: None,
            inactivity_secs: None,
        }
    }

    pub fn with_cap(mut self, cap: u64) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn with_end_height(mut self, end_height: u64) -> Self {
        self.end_height = Some(end_height);
        self
    }

    pub fn is_capped(&self) -> bool {
        self.cap.is_some()
    }

    /// Active stake that completes the phase, if any.
    pub fn completion_target(&self) -> Option<u64> {
        self.target_stake.or(self.cap)
    }
}

/// Boundary table resolving heights to phases.
#[derive(Debug, Clone)]
pub struct PhaseTable {
    /// Sorted by `start_height`, strictly increasing.
    phases: Vec<PhaseDefinition>,
    genesis: PhaseDefinition,
}

impl PhaseTable {
    /// Build a table from configured phases.
    ///
    /// Rejects duplicate phase numbers, non-increasing boundaries, more than
    /// one capped phase and a phase 0 that does not start at height 0.
    pub fn new(mut phases: Vec<PhaseDefinition>) -> ChainIndexResult<Self> {
        phases.sort_by_key(|p| p.start_height);

        for pair in phases.windows(2) {
            if pair[0].start_height == pair[1].start_height {
                return Err(ChainIndexError::InvalidPhaseTable(format!(
                    "phases {} and {} share start height {}",
                    pair[0].phase, pair[1].phase, pair[0].start_height
                )));
            }
        }

        let mut numbers: Vec<u32> = phases.iter().map(|p| p.phase).collect();
        numbers.sort_unstable();
        if numbers.windows(2).any(|w| w[0] == w[1]) {
            return Err(ChainIndexError::InvalidPhaseTable(
                "duplicate phase number".to_string(),
            ));
        }

        if phases.iter().filter(|p| p.is_capped()).count() > 1 {
            return Err(ChainIndexError::InvalidPhaseTable(
                "at most one phase may carry a cap".to_string(),
            ));
        }

        if let Some(zero) = phases.iter().find(|p| p.phase == 0) {
            if zero.start_height != 0 {
                return Err(ChainIndexError::InvalidPhaseTable(
                    "phase 0 must start at height 0".to_string(),
                ));
            }
        }

        for p in &phases {
            if let Some(end) = p.end_height {
                if end < p.start_height {
                    return Err(ChainIndexError::InvalidPhaseTable(format!(
                        "phase {} ends at {} before it starts at {}",
                        p.phase, end, p.start_height
                    )));
                }
            }
        }

        let genesis_version = phases.first().map(|p| p.protocol_version).unwrap_or(0);
        Ok(Self {
            phases,
            genesis: PhaseDefinition::uncapped(0, 0, genesis_version),
        })
    }

    /// Phase that owns `height`.
    pub fn resolve(&self, height: u64) -> &PhaseDefinition {
        let idx = self.phases.partition_point(|p| p.start_height <= height);
        if idx == 0 {
            &self.genesis
        } else {
            &self.phases[idx - 1]
        }
    }

    /// Definition by phase number.
    pub fn get(&self, phase: u32) -> Option<&PhaseDefinition> {
        if let Some(def) = self.phases.iter().find(|p| p.phase == phase) {
            return Some(def);
        }
        (phase == 0).then_some(&self.genesis)
    }

    /// The single capped phase, if configured.
    pub fn capped_phase(&self) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.is_capped())
    }

    /// Configured phases in boundary order.
    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }
}
