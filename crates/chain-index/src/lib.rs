//! Staking transaction log, phase-capped accounting and derived aggregates.
//!
//! This crate owns everything below the chain client: the append-only log of
//! accepted staking transactions, the per-phase admission cap, the per-address
//! aggregates derived from the log and the cached read side.
//!
//! # Architecture
//!
//! ```text
//!                  ingestion (stakeidx-sync)
//!                            │
//!              ┌─────────────▼─────────────┐
//!              │    PhaseCapAccountant     │  admit + commit, per-phase lock
//!              └─────────────┬─────────────┘
//!                            │
//!              ┌─────────────▼─────────────┐
//!              │      TransactionLog       │  SQLite (PersistentIndex)
//!              └─────────────┬─────────────┘
//!                            │
//!              ┌─────────────▼─────────────┐
//!              │    AggregateReindexer     │  incremental or full rebuild
//!              └─────────────┬─────────────┘
//!                            │
//!              ┌─────────────▼─────────────┐
//!              │   StakingQueryService     │  RevalidatingCache per document
//!              └───────────────────────────┘
//! ```

pub mod accountant;
pub mod aggregate;
pub mod cache;
pub mod clock;
pub mod error;
pub mod phase;
pub mod reindexer;
pub mod service;
pub mod store;
pub mod types;

pub use accountant::{AdmissionOutcome, BatchVerdict, PhaseCapAccountant};
pub use aggregate::{FinalityProviderAggregate, PhaseBreakdown, StakerAggregate};
pub use cache::{
    cache_key, CacheConfig, CacheError, CacheEvent, CacheObserver, CacheResult, CacheStats,
    RevalidatingCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ChainIndexError, ChainIndexResult};
pub use phase::{PhaseDefinition, PhaseTable};
pub use reindexer::{AggregateReindexer, CatchUpReport, RebuildReport};
pub use service::{CacheInvalidation, StakingQueryService};
pub use store::{
    AdmissionCommit, AdmissionReceipt, AggregateStore, IndexStore, LogEntry, PersistentIndex,
    SyncStateStore, TransactionLog,
};
pub use types::*;
