//! Transaction log and aggregate store.
//!
//! The traits define what the accountant, reindexer and sync layer need from
//! persistence. `PersistentIndex` implements them on SQLite with a connection
//! pool (r2d2) for concurrent reads and a dedicated writer connection. Every
//! multi-row mutation runs inside one SQLite transaction on the writer.

use std::collections::HashSet;

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::aggregate::{distinct_providers, FinalityProviderAggregate, StakerAggregate};
use crate::error::{ChainIndexError, ChainIndexResult};
use crate::phase::PhaseDefinition;
use crate::types::{
    checked_add, CompletionReason, PhaseStats, SkipReason, SkippedRange, Transaction,
};

const STAKERS: &str = "stakers";
const PROVIDERS: &str = "finality_providers";

/// Log row together with its aggregation marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub transaction: Transaction,
    /// Set once the row has been folded into the aggregates.
    pub aggregated: bool,
}

/// Admission decisions for one phase, ready to be persisted.
#[derive(Debug, Clone)]
pub struct AdmissionCommit {
    pub phase: PhaseDefinition,
    /// Sorted in admission order with overflow fields populated.
    pub transactions: Vec<Transaction>,
}

/// Outcome of persisting an admitted batch.
#[derive(Debug, Clone)]
pub struct AdmissionReceipt {
    /// Rows actually written, with their final overflow marks.
    pub inserted: Vec<Transaction>,
    /// Ids that were already in the log (or repeated within the batch).
    pub duplicates: Vec<String>,
    /// The stored active total moved since admission and the batch was
    /// flipped to overflow as a unit.
    pub cap_conflict: bool,
    /// Phase statistics after the commit.
    pub stats: PhaseStats,
}

/// Append-only log of accepted staking transactions.
///
/// All methods are synchronous to avoid Send bound issues with the storage layer.
pub trait TransactionLog: Send + Sync {
    /// Whether a transaction with this id is already logged.
    fn contains(&self, tx_id: &str) -> ChainIndexResult<bool>;

    /// Get a transaction by id.
    fn get_transaction(&self, tx_id: &str) -> ChainIndexResult<Option<Transaction>>;

    /// Height of the highest logged transaction.
    fn latest_transaction_height(&self) -> ChainIndexResult<Option<u64>>;

    /// Number of logged transactions.
    fn transaction_count(&self) -> ChainIndexResult<u64>;

    /// Distinct staker addresses in the log, sorted.
    fn staker_addresses(&self) -> ChainIndexResult<Vec<String>>;

    /// Distinct finality provider addresses in the log, sorted.
    fn provider_addresses(&self) -> ChainIndexResult<Vec<String>>;

    /// Rows of one staker in admission order.
    fn staker_entries(&self, address: &str) -> ChainIndexResult<Vec<LogEntry>>;

    /// Rows delegated to one finality provider in admission order.
    fn provider_entries(&self, address: &str) -> ChainIndexResult<Vec<LogEntry>>;

    /// Ids of rows not yet folded into the aggregates, oldest first.
    fn pending_aggregation(&self, limit: usize) -> ChainIndexResult<Vec<String>>;

    /// Persist an admitted batch and update its phase statistics atomically.
    ///
    /// Rows whose id is already logged are skipped. For a capped phase the
    /// stored active total is re-read inside the write; if the batch's
    /// active stake no longer fits under the cap every row is flipped to
    /// overflow.
    fn commit_admission(&self, commit: AdmissionCommit) -> ChainIndexResult<AdmissionReceipt>;
}

/// Derived documents: phase statistics and per-address aggregates.
pub trait AggregateStore: Send + Sync {
    fn get_phase_stats(&self, phase: u32) -> ChainIndexResult<Option<PhaseStats>>;

    fn list_phase_stats(&self) -> ChainIndexResult<Vec<PhaseStats>>;

    /// Move a phase to `completed`. Errors if it already is.
    fn complete_phase(
        &self,
        phase: &PhaseDefinition,
        reason: CompletionReason,
        at: u64,
    ) -> ChainIndexResult<PhaseStats>;

    fn get_staker(&self, address: &str) -> ChainIndexResult<Option<StakerAggregate>>;

    fn get_finality_provider(
        &self,
        address: &str,
    ) -> ChainIndexResult<Option<FinalityProviderAggregate>>;

    /// Fold one logged row into its staker and provider aggregates.
    ///
    /// Claims the row's aggregation marker in the same write, so a row is
    /// applied at most once. Returns `false` if it was already applied.
    fn apply_incremental(&self, tx_id: &str) -> ChainIndexResult<bool>;

    /// Replace a staker document with a rebuilt one.
    ///
    /// `folded` lists the rows the rebuild covered; rows applied
    /// incrementally since then are folded in before the write.
    fn swap_staker(
        &self,
        aggregate: StakerAggregate,
        folded: &HashSet<String>,
    ) -> ChainIndexResult<StakerAggregate>;

    /// Provider counterpart of [`AggregateStore::swap_staker`].
    fn swap_finality_provider(
        &self,
        aggregate: FinalityProviderAggregate,
        folded: &HashSet<String>,
    ) -> ChainIndexResult<FinalityProviderAggregate>;
}

/// Sync progress bookkeeping.
pub trait SyncStateStore: Send + Sync {
    /// Last height the historical backfill completed.
    fn sync_cursor(&self) -> ChainIndexResult<Option<u64>>;

    fn set_sync_cursor(&self, height: u64) -> ChainIndexResult<()>;

    fn record_skipped_range(&self, range: &SkippedRange) -> ChainIndexResult<()>;

    fn skipped_ranges(&self) -> ChainIndexResult<Vec<SkippedRange>>;
}

/// Everything the indexing pipeline needs from one store.
pub trait IndexStore: TransactionLog + AggregateStore + SyncStateStore {}

impl<T: TransactionLog + AggregateStore + SyncStateStore> IndexStore for T {}

/// Persistent index backed by SQLite.
///
/// Uses a connection pool for concurrent reads and a dedicated writer connection
/// for serialized writes. SQLite WAL mode allows readers to proceed without
/// blocking the writer and vice versa.
pub struct PersistentIndex {
    /// Connection pool for read operations (concurrent).
    read_pool: Pool<SqliteConnectionManager>,
    /// Dedicated connection for write operations (serialized).
    writer: Mutex<Connection>,
}

/// Configure a connection with standard PRAGMAs for WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )
}

impl PersistentIndex {
    /// Open (or create) an on-disk index.
    pub fn new(db_path: impl AsRef<std::path::Path>, read_pool_size: u32) -> ChainIndexResult<Self> {
        let writer = Connection::open(&db_path)?;
        configure_connection(&writer)?;

        let manager = SqliteConnectionManager::file(&db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(|conn| configure_connection(conn));
        let read_pool = Pool::builder()
            .max_size(read_pool_size.max(1))
            .build(manager)?;

        let index = Self {
            read_pool,
            writer: Mutex::new(writer),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// Create an in-memory index for testing.
    ///
    /// In-memory SQLite DBs are per-connection, so tests use a named
    /// shared-cache database that every pooled connection attaches to.
    /// Readers run with `read_uncommitted` so they never take shared-cache
    /// table locks that would block the writer.
    pub fn in_memory() -> ChainIndexResult<Self> {
        let uri = format!("file:stakeidx_{}?mode=memory&cache=shared", unique_id());
        let writer = Connection::open(&uri)?;
        configure_connection(&writer)?;

        let manager = SqliteConnectionManager::file(&uri).with_init(|conn| {
            configure_connection(conn)?;
            conn.execute_batch("PRAGMA read_uncommitted=true;")
        });
        let read_pool = Pool::builder().max_size(2).build(manager)?;

        let index = Self {
            read_pool,
            writer: Mutex::new(writer),
        };
        index.init_schema()?;
        Ok(index)
    }

    /// Get a read connection from the pool.
    fn read_conn(&self) -> ChainIndexResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.read_pool.get()?)
    }

    /// Log the current state of the index.
    pub fn initialize(&self) -> ChainIndexResult<()> {
        let count = self.transaction_count()?;
        match self.latest_transaction_height()? {
            Some(height) => tracing::info!(
                transactions = count,
                latest_height = height,
                "Staking index initialized"
            ),
            None => tracing::info!("Staking index initialized (empty)"),
        }
        Ok(())
    }

    fn init_schema(&self) -> ChainIndexResult<()> {
        let conn = self.writer.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transactions (
                 tx_id TEXT PRIMARY KEY,
                 block_height INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL,
                 stake_amount INTEGER NOT NULL,
                 staker_address TEXT NOT NULL,
                 finality_providers TEXT NOT NULL,
                 protocol_version INTEGER NOT NULL,
                 phase INTEGER NOT NULL,
                 is_overflow INTEGER NOT NULL DEFAULT 0,
                 overflow_amount INTEGER NOT NULL DEFAULT 0,
                 aggregated INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_tx_order ON transactions(timestamp, block_height, tx_id);
             CREATE INDEX IF NOT EXISTS idx_tx_staker ON transactions(staker_address);
             CREATE INDEX IF NOT EXISTS idx_tx_phase_height ON transactions(phase, block_height);
             CREATE INDEX IF NOT EXISTS idx_tx_pending ON transactions(aggregated);

             CREATE TABLE IF NOT EXISTS transaction_providers (
                 tx_id TEXT NOT NULL,
                 provider_address TEXT NOT NULL,
                 PRIMARY KEY (tx_id, provider_address),
                 FOREIGN KEY (tx_id) REFERENCES transactions(tx_id)
             );
             CREATE INDEX IF NOT EXISTS idx_tp_provider ON transaction_providers(provider_address);

             CREATE TABLE IF NOT EXISTS phase_stats (
                 phase INTEGER PRIMARY KEY,
                 document BLOB NOT NULL
             );

             CREATE TABLE IF NOT EXISTS stakers (
                 address TEXT PRIMARY KEY,
                 document BLOB NOT NULL
             );

             CREATE TABLE IF NOT EXISTS finality_providers (
                 address TEXT PRIMARY KEY,
                 document BLOB NOT NULL
             );

             CREATE TABLE IF NOT EXISTS skipped_ranges (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 from_height INTEGER NOT NULL,
                 to_height INTEGER NOT NULL,
                 reason TEXT NOT NULL,
                 recorded_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS metadata (
                 key TEXT PRIMARY KEY,
                 value BLOB NOT NULL
             );",
        )?;
        Ok(())
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
        let tx_id: String = row.get(0)?;
        let block_height: i64 = row.get(1)?;
        let timestamp: i64 = row.get(2)?;
        let stake_amount: i64 = row.get(3)?;
        let staker_address: String = row.get(4)?;
        let providers_json: String = row.get(5)?;
        let protocol_version: i64 = row.get(6)?;
        let phase: i64 = row.get(7)?;
        let is_overflow: i64 = row.get(8)?;
        let overflow_amount: i64 = row.get(9)?;
        let aggregated: i64 = row.get(10)?;

        let finality_providers: Vec<String> =
            serde_json::from_str(&providers_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(LogEntry {
            transaction: Transaction {
                tx_id,
                block_height: block_height as u64,
                timestamp: timestamp as u64,
                stake_amount: stake_amount as u64,
                staker_address,
                finality_providers,
                protocol_version: protocol_version as u32,
                phase: phase as u32,
                is_overflow: is_overflow != 0,
                overflow_amount: overflow_amount as u64,
            },
            aggregated: aggregated != 0,
        })
    }
}

const ENTRY_COLUMNS: &str = "t.tx_id, t.block_height, t.timestamp, t.stake_amount, t.staker_address,
     t.finality_providers, t.protocol_version, t.phase, t.is_overflow, t.overflow_amount,
     t.aggregated";

impl TransactionLog for PersistentIndex {
    fn contains(&self, tx_id: &str) -> ChainIndexResult<bool> {
        let conn = self.read_conn()?;
        tx_exists(&conn, tx_id)
    }

    fn get_transaction(&self, tx_id: &str) -> ChainIndexResult<Option<Transaction>> {
        let conn = self.read_conn()?;
        Ok(load_entry(&conn, tx_id)?.map(|e| e.transaction))
    }

    fn latest_transaction_height(&self) -> ChainIndexResult<Option<u64>> {
        let conn = self.read_conn()?;
        let height: Option<i64> =
            conn.query_row("SELECT MAX(block_height) FROM transactions", [], |row| {
                row.get(0)
            })?;
        Ok(height.map(|h| h as u64))
    }

    fn transaction_count(&self) -> ChainIndexResult<u64> {
        let conn = self.read_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn staker_addresses(&self) -> ChainIndexResult<Vec<String>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT staker_address FROM transactions ORDER BY staker_address",
        )?;
        let addresses: rusqlite::Result<Vec<String>> =
            stmt.query_map([], |row| row.get(0))?.collect();
        Ok(addresses?)
    }

    fn provider_addresses(&self) -> ChainIndexResult<Vec<String>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT provider_address FROM transaction_providers ORDER BY provider_address",
        )?;
        let addresses: rusqlite::Result<Vec<String>> =
            stmt.query_map([], |row| row.get(0))?.collect();
        Ok(addresses?)
    }

    fn staker_entries(&self, address: &str) -> ChainIndexResult<Vec<LogEntry>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions t
             WHERE t.staker_address = ?
             ORDER BY t.timestamp, t.block_height, t.tx_id"
        ))?;
        let entries: rusqlite::Result<Vec<LogEntry>> =
            stmt.query_map(params![address], Self::row_to_entry)?.collect();
        Ok(entries?)
    }

    fn provider_entries(&self, address: &str) -> ChainIndexResult<Vec<LogEntry>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM transactions t
             JOIN transaction_providers p ON p.tx_id = t.tx_id
             WHERE p.provider_address = ?
             ORDER BY t.timestamp, t.block_height, t.tx_id"
        ))?;
        let entries: rusqlite::Result<Vec<LogEntry>> =
            stmt.query_map(params![address], Self::row_to_entry)?.collect();
        Ok(entries?)
    }

    fn pending_aggregation(&self, limit: usize) -> ChainIndexResult<Vec<String>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT tx_id FROM transactions WHERE aggregated = 0
             ORDER BY timestamp, block_height, tx_id LIMIT ?",
        )?;
        let ids: rusqlite::Result<Vec<String>> = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect();
        Ok(ids?)
    }

    fn commit_admission(&self, commit: AdmissionCommit) -> ChainIndexResult<AdmissionReceipt> {
        let AdmissionCommit {
            phase,
            transactions,
        } = commit;

        let mut conn = self.writer.lock();
        let db_tx = conn.transaction()?;

        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(transactions.len());
        let mut duplicates = Vec::new();
        for tx in transactions {
            if !seen.insert(tx.tx_id.clone()) || tx_exists(&db_tx, &tx.tx_id)? {
                duplicates.push(tx.tx_id);
                continue;
            }
            fresh.push(tx);
        }

        let mut stats = load_document::<PhaseStats>(&db_tx, "phase_stats", "phase", &phase.phase)?
            .unwrap_or_else(|| PhaseStats::new(phase.phase, phase.start_height));

        // Re-check against the stored total: the batch fits as a unit or not at all.
        let mut cap_conflict = false;
        if let Some(cap) = phase.cap {
            let batch_active = fresh.iter().try_fold(0u64, |acc, tx| {
                checked_add(acc, tx.active_amount(), "batch_active")
            })?;
            let fits = stats
                .active_stake_amount
                .checked_add(batch_active)
                .is_some_and(|total| total <= cap);
            if batch_active > 0 && !fits {
                cap_conflict = true;
                for tx in &mut fresh {
                    tx.mark_overflow();
                }
            }
        }

        for tx in &fresh {
            insert_transaction(&db_tx, tx)?;
            stats.record(tx)?;
        }

        if !fresh.is_empty() {
            stats.unique_staker_count =
                count_unique_stakers(&db_tx, phase.phase, stats.start_height, stats.current_height)?;
            save_document(&db_tx, "phase_stats", "phase", &phase.phase, &stats)?;
        }

        db_tx.commit()?;

        tracing::debug!(
            phase = phase.phase,
            inserted = fresh.len(),
            duplicates = duplicates.len(),
            active = stats.active_stake_amount,
            "Committed admission batch"
        );

        Ok(AdmissionReceipt {
            inserted: fresh,
            duplicates,
            cap_conflict,
            stats,
        })
    }
}

impl AggregateStore for PersistentIndex {
    fn get_phase_stats(&self, phase: u32) -> ChainIndexResult<Option<PhaseStats>> {
        let conn = self.read_conn()?;
        load_document(&conn, "phase_stats", "phase", &phase)
    }

    fn list_phase_stats(&self) -> ChainIndexResult<Vec<PhaseStats>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare("SELECT document FROM phase_stats ORDER BY phase")?;
        let docs: rusqlite::Result<Vec<Vec<u8>>> =
            stmt.query_map([], |row| row.get(0))?.collect();
        docs?
            .iter()
            .map(|doc| Ok(serde_json::from_slice(doc)?))
            .collect()
    }

    fn complete_phase(
        &self,
        phase: &PhaseDefinition,
        reason: CompletionReason,
        at: u64,
    ) -> ChainIndexResult<PhaseStats> {
        let mut conn = self.writer.lock();
        let db_tx = conn.transaction()?;
        let mut stats = load_document::<PhaseStats>(&db_tx, "phase_stats", "phase", &phase.phase)?
            .unwrap_or_else(|| PhaseStats::new(phase.phase, phase.start_height));
        stats.complete(reason, at)?;
        save_document(&db_tx, "phase_stats", "phase", &phase.phase, &stats)?;
        db_tx.commit()?;
        Ok(stats)
    }

    fn get_staker(&self, address: &str) -> ChainIndexResult<Option<StakerAggregate>> {
        let conn = self.read_conn()?;
        load_document(&conn, STAKERS, "address", &address)
    }

    fn get_finality_provider(
        &self,
        address: &str,
    ) -> ChainIndexResult<Option<FinalityProviderAggregate>> {
        let conn = self.read_conn()?;
        load_document(&conn, PROVIDERS, "address", &address)
    }

    fn apply_incremental(&self, tx_id: &str) -> ChainIndexResult<bool> {
        let mut conn = self.writer.lock();
        let db_tx = conn.transaction()?;

        let claimed = db_tx.execute(
            "UPDATE transactions SET aggregated = 1 WHERE tx_id = ? AND aggregated = 0",
            params![tx_id],
        )?;
        if claimed == 0 {
            if !tx_exists(&db_tx, tx_id)? {
                return Err(ChainIndexError::TransactionNotFound(tx_id.to_string()));
            }
            return Ok(false);
        }

        let tx = load_entry(&db_tx, tx_id)?
            .ok_or_else(|| ChainIndexError::TransactionNotFound(tx_id.to_string()))?
            .transaction;

        let mut staker = load_document::<StakerAggregate>(
            &db_tx,
            STAKERS,
            "address",
            &tx.staker_address.as_str(),
        )?
        .unwrap_or_else(|| StakerAggregate::new(tx.staker_address.clone()));
        staker.record(&tx)?;
        save_document(&db_tx, STAKERS, "address", &staker.address.as_str(), &staker)?;

        for provider in distinct_providers(&tx) {
            let mut aggregate =
                load_document::<FinalityProviderAggregate>(&db_tx, PROVIDERS, "address", &provider)?
                    .unwrap_or_else(|| FinalityProviderAggregate::new(provider));
            aggregate.record(&tx)?;
            save_document(&db_tx, PROVIDERS, "address", &provider, &aggregate)?;
        }

        db_tx.commit()?;
        Ok(true)
    }

    fn swap_staker(
        &self,
        mut aggregate: StakerAggregate,
        folded: &HashSet<String>,
    ) -> ChainIndexResult<StakerAggregate> {
        let mut conn = self.writer.lock();
        let db_tx = conn.transaction()?;

        let late = {
            let mut stmt = db_tx.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM transactions t
                 WHERE t.staker_address = ? AND t.aggregated = 1"
            ))?;
            let rows: rusqlite::Result<Vec<LogEntry>> = stmt
                .query_map(params![aggregate.address], Self::row_to_entry)?
                .collect();
            rows?
        };
        for entry in late {
            if !folded.contains(&entry.transaction.tx_id) {
                aggregate.record(&entry.transaction)?;
            }
        }

        save_document(&db_tx, STAKERS, "address", &aggregate.address.as_str(), &aggregate)?;
        db_tx.commit()?;
        Ok(aggregate)
    }

    fn swap_finality_provider(
        &self,
        mut aggregate: FinalityProviderAggregate,
        folded: &HashSet<String>,
    ) -> ChainIndexResult<FinalityProviderAggregate> {
        let mut conn = self.writer.lock();
        let db_tx = conn.transaction()?;

        let late = {
            let mut stmt = db_tx.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM transactions t
                 JOIN transaction_providers p ON p.tx_id = t.tx_id
                 WHERE p.provider_address = ? AND t.aggregated = 1"
            ))?;
            let rows: rusqlite::Result<Vec<LogEntry>> = stmt
                .query_map(params![aggregate.address], Self::row_to_entry)?
                .collect();
            rows?
        };
        for entry in late {
            if !folded.contains(&entry.transaction.tx_id) {
                aggregate.record(&entry.transaction)?;
            }
        }

        save_document(&db_tx, PROVIDERS, "address", &aggregate.address.as_str(), &aggregate)?;
        db_tx.commit()?;
        Ok(aggregate)
    }
}

impl SyncStateStore for PersistentIndex {
    fn sync_cursor(&self) -> ChainIndexResult<Option<u64>> {
        let conn = self.read_conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'sync_cursor'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn set_sync_cursor(&self, height: u64) -> ChainIndexResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('sync_cursor', ?)",
            params![height as i64],
        )?;
        Ok(())
    }

    fn record_skipped_range(&self, range: &SkippedRange) -> ChainIndexResult<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO skipped_ranges (from_height, to_height, reason, recorded_at)
             VALUES (?, ?, ?, ?)",
            params![
                range.from_height as i64,
                range.to_height as i64,
                range.reason.as_str(),
                range.recorded_at as i64,
            ],
        )?;
        Ok(())
    }

    fn skipped_ranges(&self) -> ChainIndexResult<Vec<SkippedRange>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_height, to_height, reason, recorded_at FROM skipped_ranges ORDER BY id",
        )?;
        let ranges: rusqlite::Result<Vec<SkippedRange>> = stmt
            .query_map([], |row| {
                let from_height: i64 = row.get(0)?;
                let to_height: i64 = row.get(1)?;
                let reason: String = row.get(2)?;
                let recorded_at: i64 = row.get(3)?;
                let reason = SkipReason::parse(&reason).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        format!("unknown skip reason '{}'", reason).into(),
                    )
                })?;
                Ok(SkippedRange {
                    from_height: from_height as u64,
                    to_height: to_height as u64,
                    reason,
                    recorded_at: recorded_at as u64,
                })
            })?
            .collect();
        Ok(ranges?)
    }
}

fn tx_exists(conn: &Connection, tx_id: &str) -> ChainIndexResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM transactions WHERE tx_id = ?",
            params![tx_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_entry(conn: &Connection, tx_id: &str) -> ChainIndexResult<Option<LogEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM transactions t WHERE t.tx_id = ?"),
            params![tx_id],
            PersistentIndex::row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

fn insert_transaction(conn: &Connection, tx: &Transaction) -> ChainIndexResult<()> {
    let providers_json = serde_json::to_string(&tx.finality_providers)?;
    conn.execute(
        "INSERT INTO transactions
         (tx_id, block_height, timestamp, stake_amount, staker_address, finality_providers,
          protocol_version, phase, is_overflow, overflow_amount, aggregated)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            tx.tx_id,
            tx.block_height as i64,
            tx.timestamp as i64,
            tx.stake_amount as i64,
            tx.staker_address,
            providers_json,
            tx.protocol_version as i64,
            tx.phase as i64,
            tx.is_overflow as i64,
            tx.overflow_amount as i64,
        ],
    )?;
    for provider in distinct_providers(tx) {
        conn.execute(
            "INSERT INTO transaction_providers (tx_id, provider_address) VALUES (?, ?)",
            params![tx.tx_id, provider],
        )?;
    }
    Ok(())
}

fn count_unique_stakers(
    conn: &Connection,
    phase: u32,
    start_height: u64,
    current_height: u64,
) -> ChainIndexResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT staker_address) FROM transactions
         WHERE phase = ? AND block_height BETWEEN ? AND ?",
        params![phase as i64, start_height as i64, current_height as i64],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn load_document<T: DeserializeOwned>(
    conn: &Connection,
    table: &'static str,
    key_column: &'static str,
    key: &dyn rusqlite::ToSql,
) -> ChainIndexResult<Option<T>> {
    let doc: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT document FROM {table} WHERE {key_column} = ?"),
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    doc.map(|bytes| serde_json::from_slice(&bytes).map_err(ChainIndexError::from))
        .transpose()
}

fn save_document<T: Serialize>(
    conn: &Connection,
    table: &'static str,
    key_column: &'static str,
    key: &dyn rusqlite::ToSql,
    document: &T,
) -> ChainIndexResult<()> {
    let bytes = serde_json::to_vec(document)?;
    conn.execute(
        &format!("INSERT OR REPLACE INTO {table} ({key_column}, document) VALUES (?, ?)"),
        params![key, bytes],
    )?;
    Ok(())
}

/// Generate a unique ID for in-memory shared-cache SQLite databases.
fn unique_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_utils::make_tx;

    fn capped_phase(cap: u64) -> PhaseDefinition {
        PhaseDefinition::uncapped(1, 100, 0).with_cap(cap)
    }

    fn commit(index: &PersistentIndex, phase: &PhaseDefinition, txs: Vec<Transaction>) -> AdmissionReceipt {
        index
            .commit_admission(AdmissionCommit {
                phase: phase.clone(),
                transactions: txs,
            })
            .unwrap()
    }

    #[test]
    fn test_commit_inserts_and_updates_stats() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = capped_phase(1000);
        let a = make_tx("a", "alice", "fp1", 700, 1);
        let mut b = make_tx("b", "bob", "fp1", 400, 2);
        b.mark_overflow();

        let receipt = commit(&index, &phase, vec![a, b]);
        assert_eq!(receipt.inserted.len(), 2);
        assert!(!receipt.cap_conflict);
        assert_eq!(receipt.stats.active_stake_amount, 700);
        assert_eq!(receipt.stats.overflow_stake_amount, 400);
        assert_eq!(receipt.stats.total_stake_amount, 1100);
        assert_eq!(receipt.stats.unique_staker_count, 2);

        let stored = index.get_phase_stats(1).unwrap().unwrap();
        assert_eq!(stored, receipt.stats);
        assert!(index.contains("a").unwrap());
        assert!(index.get_transaction("b").unwrap().unwrap().is_overflow);
        assert_eq!(index.latest_transaction_height().unwrap(), Some(102));
    }

    #[test]
    fn test_duplicate_ids_are_skipped() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = PhaseDefinition::uncapped(1, 100, 0);
        let tx = make_tx("a", "alice", "fp1", 10, 1);

        commit(&index, &phase, vec![tx.clone()]);
        let receipt = commit(&index, &phase, vec![tx.clone(), tx]);

        assert!(receipt.inserted.is_empty());
        assert_eq!(receipt.duplicates, vec!["a".to_string(), "a".to_string()]);
        assert_eq!(index.transaction_count().unwrap(), 1);
        assert_eq!(index.get_phase_stats(1).unwrap().unwrap().total_stake_amount, 10);
    }

    #[test]
    fn test_commit_flips_batch_when_stored_total_moved() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = capped_phase(1000);
        commit(&index, &phase, vec![make_tx("a", "alice", "fp", 900, 1)]);

        // Marks computed against a stale active total of zero.
        let receipt = commit(
            &index,
            &phase,
            vec![make_tx("b", "bob", "fp", 50, 2), make_tx("c", "carol", "fp", 60, 3)],
        );

        assert!(receipt.cap_conflict);
        assert!(receipt.inserted.iter().all(|t| t.is_overflow));
        assert_eq!(receipt.stats.active_stake_amount, 900);
        assert_eq!(receipt.stats.overflow_stake_amount, 110);
    }

    #[test]
    fn test_apply_incremental_is_claimed_once() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = PhaseDefinition::uncapped(1, 100, 0);
        let mut tx = make_tx("a", "alice", "fp1", 10, 1);
        tx.finality_providers.push("fp2".to_string());
        commit(&index, &phase, vec![tx]);

        assert!(index.apply_incremental("a").unwrap());
        assert!(!index.apply_incremental("a").unwrap());

        let staker = index.get_staker("alice").unwrap().unwrap();
        assert_eq!(staker.total_stake, 10);
        assert_eq!(staker.transaction_count, 1);
        for fp in ["fp1", "fp2"] {
            let provider = index.get_finality_provider(fp).unwrap().unwrap();
            assert_eq!(provider.total_stake, 10);
        }
        assert!(index.pending_aggregation(10).unwrap().is_empty());
        assert!(matches!(
            index.apply_incremental("missing"),
            Err(ChainIndexError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_swap_folds_late_rows() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = PhaseDefinition::uncapped(1, 100, 0);
        commit(
            &index,
            &phase,
            vec![make_tx("a", "alice", "fp", 10, 1), make_tx("b", "alice", "fp", 5, 2)],
        );
        index.apply_incremental("a").unwrap();
        index.apply_incremental("b").unwrap();

        // The rebuild only saw "a"; "b" was applied after its scan.
        let mut rebuilt = StakerAggregate::new("alice");
        rebuilt.record(&index.get_transaction("a").unwrap().unwrap()).unwrap();
        let folded: HashSet<String> = ["a".to_string()].into_iter().collect();

        let stored = index.swap_staker(rebuilt, &folded).unwrap();
        assert_eq!(stored.total_stake, 15);
        assert_eq!(index.get_staker("alice").unwrap().unwrap(), stored);
    }

    #[test]
    fn test_entries_are_in_admission_order() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = PhaseDefinition::uncapped(1, 100, 0);
        commit(
            &index,
            &phase,
            vec![
                make_tx("late", "alice", "fp", 1, 9),
                make_tx("early", "alice", "fp", 1, 3),
                make_tx("other", "bob", "fp", 1, 5),
            ],
        );

        assert_eq!(index.staker_addresses().unwrap(), vec!["alice", "bob"]);
        assert_eq!(index.provider_addresses().unwrap(), vec!["fp"]);

        let alice: Vec<_> = index
            .staker_entries("alice")
            .unwrap()
            .into_iter()
            .map(|e| e.transaction.tx_id)
            .collect();
        assert_eq!(alice, vec!["early", "late"]);
        assert_eq!(index.provider_entries("fp").unwrap().len(), 3);
    }

    #[test]
    fn test_complete_phase_is_terminal() {
        let index = PersistentIndex::in_memory().unwrap();
        let phase = capped_phase(10);
        let stats = index
            .complete_phase(&phase, CompletionReason::BlockHeight, 42)
            .unwrap();
        assert!(stats.is_completed());
        assert!(matches!(
            index.complete_phase(&phase, CompletionReason::Timeout, 43),
            Err(ChainIndexError::PhaseAlreadyCompleted(1))
        ));
        let stored = index.get_phase_stats(1).unwrap().unwrap();
        assert_eq!(stored.completion_reason, Some(CompletionReason::BlockHeight));
    }

    #[test]
    fn test_sync_state_roundtrip() {
        let index = PersistentIndex::in_memory().unwrap();
        assert_eq!(index.sync_cursor().unwrap(), None);
        index.set_sync_cursor(499).unwrap();
        index.set_sync_cursor(600).unwrap();
        assert_eq!(index.sync_cursor().unwrap(), Some(600));

        let range = SkippedRange {
            from_height: 100,
            to_height: 499,
            reason: SkipReason::Pruned,
            recorded_at: 7,
        };
        index.record_skipped_range(&range).unwrap();
        assert_eq!(index.skipped_ranges().unwrap(), vec![range]);
    }

    #[test]
    fn test_persistence_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        {
            let index = PersistentIndex::new(&path, 2).unwrap();
            commit(
                &index,
                &PhaseDefinition::uncapped(1, 100, 0),
                vec![make_tx("a", "alice", "fp", 10, 1)],
            );
            index.set_sync_cursor(150).unwrap();
        }

        let reopened = PersistentIndex::new(&path, 2).unwrap();
        reopened.initialize().unwrap();
        assert!(reopened.contains("a").unwrap());
        assert_eq!(reopened.sync_cursor().unwrap(), Some(150));
        assert_eq!(reopened.pending_aggregation(10).unwrap(), vec!["a".to_string()]);
    }
}
