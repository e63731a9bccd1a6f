//! Prometheus-compatible metrics collection.
//!
//! This module provides a metrics registry for tracking ingestion progress
//! and read-side cache behavior, and exporting both in Prometheus format.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use stakeidx_chain_index::{CacheEvent, CacheObserver};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

/// Indexer-level metrics, shared by every network.
pub struct IndexerMetrics {
    /// Transactions written to a log.
    pub transactions_ingested: Counter,
    /// Transactions already present in the log.
    pub duplicates_skipped: Counter,
    /// Transactions stored as overflow.
    pub overflow_transactions: Counter,
    /// Whole batches flipped to overflow at commit time.
    pub cap_conflicts: Counter,
    /// Raw transactions the decoder could not parse.
    pub decode_failures: Counter,
    /// Decoded messages that are not stakes.
    pub irrelevant_messages: Counter,
    /// Ingestion batches committed.
    pub batches_processed: Counter,
    /// Backfill batches abandoned after exhausting retries.
    pub batch_retries_exhausted: Counter,
    /// Heights skipped because the node pruned them.
    pub heights_skipped: Counter,
    /// Live feed reconnects.
    pub live_resubscriptions: Counter,
    /// Highest height completed by a backfill.
    pub backfill_height: Gauge,
    /// Ingestion batch duration in seconds.
    pub batch_duration_seconds: Histogram,
    pub cache_hits: Counter,
    pub cache_stale_hits: Counter,
    pub cache_misses: Counter,
    pub cache_recomputations: Counter,
    pub cache_failures: Counter,
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerMetrics {
    /// Create a new set of indexer metrics.
    pub fn new() -> Self {
        // 1ms to ~16s
        let duration_buckets = exponential_buckets(0.001, 2.0, 15);

        Self {
            transactions_ingested: Counter::default(),
            duplicates_skipped: Counter::default(),
            overflow_transactions: Counter::default(),
            cap_conflicts: Counter::default(),
            decode_failures: Counter::default(),
            irrelevant_messages: Counter::default(),
            batches_processed: Counter::default(),
            batch_retries_exhausted: Counter::default(),
            heights_skipped: Counter::default(),
            live_resubscriptions: Counter::default(),
            backfill_height: Gauge::<i64, AtomicI64>::default(),
            batch_duration_seconds: Histogram::new(duration_buckets),
            cache_hits: Counter::default(),
            cache_stale_hits: Counter::default(),
            cache_misses: Counter::default(),
            cache_recomputations: Counter::default(),
            cache_failures: Counter::default(),
        }
    }

    /// Record the outcome of one committed ingestion batch.
    pub fn record_batch(&self, inserted: u64, duplicates: u64, overflow: u64, duration_secs: f64) {
        self.batches_processed.inc();
        self.transactions_ingested.inc_by(inserted);
        self.duplicates_skipped.inc_by(duplicates);
        self.overflow_transactions.inc_by(overflow);
        self.batch_duration_seconds.observe(duration_secs);
    }

    /// Record a pruned range of `count` heights.
    pub fn record_skipped_heights(&self, count: u64) {
        self.heights_skipped.inc_by(count);
    }

    pub fn set_backfill_height(&self, height: u64) {
        self.backfill_height
            .set(i64::try_from(height).unwrap_or(i64::MAX));
    }
}

impl CacheObserver for IndexerMetrics {
    fn record(&self, event: CacheEvent) {
        match event {
            CacheEvent::Hit => self.cache_hits.inc(),
            CacheEvent::StaleHit => self.cache_stale_hits.inc(),
            CacheEvent::Miss => self.cache_misses.inc(),
            CacheEvent::Recompute => self.cache_recomputations.inc(),
            CacheEvent::ComputeFailed => self.cache_failures.inc(),
        };
    }
}

/// Central metrics registry for the indexer.
pub struct MetricsRegistry {
    registry: Registry,
    /// Indexer metrics, handed to sync tasks and caches.
    pub indexer: Arc<IndexerMetrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("stakeidx");
        let indexer = IndexerMetrics::new();

        registry.register(
            "transactions_ingested",
            "Total staking transactions written to the log",
            indexer.transactions_ingested.clone(),
        );
        registry.register(
            "duplicates_skipped",
            "Transactions skipped because they were already logged",
            indexer.duplicates_skipped.clone(),
        );
        registry.register(
            "overflow_transactions",
            "Transactions stored as overflow of a capped phase",
            indexer.overflow_transactions.clone(),
        );
        registry.register(
            "cap_conflicts",
            "Batches flipped to overflow because the stored active total moved",
            indexer.cap_conflicts.clone(),
        );
        registry.register(
            "decode_failures",
            "Raw transactions that could not be decoded",
            indexer.decode_failures.clone(),
        );
        registry.register(
            "irrelevant_messages",
            "Decoded messages that are not stakes",
            indexer.irrelevant_messages.clone(),
        );
        registry.register(
            "batches_processed",
            "Ingestion batches committed",
            indexer.batches_processed.clone(),
        );
        registry.register(
            "batch_retries_exhausted",
            "Backfill batches recorded as skipped after exhausting retries",
            indexer.batch_retries_exhausted.clone(),
        );
        registry.register(
            "heights_skipped",
            "Heights skipped because the node pruned them",
            indexer.heights_skipped.clone(),
        );
        registry.register(
            "live_resubscriptions",
            "Live feed reconnects",
            indexer.live_resubscriptions.clone(),
        );
        registry.register(
            "backfill_height",
            "Highest height completed by a backfill",
            indexer.backfill_height.clone(),
        );
        registry.register(
            "batch_duration_seconds",
            "Ingestion batch duration in seconds",
            indexer.batch_duration_seconds.clone(),
        );
        registry.register(
            "cache_hits",
            "Fresh cache hits",
            indexer.cache_hits.clone(),
        );
        registry.register(
            "cache_stale_hits",
            "Stale cache hits served while revalidating",
            indexer.cache_stale_hits.clone(),
        );
        registry.register(
            "cache_misses",
            "Cache misses",
            indexer.cache_misses.clone(),
        );
        registry.register(
            "cache_recomputations",
            "Cache values recomputed",
            indexer.cache_recomputations.clone(),
        );
        registry.register(
            "cache_failures",
            "Cache recomputations that failed",
            indexer.cache_failures.clone(),
        );

        Self {
            registry,
            indexer: Arc::new(indexer),
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode_prometheus(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            return String::from("# Error encoding metrics\n");
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new();
        let encoded = registry.encode_prometheus();

        assert!(encoded.contains("stakeidx_transactions_ingested"));
        assert!(encoded.contains("stakeidx_backfill_height"));
        assert!(encoded.contains("stakeidx_cache_hits"));
    }

    #[test]
    fn test_record_batch() {
        let registry = MetricsRegistry::new();
        registry.indexer.record_batch(7, 2, 3, 0.05);
        registry.indexer.set_backfill_height(4_242);

        assert_eq!(registry.indexer.transactions_ingested.get(), 7);
        assert_eq!(registry.indexer.duplicates_skipped.get(), 2);
        assert_eq!(registry.indexer.overflow_transactions.get(), 3);
        assert_eq!(registry.indexer.batches_processed.get(), 1);

        let encoded = registry.encode_prometheus();
        assert!(encoded.contains("4242"));
    }

    #[test]
    fn test_cache_observer_counts_events() {
        let registry = MetricsRegistry::new();
        let observer: Arc<dyn CacheObserver> = registry.indexer.clone();

        observer.record(CacheEvent::Hit);
        observer.record(CacheEvent::Hit);
        observer.record(CacheEvent::StaleHit);
        observer.record(CacheEvent::Miss);
        observer.record(CacheEvent::Recompute);

        assert_eq!(registry.indexer.cache_hits.get(), 2);
        assert_eq!(registry.indexer.cache_stale_hits.get(), 1);
        assert_eq!(registry.indexer.cache_misses.get(), 1);
        assert_eq!(registry.indexer.cache_recomputations.get(), 1);
    }
}
