//! Read side of the index: cached queries over phase statistics and
//! aggregates, plus the administrative rebuild.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregate::{FinalityProviderAggregate, StakerAggregate};
use crate::cache::{
    cache_key, CacheConfig, CacheError, CacheObserver, CacheResult, CacheStats, RevalidatingCache,
};
use crate::clock::Clock;
use crate::error::{ChainIndexError, ChainIndexResult};
use crate::phase::PhaseTable;
use crate::reindexer::{AggregateReindexer, RebuildReport};
use crate::store::{AggregateStore, TransactionLog};
use crate::types::{PhaseStats, Transaction};

const PHASE_PREFIX: &str = "phase_stats";
const PHASE_LIST_KEY: &str = "phase_stats_list";
const STAKER_PREFIX: &str = "staker";
const PROVIDER_PREFIX: &str = "finality_provider";

/// Hook the ingestion path calls after new rows were applied.
pub trait CacheInvalidation: Send + Sync {
    fn on_transactions_applied(&self, transactions: &[Transaction]);

    /// A phase moved to `completed`.
    fn on_phase_completed(&self, phase: u32);
}

fn phase_key(phase: u32) -> String {
    cache_key(PHASE_PREFIX, &[("phase", &phase.to_string())])
}

fn staker_key(address: &str) -> String {
    cache_key(STAKER_PREFIX, &[("address", address)])
}

fn provider_key(address: &str) -> String {
    cache_key(PROVIDER_PREFIX, &[("address", address)])
}

/// Run a storage call on the blocking pool.
async fn blocking<T, F>(f: F) -> CacheResult<T>
where
    F: FnOnce() -> ChainIndexResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(|e| CacheError::Compute(e.to_string())),
        Err(e) => Err(CacheError::Aborted(e.to_string())),
    }
}

/// Cached queries consumed by the HTTP layer.
pub struct StakingQueryService<S> {
    store: Arc<S>,
    phases: Arc<PhaseTable>,
    reindexer: Arc<AggregateReindexer<S>>,
    ttl_secs: u64,
    phase_cache: RevalidatingCache<Option<PhaseStats>>,
    phase_list_cache: RevalidatingCache<Vec<PhaseStats>>,
    staker_cache: RevalidatingCache<Option<StakerAggregate>>,
    provider_cache: RevalidatingCache<Option<FinalityProviderAggregate>>,
}

impl<S> StakingQueryService<S>
where
    S: TransactionLog + AggregateStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        phases: Arc<PhaseTable>,
        reindexer: Arc<AggregateReindexer<S>>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        observer: Option<Arc<dyn CacheObserver>>,
    ) -> Self {
        fn build<V: Clone + Send + Sync + 'static>(
            config: &CacheConfig,
            clock: &Arc<dyn Clock>,
            observer: &Option<Arc<dyn CacheObserver>>,
        ) -> RevalidatingCache<V> {
            match observer {
                Some(observer) => RevalidatingCache::with_observer(
                    config.clone(),
                    Arc::clone(clock),
                    Arc::clone(observer),
                ),
                None => RevalidatingCache::with_clock(config.clone(), Arc::clone(clock)),
            }
        }

        Self {
            store,
            phases,
            reindexer,
            ttl_secs: config.default_ttl_secs,
            phase_cache: build(&config, &clock, &observer),
            phase_list_cache: build(&config, &clock, &observer),
            staker_cache: build(&config, &clock, &observer),
            provider_cache: build(&config, &clock, &observer),
        }
    }

    /// Statistics for a configured phase. Empty until its first admission.
    pub async fn get_phase_stats(&self, phase: u32) -> ChainIndexResult<PhaseStats> {
        let def = self
            .phases
            .get(phase)
            .ok_or(ChainIndexError::PhaseNotFound(phase))?;
        let store = Arc::clone(&self.store);
        let stats = self
            .phase_cache
            .get_with_revalidate(&phase_key(phase), self.ttl_secs, move || {
                blocking(move || store.get_phase_stats(phase))
            })
            .await?;
        Ok(stats.unwrap_or_else(|| PhaseStats::new(def.phase, def.start_height)))
    }

    /// Statistics of every phase that has recorded activity, by phase number.
    pub async fn list_phase_stats(&self) -> ChainIndexResult<Vec<PhaseStats>> {
        let store = Arc::clone(&self.store);
        Ok(self
            .phase_list_cache
            .get_with_revalidate(PHASE_LIST_KEY, self.ttl_secs, move || {
                blocking(move || store.list_phase_stats())
            })
            .await?)
    }

    pub async fn get_staker_aggregate(&self, address: &str) -> ChainIndexResult<StakerAggregate> {
        let store = Arc::clone(&self.store);
        let owned = address.to_string();
        self.staker_cache
            .get_with_revalidate(&staker_key(address), self.ttl_secs, move || {
                blocking(move || store.get_staker(&owned))
            })
            .await?
            .ok_or_else(|| ChainIndexError::StakerNotFound(address.to_string()))
    }

    pub async fn get_finality_provider_aggregate(
        &self,
        address: &str,
    ) -> ChainIndexResult<FinalityProviderAggregate> {
        let store = Arc::clone(&self.store);
        let owned = address.to_string();
        self.provider_cache
            .get_with_revalidate(&provider_key(address), self.ttl_secs, move || {
                blocking(move || store.get_finality_provider(&owned))
            })
            .await?
            .ok_or_else(|| ChainIndexError::FinalityProviderNotFound(address.to_string()))
    }

    /// Rebuild every aggregate from the log and drop the cached documents.
    pub async fn reindex_all(&self) -> ChainIndexResult<RebuildReport> {
        let reindexer = Arc::clone(&self.reindexer);
        let report = tokio::task::spawn_blocking(move || reindexer.rebuild_all())
            .await
            .map_err(|e| ChainIndexError::Storage(format!("rebuild task failed: {e}")))??;
        self.staker_cache.invalidate_prefix(STAKER_PREFIX);
        self.provider_cache.invalidate_prefix(PROVIDER_PREFIX);
        Ok(report)
    }

    /// Start one sweeper per cache. They stop when `shutdown` flips to true.
    pub fn spawn_sweepers(
        &self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.phase_cache.spawn_sweeper(interval, shutdown.clone()),
            self.phase_list_cache.spawn_sweeper(interval, shutdown.clone()),
            self.staker_cache.spawn_sweeper(interval, shutdown.clone()),
            self.provider_cache.spawn_sweeper(interval, shutdown),
        ]
    }

    /// Counters summed over all caches.
    pub fn cache_stats(&self) -> CacheStats {
        [
            self.phase_cache.stats(),
            self.phase_list_cache.stats(),
            self.staker_cache.stats(),
            self.provider_cache.stats(),
        ]
        .into_iter()
        .fold(CacheStats::default(), |acc, s| CacheStats {
            hits: acc.hits + s.hits,
            stale_hits: acc.stale_hits + s.stale_hits,
            misses: acc.misses + s.misses,
            recomputations: acc.recomputations + s.recomputations,
            failures: acc.failures + s.failures,
            entries: acc.entries + s.entries,
            in_flight: acc.in_flight + s.in_flight,
        })
    }
}

impl<S> CacheInvalidation for StakingQueryService<S>
where
    S: TransactionLog + AggregateStore + 'static,
{
    fn on_transactions_applied(&self, transactions: &[Transaction]) {
        if transactions.is_empty() {
            return;
        }
        self.phase_list_cache.invalidate(PHASE_LIST_KEY);
        for tx in transactions {
            self.phase_cache.invalidate(&phase_key(tx.phase));
            self.staker_cache.invalidate(&staker_key(&tx.staker_address));
            for provider in &tx.finality_providers {
                self.provider_cache.invalidate(&provider_key(provider));
            }
        }
    }

    fn on_phase_completed(&self, phase: u32) {
        self.phase_cache.invalidate(&phase_key(phase));
        self.phase_list_cache.invalidate(PHASE_LIST_KEY);
    }
}
