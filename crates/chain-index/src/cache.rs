//! Stale-while-revalidate cache with single-flight recomputation.
//!
//! Values live in a bounded LRU. At most one recomputation per key is in
//! flight; it runs as a spawned task whose result is shared by every caller
//! that has to wait for it. Callers never wait when any cached value exists.
//!
//! An entry is *fresh* for `ttl` and *stale* afterwards. A stale entry is
//! served while a background recompute runs, however old it is, and stays the
//! last good value until a recompute succeeds. Only LRU eviction and explicit
//! invalidation remove entries.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::clock::{Clock, SystemClock};

/// Default time-to-live in seconds.
const DEFAULT_TTL_SECS: u64 = 30;
/// Default number of cached keys.
const DEFAULT_CAPACITY: usize = 10_000;
/// Default fraction of the TTL after which a fresh entry is refreshed ahead.
const DEFAULT_REFRESH_AHEAD_RATIO: f64 = 0.8;

/// Errors surfaced by cache computations.
///
/// Cloneable so a single in-flight result can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("computation failed: {0}")]
    Compute(String),

    #[error("computation task aborted: {0}")]
    Aborted(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Configuration for the revalidating cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub capacity: usize,
    /// Fresh entries older than `ttl * ratio` trigger a background refresh.
    /// `1.0` disables refresh-ahead.
    pub refresh_ahead_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            capacity: DEFAULT_CAPACITY,
            refresh_ahead_ratio: DEFAULT_REFRESH_AHEAD_RATIO,
        }
    }
}

/// Cached value with its fetch time.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub last_fetched_at_ms: u64,
    pub ttl_secs: u64,
}

impl<V> CacheEntry<V> {
    fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_fetched_at_ms)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl_secs.saturating_mul(1000)
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        self.age_ms(now_ms) < self.ttl_ms()
    }
}

/// Observable cache events, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    StaleHit,
    Miss,
    Recompute,
    ComputeFailed,
}

/// Receives cache events.
pub trait CacheObserver: Send + Sync {
    fn record(&self, event: CacheEvent);
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub recomputations: u64,
    pub failures: u64,
    pub entries: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    recomputations: AtomicU64,
    failures: AtomicU64,
}

type SharedCompute<V> = Shared<BoxFuture<'static, CacheResult<V>>>;

struct Flight<V> {
    id: u64,
    future: SharedCompute<V>,
    task: AbortHandle,
}

struct State<V> {
    entries: LruCache<String, CacheEntry<V>>,
    inflight: HashMap<String, Flight<V>>,
    next_flight: u64,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    counters: Counters,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl<V> Inner<V> {
    fn record(&self, event: CacheEvent) {
        let counter = match event {
            CacheEvent::Hit => &self.counters.hits,
            CacheEvent::StaleHit => &self.counters.stale_hits,
            CacheEvent::Miss => &self.counters.misses,
            CacheEvent::Recompute => &self.counters.recomputations,
            CacheEvent::ComputeFailed => &self.counters.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.record(event);
        }
    }

    /// Store a finished computation unless the flight was invalidated meanwhile.
    fn finish(&self, key: &str, id: u64, ttl_secs: u64, result: &CacheResult<V>)
    where
        V: Clone,
    {
        let mut state = self.state.lock();
        if state.inflight.get(key).map(|f| f.id) != Some(id) {
            return;
        }
        state.inflight.remove(key);
        match result {
            Ok(value) => {
                state.entries.put(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        last_fetched_at_ms: self.clock.now_ms(),
                        ttl_secs,
                    },
                );
            }
            Err(e) => {
                drop(state);
                self.record(CacheEvent::ComputeFailed);
                tracing::warn!(key, error = %e, "Cache recomputation failed");
            }
        }
    }
}

/// Generic key/value cache with TTL, refresh-ahead and single-flight.
pub struct RevalidatingCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for RevalidatingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> RevalidatingCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache reading the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Create a cache that reports every event to `observer`.
    pub fn with_observer(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn CacheObserver>,
    ) -> Self {
        Self::build(config, clock, Some(observer))
    }

    fn build(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        observer: Option<Arc<dyn CacheObserver>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: LruCache::new(capacity),
                    inflight: HashMap::new(),
                    next_flight: 0,
                }),
                config,
                clock,
                counters: Counters::default(),
                observer,
            }),
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.inner.config.default_ttl_secs
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|e| e.is_fresh(now))
            .map(|e| e.value.clone())
    }

    /// Store a value. Any in-flight recomputation for `key` is discarded.
    pub fn set(&self, key: &str, value: V, ttl_secs: u64) {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        state.inflight.remove(key);
        state.entries.put(
            key.to_string(),
            CacheEntry {
                value,
                last_fetched_at_ms: now,
                ttl_secs,
            },
        );
    }

    /// Serve `key`, recomputing with `compute` when needed.
    ///
    /// 1. A recompute is in flight: return the cached value if one exists,
    ///    otherwise await that recompute.
    /// 2. Fresh entry: return it (refreshing ahead in the background once it
    ///    is older than `ttl * refresh_ahead_ratio`).
    /// 3. Stale entry of any age: start a background recompute and return the
    ///    stale value.
    /// 4. Nothing cached: compute, cache and return. Errors reach the caller.
    pub async fn get_with_revalidate<F, Fut>(
        &self,
        key: &str,
        ttl_secs: u64,
        compute: F,
    ) -> CacheResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let pending = {
            let now = self.inner.clock.now_ms();
            let mut state = self.inner.state.lock();
            let cached = state.entries.get(key).cloned();

            if let Some(flight) = state.inflight.get(key) {
                match cached {
                    Some(entry) => {
                        let event = if entry.is_fresh(now) {
                            CacheEvent::Hit
                        } else {
                            CacheEvent::StaleHit
                        };
                        drop(state);
                        self.inner.record(event);
                        return Ok(entry.value);
                    }
                    None => flight.future.clone(),
                }
            } else {
                match cached {
                    Some(entry) if entry.is_fresh(now) => {
                        let ratio = self.inner.config.refresh_ahead_ratio;
                        let refresh_at = (entry.ttl_ms() as f64 * ratio) as u64;
                        if ratio < 1.0 && entry.age_ms(now) >= refresh_at {
                            self.start_flight(&mut state, key, ttl_secs, compute());
                        }
                        drop(state);
                        self.inner.record(CacheEvent::Hit);
                        return Ok(entry.value);
                    }
                    Some(entry) => {
                        self.start_flight(&mut state, key, ttl_secs, compute());
                        drop(state);
                        self.inner.record(CacheEvent::StaleHit);
                        return Ok(entry.value);
                    }
                    None => {
                        let future = self.start_flight(&mut state, key, ttl_secs, compute());
                        drop(state);
                        self.inner.record(CacheEvent::Miss);
                        future
                    }
                }
            }
        };

        pending.await
    }

    fn start_flight<Fut>(
        &self,
        state: &mut State<V>,
        key: &str,
        ttl_secs: u64,
        compute: Fut,
    ) -> SharedCompute<V>
    where
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let id = state.next_flight;
        state.next_flight = state.next_flight.wrapping_add(1);

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let task = tokio::spawn(async move {
            let result = compute.await;
            inner.finish(&owned_key, id, ttl_secs, &result);
            result
        });

        let abort = task.abort_handle();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        state.inflight.insert(
            key.to_string(),
            Flight {
                id,
                future: future.clone(),
                task: abort,
            },
        );
        self.inner.record(CacheEvent::Recompute);
        future
    }

    /// Drop `key`. A recompute already in flight will not repopulate it.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        let had_flight = state.inflight.remove(key).is_some();
        state.entries.pop(key).is_some() || had_flight
    }

    /// Drop every key starting with `prefix`. Returns the number of entries removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.inner.state.lock();
        state.inflight.retain(|key, _| !key.starts_with(prefix));
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            state.entries.pop(key);
        }
        keys.len()
    }

    /// Clear recomputations whose task ended without reporting back (it
    /// panicked or was aborted), so the next read can start a new one.
    /// Cached values are kept. Returns the number of flights cleared.
    pub fn sweep(&self) -> usize {
        let stalled: Vec<String> = {
            let mut state = self.inner.state.lock();
            let stalled: Vec<String> = state
                .inflight
                .iter()
                .filter(|(_, flight)| flight.task.is_finished())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stalled {
                state.inflight.remove(key);
            }
            stalled
        };
        for key in &stalled {
            self.inner.record(CacheEvent::ComputeFailed);
            tracing::warn!(key = %key, "Cache recomputation ended without a result");
        }
        stalled.len()
    }

    /// Run [`RevalidatingCache::sweep`] every `interval` until `shutdown` flips.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, in_flight) = {
            let state = self.inner.state.lock();
            (state.entries.len(), state.inflight.len())
        };
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            recomputations: c.recomputations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            entries,
            in_flight,
        }
    }
}

/// Build a namespaced cache key from a prefix and parameters.
///
/// Parameters are sorted by name so insertion order does not matter.
pub fn cache_key(prefix: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
    sorted.sort();
    let mut key = prefix.to_string();
    for (i, (name, value)) in sorted.into_iter().enumerate() {
        key.push(if i == 0 { ':' } else { '&' });
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn cache(clock: &Arc<ManualClock>) -> RevalidatingCache<u64> {
        RevalidatingCache::with_clock(
            CacheConfig {
                default_ttl_secs: 10,
                capacity: 16,
                refresh_ahead_ratio: 1.0,
            },
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    /// Wait until no computation for any key is in flight.
    async fn settle(cache: &RevalidatingCache<u64>) {
        for _ in 0..1000 {
            if cache.stats().in_flight == 0 {
                return;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("computation did not settle");
    }

    #[test]
    fn test_cache_key_ignores_param_order() {
        let a = cache_key("staker", &[("phase", "2"), ("address", "bc1q")]);
        let b = cache_key("staker", &[("address", "bc1q"), ("phase", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "staker:address=bc1q&phase=2");
        assert_eq!(cache_key("phases", &[]), "phases");
    }

    #[tokio::test]
    async fn test_miss_computes_and_caches() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);

        let value = cache
            .get_with_revalidate("k", 10, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cache.get("k"), Some(7));

        let again = cache
            .get_with_revalidate("k", 10, || async { Ok(8) })
            .await
            .unwrap();
        assert_eq!(again, 7);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.recomputations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_share_one_computation() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = Arc::clone(&calls);
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    cache
                        .get_with_revalidate("k", 10, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            Ok(42)
                        })
                        .await
                })
            })
            .collect();

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_key_returns_immediately_with_one_recompute() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("k", 1, 10);
        clock.advance_secs(11);

        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_with_revalidate("k", 10, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(2)
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert!(value == 1 || value == 2);
        }
        settle(&cache).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test]
    async fn test_background_failure_keeps_stale_value() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("k", 5, 10);
        clock.advance_secs(15);

        let value = cache
            .get_with_revalidate("k", 10, || async {
                Err(CacheError::Compute("node down".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        settle(&cache).await;

        let value = cache
            .get_with_revalidate("k", 10, || async { Ok(6) })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_miss_failure_reaches_caller() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        let err = cache
            .get_with_revalidate("k", 10, || async {
                Err(CacheError::Compute("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::Compute("boom".to_string()));
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_last_good_value_survives_long_outage() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("k", 5, 10);

        for _ in 0..3 {
            clock.advance_secs(15);
            let value = cache
                .get_with_revalidate("k", 10, || async {
                    Err(CacheError::Compute("down".to_string()))
                })
                .await;
            assert_eq!(value, Ok(5));
            settle(&cache).await;
            cache.sweep();
            assert_eq!(cache.stats().entries, 1);
        }

        let value = cache
            .get_with_revalidate("k", 10, || async { Ok(6) })
            .await;
        assert_eq!(value, Ok(5));
        settle(&cache).await;
        assert_eq!(cache.get("k"), Some(6));
        assert_eq!(cache.stats().failures, 3);
    }

    #[tokio::test]
    async fn test_sweep_clears_panicked_recompute() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("k", 1, 10);
        clock.advance_secs(11);

        let value = cache
            .get_with_revalidate("k", 10, || async {
                if true {
                    panic!("compute panicked");
                }
                Ok(2)
            })
            .await;
        assert_eq!(value, Ok(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.stats().in_flight, 1);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().in_flight, 0);
        assert_eq!(cache.stats().entries, 1);

        let value = cache
            .get_with_revalidate("k", 10, || async { Ok(3) })
            .await;
        assert_eq!(value, Ok(1));
        settle(&cache).await;
        assert_eq!(cache.get("k"), Some(3));
    }

    #[tokio::test]
    async fn test_observer_sees_events_from_clones() {
        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl CacheObserver for Counting {
            fn record(&self, _event: CacheEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let clock = Arc::new(ManualClock::new(0));
        let observer = Arc::new(Counting::default());
        let cache: RevalidatingCache<u64> = RevalidatingCache::with_observer(
            CacheConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&observer) as Arc<dyn CacheObserver>,
        );
        let clone = cache.clone();

        clone
            .get_with_revalidate("k", 10, || async { Ok(1) })
            .await
            .unwrap();
        // Recompute then Miss.
        assert_eq!(observer.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_ahead_serves_fresh_value() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = RevalidatingCache::with_clock(
            CacheConfig {
                default_ttl_secs: 10,
                capacity: 16,
                refresh_ahead_ratio: 0.5,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        cache.set("k", 1, 10);
        clock.advance_secs(6);

        let value = cache
            .get_with_revalidate("k", 10, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 1);
        settle(&cache).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test]
    async fn test_invalidate_discards_inflight_result() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("k", 1, 10);
        clock.advance_secs(11);

        let gate = Arc::new(Notify::new());
        let waiter = Arc::clone(&gate);
        cache
            .get_with_revalidate("k", 10, move || async move {
                waiter.notified().await;
                Ok(2)
            })
            .await
            .unwrap();

        assert!(cache.invalidate("k"));
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_invalidate_prefix_and_sweep() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        cache.set("staker:address=a", 1, 10);
        cache.set("staker:address=b", 2, 10);
        cache.set("phase:phase=1", 3, 100);

        assert_eq!(cache.invalidate_prefix("staker:"), 2);
        assert_eq!(cache.get("phase:phase=1"), Some(3));

        cache.set("short", 4, 1);
        clock.advance_secs(200);
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.stats().entries, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = RevalidatingCache::with_clock(
            CacheConfig {
                default_ttl_secs: 10,
                capacity: 2,
                refresh_ahead_ratio: 1.0,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        cache.set("a", 1, 10);
        cache.set("b", 2, 10);
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, 10);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache(&clock);
        let (tx, rx) = watch::channel(false);
        let handle = cache.spawn_sweeper(Duration::from_millis(5), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
