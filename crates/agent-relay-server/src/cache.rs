//! TTL cache with single-flight refresh per key.
//!
//! The key -> entry map sits behind a short-held coarse lock that is only
//! taken to create, look up or delete entries. Whether an entry needs a
//! refresh is decided under the entry's own async lock, so concurrent callers
//! for one key wait for a single load while other keys proceed in parallel.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

use crate::stream::StreamContext;

/// Returned when a caller stops waiting for a busy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for agent_relay_core::MetadataError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

struct EntryState<V, E> {
    item: Option<Result<V, E>>,
    expires: Instant,
}

impl<V, E> EntryState<V, E> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires <= now
    }

    fn needs_refresh(&self, now: Instant) -> bool {
        self.item.is_none() || self.is_expired(now)
    }
}

struct CacheEntry<V, E> {
    state: AsyncMutex<EntryState<V, E>>,
}

/// Caches successful and failed lookups for independent durations.
///
/// A zero `ttl` turns the cache into a pass-through.
pub struct ExpiringCache<K, V, E> {
    ttl: Duration,
    error_ttl: Duration,
    entries: Mutex<HashMap<K, Arc<CacheEntry<V, E>>>>,
}

impl<K, V, E> ExpiringCache<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone + From<Cancelled>,
{
    pub fn new(ttl: Duration, error_ttl: Duration) -> Self {
        Self {
            ttl,
            error_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// How often expired entries are swept: the smaller of the two TTLs.
    /// Errors that are not cached at all do not shorten it.
    pub fn sweep_period(&self) -> Duration {
        if self.error_ttl.is_zero() {
            self.ttl
        } else {
            self.ttl.min(self.error_ttl)
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<K, Arc<CacheEntry<V, E>>>> {
        // Nothing panics while the map lock is held; recover the data anyway.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, key: K) -> Arc<CacheEntry<V, E>> {
        let mut entries = self.lock_entries();
        entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CacheEntry {
                    state: AsyncMutex::new(EntryState {
                        item: None,
                        expires: Instant::now(),
                    }),
                })
            })
            .clone()
    }

    /// Get the cached result for `key`, calling `loader` if the entry is
    /// empty or expired.
    ///
    /// If another caller is refreshing the same key this waits for it,
    /// unless `cancelled` resolves first, in which case `Cancelled` is
    /// returned and the entry is left untouched.
    pub async fn get<C, F, Fut>(&self, key: K, cancelled: C, loader: F) -> Result<V, E>
    where
        C: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !self.is_enabled() {
            return loader().await;
        }

        let entry = self.entry(key);
        let mut state = tokio::select! {
            biased;
            _ = cancelled => return Err(Cancelled.into()),
            guard = entry.state.lock() => guard,
        };

        if !state.needs_refresh(Instant::now()) {
            if let Some(item) = &state.item {
                return item.clone();
            }
        }

        let result = loader().await;
        let ttl = if result.is_ok() {
            self.ttl
        } else {
            self.error_ttl
        };
        state.item = Some(result.clone());
        state.expires = Instant::now() + ttl;
        result
    }

    /// Delete expired entries. Entries that are locked or held by an
    /// in-flight `get` are skipped, never waited for.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.state.try_lock() {
                Ok(state) => !state.is_expired(now),
                Err(_) => true,
            }
        });
        before - entries.len()
    }

    /// Sweep expired entries every `sweep_period` until `ctx` is cancelled.
    pub async fn run_eviction(&self, name: &str, ctx: &StreamContext) {
        let period = self.sweep_period();
        if !self.is_enabled() || period.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        debug!("Evicted {} expired {} cache entries", evicted, name);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Upstream,
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    type TestCache = ExpiringCache<String, u32, TestError>;

    fn cache(ttl_secs: u64, error_ttl_secs: u64) -> Arc<TestCache> {
        Arc::new(ExpiringCache::new(
            Duration::from_secs(ttl_secs),
            Duration::from_secs(error_ttl_secs),
        ))
    }

    fn never() -> std::future::Pending<()> {
        std::future::pending()
    }

    async fn counted_get(
        cache: &TestCache,
        key: &str,
        calls: &AtomicUsize,
        result: Result<u32, TestError>,
    ) -> Result<u32, TestError> {
        cache
            .get(key.to_string(), never(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                result
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_load_once() {
        let cache = cache(300, 60);
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get("token".to_string(), never(), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(42)
                        })
                        .await
                })
            })
            .collect();

        for res in futures::future::join_all(handles).await {
            assert_eq!(res.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_keys_load_in_parallel() {
        let cache = cache(300, 60);
        let start = Instant::now();

        let slow = |value: u32| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(value)
        };
        let (a, b) = tokio::join!(
            cache.get("a".to_string(), never(), || slow(1)),
            cache.get("b".to_string(), never(), || slow(2)),
        );

        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(2));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_cached_until_ttl() {
        let cache = cache(300, 60);
        let calls = AtomicUsize::new(0);

        assert_eq!(counted_get(&cache, "k", &calls, Ok(1)).await, Ok(1));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(counted_get(&cache, "k", &calls, Ok(2)).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counted_get(&cache, "k", &calls, Ok(2)).await, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_retried_after_error_ttl() {
        let cache = cache(300, 60);
        let calls = AtomicUsize::new(0);

        let first = counted_get(&cache, "k", &calls, Err(TestError::Upstream)).await;
        assert_eq!(first, Err(TestError::Upstream));

        tokio::time::advance(Duration::from_secs(30)).await;
        let cached = counted_get(&cache, "k", &calls, Ok(7)).await;
        assert_eq!(cached, Err(TestError::Upstream));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Well before the success TTL
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(counted_get(&cache, "k", &calls, Ok(7)).await, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_pass_through() {
        let cache = cache(0, 60);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert_eq!(counted_get(&cache, "k", &calls, Ok(1)).await, Ok(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_busy_entry() {
        let cache = cache(300, 60);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let holder = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get("k".to_string(), never(), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(5)
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        let (canceller, ctx) = StreamContext::new();
        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get("k".to_string(), ctx.cancelled(), || async { Ok(99) })
                    .await
            }
        });
        tokio::task::yield_now().await;
        canceller.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Err(TestError::Cancelled));

        release_tx.send(()).unwrap();
        assert_eq!(holder.await.unwrap(), Ok(5));

        // The holder's result is intact and served from cache
        let calls = AtomicUsize::new(0);
        assert_eq!(counted_get(&cache, "k", &calls, Ok(99)).await, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loader_panic_releases_entry() {
        let cache = cache(300, 60);

        let panicked = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get("k".to_string(), never(), || async {
                        let fail = true;
                        if fail {
                            panic!("loader failed");
                        }
                        Ok(0)
                    })
                    .await
            }
        })
        .await;
        assert!(panicked.is_err());

        let calls = AtomicUsize::new(0);
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            counted_get(&cache, "k", &calls, Ok(3)),
        )
        .await
        .unwrap();
        assert_eq!(res, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_skips_busy_entries() {
        let cache = cache(10, 10);
        let calls = AtomicUsize::new(0);

        counted_get(&cache, "idle", &calls, Ok(1)).await.unwrap();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let busy = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get("busy".to_string(), never(), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(2)
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);

        release_tx.send(()).unwrap();
        busy.await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_eviction_sweeps_periodically() {
        let cache = cache(20, 5);
        assert_eq!(cache.sweep_period(), Duration::from_secs(5));

        let calls = AtomicUsize::new(0);
        counted_get(&cache, "k", &calls, Err(TestError::Upstream))
            .await
            .unwrap_err();

        let (canceller, ctx) = StreamContext::new();
        let sweeper = tokio::spawn({
            let cache = cache.clone();
            async move { cache.run_eviction("test", &ctx).await }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());

        canceller.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_errors_still_get_swept() {
        let cache = cache(20, 0);
        assert_eq!(cache.sweep_period(), Duration::from_secs(20));

        let calls = AtomicUsize::new(0);
        counted_get(&cache, "k", &calls, Err(TestError::Upstream))
            .await
            .unwrap_err();
        counted_get(&cache, "k", &calls, Err(TestError::Upstream))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);

        let (canceller, ctx) = StreamContext::new();
        let sweeper = tokio::spawn({
            let cache = cache.clone();
            async move { cache.run_eviction("test", &ctx).await }
        });

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(cache.is_empty());

        canceller.cancel();
        sweeper.await.unwrap();
    }
}
