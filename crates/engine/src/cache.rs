//! Process-wide size cache with single-flight measurement.
//!
//! Sizes are keyed by content fingerprint and kept in a bounded LRU. When
//! several renders ask for the same uncached fingerprint at once, only one
//! of them calls the measurer; the others await its result. Failed
//! measurements are handed to everyone waiting on them but never stored.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::Serialize;
use tokenloom_core::{Fingerprint, MeasureError, MeasureInput, Measurer};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Result<u64, MeasureError>>>;

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// How a size was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// Already in the cache.
    Hit,
    /// Another caller was measuring it; we waited for their result.
    Coalesced,
    /// We called the measurer.
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub size: u64,
    pub source: LookupSource,
}

/// Memoizing front for a [`Measurer`], shared across concurrent renders.
pub struct SizeCache {
    measurer: Arc<dyn Measurer>,
    entries: Mutex<LruCache<Fingerprint, u64>>,
    in_flight: Mutex<HashMap<Fingerprint, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SizeCache {
    /// Capacity 0 is treated as 1.
    pub fn new(measurer: Arc<dyn Measurer>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            measurer,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Size of `input`, measuring at most once per fingerprint at a time.
    pub async fn measure(&self, input: &MeasureInput) -> Result<Lookup, MeasureError> {
        let (source, result) = self.lookup(input).await;
        result.map(|size| Lookup { size, source })
    }

    /// Like [`measure`](Self::measure), but reports the source even when the
    /// measurement failed. Coalesced failures count as hits, like coalesced
    /// successes.
    async fn lookup(&self, input: &MeasureInput) -> (LookupSource, Result<u64, MeasureError>) {
        let key = input.fingerprint();

        let cached = lock(&self.entries).get(&key).copied();
        if let Some(size) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (LookupSource::Hit, Ok(size));
        }

        let slot = {
            let mut in_flight = lock(&self.in_flight);
            // A leader may have finished between the first check and this lock.
            let cached = lock(&self.entries).get(&key).copied();
            if let Some(size) = cached {
                drop(in_flight);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return (LookupSource::Hit, Ok(size));
            }
            in_flight.entry(key).or_default().clone()
        };

        let mut leader = false;
        let result = slot
            .get_or_init(|| {
                leader = true;
                self.measurer.measure(input)
            })
            .await
            .clone();

        if !leader {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (LookupSource::Coalesced, result);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        {
            let mut in_flight = lock(&self.in_flight);
            if let Ok(size) = &result {
                lock(&self.entries).put(key, *size);
            }
            if in_flight.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                in_flight.remove(&key);
            }
        }

        match &result {
            Ok(size) => tracing::debug!(
                fingerprint = %key.short(),
                size,
                measurer = self.measurer.name(),
                "Measured content"
            ),
            Err(e) => tracing::debug!(
                fingerprint = %key.short(),
                error = %e,
                "Measurement failed, not caching"
            ),
        }

        (LookupSource::Miss, result)
    }

    /// Lifetime counters across every render that used this cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached size. Counters are kept.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn measurer_name(&self) -> &str {
        self.measurer.name()
    }
}

impl std::fmt::Debug for SizeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeCache")
            .field("measurer", &self.measurer.name())
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A per-request view of the shared cache that counts its own hits.
#[derive(Clone)]
pub struct RequestMeasurer {
    cache: Arc<SizeCache>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl RequestMeasurer {
    pub fn new(cache: Arc<SizeCache>) -> Self {
        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn measure(&self, input: &MeasureInput) -> Result<Lookup, MeasureError> {
        let (source, result) = self.cache.lookup(input).await;
        let counter = match source {
            LookupSource::Hit | LookupSource::Coalesced => &self.hits,
            LookupSource::Miss => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result.map(|size| Lookup { size, source })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokenloom_core::Role;

    /// Counts calls; sleeps so concurrent callers overlap.
    struct SlowCounter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl SlowCounter {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Measurer for SlowCounter {
        fn name(&self) -> &str {
            "slow_counter"
        }

        async fn measure(&self, input: &MeasureInput) -> Result<u64, MeasureError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(MeasureError::Unavailable("offline".into()));
            }
            Ok(input.text.len() as u64)
        }
    }

    #[tokio::test]
    async fn second_lookup_hits() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 16);
        let input = MeasureInput::new(Role::User, "hello");

        let first = cache.measure(&input).await.unwrap();
        let second = cache.measure(&input).await.unwrap();

        assert_eq!(first.source, LookupSource::Miss);
        assert_eq!(second.source, LookupSource::Hit);
        assert_eq!(second.size, 5);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn concurrent_lookups_measure_once() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 16);
        let input = MeasureInput::new(Role::User, "shared");

        let (a, b, c) = tokio::join!(
            cache.measure(&input),
            cache.measure(&input),
            cache.measure(&input)
        );

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        let sources = [a.unwrap().source, b.unwrap().source, c.unwrap().source];
        assert_eq!(
            sources.iter().filter(|s| **s == LookupSource::Miss).count(),
            1
        );
        assert_eq!(
            sources
                .iter()
                .filter(|s| **s == LookupSource::Coalesced)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn role_is_part_of_the_key() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 16);
        cache
            .measure(&MeasureInput::new(Role::User, "x"))
            .await
            .unwrap();
        cache
            .measure(&MeasureInput::new(Role::System, "x"))
            .await
            .unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn failures_are_shared_but_not_cached() {
        let counter = SlowCounter::new(true);
        let cache = SizeCache::new(counter.clone(), 16);
        let input = MeasureInput::new(Role::User, "broken");

        let (a, b) = tokio::join!(cache.measure(&input), cache.measure(&input));
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        assert!(cache.measure(&input).await.is_err());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lru_evicts_least_recent() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 2);
        let a = MeasureInput::new(Role::User, "a");
        let b = MeasureInput::new(Role::User, "b");
        let c = MeasureInput::new(Role::User, "c");

        cache.measure(&a).await.unwrap();
        cache.measure(&b).await.unwrap();
        cache.measure(&a).await.unwrap();
        cache.measure(&c).await.unwrap();
        assert_eq!(cache.len(), 2);

        // `b` was least recently used and is measured again.
        let again = cache.measure(&b).await.unwrap();
        assert_eq!(again.source, LookupSource::Miss);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn zero_capacity_still_caches_one() {
        let cache = SizeCache::new(SlowCounter::new(false), 0);
        let input = MeasureInput::new(Role::User, "solo");
        cache.measure(&input).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn request_measurer_counts_its_own_lookups() {
        let cache = Arc::new(SizeCache::new(SlowCounter::new(false), 16));
        let input = MeasureInput::new(Role::User, "hi");

        let first = RequestMeasurer::new(cache.clone());
        first.measure(&input).await.unwrap();
        assert_eq!(first.stats(), CacheStats { hits: 0, misses: 1 });

        let second = RequestMeasurer::new(cache.clone());
        second.measure(&input).await.unwrap();
        second.measure(&input).await.unwrap();
        assert_eq!(second.stats(), CacheStats { hits: 2, misses: 0 });
        assert_eq!(cache.stats(), CacheStats { hits: 2, misses: 1 });
    }

    #[tokio::test]
    async fn coalesced_failure_counts_as_hit_everywhere() {
        let cache = Arc::new(SizeCache::new(SlowCounter::new(true), 16));
        let input = MeasureInput::new(Role::User, "broken");
        let leader = RequestMeasurer::new(cache.clone());
        let waiter = RequestMeasurer::new(cache.clone());

        let (a, b) = tokio::join!(leader.measure(&input), waiter.measure(&input));
        assert!(a.is_err());
        assert!(b.is_err());

        assert_eq!(leader.stats(), CacheStats { hits: 0, misses: 1 });
        assert_eq!(waiter.stats(), CacheStats { hits: 1, misses: 0 });
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[tokio::test]
    async fn abandoned_leader_leaves_slot_reusable() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 16);
        let input = MeasureInput::new(Role::User, "abc");

        // Drop the leader while its measurement is still sleeping.
        tokio::select! {
            _ = cache.measure(&input) => panic!("measurement finished before the timeout"),
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());
        assert_eq!(lock(&cache.in_flight).len(), 1);

        let lookup = cache.measure(&input).await.unwrap();
        assert_eq!(lookup.size, 3);
        assert_eq!(lookup.source, LookupSource::Miss);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert!(lock(&cache.in_flight).is_empty());
        assert_eq!(cache.stats(), CacheStats { hits: 0, misses: 1 });
    }

    #[tokio::test]
    async fn clear_forces_remeasure() {
        let counter = SlowCounter::new(false);
        let cache = SizeCache::new(counter.clone(), 4);
        let input = MeasureInput::new(Role::Tool, "output");
        cache.measure(&input).await.unwrap();
        cache.clear();
        assert!(cache.is_empty());
        cache.measure(&input).await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }
}
