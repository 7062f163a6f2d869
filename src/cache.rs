//! Memoization in front of a hosted function
//!
//! The cache is shared by every worker of one endpoint. Keys are the exact
//! (positional, named) argument combination of a request, so `f(1)` and
//! `f(a=1)` are cached separately.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by the cache layer itself
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("arguments cannot be used as a cache key: {0}")]
    Key(#[from] rmp_serde::encode::Error),
}

/// How results of an endpoint are memoized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    Disabled,
    Unbounded,
    /// Evict least recently used entries past the capacity
    Bounded(NonZeroUsize),
}

impl CachePolicy {
    /// Policy for the `cache` / `cache_capacity` option pair
    ///
    /// A capacity of `None` or `0` means unbounded.
    pub fn from_options(enabled: bool, capacity: Option<usize>) -> Self {
        match (enabled, capacity.and_then(NonZeroUsize::new)) {
            (false, _) => CachePolicy::Disabled,
            (true, None) => CachePolicy::Unbounded,
            (true, Some(capacity)) => CachePolicy::Bounded(capacity),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CachePolicy::Disabled)
    }
}

/// Canonical encoding of a request's arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    pub fn new(args: &[Value], kwargs: &Map<String, Value>) -> Result<Self, CacheError> {
        let args: Vec<Canonical<'_>> = args.iter().map(Canonical).collect();
        let kwargs: BTreeMap<&str, Canonical<'_>> =
            kwargs.iter().map(|(k, v)| (k.as_str(), Canonical(v))).collect();
        Ok(Self(rmp_serde::to_vec(&(args, kwargs))?))
    }
}

/// Serializes a value with object keys in sorted order, whatever map
/// implementation `serde_json` was built with
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            Value::Object(map) => {
                let sorted: BTreeMap<&str, Canonical<'_>> =
                    map.iter().map(|(k, v)| (k.as_str(), Canonical(v))).collect();
                sorted.serialize(serializer)
            }
            other => other.serialize(serializer),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub capacity: Option<usize>,
}

/// Shared memo table for one endpoint
pub struct ResultCache {
    entries: Mutex<LruCache<CacheKey, Value>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    capacity: Option<NonZeroUsize>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create a cache for an enabled policy, `None` when caching is off
    pub fn for_policy(policy: CachePolicy) -> Option<Self> {
        match policy {
            CachePolicy::Disabled => None,
            CachePolicy::Unbounded => Some(Self::with_lru(LruCache::unbounded(), None)),
            CachePolicy::Bounded(capacity) => {
                Some(Self::with_lru(LruCache::new(capacity), Some(capacity)))
            }
        }
    }

    fn with_lru(entries: LruCache<CacheKey, Value>, capacity: Option<NonZeroUsize>) -> Self {
        Self {
            entries: Mutex::new(entries),
            in_flight: Mutex::new(HashMap::new()),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the memoized value for `key`, computing and storing it on a miss
    ///
    /// Concurrent callers with the same key wait for the first one instead of
    /// computing again. Errors are never stored; callers that waited on a
    /// failed computation retry it themselves. The boolean is true when the
    /// value came from the cache.
    pub fn get_or_compute<E>(
        &self,
        key: CacheKey,
        compute: impl FnOnce() -> Result<Value, E>,
    ) -> Result<(Value, bool), E> {
        let flight = loop {
            let pending = {
                let mut in_flight = lock(&self.in_flight);
                if let Some(value) = lock(&self.entries).get(&key).cloned() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((value, true));
                }
                match in_flight.get(&key) {
                    Some(flight) => Arc::clone(flight),
                    None => {
                        let flight = Arc::new(Flight::default());
                        in_flight.insert(key.clone(), Arc::clone(&flight));
                        break flight;
                    }
                }
            };

            if let Some(value) = pending.wait() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok((value, true));
            }
        };

        let mut leader = Leader {
            cache: self,
            key,
            flight,
            value: None,
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute()?;
        lock(&self.entries).put(leader.key.clone(), value.clone());
        leader.value = Some(value.clone());
        Ok((value, false))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: lock(&self.entries).len(),
            capacity: self.capacity.map(NonZeroUsize::get),
        }
    }
}

// Tables are only touched under their lock, never user code, so a poisoned
// lock still guards a consistent table.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A computation in progress; `None` while running, then its outcome
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Option<Value>>>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> Option<Value> {
        let mut outcome = lock(&self.outcome);
        while outcome.is_none() {
            outcome = self.done.wait(outcome).unwrap_or_else(|e| e.into_inner());
        }
        outcome.clone().flatten()
    }

    fn finish(&self, value: Option<Value>) {
        *lock(&self.outcome) = Some(value);
        self.done.notify_all();
    }
}

/// Releases waiters on drop, also when the computation failed or unwound
struct Leader<'a> {
    cache: &'a ResultCache,
    key: CacheKey,
    flight: Arc<Flight>,
    value: Option<Value>,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        lock(&self.cache.in_flight).remove(&self.key);
        self.flight.finish(self.value.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn key(args: Value) -> CacheKey {
        match args {
            Value::Array(args) => CacheKey::new(&args, &Map::new()).unwrap(),
            _ => panic!("expected an array"),
        }
    }

    fn counted(cache: &ResultCache, runs: &AtomicUsize, n: i64) -> (Value, bool) {
        cache
            .get_or_compute::<()>(key(json!([n])), || {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!(n * n))
            })
            .unwrap()
    }

    #[test]
    fn test_policy_from_options() {
        assert_eq!(CachePolicy::from_options(false, Some(8)), CachePolicy::Disabled);
        assert_eq!(CachePolicy::from_options(true, None), CachePolicy::Unbounded);
        assert_eq!(CachePolicy::from_options(true, Some(0)), CachePolicy::Unbounded);
        assert_eq!(
            CachePolicy::from_options(true, Some(8)),
            CachePolicy::Bounded(NonZeroUsize::new(8).unwrap())
        );
        assert!(ResultCache::for_policy(CachePolicy::Disabled).is_none());
    }

    #[test]
    fn test_identical_arguments_compute_once() {
        let cache = ResultCache::for_policy(CachePolicy::Unbounded).unwrap();
        let runs = AtomicUsize::new(0);

        assert_eq!(counted(&cache, &runs, 4), (json!(16), false));
        assert_eq!(counted(&cache, &runs, 4), (json!(16), true));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(counted(&cache, &runs, 5), (json!(25), false));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 2, 2));
        assert_eq!(stats.capacity, None);
    }

    #[test]
    fn test_bounded_evicts_least_recently_used() {
        let policy = CachePolicy::from_options(true, Some(2));
        let cache = ResultCache::for_policy(policy).unwrap();
        let runs = AtomicUsize::new(0);

        counted(&cache, &runs, 1);
        counted(&cache, &runs, 2);
        // Touch 1 so that 2 becomes the eviction candidate
        counted(&cache, &runs, 1);
        counted(&cache, &runs, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        assert!(counted(&cache, &runs, 1).1);
        assert!(!counted(&cache, &runs, 2).1);
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn test_errors_are_not_memoized() {
        let cache = ResultCache::for_policy(CachePolicy::Unbounded).unwrap();
        let runs = AtomicUsize::new(0);

        for _ in 0..2 {
            let result = cache.get_or_compute(key(json!([1])), || {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>("boom")
            });
            assert_eq!(result, Err("boom"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_concurrent_identical_calls_compute_once() {
        let cache = ResultCache::for_policy(CachePolicy::Unbounded).unwrap();
        let runs = AtomicUsize::new(0);

        let results: Vec<(Value, bool)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        cache
                            .get_or_compute::<()>(key(json!([3])), || {
                                runs.fetch_add(1, Ordering::SeqCst);
                                std::thread::sleep(std::time::Duration::from_millis(200));
                                Ok(json!(9))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|(value, _)| value == &json!(9)));
        assert_eq!(results.iter().filter(|(_, hit)| !hit).count(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (3, 1, 1));
    }

    #[test]
    fn test_waiters_retry_after_failed_computation() {
        let cache = ResultCache::for_policy(CachePolicy::Unbounded).unwrap();
        let runs = AtomicUsize::new(0);

        let outcomes: Vec<Result<(Value, bool), &str>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        cache.get_or_compute(key(json!([7])), || {
                            let run = runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(150));
                            if run == 0 {
                                Err("first run fails")
                            } else {
                                Ok(json!(49))
                            }
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(outcomes.contains(&Err("first run fails")));
        assert!(outcomes.contains(&Ok((json!(49), false))));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_key_distinguishes_positional_and_named() {
        let mut named = Map::new();
        named.insert("a".to_string(), json!(1));

        let positional = CacheKey::new(&[json!(1)], &Map::new()).unwrap();
        let keyword = CacheKey::new(&[], &named).unwrap();
        assert_ne!(positional, keyword);
    }

    #[test]
    fn test_key_ignores_map_insertion_order() {
        let mut first = Map::new();
        first.insert("x".to_string(), json!({"b": 1, "a": 2}));
        first.insert("y".to_string(), json!(true));

        let mut second = Map::new();
        second.insert("y".to_string(), json!(true));
        second.insert("x".to_string(), json!({"a": 2, "b": 1}));

        assert_eq!(
            CacheKey::new(&[], &first).unwrap(),
            CacheKey::new(&[], &second).unwrap()
        );
    }
}
