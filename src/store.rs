//! Per-key bucket storage.
//!
//! A [`BucketStore`] maps keys to [`TokenBucket`]s, creating a full bucket the first time a
//! key is seen and evicting buckets that sat idle longer than the configured cleanup age.
//!
//! Two in-process implementations are provided:
//! - [`InMemoryStore`]: one `RwLock<HashMap>`; lookups of existing keys share the read lock
//!   and only new keys take the write lock (with a double check).
//! - [`ShardedStore`]: a `DashMap`, which spreads both reads and inserts over shards.
//!
//! The map lock and a bucket's own lock are never held together: the store hands out an
//! `Arc<TokenBucket>` and all token arithmetic happens after the map lock is released.

use crate::bucket::TokenBucket;
use crate::clock::{default_clock, Clock, SharedClock};
use crate::eviction::{spawn_periodic, EvictionHandle};
use crate::RateLimitError;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::bucket::BucketConfig;

const EVICTION_THREAD: &str = "tollgate-eviction";

/// Storage backend for per-key buckets.
///
/// Implementations must honor get-or-create: concurrent `get_bucket` calls for an unseen
/// key all receive the same bucket.
pub trait BucketStore: Send + Sync + fmt::Debug {
    /// Fetch the bucket for `key`, creating a full one if absent. Errors with
    /// [`RateLimitError::InvalidKey`] for an empty key.
    fn get_bucket(&self, key: &str) -> Result<Arc<TokenBucket>, RateLimitError>;

    /// Remove idle buckets, returning how many were removed.
    fn cleanup(&self) -> Result<usize, RateLimitError>;

    /// Number of live buckets.
    fn count(&self) -> usize;

    /// Run [`cleanup`](Self::cleanup) every `interval` until the handle is cancelled.
    ///
    /// Stores without idle eviction keep this default, which returns an inert handle.
    fn start_background_eviction(self: Arc<Self>, interval: Duration) -> EvictionHandle {
        let _ = interval;
        EvictionHandle::inert()
    }
}

#[derive(Debug)]
struct Entry {
    bucket: Arc<TokenBucket>,
    last_accessed: AtomicU64,
}

impl Entry {
    fn new(bucket: TokenBucket, now: u64) -> Self {
        Self { bucket: Arc::new(bucket), last_accessed: AtomicU64::new(now) }
    }

    fn touch(&self, now: u64) -> Arc<TokenBucket> {
        self.last_accessed.fetch_max(now, Ordering::Relaxed);
        self.bucket.clone()
    }

    fn idle_since(&self, cutoff: u64) -> bool {
        self.last_accessed.load(Ordering::Relaxed) < cutoff
    }
}

/// Settings shared by the in-process stores.
#[derive(Debug, Clone)]
struct StoreSettings {
    config: BucketConfig,
    cleanup_age: Duration,
    clock: SharedClock,
}

impl StoreSettings {
    fn new(config: BucketConfig, cleanup_age: Duration) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self { config, cleanup_age, clock: default_clock() })
    }

    fn new_bucket(&self) -> TokenBucket {
        TokenBucket::with_shared_clock(self.config, self.clock.clone())
    }

    /// Entries last touched before this reading are idle; `None` when eviction is off.
    fn idle_cutoff(&self) -> Option<u64> {
        if self.cleanup_age.is_zero() {
            return None;
        }
        let age = u64::try_from(self.cleanup_age.as_nanos()).unwrap_or(u64::MAX);
        Some(self.clock.now_nanos().saturating_sub(age))
    }
}

fn check_key(key: &str) -> Result<(), RateLimitError> {
    if key.is_empty() {
        return Err(RateLimitError::InvalidKey);
    }
    Ok(())
}

fn log_cleanup(removed: usize, remaining: usize) {
    if removed > 0 {
        info!(target: "tollgate::store", removed, remaining, "evicted idle buckets");
    }
}

fn periodic_cleanup<S>(store: &Arc<S>, cleanup_age: Duration, interval: Duration) -> EvictionHandle
where
    S: BucketStore + 'static,
{
    if cleanup_age.is_zero() || interval.is_zero() {
        return EvictionHandle::inert();
    }
    info!(target: "tollgate::store", ?interval, ?cleanup_age, "starting background eviction");
    let weak = Arc::downgrade(store);
    spawn_periodic(EVICTION_THREAD, interval, move || match weak.upgrade() {
        Some(store) => {
            if let Err(err) = store.cleanup() {
                warn!(target: "tollgate::store", error = %err, "background eviction failed");
            }
            ControlFlow::Continue(())
        }
        // Store dropped: nothing left to evict.
        None => ControlFlow::Break(()),
    })
}

/// In-memory store guarded by a single reader-writer lock.
#[derive(Debug)]
pub struct InMemoryStore {
    buckets: RwLock<HashMap<String, Entry>>,
    settings: StoreSettings,
}

impl InMemoryStore {
    /// Create a store whose buckets follow `config`. A zero `cleanup_age` disables eviction.
    pub fn new(config: BucketConfig, cleanup_age: Duration) -> Result<Self, RateLimitError> {
        Ok(Self { buckets: RwLock::new(HashMap::new()), settings: StoreSettings::new(config, cleanup_age)? })
    }

    /// Override the clock (useful for deterministic tests). Call before any bucket exists.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.settings.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: SharedClock) -> Self {
        self.settings.clock = clock;
        self
    }

    /// Policy applied to newly created buckets.
    pub fn bucket_config(&self) -> BucketConfig {
        self.settings.config
    }

    /// Idle age after which buckets are evicted (zero = never).
    pub fn cleanup_age(&self) -> Duration {
        self.settings.cleanup_age
    }
}

impl BucketStore for InMemoryStore {
    fn get_bucket(&self, key: &str) -> Result<Arc<TokenBucket>, RateLimitError> {
        check_key(key)?;
        let now = self.settings.clock.now_nanos();

        {
            let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = map.get(key) {
                return Ok(entry.touch(now));
            }
        }

        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks.
        if let Some(entry) = map.get(key) {
            return Ok(entry.touch(now));
        }
        let entry = Entry::new(self.settings.new_bucket(), now);
        let bucket = entry.bucket.clone();
        map.insert(key.to_owned(), entry);
        debug!(target: "tollgate::store", key, "created bucket");
        Ok(bucket)
    }

    fn cleanup(&self) -> Result<usize, RateLimitError> {
        let Some(cutoff) = self.settings.idle_cutoff() else {
            return Ok(0);
        };
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, entry| !entry.idle_since(cutoff));
        let removed = before - map.len();
        log_cleanup(removed, map.len());
        Ok(removed)
    }

    fn count(&self) -> usize {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn start_background_eviction(self: Arc<Self>, interval: Duration) -> EvictionHandle {
        let age = self.settings.cleanup_age;
        periodic_cleanup(&self, age, interval)
    }
}

/// Sharded in-memory store backed by `DashMap`.
///
/// Same contract as [`InMemoryStore`]; inserts for different keys rarely contend.
pub struct ShardedStore {
    buckets: DashMap<String, Entry>,
    settings: StoreSettings,
}

impl fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedStore")
            .field("buckets", &self.buckets.len())
            .field("config", &self.settings.config)
            .field("cleanup_age", &self.settings.cleanup_age)
            .finish()
    }
}

impl ShardedStore {
    /// Create a store whose buckets follow `config`. A zero `cleanup_age` disables eviction.
    pub fn new(config: BucketConfig, cleanup_age: Duration) -> Result<Self, RateLimitError> {
        Ok(Self { buckets: DashMap::new(), settings: StoreSettings::new(config, cleanup_age)? })
    }

    /// Override the clock (useful for deterministic tests). Call before any bucket exists.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.settings.clock = Arc::new(clock);
        self
    }

    /// Policy applied to newly created buckets.
    pub fn bucket_config(&self) -> BucketConfig {
        self.settings.config
    }
}

impl BucketStore for ShardedStore {
    fn get_bucket(&self, key: &str) -> Result<Arc<TokenBucket>, RateLimitError> {
        check_key(key)?;
        let now = self.settings.clock.now_nanos();

        if let Some(entry) = self.buckets.get(key) {
            return Ok(entry.touch(now));
        }
        let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            debug!(target: "tollgate::store", key, "created bucket");
            Entry::new(self.settings.new_bucket(), now)
        });
        Ok(entry.touch(now))
    }

    fn cleanup(&self) -> Result<usize, RateLimitError> {
        let Some(cutoff) = self.settings.idle_cutoff() else {
            return Ok(0);
        };
        let mut removed = 0;
        self.buckets.retain(|_, entry| {
            let idle = entry.idle_since(cutoff);
            if idle {
                removed += 1;
            }
            !idle
        });
        log_cleanup(removed, self.buckets.len());
        Ok(removed)
    }

    fn count(&self) -> usize {
        self.buckets.len()
    }

    fn start_background_eviction(self: Arc<Self>, interval: Duration) -> EvictionHandle {
        let age = self.settings.cleanup_age;
        periodic_cleanup(&self, age, interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    fn config(capacity: u64, rate: f64) -> BucketConfig {
        BucketConfig::new(capacity, rate).unwrap()
    }

    fn both(cfg: BucketConfig, age: Duration, clock: &ManualClock) -> Vec<Arc<dyn BucketStore>> {
        vec![
            Arc::new(InMemoryStore::new(cfg, age).unwrap().with_clock(clock.clone()))
                as Arc<dyn BucketStore>,
            Arc::new(ShardedStore::new(cfg, age).unwrap().with_clock(clock.clone())),
        ]
    }

    #[test]
    fn rejects_invalid_config() {
        let bad: BucketConfig = serde_json::from_str(r#"{"capacity":0,"refill_rate":1.0}"#).unwrap();
        let err = InMemoryStore::new(bad, Duration::ZERO).unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidCapacity { .. }));

        let bad: BucketConfig = serde_json::from_str(r#"{"capacity":3,"refill_rate":-1.0}"#).unwrap();
        let err = ShardedStore::new(bad, Duration::ZERO).unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidRefillRate { .. }));
    }

    #[test]
    fn empty_key_is_rejected_without_side_effects() {
        let clock = ManualClock::new();
        for store in both(config(3, 1.0), Duration::ZERO, &clock) {
            assert!(store.get_bucket("").unwrap_err().is_invalid_key());
            assert_eq!(store.count(), 0);
        }
    }

    #[test]
    fn get_bucket_returns_same_bucket_for_same_key() {
        let clock = ManualClock::new();
        for store in both(config(3, 1.0), Duration::ZERO, &clock) {
            let a = store.get_bucket("user").unwrap();
            assert!(a.allow());
            let b = store.get_bucket("user").unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            assert_eq!(b.remaining(), 2);
            assert_eq!(store.count(), 1);
        }
    }

    #[test]
    fn keys_are_isolated() {
        let clock = ManualClock::new();
        for store in both(config(3, 1.0), Duration::ZERO, &clock) {
            let key1 = store.get_bucket("key1").unwrap();
            assert!(key1.allow_n(3));
            assert!(!key1.allow());
            let key2 = store.get_bucket("key2").unwrap();
            assert_eq!(key2.remaining(), 3);
            assert_eq!(store.count(), 2);
        }
    }

    #[test]
    fn cleanup_evicts_idle_buckets_and_recreates_full() {
        let clock = ManualClock::new();
        for store in both(config(5, 1.0), Duration::from_millis(100), &clock) {
            let bucket = store.get_bucket("user1").unwrap();
            assert!(bucket.allow_n(5));
            clock.advance(Duration::from_millis(150));

            assert_eq!(store.cleanup().unwrap(), 1);
            assert_eq!(store.count(), 0);

            let fresh = store.get_bucket("user1").unwrap();
            assert!(!Arc::ptr_eq(&bucket, &fresh));
            assert_eq!(fresh.remaining(), 5);
        }
    }

    #[test]
    fn cleanup_keeps_recently_accessed_buckets() {
        let clock = ManualClock::new();
        for store in both(config(5, 1.0), Duration::from_millis(100), &clock) {
            store.get_bucket("idle").unwrap();
            store.get_bucket("busy").unwrap();
            clock.advance(Duration::from_millis(80));
            store.get_bucket("busy").unwrap();
            clock.advance(Duration::from_millis(80));

            assert_eq!(store.cleanup().unwrap(), 1);
            assert_eq!(store.count(), 1);
        }
    }

    #[test]
    fn zero_cleanup_age_disables_eviction() {
        let clock = ManualClock::new();
        for store in both(config(5, 1.0), Duration::ZERO, &clock) {
            store.get_bucket("forever").unwrap();
            clock.advance(Duration::from_secs(365 * 86_400));
            assert_eq!(store.cleanup().unwrap(), 0);
            assert_eq!(store.count(), 1);
        }
    }

    #[test]
    fn concurrent_first_access_creates_one_bucket() {
        let stores: Vec<Arc<dyn BucketStore>> = vec![
            Arc::new(InMemoryStore::new(config(1_000, 0.001), Duration::ZERO).unwrap())
                as Arc<dyn BucketStore>,
            Arc::new(ShardedStore::new(config(1_000, 0.001), Duration::ZERO).unwrap()),
        ];
        for store in stores {
            let barrier = Arc::new(Barrier::new(16));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let bucket = store.get_bucket("shared").unwrap();
                        assert!(bucket.allow());
                        bucket
                    })
                })
                .collect();
            let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(buckets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
            assert_eq!(store.count(), 1);
            assert_eq!(buckets[0].remaining(), 1_000 - 16);
        }
    }

    #[test]
    fn background_eviction_removes_idle_buckets() {
        let store = Arc::new(InMemoryStore::new(config(5, 1.0), Duration::from_millis(30)).unwrap());
        store.get_bucket("gone-soon").unwrap();
        let handle = store.clone().start_background_eviction(Duration::from_millis(10));
        assert!(handle.is_running());

        let start = Instant::now();
        while store.count() > 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.count(), 0);
        handle.cancel();
    }

    #[test]
    fn cancelled_eviction_stops_removing() {
        let store = Arc::new(ShardedStore::new(config(5, 1.0), Duration::from_millis(20)).unwrap());
        let handle = store.clone().start_background_eviction(Duration::from_millis(10));
        handle.cancel();
        let start = Instant::now();
        while handle.is_running() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());

        store.get_bucket("stays").unwrap();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn background_eviction_is_inert_when_disabled() {
        let no_age = Arc::new(InMemoryStore::new(config(5, 1.0), Duration::ZERO).unwrap());
        assert!(!no_age.start_background_eviction(Duration::from_millis(10)).is_running());

        let aged = Arc::new(InMemoryStore::new(config(5, 1.0), Duration::from_secs(1)).unwrap());
        assert!(!aged.start_background_eviction(Duration::ZERO).is_running());
    }

    #[test]
    fn eviction_task_exits_when_store_is_dropped() {
        let store = Arc::new(InMemoryStore::new(config(5, 1.0), Duration::from_secs(60)).unwrap());
        let handle = store.clone().start_background_eviction(Duration::from_millis(5));
        drop(store);
        let start = Instant::now();
        while handle.is_running() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());
    }
}
