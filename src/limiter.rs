//! The rate limiter: turns keys and requests into [`Decision`]s.
//!
//! ```
//! use tollgate::RateLimiter;
//!
//! let limiter = RateLimiter::builder().defaults(2, 1.0).build().unwrap();
//! assert!(limiter.allow("user-1").unwrap().allowed);
//! assert!(limiter.allow("user-1").unwrap().allowed);
//!
//! let third = limiter.allow("user-1").unwrap();
//! assert!(!third.allowed);
//! assert!(third.retry_after > std::time::Duration::ZERO);
//! ```

use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, SharedClock};
use crate::config::{LimiterConfig, PolicyConfig};
use crate::decision::Decision;
use crate::eviction::EvictionHandle;
use crate::key::KeyExtractor;
use crate::store::{BucketStore, InMemoryStore};
use crate::RateLimitError;
use http::Request;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Maps a request path to the route name used for policy lookup.
pub type RouteExtractor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Per-key rate limiter backed by a [`BucketStore`].
///
/// Every key is charged against a bucket built from the default policy. Route policies
/// decide whether a request is limited at all.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: DynamicConfig<LimiterConfig>,
    key_extractor: KeyExtractor,
    route_extractor: RouteExtractor,
    cleanup_interval: Duration,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store)
            .field("key_extractor", &self.key_extractor)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Limiter with an in-memory store built from `config`.
    pub fn new(config: LimiterConfig) -> Result<Self, RateLimitError> {
        Self::builder().config(config).build()
    }

    /// Spend one token from `key`'s bucket.
    pub fn allow(&self, key: &str) -> Result<Decision, RateLimitError> {
        self.allow_n(key, 1)
    }

    /// Spend `n` tokens from `key`'s bucket. `n == 0` is always allowed and spends nothing.
    pub fn allow_n(&self, key: &str, n: u64) -> Result<Decision, RateLimitError> {
        if key.is_empty() {
            return Err(RateLimitError::InvalidKey);
        }
        let bucket = self.store.get_bucket(key)?;
        let outcome = bucket.acquire(n);
        if !outcome.allowed {
            debug!(target: "tollgate::limiter", key, retry_after = ?outcome.retry_after, "request denied");
        }
        Ok(Decision {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            limit: bucket.capacity(),
            retry_after: outcome.retry_after,
            key: key.to_string(),
            route: None,
        })
    }

    /// Extract the key from `req`, resolve the route policy, and check it.
    ///
    /// Disabled routes are allowed without touching the store.
    pub fn allow_request<B>(&self, req: &Request<B>) -> Result<Decision, RateLimitError> {
        let key = self.key_extractor.extract(req)?;
        let route = (self.route_extractor)(req.uri().path());

        let config = self.config.get();
        let policy = config.policy_for(&route);
        let mut decision = if policy.enabled {
            self.allow(&key)?
        } else {
            Decision::unlimited(key, policy.capacity)
        };
        decision.route = Some(route);
        Ok(decision)
    }

    /// Install or replace the policy for `route` while the limiter is running.
    pub fn set_policy(&self, route: &str, policy: PolicyConfig) -> Result<(), RateLimitError> {
        let previous = self.config.try_update(|current| {
            let mut next = current.clone();
            let previous = next.set_policy(route, policy.clone())?;
            Ok::<_, RateLimitError>((next, previous))
        })?;
        if let Some(previous) = previous {
            warn!(target: "tollgate::limiter", route, ?previous, ?policy, "replaced route policy");
        }
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.get()
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    pub fn key_extractor(&self) -> &KeyExtractor {
        &self.key_extractor
    }

    /// Interval used by [`start_background_cleanup`](Self::start_background_cleanup).
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Run one eviction pass now.
    pub fn cleanup(&self) -> Result<usize, RateLimitError> {
        self.store.cleanup()
    }

    /// Start periodic eviction on the store. Stores without eviction support return an
    /// inert handle.
    pub fn start_background_cleanup(&self) -> EvictionHandle {
        self.store.clone().start_background_eviction(self.cleanup_interval)
    }
}

/// Builder for [`RateLimiter`]. Errors from any option surface from [`build`](Self::build).
pub struct RateLimiterBuilder {
    store: Option<Arc<dyn BucketStore>>,
    config: Result<LimiterConfig, RateLimitError>,
    key_extractor: Option<KeyExtractor>,
    route_extractor: Option<RouteExtractor>,
    cleanup_age: Option<Duration>,
    cleanup_interval: Duration,
    clock: Option<SharedClock>,
}

impl fmt::Debug for RateLimiterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterBuilder")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("key_extractor", &self.key_extractor)
            .field("cleanup_age", &self.cleanup_age)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl RateLimiterBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            config: Ok(LimiterConfig::default()),
            key_extractor: None,
            route_extractor: None,
            cleanup_age: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            clock: None,
        }
    }

    /// Use a custom store. The store's own bucket policy and cleanup age apply; the
    /// default policy, cleanup age and clock options are then ignored.
    pub fn store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: LimiterConfig) -> Self {
        self.config = Ok(config);
        self
    }

    /// Load the configuration from a YAML file.
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config = LimiterConfig::from_yaml_file(path);
        self
    }

    /// Replace the configuration with defaults using this default policy.
    pub fn defaults(mut self, capacity: u64, refill_rate: f64) -> Self {
        self.config = LimiterConfig::with_defaults(capacity, refill_rate);
        self
    }

    /// Override the extractor named in the configuration.
    pub fn key_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.key_extractor = Some(extractor);
        self
    }

    /// Override the configured idle age (zero disables eviction).
    pub fn cleanup_age(mut self, age: Duration) -> Self {
        self.cleanup_age = Some(age);
        self
    }

    /// How often background cleanup runs (default 10 minutes; zero disables it).
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Map request paths to route names, e.g. to collapse path parameters. Defaults to
    /// the path itself.
    pub fn route_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.route_extractor = Some(Arc::new(f));
        self
    }

    /// Clock for the default store.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn build(self) -> Result<RateLimiter, RateLimitError> {
        let config = self.config?;
        config.validate()?;

        // The configured extractor spec is only parsed when no override was given.
        let key_extractor = match self.key_extractor {
            Some(extractor) => extractor,
            None => config.extractor()?,
        };

        let store: Arc<dyn BucketStore> = match self.store {
            Some(store) => store,
            None => {
                let cleanup_age = match self.cleanup_age {
                    Some(age) => age,
                    None => config.parsed_cleanup_age()?,
                };
                let mut store =
                    InMemoryStore::new(config.defaults.to_bucket_config()?, cleanup_age)?;
                if let Some(clock) = self.clock {
                    store = store.with_shared_clock(clock);
                }
                Arc::new(store)
            }
        };

        Ok(RateLimiter {
            store,
            config: DynamicConfig::new(config),
            key_extractor,
            route_extractor: self.route_extractor.unwrap_or_else(|| Arc::new(str::to_string)),
            cleanup_interval: self.cleanup_interval,
        })
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
