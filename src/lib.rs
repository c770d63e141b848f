#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Per-key token bucket rate limiting for Rust services.
//!
//! Each key (an IP address, API key, session, ...) owns a bucket holding up to `capacity`
//! tokens that refills continuously at `refill_rate` tokens per second. Every admitted
//! request spends a token; an empty bucket means the request is denied, along with an
//! estimate of when to retry.
//!
//! ## Features
//!
//! - **Lazy refill**: no timers per bucket, tokens are credited on access
//! - **Concurrent stores**: `RwLock<HashMap>` ([`InMemoryStore`]) or sharded ([`ShardedStore`])
//! - **Idle eviction** on a cancellable background thread
//! - **Key extraction** from `http` requests (IP, proxy headers, header, bearer, cookie)
//! - **YAML configuration** with per-route policies, updatable at runtime
//! - **Tower middleware** emitting standard `X-RateLimit-*` headers and `429`s
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::RateLimiter;
//!
//! let limiter = RateLimiter::builder()
//!     .defaults(10, 5.0) // burst of 10, 5 tokens per second
//!     .build()
//!     .unwrap();
//!
//! let decision = limiter.allow("ip:203.0.113.1").unwrap();
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 9);
//! ```

pub mod adaptive;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod eviction;
pub mod key;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod store;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use bucket::{Acquisition, BucketSnapshot, TokenBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{parse_duration, LimiterConfig, PolicyConfig};
pub use decision::Decision;
pub use error::{BoxError, RateLimitError};
pub use eviction::{spawn_periodic, EvictionHandle};
pub use key::{ClientAddr, KeyExtractor};
pub use limiter::{RateLimiter, RateLimiterBuilder, RouteExtractor};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{BucketConfig, BucketStore, InMemoryStore, ShardedStore};
pub use telemetry::{RateLimitEvent, TelemetrySink};
