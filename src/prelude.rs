//! Convenient re-exports for common tollgate types.
pub use crate::{
    bucket::{Acquisition, BucketSnapshot, TokenBucket},
    clock::{Clock, ManualClock, MonotonicClock},
    config::{LimiterConfig, PolicyConfig},
    decision::Decision,
    eviction::EvictionHandle,
    key::{ClientAddr, KeyExtractor},
    limiter::{RateLimiter, RateLimiterBuilder},
    middleware::{RateLimitLayer, RateLimitService},
    store::{BucketConfig, BucketStore, InMemoryStore, ShardedStore},
    telemetry::{
        LogSink, MemorySink, MetricsSink, MetricsSnapshot, NullSink, RateLimitEvent, TelemetrySink,
    },
    RateLimitError,
};
