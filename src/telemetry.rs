//! Rate limit events and the sinks that consume them.
//!
//! The HTTP middleware emits a [`RateLimitEvent`] for every decision it makes. Events flow
//! into a [`TelemetrySink`], which is just a `tower::Service<RateLimitEvent>`, so sinks
//! compose with ordinary tower combinators.
//!
//! ```rust
//! use tollgate::telemetry::{MemorySink, RateLimitEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = RateLimitEvent::Allowed { key: "ip:192.0.2.1".into(), remaining: 9, limit: 10 };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tower::Service;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// What happened to a request at the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitEvent {
    /// The request was admitted.
    Allowed {
        /// Key the request was charged to.
        key: String,
        /// Whole tokens left.
        remaining: u64,
        /// Bucket capacity.
        limit: u64,
    },
    /// The request was rejected.
    Denied {
        /// Key the request was charged to.
        key: String,
        /// Wait until a token is available.
        retry_after: Duration,
    },
    /// No key could be derived from the request.
    ExtractionFailed {
        /// Why extraction failed.
        reason: String,
    },
    /// The limiter failed for another reason (store backend, configuration).
    Failed {
        /// Error description.
        reason: String,
    },
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed { key, remaining, limit } => {
                write!(f, "Allowed(key={key}, remaining={remaining}/{limit})")
            }
            Self::Denied { key, retry_after } => {
                write!(f, "Denied(key={key}, retry_after={retry_after:?})")
            }
            Self::ExtractionFailed { reason } => write!(f, "ExtractionFailed({reason})"),
            Self::Failed { reason } => write!(f, "Failed({reason})"),
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an event into a flat JSON object with a `kind` discriminator.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &RateLimitEvent) -> serde_json::Value {
    match event {
        RateLimitEvent::Allowed { key, remaining, limit } => json!({
            "kind": "allowed",
            "key": key,
            "remaining": *remaining,
            "limit": *limit,
        }),
        RateLimitEvent::Denied { key, retry_after } => json!({
            "kind": "denied",
            "key": key,
            "retry_after_ms": clamp_u64(retry_after.as_millis()),
        }),
        RateLimitEvent::ExtractionFailed { reason } => {
            json!({ "kind": "extraction_failed", "reason": reason })
        }
        RateLimitEvent::Failed { reason } => json!({ "kind": "failed", "reason": reason }),
    }
}

/// A sink that consumes rate limit events.
pub trait TelemetrySink:
    Service<RateLimitEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Emit an event, dropping it if the sink is not ready or fails.
pub async fn emit_best_effort<S>(sink: S, event: RateLimitEvent)
where
    S: Service<RateLimitEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type SinkFuture<E> = Pin<Box<dyn std::future::Future<Output = Result<(), E>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<RateLimitEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RateLimitEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs events through `tracing`: denials and failures at INFO, admissions at DEBUG.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<RateLimitEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        match &event {
            RateLimitEvent::Allowed { .. } => {
                tracing::debug!(target: "tollgate::telemetry", event = %event, "rate_limit_event")
            }
            _ => tracing::info!(target: "tollgate::telemetry", event = %event, "rate_limit_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past a fixed capacity.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<RateLimitEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RateLimitEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RateLimitEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Broadcasts events to any number of subscribers.
///
/// Slow subscribers miss events once the buffer fills; sends with no subscriber count
/// as dropped.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: Arc<tokio::sync::broadcast::Sender<RateLimitEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender: Arc::new(sender), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RateLimitEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<RateLimitEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}

/// Request counts for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub key: String,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    /// Unix milliseconds of the first decision for this key.
    pub first_request_at_ms: u64,
    /// Unix milliseconds of the latest decision for this key.
    pub last_request_at_ms: u64,
}

/// Point-in-time view of a [`MetricsSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub unique_clients: u64,
    /// Busiest keys by total requests, at most [`MetricsSink::TOP_CLIENTS`].
    pub top_clients: Vec<ClientStats>,
    pub uptime_seconds: u64,
    pub start_time_ms: u64,
}

#[derive(Debug)]
struct MetricsState {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    clients: RwLock<HashMap<String, ClientStats>>,
    started: Instant,
    start_time_ms: u64,
}

/// Aggregates admissions and denials into totals and per-key statistics.
///
/// Failed decisions carry no key and are not counted.
#[derive(Clone, Debug)]
pub struct MetricsSink {
    state: Arc<MetricsState>,
}

impl MetricsSink {
    /// Number of keys reported in [`MetricsSnapshot::top_clients`].
    pub const TOP_CLIENTS: usize = 10;

    pub fn new() -> Self {
        Self {
            state: Arc::new(MetricsState {
                total: AtomicU64::new(0),
                allowed: AtomicU64::new(0),
                blocked: AtomicU64::new(0),
                clients: RwLock::new(HashMap::new()),
                started: Instant::now(),
                start_time_ms: unix_millis(),
            }),
        }
    }

    /// Count one decision for `key`.
    pub fn record(&self, key: &str, allowed: bool) {
        let state = &self.state;
        state.total.fetch_add(1, Ordering::Relaxed);
        if allowed {
            state.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            state.blocked.fetch_add(1, Ordering::Relaxed);
        }

        let now = unix_millis();
        let mut clients = state.clients.write().unwrap_or_else(PoisonError::into_inner);
        let stats = clients.entry(key.to_string()).or_insert_with(|| ClientStats {
            key: key.to_string(),
            total_requests: 0,
            allowed_requests: 0,
            blocked_requests: 0,
            first_request_at_ms: now,
            last_request_at_ms: now,
        });
        stats.total_requests += 1;
        if allowed {
            stats.allowed_requests += 1;
        } else {
            stats.blocked_requests += 1;
        }
        stats.last_request_at_ms = now;
    }

    /// Statistics for a single key, if it has been seen.
    pub fn client(&self, key: &str) -> Option<ClientStats> {
        self.state.clients.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = &self.state;
        let (unique_clients, mut top_clients) = {
            let clients = state.clients.read().unwrap_or_else(PoisonError::into_inner);
            (clients.len() as u64, clients.values().cloned().collect::<Vec<_>>())
        };
        top_clients.sort_by(|a, b| {
            b.total_requests.cmp(&a.total_requests).then_with(|| a.key.cmp(&b.key))
        });
        top_clients.truncate(Self::TOP_CLIENTS);

        MetricsSnapshot {
            total_requests: state.total.load(Ordering::Relaxed),
            allowed_requests: state.allowed.load(Ordering::Relaxed),
            blocked_requests: state.blocked.load(Ordering::Relaxed),
            unique_clients,
            top_clients,
            uptime_seconds: state.started.elapsed().as_secs(),
            start_time_ms: state.start_time_ms,
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RateLimitEvent> for MetricsSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        match &event {
            RateLimitEvent::Allowed { key, .. } => self.record(key, true),
            RateLimitEvent::Denied { key, .. } => self.record(key, false),
            RateLimitEvent::ExtractionFailed { .. } | RateLimitEvent::Failed { .. } => {}
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MetricsSink {
    type SinkError = Infallible;
}

fn unix_millis() -> u64 {
    clamp_u64(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis())
}
