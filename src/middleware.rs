//! Tower middleware that rate limits `http` requests.
//!
//! Allowed requests reach the inner service and get `X-RateLimit-Limit` and
//! `X-RateLimit-Remaining` headers on the way out. Denied requests are answered with
//! `429 Too Many Requests` plus `X-RateLimit-Reset` and `Retry-After`, without calling the
//! inner service. If no decision can be made (no key, store failure) the answer is `500`.
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use tollgate::{KeyExtractor, RateLimitLayer, RateLimiter};
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let limiter = RateLimiter::builder()
//!     .defaults(1, 0.5)
//!     .key_extractor(KeyExtractor::Static("global".into()))
//!     .build()
//!     .unwrap();
//! let svc = ServiceBuilder::new()
//!     .layer(RateLimitLayer::new(Arc::new(limiter)))
//!     .service(service_fn(|_req: http::Request<()>| async {
//!         Ok::<_, Infallible>(http::Response::new(String::from("hello")))
//!     }));
//!
//! let first = svc.clone().oneshot(http::Request::new(())).await.unwrap();
//! assert_eq!(first.status(), 200);
//! let second = svc.oneshot(http::Request::new(())).await.unwrap();
//! assert_eq!(second.status(), 429);
//! # }
//! ```

use crate::decision::Decision;
use crate::limiter::RateLimiter;
use crate::telemetry::{emit_best_effort, NullSink, RateLimitEvent, TelemetrySink};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

/// Layer that wraps services in a [`RateLimitService`].
#[derive(Clone, Debug)]
pub struct RateLimitLayer<T = NullSink> {
    limiter: Arc<RateLimiter>,
    sink: T,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter, sink: NullSink }
    }
}

impl<T> RateLimitLayer<T> {
    /// Send a [`RateLimitEvent`] to `sink` for every request.
    pub fn with_sink<U: TelemetrySink>(self, sink: U) -> RateLimitLayer<U> {
        RateLimitLayer { limiter: self.limiter, sink }
    }
}

impl<S, T: Clone> Layer<S> for RateLimitLayer<T> {
    type Service = RateLimitService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone(), sink: self.sink.clone() }
    }
}

/// Rate limiting middleware service.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, T = NullSink> {
    inner: S,
    limiter: Arc<RateLimiter>,
    sink: T,
}

impl<S, T, B, R> Service<Request<B>> for RateLimitService<S, T>
where
    S: Service<Request<B>, Response = Response<R>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    R: Default + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    type Response = Response<R>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let sink = self.sink.clone();
        let decision = match self.limiter.allow_request(&req) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(target: "tollgate::middleware", error = %err, uri = %req.uri(), "rate limit check failed");
                let reason = err.to_string();
                let event = if err.is_key_extraction() {
                    RateLimitEvent::ExtractionFailed { reason }
                } else {
                    RateLimitEvent::Failed { reason }
                };
                return Box::pin(async move {
                    emit_best_effort(sink, event).await;
                    Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))
                });
            }
        };

        let headers = decision_headers(&decision);
        if !decision.allowed {
            let event =
                RateLimitEvent::Denied { key: decision.key, retry_after: decision.retry_after };
            return Box::pin(async move {
                emit_best_effort(sink, event).await;
                let mut resp = empty_response(StatusCode::TOO_MANY_REQUESTS);
                resp.headers_mut().extend(headers);
                Ok(resp)
            });
        }

        let event = RateLimitEvent::Allowed {
            key: decision.key,
            remaining: decision.remaining,
            limit: decision.limit,
        };
        // Take the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            emit_best_effort(sink, event).await;
            let mut resp = inner.call(req).await?;
            resp.headers_mut().extend(headers);
            Ok(resp)
        })
    }
}

fn empty_response<R: Default>(status: StatusCode) -> Response<R> {
    let mut resp = Response::new(R::default());
    *resp.status_mut() = status;
    resp
}

fn decision_headers(decision: &Decision) -> HeaderMap {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let mut map = HeaderMap::new();
    for (name, value) in decision.rate_limit_headers(now) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
    map
}
