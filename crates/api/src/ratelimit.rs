//! Per-client-address sliding-window rate limiter (spec.md §4.4).
//!
//! Runs as the outermost `tower::Layer` in the router stack, ahead of
//! authorization (SPEC_FULL.md §9 Open Question 1) — grounded in the
//! `tower::Layer`/`tower::Service` shape the teacher uses for its own
//! auth middleware.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 60, window: Duration::from_secs(60) }
    }
}

/// Process-local, single-node limiter: a mutex-guarded map from client
/// address to the accepted-request timestamps still inside the window.
/// Does not survive restarts or coordinate across replicas — acceptable per
/// spec.md §4.4 ("storage is process-local").
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, buckets: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Returns `true` if the request is allowed, recording it as accepted.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let timestamps = buckets.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.config.window);
        if timestamps.len() as u32 >= self.config.max_requests {
            return false;
        }
        timestamps.push(now);
        true
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware { inner, limiter: self.limiter.clone() }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let key = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let allowed = self.limiter.check(&key);
        let mut inner = self.inner.clone();
        std::mem::swap(&mut self.inner, &mut inner);

        Box::pin(async move {
            if !allowed {
                return Ok(too_many_requests());
            }
            inner.call(request).await
        })
    }
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(serde_json::json!({ "detail": "rate limit exceeded" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 3, window: Duration::from_secs(60) });
        let now = Instant::now();
        assert!(limiter.check_at("1.2.3.4", now));
        assert!(limiter.check_at("1.2.3.4", now));
        assert!(limiter.check_at("1.2.3.4", now));
        assert!(!limiter.check_at("1.2.3.4", now));
    }

    #[test]
    fn window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 1, window: Duration::from_secs(10) });
        let t0 = Instant::now();
        assert!(limiter.check_at("1.2.3.4", t0));
        assert!(!limiter.check_at("1.2.3.4", t0 + Duration::from_secs(5)));
        assert!(limiter.check_at("1.2.3.4", t0 + Duration::from_secs(11)));
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(RateLimitConfig { max_requests: 1, window: Duration::from_secs(60) });
        let now = Instant::now();
        assert!(limiter.check_at("a", now));
        assert!(limiter.check_at("b", now));
        assert!(!limiter.check_at("a", now));
    }
}
