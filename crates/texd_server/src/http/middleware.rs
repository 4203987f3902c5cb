//! Request gates: CORS, drain tracking, rate limiting and API keys.

use super::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

const HEALTH_PATH: &str = "/health";

/// In-flight request accounting for graceful shutdown.
///
/// Service work runs detached from the connection, so it is counted
/// separately and outlives a client that hangs up.
#[derive(Debug, Default)]
pub struct RequestTracker {
    in_flight: AtomicUsize,
    draining: AtomicBool,
    detached: AtomicUsize,
    idle: Notify,
}

/// Held by a detached task until it finishes.
pub struct DetachedWork(Arc<RequestTracker>);

impl Drop for DetachedWork {
    fn drop(&mut self) {
        if self.0.detached.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Decrements the in-flight count when the request finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RequestTracker {
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn detach(self: &Arc<Self>) -> DetachedWork {
        self.detached.fetch_add(1, Ordering::SeqCst);
        DetachedWork(Arc::clone(self))
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    /// Waits until no detached work is running. Returns false on timeout.
    pub async fn wait_detached(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.idle.notified();
            if self.detached() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.detached() == 0;
            }
        }
    }
}

/// Fixed one-minute window per client address.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    /// `limit == 0` disables limiting.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request. `Err` carries the time until the window resets.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|p| p.into_inner());
        if buckets.len() > 10_000 {
            buckets.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        }
        let bucket = buckets.entry(ip).or_insert((now, 0));
        if now.duration_since(bucket.0) >= self.window {
            *bucket = (now, 0);
        }
        if bucket.1 >= self.limit {
            return Err(self.window.saturating_sub(now.duration_since(bucket.0)));
        }
        bucket.1 += 1;
        Ok(())
    }
}

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Adds CORS headers for allowed origins and answers their preflights.
pub async fn cors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|o| {
            state
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed == o)
        })
        .and_then(|o| HeaderValue::from_str(o).ok());

    let Some(origin) = origin else {
        return next.run(req).await;
    };

    let mut resp = if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        let headers = resp.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, X-API-Key"),
        );
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
        resp
    } else {
        next.run(req).await
    };

    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("X-Dependencies"),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    resp
}

/// Counts non-health requests and turns new ones away while draining.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.uri().path() == HEALTH_PATH {
        return next.run(req).await;
    }
    if state.requests.is_draining() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
    }
    state.requests.in_flight.fetch_add(1, Ordering::SeqCst);
    let _guard = InFlight(&state.requests.in_flight);
    next.run(req).await
}

pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.uri().path() == HEALTH_PATH {
        return next.run(req).await;
    }
    let ip = client_ip(&req);
    match state.limiter.check(ip) {
        Ok(()) => next.run(req).await,
        Err(retry) => {
            debug!(%ip, "rate limit exceeded");
            let mut resp = json_error(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
            resp.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry.as_secs().max(1)),
            );
            resp
        }
    }
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Requires the configured API key on everything except `/health`.
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };
    if req.uri().path() == HEALTH_PATH || req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let header_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let provided = match header_key {
        Some(key) => Some(key),
        None => {
            let legacy = query_param(req.uri().query(), "apiKey");
            if legacy.is_some() {
                warn!(
                    path = %req.uri().path(),
                    "API key passed as ?apiKey= query parameter; this is deprecated, send the X-API-Key header"
                );
            }
            legacy
        }
    };

    match provided {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => next.run(req).await,
        _ => json_error(StatusCode::UNAUTHORIZED, "Unauthorized"),
    }
}
