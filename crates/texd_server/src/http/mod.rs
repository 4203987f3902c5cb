//! HTTP interface.

mod error;
mod handlers;
mod middleware;

use middleware::{RateLimiter, RequestTracker};

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use texd_core::CompileService;

/// Room for a base64 thumbnail PDF at the configured limit plus JSON overhead.
fn body_limit(service: &CompileService) -> usize {
    let pdf = service.config().limits.max_thumbnail_pdf_bytes;
    pdf / 3 * 4 + 1024 * 1024
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CompileService>,
    pub requests: Arc<RequestTracker>,
    pub limiter: Arc<RateLimiter>,
    pub api_key: Option<Arc<str>>,
    pub allowed_origins: Arc<[String]>,
}

impl AppState {
    pub fn new(service: Arc<CompileService>) -> Self {
        let server = &service.config().server;
        Self {
            requests: Arc::new(RequestTracker::default()),
            limiter: Arc::new(RateLimiter::new(
                server.rate_limit_per_min,
                Duration::from_secs(60),
            )),
            api_key: server.api_key.as_deref().map(Arc::from),
            allowed_origins: server.allowed_origins.clone().into(),
            service,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let limit = body_limit(&state.service);
    Router::new()
        .route("/health", get(handlers::health))
        .route("/compile-from-git", post(handlers::compile_from_git))
        .route("/cache/clear", post(handlers::clear_cache))
        .route("/git/refs", post(handlers::git_refs))
        .route("/git/tree", post(handlers::git_tree))
        .route("/git/file", post(handlers::git_file))
        .route("/git/archive", post(handlers::git_archive))
        .route("/git/selective-archive", post(handlers::git_selective_archive))
        .route("/git/file-hash", post(handlers::git_file_hash))
        .route("/thumbnail", post(handlers::thumbnail))
        // Outermost last: cors, then drain tracking, then rate limit, then auth.
        .layer(from_fn_with_state(state.clone(), middleware::require_api_key))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::track_requests))
        .layer(from_fn_with_state(state.clone(), middleware::cors))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}
