//! Endpoint handlers. Each one validates nothing itself; the service does.
//!
//! Service calls run on their own task so a client that disconnects does
//! not cancel a compile or a git operation halfway through.

use super::error::{ApiError, ApiResult, JsonBody};
use super::AppState;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::future::Future;
use std::sync::Arc;
use texd_core::api::{
    ArchiveRequest, ClearCacheRequest, ClearCacheResponse, CompileRequest, FileRequest,
    HashRequest, HashResponse, HealthReport, RefsRequest, ThumbnailRequest, TreeRequest,
    TreeResponse,
};
use texd_core::archive::{Archive, FileContent};
use texd_core::refs::RefsInfo;
use texd_core::{CompileService, TexdError};
use tracing::{error, warn};

pub const X_DEPENDENCIES: HeaderName = HeaderName::from_static("x-dependencies");

/// Runs `work` on a spawned task and waits for it.
async fn detached<T, F, Fut>(state: &AppState, work: F) -> ApiResult<T>
where
    F: FnOnce(Arc<CompileService>) -> Fut,
    Fut: Future<Output = texd_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let guard = state.requests.detach();
    let fut = work(Arc::clone(&state.service));
    let handle = tokio::spawn(async move {
        let _guard = guard;
        fut.await
    });
    match handle.await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "request task failed");
            Err(ApiError(TexdError::Io(std::io::Error::other(format!(
                "request task failed: {}",
                e
            )))))
        }
    }
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.service.health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub async fn compile_from_git(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CompileRequest>,
) -> ApiResult<Response> {
    let result = detached(&state, move |svc| async move { svc.compile_from_git(req).await }).await?;

    let deps = serde_json::to_string(&result.dependencies).unwrap_or_else(|_| "[]".into());
    let deps = HeaderValue::from_bytes(deps.as_bytes()).unwrap_or_else(|e| {
        warn!(error = %e, "dependency list is not a valid header value");
        HeaderValue::from_static("[]")
    });
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (X_DEPENDENCIES, deps),
        ],
        result.pdf,
    )
        .into_response())
}

pub async fn clear_cache(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ClearCacheRequest>,
) -> ApiResult<Json<ClearCacheResponse>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.clear_caches(&req).await }).await?,
    ))
}

pub async fn git_refs(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RefsRequest>,
) -> ApiResult<Json<RefsInfo>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.resolve_refs(&req).await }).await?,
    ))
}

pub async fn git_tree(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<TreeRequest>,
) -> ApiResult<Json<TreeResponse>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.list_tree(&req).await }).await?,
    ))
}

pub async fn git_file(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<FileRequest>,
) -> ApiResult<Json<FileContent>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.read_file(&req).await }).await?,
    ))
}

pub async fn git_archive(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ArchiveRequest>,
) -> ApiResult<Json<Archive>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.archive(&req).await }).await?,
    ))
}

pub async fn git_selective_archive(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ArchiveRequest>,
) -> ApiResult<Json<Archive>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.selective_archive(&req).await }).await?,
    ))
}

pub async fn git_file_hash(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<HashRequest>,
) -> ApiResult<Json<HashResponse>> {
    Ok(Json(
        detached(&state, move |svc| async move { svc.file_hashes(&req).await }).await?,
    ))
}

pub async fn thumbnail(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ThumbnailRequest>,
) -> ApiResult<Response> {
    let thumb = detached(&state, move |svc| async move { svc.thumbnail(&req).await }).await?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(thumb.content_type))],
        thumb.bytes,
    )
        .into_response())
}
