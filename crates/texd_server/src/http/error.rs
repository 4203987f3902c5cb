//! Mapping of core errors onto HTTP responses.

use axum::async_trait;
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde_json::json;
use texd_core::{ErrorKind, TexdError};
use tracing::error;

/// Seconds clients are told to wait after a 503.
pub const RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug)]
pub struct ApiError(pub TexdError);

impl From<TexdError> for ApiError {
    fn from(e: TexdError) -> Self {
        Self(e)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::ToolFailure => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceExhausted | ErrorKind::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_retry_after(mut resp: Response) -> Response {
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    resp
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        match &err {
            TexdError::CompileFailed { log, timed_out } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Compilation failed",
                    "log": log,
                    "timedOut": timed_out,
                })),
            )
                .into_response(),
            TexdError::QueueFull { running, queued } => with_retry_after(
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "Compilation queue is full",
                        "queue": { "running": running, "queued": queued },
                        "retryAfter": RETRY_AFTER_SECS,
                    })),
                )
                    .into_response(),
            ),
            TexdError::PayloadTooLarge { .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "error": err.to_string(),
                    "hint": err.recovery_suggestion(),
                })),
            )
                .into_response(),
            TexdError::LockTimeout { .. } => {
                error!(error = %err, "lock wait timed out");
                with_retry_after(
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({
                            "error": "Another build of this paper is in progress",
                            "retryAfter": RETRY_AFTER_SECS,
                        })),
                    )
                        .into_response(),
                )
            }
            TexdError::ShuttingDown => with_retry_after(
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "Server is shutting down" })),
                )
                    .into_response(),
            ),
            _ => {
                let status = status_for(err.kind());
                let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %err, "request failed");
                    "Internal server error".to_string()
                } else {
                    err.to_string()
                };
                let mut body = json!({ "error": message });
                if err.timed_out() {
                    body["timedOut"] = json!(true);
                }
                if let Some(hint) = err.recovery_suggestion() {
                    body["hint"] = json!(hint);
                }
                (status, Json(body)).into_response()
            }
        }
    }
}

/// `Json` whose rejections become 400 responses in the service's error
/// shape instead of axum's plain-text 422.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(TexdError::invalid(rejection.body_text()))),
        }
    }
}
