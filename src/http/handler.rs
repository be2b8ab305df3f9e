//! Main axum router and HTTP request handlers for the cache gateway.
//!
//! Routes:
//! - `PUT  /v1/cache/{hash}` - Store an artifact (bearer token required)
//! - `GET  /v1/cache/{hash}` - Retrieve an artifact (bearer token required)
//! - `GET  /health`          - Liveness probe
//! - `GET  /metrics`         - Prometheus metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Extension, Router,
};
use tracing::{debug, error, info, instrument, warn};

use crate::auth::middleware::{require_bearer_token, Caller};
use crate::config::DownloadMode;
use crate::metrics::{Operation, Outcome};
use crate::storage::{presigned, NewObject, StoreError};
use crate::AppState;

/// Content type reported when the store does not know one.
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cache_routes = Router::new()
        .route("/v1/cache/{hash}", put(handle_upload).get(handle_download))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer_token,
        ));

    Router::new()
        .merge(cache_routes)
        .route("/health", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `PUT /v1/cache/{hash}`
///
/// Stores the request body under `hash` unless an object already exists
/// there.  The existence probe and the write are two separate store calls;
/// unless `storage.conditional_writes` is on, two concurrent uploads of a new
/// hash can both pass the probe and the later write wins.
#[instrument(skip(state, _caller, headers, body), fields(%hash))]
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Extension(_caller): Extension<Caller>,
    Path(hash): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let result = store_artifact(&state, &hash, &headers, body).await;
    state
        .metrics
        .record_request(Operation::Upload, outcome(&result, Outcome::Stored), started.elapsed());
    result
}

/// `GET /v1/cache/{hash}`
///
/// Streams the stored artifact back with the content type the store reports.
#[instrument(skip(state, _caller), fields(%hash))]
async fn handle_download(
    State(state): State<Arc<AppState>>,
    Extension(_caller): Extension<Caller>,
    Path(hash): Path<String>,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let result = fetch_artifact(&state, &hash).await;
    state
        .metrics
        .record_request(Operation::Download, outcome(&result, Outcome::Hit), started.elapsed());
    result
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the gateway.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

async fn store_artifact(
    state: &AppState,
    hash: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    // 1. Refuse to overwrite.  The body is left unread on conflict.
    match state.store.exists(hash).await {
        Ok(true) => {
            debug!("record already exists");
            return Err(AppError::Conflict);
        }
        Ok(false) => {}
        Err(err) => return Err(internal(err, "existence check failed")),
    }

    // 2. Buffer the whole body and write it in one request.
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to read upload body");
            AppError::BadRequest
        })?;
    let size = bytes.len();

    let object = NewObject {
        body: bytes,
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        if_absent: state.config.storage.conditional_writes,
    };

    match state.store.put(hash, object).await {
        Ok(()) => {}
        Err(StoreError::AlreadyExists) => {
            debug!("lost upload race to a concurrent writer");
            return Err(AppError::Conflict);
        }
        Err(err) => return Err(internal(err, "store write failed")),
    }

    state.metrics.record_upload_bytes(size);
    info!(bytes = size, "artifact stored");
    Ok((StatusCode::ACCEPTED, "Successfully uploaded").into_response())
}

async fn fetch_artifact(state: &AppState, hash: &str) -> Result<Response, AppError> {
    let object = match state.config.storage.download_mode {
        DownloadMode::Presigned => {
            let ttl = Duration::from_secs(state.config.storage.presigned_url_ttl);
            let url = state.store.presign_read(hash, ttl).await?;
            presigned::fetch(&state.http_client, &url).await?
        }
        DownloadMode::Direct => state.store.get(hash).await?,
    };

    let content_type = object
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let mut response = Response::new(object.body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(len) = object.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    debug!(content_length = ?object.content_length, "serving artifact");
    Ok(response)
}

fn internal(err: StoreError, what: &'static str) -> AppError {
    AppError::Internal(anyhow::Error::new(err).context(what))
}

/// Classify a handler result for the request counter.
fn outcome(result: &Result<Response, AppError>, success: Outcome) -> Outcome {
    match result {
        Ok(_) => success,
        Err(AppError::NotFound) => Outcome::Miss,
        Err(AppError::Conflict) => Outcome::Conflict,
        Err(AppError::Unauthorized | AppError::Forbidden) => Outcome::Forbidden,
        Err(AppError::BadRequest | AppError::Internal(_)) => Outcome::Error,
    }
}

/// Log one line per request.  Only method and path are recorded, never
/// headers.
async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Bodies are fixed strings; causes of internal errors only reach the log.
#[derive(Debug)]
pub enum AppError {
    /// No usable bearer credential.
    Unauthorized,
    /// Wrong token, or the store refused access to the object.
    Forbidden,
    /// No object under the requested hash.
    NotFound,
    /// An object already exists under the hash being uploaded.
    Conflict,
    /// The request body could not be read.
    BadRequest,
    /// An unexpected store or server failure.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer realm=\"nxcache\"")],
                "Unauthorized",
            )
                .into_response(),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Access forbidden").into_response(),
            AppError::NotFound => {
                (StatusCode::NOT_FOUND, "The record was not found").into_response()
            }
            AppError::Conflict => {
                (StatusCode::CONFLICT, "Cannot override an existing record").into_response()
            }
            AppError::BadRequest => {
                (StatusCode::BAD_REQUEST, "Invalid request body").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format_args!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => AppError::NotFound,
            StoreError::AlreadyExists => AppError::Conflict,
            StoreError::Forbidden => AppError::Forbidden,
            other @ (StoreError::Unsupported(_) | StoreError::Upstream(_)) => {
                internal(other, "store request failed")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
