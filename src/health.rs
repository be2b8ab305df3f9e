use axum::http::StatusCode;
use axum::response::IntoResponse;

/// `GET /health` handler.  Liveness only: no auth and no store access.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
