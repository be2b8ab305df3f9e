use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::http::handler::AppError;
use crate::metrics::AuthFailureReason;
use crate::AppState;

/// Identity attached to a request once the token check has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Authorized,
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No `Authorization` header.
    Missing,
    /// Header present but not `Bearer <token>`.
    Malformed,
    /// Well-formed bearer token that does not match the configured one.
    Mismatch,
}

impl AuthFailure {
    fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Malformed => "malformed",
            Self::Mismatch => "mismatch",
        }
    }

    fn metric_reason(self) -> AuthFailureReason {
        match self {
            Self::Missing | Self::Malformed => AuthFailureReason::Missing,
            Self::Mismatch => AuthFailureReason::Invalid,
        }
    }
}

impl From<AuthFailure> for AppError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Missing | AuthFailure::Malformed => AppError::Unauthorized,
            AuthFailure::Mismatch => AppError::Forbidden,
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// The token ends at the first space after the scheme.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthFailure> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthFailure::Missing)?
        .to_str()
        .map_err(|_| AuthFailure::Malformed)?;
    let rest = value
        .strip_prefix("Bearer ")
        .ok_or(AuthFailure::Malformed)?;
    Ok(rest.split(' ').next().unwrap_or_default())
}

/// Check the request's bearer token against `expected`.
///
/// Both sides are hashed before comparison so the time taken does not depend
/// on how many leading bytes match.
pub fn verify(headers: &HeaderMap, expected: &str) -> Result<Caller, AuthFailure> {
    let token = bearer_token(headers)?;
    if Sha256::digest(token.as_bytes()) == Sha256::digest(expected.as_bytes()) {
        Ok(Caller::Authorized)
    } else {
        Err(AuthFailure::Mismatch)
    }
}

/// axum middleware guarding the cache routes.
///
/// Runs before the handler and never touches the store.  Missing or
/// malformed credentials get `401 Unauthorized`; a wrong token gets
/// `403 Access forbidden`.
pub async fn require_bearer_token(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match verify(request.headers(), &state.config.auth.access_token) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        Err(failure) => {
            state.metrics.record_auth_failure(failure.metric_reason());
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                reason = failure.as_str(),
                "rejected unauthenticated cache request"
            );
            Err(failure.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Ok("abc123"));
    }

    #[test]
    fn token_stops_at_first_space() {
        assert_eq!(bearer_token(&headers("Bearer abc extra")), Ok("abc"));
    }

    #[test]
    fn empty_token_is_well_formed() {
        assert_eq!(bearer_token(&headers("Bearer ")), Ok(""));
    }

    #[test]
    fn missing_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), Err(AuthFailure::Missing));
    }

    #[test]
    fn other_schemes_are_malformed() {
        assert_eq!(
            bearer_token(&headers("Basic dXNlcjpwYXNz")),
            Err(AuthFailure::Malformed)
        );
        assert_eq!(bearer_token(&headers("bearer abc")), Err(AuthFailure::Malformed));
        assert_eq!(bearer_token(&headers("Bearer")), Err(AuthFailure::Malformed));
    }

    #[test]
    fn non_utf8_header_is_malformed() {
        let mut map = HeaderMap::new();
        map.insert(
            header::AUTHORIZATION,
            HeaderValue::from_bytes(b"Bearer \xfftoken").unwrap(),
        );
        assert_eq!(bearer_token(&map), Err(AuthFailure::Malformed));
    }

    #[test]
    fn verify_accepts_exact_match_only() {
        assert_eq!(verify(&headers("Bearer s3cret"), "s3cret"), Ok(Caller::Authorized));
        assert_eq!(
            verify(&headers("Bearer s3cre"), "s3cret"),
            Err(AuthFailure::Mismatch)
        );
        assert_eq!(
            verify(&headers("Bearer S3CRET"), "s3cret"),
            Err(AuthFailure::Mismatch)
        );
        assert_eq!(verify(&headers("Bearer "), "s3cret"), Err(AuthFailure::Mismatch));
    }

    #[test]
    fn failures_map_to_status_codes() {
        use axum::http::StatusCode;
        use axum::response::IntoResponse;

        let missing = AppError::from(AuthFailure::Missing).into_response();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let malformed = AppError::from(AuthFailure::Malformed).into_response();
        assert_eq!(malformed.status(), StatusCode::UNAUTHORIZED);
        let mismatch = AppError::from(AuthFailure::Mismatch).into_response();
        assert_eq!(mismatch.status(), StatusCode::FORBIDDEN);
    }
}
