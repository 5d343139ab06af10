// =============================================================================
// API-Key Authentication — Axum extractor
// =============================================================================
//
// Extracts and validates the `X-API-KEY` header. The expected key is read
// from the `MERIDIAN_API_KEY` environment variable on every request so that
// rotation does not require a restart. Comparison is constant time to prevent
// timing side-channels.
//
// Usage as an Axum extractor:
//
//   async fn handler(_auth: ApiKey, ...) { ... }
//
// A missing or invalid key short-circuits the request with 403 before the
// handler body executes.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const API_KEY_HEADER: &str = "x-api-key";
const API_KEY_ENV: &str = "MERIDIAN_API_KEY";

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. Always examines every byte even
/// after a mismatch so the comparison duration leaks nothing about where the
/// mismatch occurred.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// =============================================================================
// Extractor
// =============================================================================

/// Axum extractor validating the `X-API-KEY` header against
/// `MERIDIAN_API_KEY`.
pub struct ApiKey(pub String);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for ApiKey
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("MERIDIAN_API_KEY is not set — all authenticated requests will be rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        let Some(presented) = presented else {
            warn!("missing X-API-KEY header");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing API key",
            });
        };

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid API key presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid API key",
            });
        }

        Ok(ApiKey(presented.to_string()))
    }
}

// =============================================================================
// Key validation helper (WebSocket query-param auth)
// =============================================================================

/// Validate a key against `MERIDIAN_API_KEY`, for contexts where the Axum
/// extractor is not usable (e.g. WebSocket upgrades passing the key as a
/// query parameter).
pub fn validate_key(key: &str) -> bool {
    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(key.as_bytes(), expected.as_bytes())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
