//! # Authentication Module
//!
//! Bearer API key authentication for the Worldline HTTP API.
//!
//! ## Configuration
//!
//! - `WORLDLINE_API_KEY`: if set, every request except `/health` must carry
//!   `Authorization: Bearer <key>`
//!
//! Event sources and operators share one key; per-source credentials are
//! not modelled.

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "WORLDLINE_API_KEY";

/// Paths reachable without a key (load balancer probes).
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Returns `Some(key)` if `WORLDLINE_API_KEY` is set and non-empty.
pub fn get_api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Constant-time key comparison.
///
/// Both sides are padded to the same length so the comparison always runs
/// over the same number of bytes; the length check comes after.
pub fn keys_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    let len = provided.len().max(expected.len());
    let mut lhs = vec![0u8; len];
    let mut rhs = vec![0u8; len];
    lhs[..provided.len()].copy_from_slice(provided);
    rhs[..expected.len()].copy_from_slice(expected);

    let same: bool = lhs.ct_eq(&rhs).into();
    same && provided.len() == expected.len()
}

/// Reject requests without a valid bearer key.
///
/// The key is read on every request, so rotating it only needs a restart of
/// whatever sets the environment.
pub async fn api_key_auth_middleware(
    request: Request<Body>,
    next: Next,
) -> Result<Response, (StatusCode, &'static str)> {
    let Some(expected) = get_api_key_from_env() else {
        return Ok(next.run(request).await);
    };
    if PUBLIC_PATHS.contains(&request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));

    match provided {
        Some(key) if keys_match(key, &expected) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(
                event = "auth_failure",
                reason = "invalid_api_key",
                path = %request.uri().path(),
                "authentication failed"
            );
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
        None => {
            tracing::warn!(
                event = "auth_failure",
                reason = "missing_authorization_header",
                path = %request.uri().path(),
                "authentication failed"
            );
            Err((StatusCode::UNAUTHORIZED, "Unauthorized"))
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_exact_only() {
        assert!(keys_match("s3cret", "s3cret"));
        assert!(!keys_match("s3cre", "s3cret"));
        assert!(!keys_match("s3cret\0", "s3cret"));
        assert!(!keys_match("", "s3cret"));
        assert!(!keys_match("S3CRET", "s3cret"));
    }

    #[test]
    fn health_is_public() {
        assert!(PUBLIC_PATHS.contains(&"/health"));
        assert!(!PUBLIC_PATHS.contains(&"/events"));
    }
}
