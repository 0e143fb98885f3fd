//! Shared-secret bearer auth for the privileged broadcast endpoint.

use axum::http::HeaderMap;

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// True when the request carries the configured admin token. An unset token
/// disables the endpoint entirely.
pub fn authorize_admin(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
        .is_some_and(|token| token == expected)
}
