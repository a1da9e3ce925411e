//! Bearer-token authentication for Control API handlers.
//!
//! Handlers that require a caller take [`AuthClaims`] as an argument; the
//! extractor verifies an `access` token from the `Authorization` header and
//! rejects the request with 401 otherwise.

use crate::errors::SignalingError;
use crate::routes::AppState;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use common::jwt::{TokenClaims, TokenKind};
use tracing::debug;

/// Extract the token from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Verified claims of the calling access token.
#[derive(Debug, Clone)]
pub struct AuthClaims(pub TokenClaims);

#[async_trait]
impl FromRequestParts<AppState> for AuthClaims {
    type Rejection = SignalingError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers).ok_or_else(|| {
            debug!(target: "sig.api", "Missing or malformed Authorization header");
            SignalingError::Unauthenticated("Missing Authorization header".to_string())
        })?;

        let claims = state
            .credentials
            .verify_kind(token, &[TokenKind::Access])?;

        Ok(Self(claims))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token(&headers("Bearer abc.def.ghi")), Some("abc.def.ghi"));
        assert_eq!(extract_bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(extract_bearer_token(&headers("Bearer ")), None);
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
    }
}
