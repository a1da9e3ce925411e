//! Signaling service error types.
//!
//! Every error carries a stable machine-readable code (`error_code`) shared by
//! the Control API and the relay protocol, so a client can tell "room full"
//! from "not authenticated" from "target gone". Messages returned to clients
//! never include internal detail; that is logged server-side instead.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Signaling service error type.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Missing, malformed or expired token.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid identity without the right to perform the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed relay message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Malformed HTTP request body or parameter.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Room not found")]
    RoomNotFound,

    #[error("Room is full")]
    RoomFull,

    /// Room exists but is owned by another instance.
    #[error("Room is owned by instance {owner}")]
    RoomNotLocal { owner: String },

    #[error("Connection is not in the claimed room")]
    NotInRoom,

    #[error("Target connection not found")]
    TargetNotFound,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Shared store (Redis) failure.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Stable reason code for clients.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SignalingError::Unauthenticated(_) => "UNAUTHENTICATED",
            SignalingError::Forbidden(_) => "FORBIDDEN",
            SignalingError::InvalidMessage(_) => "INVALID_MESSAGE",
            SignalingError::BadRequest(_) => "INVALID_REQUEST",
            SignalingError::RoomNotFound => "ROOM_NOT_FOUND",
            SignalingError::RoomFull => "ROOM_FULL",
            SignalingError::RoomNotLocal { .. } => "ROOM_NOT_LOCAL",
            SignalingError::NotInRoom => "NOT_IN_ROOM",
            SignalingError::TargetNotFound => "TARGET_NOT_FOUND",
            SignalingError::NotFound(_) => "NOT_FOUND",
            SignalingError::RateLimited { .. } => "RATE_LIMITED",
            SignalingError::Store(_) => "SERVICE_UNAVAILABLE",
            SignalingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-safe message.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Unauthenticated(_) => "The token is invalid or expired".to_string(),
            SignalingError::Forbidden(reason)
            | SignalingError::InvalidMessage(reason)
            | SignalingError::BadRequest(reason)
            | SignalingError::NotFound(reason) => reason.clone(),
            SignalingError::RoomNotFound => "Room not found".to_string(),
            SignalingError::RoomFull => "Room is at capacity".to_string(),
            SignalingError::RoomNotLocal { owner } => {
                format!("Room is hosted by instance {owner}")
            }
            SignalingError::NotInRoom => "You are not in this room".to_string(),
            SignalingError::TargetNotFound => "Target participant not found".to_string(),
            SignalingError::RateLimited { .. } => {
                "Too many requests. Please try again later.".to_string()
            }
            SignalingError::Store(_) => "Service temporarily unavailable".to_string(),
            SignalingError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            SignalingError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            SignalingError::Forbidden(_) => StatusCode::FORBIDDEN,
            SignalingError::InvalidMessage(_) | SignalingError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            SignalingError::RoomNotFound
            | SignalingError::TargetNotFound
            | SignalingError::NotFound(_) => StatusCode::NOT_FOUND,
            SignalingError::RoomFull
            | SignalingError::RoomNotLocal { .. }
            | SignalingError::NotInRoom => StatusCode::CONFLICT,
            SignalingError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SignalingError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            SignalingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for SignalingError {
    fn into_response(self) -> Response {
        match &self {
            SignalingError::Store(err) => {
                tracing::warn!(target: "sig.api", error = %err, "Shared store unavailable");
            }
            SignalingError::Internal(err) => {
                tracing::error!(target: "sig.api", error = %err, "Internal error");
            }
            _ => {}
        }

        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"signaling\", error=\"invalid_token\""),
            );
        }

        if let SignalingError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<redis::RedisError> for SignalingError {
    fn from(err: redis::RedisError) -> Self {
        SignalingError::Store(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(SignalingError::RoomFull.error_code(), "ROOM_FULL");
        assert_eq!(SignalingError::RoomNotFound.error_code(), "ROOM_NOT_FOUND");
        assert_eq!(SignalingError::NotInRoom.error_code(), "NOT_IN_ROOM");
        assert_eq!(SignalingError::TargetNotFound.error_code(), "TARGET_NOT_FOUND");
        assert_eq!(
            SignalingError::Unauthenticated("expired".into()).error_code(),
            "UNAUTHENTICATED"
        );
        assert_eq!(
            SignalingError::RoomNotLocal { owner: "sig-b".into() }.error_code(),
            "ROOM_NOT_LOCAL"
        );
    }

    #[test]
    fn test_client_message_hides_internal_detail() {
        let err = SignalingError::Internal("mutex poisoned at registry.rs:42".into());
        assert!(!err.client_message().contains("registry.rs"));

        let err = SignalingError::Store("connection refused 10.0.0.7:6379".into());
        assert!(!err.client_message().contains("10.0.0.7"));

        let err = SignalingError::Unauthenticated("signature mismatch".into());
        assert!(!err.client_message().contains("signature"));
    }

    #[tokio::test]
    async fn test_unauthorized_response_has_www_authenticate() {
        let response = SignalingError::Unauthenticated("missing".into()).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_rate_limited_response_has_retry_after() {
        let response = SignalingError::RateLimited { retry_after_secs: 17 }.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "17");
    }

    #[tokio::test]
    async fn test_room_full_maps_to_conflict() {
        let response = SignalingError::RoomFull.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "ROOM_FULL");
        assert_eq!(body["error"]["message"], "Room is at capacity");
    }
}
