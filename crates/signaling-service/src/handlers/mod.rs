//! HTTP request handlers for the Control API.

pub mod agents;
pub mod metrics;
pub mod rooms;
pub mod sessions;
pub mod stats;

pub use agents::{get_me, refresh_token, register_agent};
pub use metrics::metrics_handler;
pub use rooms::{create_room, delete_room, get_room, join_room, list_rooms, update_room_settings};
pub use sessions::list_sessions;
pub use stats::get_stats;

use crate::errors::SignalingError;
use common::types::RoomId;
use serde::de::DeserializeOwned;

/// Deserialize a JSON body, answering 400 (not Axum's default 422) when it
/// does not parse.
pub(crate) fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, SignalingError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "sig.api", error = %e, "Invalid request body");
        SignalingError::BadRequest("Invalid request body".to_string())
    })
}

/// A path segment that is not a room id names no room.
pub(crate) fn parse_room_id(raw: &str) -> Result<RoomId, SignalingError> {
    raw.parse().map_err(|_| SignalingError::RoomNotFound)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::RefreshTokenRequest;

    #[test]
    fn test_parse_json_body_rejects_garbage_as_bad_request() {
        let err = parse_json_body::<RefreshTokenRequest>(b"{not json").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");

        let err = parse_json_body::<RefreshTokenRequest>(b"{}").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_parse_room_id() {
        let id = RoomId::new();
        assert_eq!(parse_room_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_room_id("not-a-room"),
            Err(SignalingError::RoomNotFound)
        ));
    }
}
