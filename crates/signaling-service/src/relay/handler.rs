//! `GET /ws` - authenticate, then upgrade to a relay connection.
//!
//! The token comes from `?token=` (browsers cannot set headers on a
//! WebSocket handshake) or `Authorization: Bearer`. It is verified before
//! the upgrade; a bad token is refused with 401 and no socket is opened.

use super::connection::{Connection, ConnectionIdentity};
use crate::errors::SignalingError;
use crate::middleware::auth::extract_bearer_token;
use crate::routes::AppState;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::HeaderMap,
    response::Response,
};
use common::jwt::TokenKind;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Largest accepted client frame.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

#[instrument(skip_all, name = "sig.relay.upgrade")]
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Result<Response, SignalingError> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| extract_bearer_token(&headers))
        .ok_or_else(|| {
            debug!(target: "sig.relay", "WebSocket handshake without token");
            SignalingError::Unauthenticated("Missing token".to_string())
        })?;

    let claims = state
        .credentials
        .verify_kind(token, &[TokenKind::Access, TokenKind::RoomJoin])?;

    let Some(upgrade) = upgrade else {
        return Err(SignalingError::BadRequest(
            "WebSocket upgrade required".to_string(),
        ));
    };

    let identity = ConnectionIdentity {
        subject: claims.sub.clone(),
        display_name: claims.name.clone(),
        scoped_room: match claims.kind {
            TokenKind::RoomJoin => claims.room_id,
            _ => None,
        },
    };

    let (connection, events) = Connection::new(identity, state.relay_context());

    Ok(upgrade
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| connection.run(socket, events)))
}
