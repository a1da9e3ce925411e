//! Room handlers.
//!
//! - `GET /api/rooms` - list local and remote rooms (public)
//! - `POST /api/rooms` - create a room owned by the caller
//! - `GET /api/rooms/:id` - one room; participants only when hosted here
//! - `PATCH /api/rooms/:id/settings` - merge settings (owner only)
//! - `DELETE /api/rooms/:id` - delete (owner only)
//! - `POST /api/rooms/:id/join` - issue a room-scoped join token
//!
//! Remote rooms come from the [`crate::cluster::RoomDirectory`]. Deleting one
//! publishes `DeleteRequested`; the owning instance performs the delete.

use super::{parse_json_body, parse_room_id};
use crate::cluster::{ClusterEvent, ClusterEventKind};
use crate::errors::SignalingError;
use crate::middleware::AuthClaims;
use crate::models::{
    CreateRoomRequest, DataResponse, DeleteRoomResponse, JoinRoomResponse, RoomDetailResponse,
    RoomListResponse, MAX_ROOM_NAME_LENGTH,
};
use crate::registry::{CloseReason, NewRoom, Room, SettingsPatch};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, instrument};

pub async fn list_rooms(
    State(state): State<AppState>,
) -> Result<Json<DataResponse<RoomListResponse>>, SignalingError> {
    let mut rooms = state.registry.list_rooms().await?;
    rooms.extend(state.directory.list().await);
    rooms.sort_by(|a, b| a.room.created_at.cmp(&b.room.created_at));

    Ok(Json(DataResponse::new(RoomListResponse { rooms })))
}

fn validate_room_name(name: &str) -> Result<String, SignalingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SignalingError::BadRequest("Room name is required".to_string()));
    }
    if name.chars().count() > MAX_ROOM_NAME_LENGTH {
        return Err(SignalingError::BadRequest(format!(
            "Room name must be at most {MAX_ROOM_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

#[instrument(skip_all, name = "sig.api.room.create")]
pub async fn create_room(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    body: Bytes,
) -> Result<(StatusCode, Json<DataResponse<Room>>), SignalingError> {
    let request: CreateRoomRequest = parse_json_body(&body)?;
    let name = validate_room_name(&request.name)?;

    let room = state
        .registry
        .create_room(NewRoom {
            name,
            kind: request.kind,
            owner: claims.sub,
            settings: request.settings,
            topic: request.topic.filter(|t| !t.trim().is_empty()),
            connection_url: request.connection_url.filter(|u| !u.trim().is_empty()),
        })
        .await?;

    info!(target: "sig.api", room_id = %room.id, kind = ?room.kind, "Room created");
    Ok((StatusCode::CREATED, Json(DataResponse::new(room))))
}

pub async fn get_room(
    State(state): State<AppState>,
    AuthClaims(_claims): AuthClaims,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<RoomDetailResponse>>, SignalingError> {
    let room_id = parse_room_id(&id)?;

    if let Some(snapshot) = state.registry.get_room(room_id).await? {
        return Ok(Json(DataResponse::new(RoomDetailResponse {
            participant_count: snapshot.participants.len(),
            room: snapshot.room,
            participants: Some(snapshot.participants),
        })));
    }

    let remote = state
        .directory
        .get(room_id)
        .await
        .ok_or(SignalingError::RoomNotFound)?;

    Ok(Json(DataResponse::new(RoomDetailResponse {
        room: remote.room,
        participant_count: remote.participant_count,
        participants: None,
    })))
}

fn ensure_owner(room: &Room, subject: &str, action: &str) -> Result<(), SignalingError> {
    if room.owner == subject {
        return Ok(());
    }
    Err(SignalingError::Forbidden(format!(
        "Only the room owner may {action} this room"
    )))
}

#[instrument(skip_all, name = "sig.api.room.settings")]
pub async fn update_room_settings(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DataResponse<Room>>, SignalingError> {
    let room_id = parse_room_id(&id)?;
    let patch: SettingsPatch = parse_json_body(&body)?;

    let Some(snapshot) = state.registry.get_room(room_id).await? else {
        return match state.directory.get(room_id).await {
            Some(remote) => Err(SignalingError::RoomNotLocal {
                owner: remote.room.owner_instance,
            }),
            None => Err(SignalingError::RoomNotFound),
        };
    };
    ensure_owner(&snapshot.room, &claims.sub, "update")?;

    let room = state
        .registry
        .update_settings(room_id, patch)
        .await?
        .ok_or(SignalingError::RoomNotFound)?;

    info!(target: "sig.api", room_id = %room_id, "Room settings updated");
    Ok(Json(DataResponse::new(room)))
}

#[instrument(skip_all, name = "sig.api.room.delete")]
pub async fn delete_room(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<DeleteRoomResponse>>, SignalingError> {
    let room_id = parse_room_id(&id)?;

    if let Some(snapshot) = state.registry.get_room(room_id).await? {
        ensure_owner(&snapshot.room, &claims.sub, "delete")?;
        let deleted = state
            .registry
            .delete_room(room_id, CloseReason::Deleted)
            .await?;
        if !deleted {
            return Err(SignalingError::RoomNotFound);
        }

        info!(target: "sig.api", room_id = %room_id, "Room deleted");
        return Ok(Json(DataResponse::new(DeleteRoomResponse { deleted: true })));
    }

    let remote = state
        .directory
        .get(room_id)
        .await
        .ok_or(SignalingError::RoomNotFound)?;
    ensure_owner(&remote.room, &claims.sub, "delete")?;

    state
        .cluster
        .event_bus
        .publish(&ClusterEvent {
            origin: state.config.instance_id.clone(),
            event: ClusterEventKind::DeleteRequested {
                room_id,
                requested_by: claims.sub,
            },
        })
        .await?;

    info!(
        target: "sig.api",
        room_id = %room_id,
        owner_instance = %remote.room.owner_instance,
        "Delete forwarded to owning instance"
    );
    Ok(Json(DataResponse::new(DeleteRoomResponse { deleted: true })))
}

/// Issue a join token for an existing room with a free slot.
///
/// The check is advisory: the registry re-checks capacity when the relay
/// connection actually joins.
#[instrument(skip_all, name = "sig.api.room.join")]
pub async fn join_room(
    State(state): State<AppState>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<String>,
) -> Result<Json<DataResponse<JoinRoomResponse>>, SignalingError> {
    let room_id = parse_room_id(&id)?;

    let (capacity, present) = match state.registry.get_room(room_id).await? {
        Some(snapshot) => (snapshot.room.capacity, snapshot.participants.len()),
        None => {
            let remote = state
                .directory
                .get(room_id)
                .await
                .ok_or(SignalingError::RoomNotFound)?;
            (remote.room.capacity, remote.participant_count)
        }
    };
    if present >= capacity {
        return Err(SignalingError::RoomFull);
    }

    let issued = state
        .credentials
        .issue_room_join(&claims.sub, claims.name.as_deref(), room_id)?;

    Ok(Json(DataResponse::new(JoinRoomResponse {
        token: issued.token,
        room_id,
        expires_in: issued.expires_in,
    })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{RoomKind, RoomSettings};
    use chrono::Utc;
    use common::types::RoomId;

    #[test]
    fn test_validate_room_name() {
        assert_eq!(validate_room_name("  standup ").unwrap(), "standup");
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name(&"x".repeat(MAX_ROOM_NAME_LENGTH)).is_ok());
        assert!(validate_room_name(&"x".repeat(MAX_ROOM_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_ensure_owner() {
        let room = Room {
            id: RoomId::new(),
            name: "standup".to_string(),
            kind: RoomKind::Voice,
            owner: "agent-1".to_string(),
            owner_instance: "sig-a".to_string(),
            created_at: Utc::now(),
            capacity: 10,
            settings: RoomSettings::defaults_for(RoomKind::Voice),
            topic: None,
            connection_url: None,
        };

        assert!(ensure_owner(&room, "agent-1", "delete").is_ok());
        let err = ensure_owner(&room, "agent-2", "delete").unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
    }
}
