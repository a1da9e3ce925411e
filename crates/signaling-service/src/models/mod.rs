//! Control API request and response bodies.
//!
//! Successful responses are wrapped as `{"data": ...}`; errors are rendered
//! by [`crate::errors::SignalingError`].

use crate::cluster::Session;
use crate::registry::{Participant, Room, RoomKind, RoomSummary, SettingsPatch};
use chrono::{DateTime, Utc};
use common::types::RoomId;
use serde::{Deserialize, Serialize};

/// Longest accepted room name, in characters.
pub const MAX_ROOM_NAME_LENGTH: usize = 100;

/// Longest accepted agent name, in characters.
pub const MAX_AGENT_NAME_LENGTH: usize = 64;

/// Limit for the registration `emoji` and `color` attributes.
pub const MAX_PROFILE_ATTRIBUTE_LENGTH: usize = 32;

/// `{"data": T}` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: RoomKind,
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub connection_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
}

/// One room. Participants are listed only for rooms hosted here; remote
/// rooms carry the last announced count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetailResponse {
    #[serde(flatten)]
    pub room: Room,
    pub participant_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteRoomResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub token: String,
    pub room_id: RoomId,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub rooms: usize,
    pub remote_rooms: usize,
    pub participants: usize,
    pub connections: usize,
    pub instance_id: String,
    pub cluster_mode: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentRequest {
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentResponse {
    pub agent_id: String,
    pub access_token: String,
    /// Same value as `access_token`.
    pub api_key: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub id: String,
    pub agent_id: String,
    pub name: Option<String>,
    pub emoji: Option<String>,
    pub color: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}
