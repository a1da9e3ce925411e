//! Rooms, participants and the events the registry emits.

use crate::errors::SignalingError;
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Outbound queue of one relay connection. The registry pushes room events
/// onto it with `try_send` and never awaits a slow reader.
pub type ConnectionOutbox = mpsc::Sender<RoomEvent>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    #[default]
    Voice,
    Video,
}

/// Audio processing settings only meaningful for voice rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub music_mode: bool,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            music_mode: false,
            noise_suppression: true,
            echo_cancellation: true,
        }
    }
}

/// Fully resolved room settings. Defaults are applied once at creation;
/// updates merge a patch over the current record and replace it whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub mute_on_entry: bool,
    pub recording_allowed: bool,
    pub max_duration_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceSettings>,
}

pub const DEFAULT_MAX_DURATION_MINUTES: u32 = 60;

impl RoomSettings {
    #[must_use]
    pub fn defaults_for(kind: RoomKind) -> Self {
        Self {
            mute_on_entry: false,
            recording_allowed: false,
            max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            voice: match kind {
                RoomKind::Voice => Some(VoiceSettings::default()),
                RoomKind::Video => None,
            },
        }
    }

    /// New record with every field present in `patch` overriding `self`.
    /// Voice-only fields are ignored for rooms without voice settings.
    #[must_use]
    pub fn merged(&self, patch: &SettingsPatch) -> Self {
        let voice = self.voice.map(|v| VoiceSettings {
            music_mode: patch.music_mode.unwrap_or(v.music_mode),
            noise_suppression: patch.noise_suppression.unwrap_or(v.noise_suppression),
            echo_cancellation: patch.echo_cancellation.unwrap_or(v.echo_cancellation),
        });

        Self {
            mute_on_entry: patch.mute_on_entry.unwrap_or(self.mute_on_entry),
            recording_allowed: patch.recording_allowed.unwrap_or(self.recording_allowed),
            max_duration_minutes: patch
                .max_duration_minutes
                .unwrap_or(self.max_duration_minutes),
            voice,
        }
    }
}

/// Caller-supplied subset of settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub mute_on_entry: Option<bool>,
    #[serde(alias = "allowRecording")]
    pub recording_allowed: Option<bool>,
    #[serde(alias = "maxDuration")]
    pub max_duration_minutes: Option<u32>,
    pub music_mode: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub echo_cancellation: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    /// Subject identity of the creator.
    pub owner: String,
    /// Instance holding this room's registry entry.
    pub owner_instance: String,
    pub created_at: DateTime<Utc>,
    pub capacity: usize,
    pub settings: RoomSettings,
    /// Free-form subject agents use to pick a room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Where a host agent accepts participants, if it runs its own endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<String>,
}

/// Input to room creation.
#[derive(Debug, Clone, Default)]
pub struct NewRoom {
    pub name: String,
    pub kind: RoomKind,
    pub owner: String,
    pub settings: Option<SettingsPatch>,
    pub topic: Option<String>,
    pub connection_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Moderator,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
    pub role: Role,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking_since: Option<DateTime<Utc>>,
}

/// Mute/deafen/speaking changes reported by a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipantPatch {
    pub muted: Option<bool>,
    pub deafened: Option<bool>,
    pub speaking: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub participant_count: usize,
}

/// Where a connection currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRoomInfo {
    pub room: Room,
    pub participant: Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub rooms: usize,
    pub participants: usize,
}

/// Join request handed to the registry by the relay.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room_id: RoomId,
    pub identity: String,
    pub display_name: Option<String>,
    pub connection_id: ConnectionId,
    /// `None` resolves to `Owner` for the room's creator, else `Participant`.
    pub role: Option<Role>,
    pub outbox: ConnectionOutbox,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant: Participant,
    pub room: Room,
    /// Participants already present, excluding the joiner.
    pub others: Vec<Participant>,
    /// Room left implicitly to make this join, if any.
    pub left: Option<RoomId>,
}

/// Why a join was refused. A refused join has no side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    RoomNotFound,
    RoomFull,
}

impl JoinRejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JoinRejection::RoomNotFound => "room_not_found",
            JoinRejection::RoomFull => "room_full",
        }
    }
}

impl From<JoinRejection> for SignalingError {
    fn from(rejection: JoinRejection) -> Self {
        match rejection {
            JoinRejection::RoomNotFound => SignalingError::RoomNotFound,
            JoinRejection::RoomFull => SignalingError::RoomFull,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRejection {
    NotInRoom,
    TargetNotFound,
}

impl From<RelayRejection> for SignalingError {
    fn from(rejection: RelayRejection) -> Self {
        match rejection {
            RelayRejection::NotInRoom => SignalingError::NotInRoom,
            RelayRejection::TargetNotFound => SignalingError::TargetNotFound,
        }
    }
}

/// Directed signaling message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    CandidateEnd,
}

impl SignalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::CandidateEnd => "candidate-end",
        }
    }
}

/// Opaque payload forwarded between two connections.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    /// SDP or ICE candidate blob; `None` for `candidate-end`.
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit `leave`.
    Left,
    /// Connection closed, errored or timed out.
    Disconnected,
    /// Joined another room.
    Moved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Deleted,
    Idle,
}

/// Event delivered to a connection's outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    UserJoined {
        room_id: RoomId,
        participant: Participant,
    },
    UserLeft {
        room_id: RoomId,
        participant: Participant,
        reason: LeaveReason,
    },
    ParticipantUpdated {
        room_id: RoomId,
        participant: Participant,
    },
    /// The room was deleted; the receiving connection is no longer in it.
    RoomClosed {
        room_id: RoomId,
        reason: CloseReason,
    },
    Signal {
        room_id: RoomId,
        from: ConnectionId,
        from_participant: ParticipantId,
        signal: Signal,
    },
}

/// Change feed consumed by the cluster publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomChange {
    Created(Room),
    Updated(Room),
    Deleted { room_id: RoomId, reason: CloseReason },
    CountChanged { room_id: RoomId, count: usize },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_defaults_include_audio_processing() {
        let settings = RoomSettings::defaults_for(RoomKind::Voice);
        let voice = settings.voice.unwrap();
        assert!(voice.noise_suppression);
        assert!(voice.echo_cancellation);
        assert!(!voice.music_mode);
        assert_eq!(settings.max_duration_minutes, DEFAULT_MAX_DURATION_MINUTES);
    }

    #[test]
    fn test_video_defaults_have_no_voice_settings() {
        assert!(RoomSettings::defaults_for(RoomKind::Video).voice.is_none());
    }

    #[test]
    fn test_merge_overrides_only_present_fields() {
        let base = RoomSettings::defaults_for(RoomKind::Voice);
        let patch = SettingsPatch {
            recording_allowed: Some(true),
            music_mode: Some(true),
            ..SettingsPatch::default()
        };

        let merged = base.merged(&patch);
        assert!(merged.recording_allowed);
        assert!(!merged.mute_on_entry);
        assert!(merged.voice.unwrap().music_mode);
        assert!(merged.voice.unwrap().noise_suppression);
    }

    #[test]
    fn test_merge_ignores_voice_fields_for_video() {
        let base = RoomSettings::defaults_for(RoomKind::Video);
        let patch = SettingsPatch {
            music_mode: Some(true),
            ..SettingsPatch::default()
        };
        assert!(base.merged(&patch).voice.is_none());
    }

    #[test]
    fn test_patch_accepts_legacy_field_names() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"maxDuration": 30, "allowRecording": true}"#).unwrap();
        assert_eq!(patch.max_duration_minutes, Some(30));
        assert_eq!(patch.recording_allowed, Some(true));
    }

    #[test]
    fn test_room_serializes_kind_as_type() {
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

        let json = serde_json::to_value(&room).unwrap();
        assert_eq!(json["type"], "voice");
        assert_eq!(json["ownerInstance"], "sig-a");
        assert_eq!(json["settings"]["voice"]["noiseSuppression"], true);
        assert!(json.get("topic").is_none());
    }
}
