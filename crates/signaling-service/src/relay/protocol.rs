//! Relay wire protocol.
//!
//! JSON text frames tagged by `type`, camelCase fields. SDP and ICE
//! candidate payloads are opaque JSON values forwarded unchanged.

use crate::errors::SignalingError;
use crate::registry::{
    CloseReason, LeaveReason, Participant, ParticipantPatch, RoomEvent, Signal, SignalKind,
};
use common::types::{ConnectionId, ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
    },
    Leave,
    Offer {
        room_id: RoomId,
        target: ConnectionId,
        sdp: Value,
    },
    Answer {
        room_id: RoomId,
        target: ConnectionId,
        sdp: Value,
    },
    Candidate {
        room_id: RoomId,
        target: ConnectionId,
        candidate: Value,
    },
    CandidateEnd {
        room_id: RoomId,
        target: ConnectionId,
    },
    Mute {
        muted: bool,
    },
    Deafen {
        deafened: bool,
    },
    Speaking {
        speaking: bool,
    },
    Ping,
}

impl ClientMessage {
    /// Message type label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::Candidate { .. } => "candidate",
            ClientMessage::CandidateEnd { .. } => "candidate-end",
            ClientMessage::Mute { .. } => "mute",
            ClientMessage::Deafen { .. } => "deafen",
            ClientMessage::Speaking { .. } => "speaking",
            ClientMessage::Ping => "ping",
        }
    }
}

/// A directed signal pulled out of a client message.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectedSignal {
    pub room_id: RoomId,
    pub target: ConnectionId,
    pub signal: Signal,
}

impl DirectedSignal {
    /// `None` for messages that are not directed signals.
    #[must_use]
    pub fn from_message(message: &ClientMessage) -> Option<Self> {
        let (room_id, target, kind, payload) = match message {
            ClientMessage::Offer {
                room_id,
                target,
                sdp,
            } => (*room_id, *target, SignalKind::Offer, Some(sdp.clone())),
            ClientMessage::Answer {
                room_id,
                target,
                sdp,
            } => (*room_id, *target, SignalKind::Answer, Some(sdp.clone())),
            ClientMessage::Candidate {
                room_id,
                target,
                candidate,
            } => (
                *room_id,
                *target,
                SignalKind::Candidate,
                Some(candidate.clone()),
            ),
            ClientMessage::CandidateEnd { room_id, target } => {
                (*room_id, *target, SignalKind::CandidateEnd, None)
            }
            _ => return None,
        };

        Some(Self {
            room_id,
            target,
            signal: Signal { kind, payload },
        })
    }
}

/// Participant state changes carried by mute/deafen/speaking.
#[must_use]
pub fn participant_patch(message: &ClientMessage) -> Option<ParticipantPatch> {
    match message {
        ClientMessage::Mute { muted } => Some(ParticipantPatch {
            muted: Some(*muted),
            ..ParticipantPatch::default()
        }),
        ClientMessage::Deafen { deafened } => Some(ParticipantPatch {
            deafened: Some(*deafened),
            ..ParticipantPatch::default()
        }),
        ClientMessage::Speaking { speaking } => Some(ParticipantPatch {
            speaking: Some(*speaking),
            ..ParticipantPatch::default()
        }),
        _ => None,
    }
}

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined {
        room_id: RoomId,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        /// Everyone already in the room, excluding the joiner.
        participants: Vec<Participant>,
    },

    #[serde(rename = "left")]
    Left { room_id: RoomId },

    #[serde(rename = "user_joined")]
    UserJoined {
        room_id: RoomId,
        participant: Participant,
    },

    #[serde(rename = "user_left")]
    UserLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
        connection_id: ConnectionId,
        reason: LeaveReason,
    },

    #[serde(rename = "offer")]
    Offer {
        room_id: RoomId,
        from: ConnectionId,
        from_participant: ParticipantId,
        sdp: Value,
    },

    #[serde(rename = "answer")]
    Answer {
        room_id: RoomId,
        from: ConnectionId,
        from_participant: ParticipantId,
        sdp: Value,
    },

    #[serde(rename = "candidate")]
    Candidate {
        room_id: RoomId,
        from: ConnectionId,
        from_participant: ParticipantId,
        candidate: Value,
    },

    #[serde(rename = "candidate-end")]
    CandidateEnd {
        room_id: RoomId,
        from: ConnectionId,
        from_participant: ParticipantId,
    },

    #[serde(rename = "participant_updated")]
    ParticipantUpdated {
        room_id: RoomId,
        participant: Participant,
    },

    #[serde(rename = "room_closed")]
    RoomClosed { room_id: RoomId, reason: CloseReason },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    #[must_use]
    pub fn error(err: &SignalingError) -> Self {
        ServerMessage::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
        }
    }
}

impl From<RoomEvent> for ServerMessage {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::UserJoined {
                room_id,
                participant,
            } => ServerMessage::UserJoined {
                room_id,
                participant,
            },
            RoomEvent::UserLeft {
                room_id,
                participant,
                reason,
            } => ServerMessage::UserLeft {
                room_id,
                participant_id: participant.id,
                connection_id: participant.connection_id,
                reason,
            },
            RoomEvent::ParticipantUpdated {
                room_id,
                participant,
            } => ServerMessage::ParticipantUpdated {
                room_id,
                participant,
            },
            RoomEvent::RoomClosed { room_id, reason } => {
                ServerMessage::RoomClosed { room_id, reason }
            }
            RoomEvent::Signal {
                room_id,
                from,
                from_participant,
                signal,
            } => {
                let payload = signal.payload.unwrap_or(Value::Null);
                match signal.kind {
                    SignalKind::Offer => ServerMessage::Offer {
                        room_id,
                        from,
                        from_participant,
                        sdp: payload,
                    },
                    SignalKind::Answer => ServerMessage::Answer {
                        room_id,
                        from,
                        from_participant,
                        sdp: payload,
                    },
                    SignalKind::Candidate => ServerMessage::Candidate {
                        room_id,
                        from,
                        from_participant,
                        candidate: payload,
                    },
                    SignalKind::CandidateEnd => ServerMessage::CandidateEnd {
                        room_id,
                        from,
                        from_participant,
                    },
                }
            }
        }
    }
}
