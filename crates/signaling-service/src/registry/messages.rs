//! Messages accepted by the registry actor.
//!
//! Every request carries a `oneshot` reply channel; the handle awaits it.

use super::model::{
    CloseReason, ConnectionRoomInfo, JoinOutcome, JoinRejection, JoinRequest, LeaveReason,
    NewRoom, Participant, ParticipantPatch, RegistryStats, RelayRejection, Room, RoomSnapshot,
    RoomSummary, SettingsPatch, Signal,
};
use common::types::{ConnectionId, RoomId};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum RegistryMessage {
    CreateRoom {
        new_room: NewRoom,
        respond_to: oneshot::Sender<Room>,
    },

    /// Detach every participant, then remove the room.
    DeleteRoom {
        room_id: RoomId,
        reason: CloseReason,
        respond_to: oneshot::Sender<bool>,
    },

    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Option<RoomSnapshot>>,
    },

    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomSummary>>,
    },

    /// Capacity check and insertion happen in one message turn.
    AddParticipant {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, JoinRejection>>,
    },

    RemoveParticipant {
        connection_id: ConnectionId,
        reason: LeaveReason,
        respond_to: oneshot::Sender<Option<Participant>>,
    },

    RoomInfoForConnection {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Option<ConnectionRoomInfo>>,
    },

    /// Directed offer/answer/candidate from one connection to another.
    Relay {
        from: ConnectionId,
        room_id: RoomId,
        target: ConnectionId,
        signal: Signal,
        respond_to: oneshot::Sender<Result<(), RelayRejection>>,
    },

    UpdateSettings {
        room_id: RoomId,
        patch: SettingsPatch,
        respond_to: oneshot::Sender<Option<Room>>,
    },

    UpdateParticipant {
        connection_id: ConnectionId,
        patch: ParticipantPatch,
        respond_to: oneshot::Sender<Option<Participant>>,
    },

    /// Delete rooms empty for longer than `idle_timeout`.
    ReapIdle {
        idle_timeout: Duration,
        respond_to: oneshot::Sender<Vec<RoomId>>,
    },

    Stats {
        respond_to: oneshot::Sender<RegistryStats>,
    },
}
