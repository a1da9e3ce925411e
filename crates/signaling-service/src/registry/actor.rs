//! `RegistryActor` - single owner of all local room and participant state.
//!
//! All mutations arrive as messages on one mailbox and are applied one at a
//! time, so "capacity check then insert" and "join then notify" are atomic
//! with respect to every other registry operation. Callers use the cloneable
//! [`RegistryHandle`].
//!
//! Notifications to other participants are pushed from inside the actor onto
//! each connection's outbox with `try_send`. A full outbox drops the event
//! (the connection is too slow to keep up); the actor never awaits a reader.

use super::mailbox::MailboxMonitor;
use super::messages::RegistryMessage;
use super::model::{
    CloseReason, ConnectionOutbox, ConnectionRoomInfo, JoinOutcome, JoinRejection, JoinRequest,
    LeaveReason, NewRoom, Participant, ParticipantPatch, RegistryStats, RelayRejection, Role,
    Room, RoomChange, RoomEvent, RoomSettings, RoomSnapshot, RoomSummary, SettingsPatch, Signal,
    SignalKind,
};
use crate::errors::SignalingError;
use crate::observability::metrics;

use chrono::Utc;
use common::types::{ConnectionId, ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const REGISTRY_CHANNEL_BUFFER: usize = 1024;

/// Static inputs for the registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity assigned to every new room.
    pub room_capacity: usize,
    /// Recorded as `owner_instance` on every room created here.
    pub instance_id: String,
}

/// Handle to the [`RegistryActor`].
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RegistryHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();

        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(make(tx)).await {
            self.mailbox.record_send_failure();
            return Err(SignalingError::Internal(format!("channel send failed: {e}")));
        }

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Create a room. Names need not be unique; capacity comes from config.
    pub async fn create_room(&self, new_room: NewRoom) -> Result<Room, SignalingError> {
        self.request(|respond_to| RegistryMessage::CreateRoom {
            new_room,
            respond_to,
        })
        .await
    }

    /// Returns `false` if the room was absent.
    pub async fn delete_room(
        &self,
        room_id: RoomId,
        reason: CloseReason,
    ) -> Result<bool, SignalingError> {
        self.request(|respond_to| RegistryMessage::DeleteRoom {
            room_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            room_id,
            respond_to,
        })
        .await
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, SignalingError> {
        self.request(|respond_to| RegistryMessage::ListRooms { respond_to })
            .await
    }

    /// Join a room, leaving any current room first.
    ///
    /// The inner `Err` is a refusal (absent or full room) with no side effect.
    pub async fn add_participant(
        &self,
        request: JoinRequest,
    ) -> Result<Result<JoinOutcome, JoinRejection>, SignalingError> {
        self.request(|respond_to| RegistryMessage::AddParticipant {
            request,
            respond_to,
        })
        .await
    }

    /// Idempotent: `None` when the connection is not in any room.
    pub async fn remove_participant(
        &self,
        connection_id: ConnectionId,
        reason: LeaveReason,
    ) -> Result<Option<Participant>, SignalingError> {
        self.request(|respond_to| RegistryMessage::RemoveParticipant {
            connection_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn room_info_for_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<ConnectionRoomInfo>, SignalingError> {
        self.request(|respond_to| RegistryMessage::RoomInfoForConnection {
            connection_id,
            respond_to,
        })
        .await
    }

    /// Forward `signal` from `from` to `target`, both of which must be in `room_id`.
    pub async fn relay(
        &self,
        from: ConnectionId,
        room_id: RoomId,
        target: ConnectionId,
        signal: Signal,
    ) -> Result<Result<(), RelayRejection>, SignalingError> {
        self.request(|respond_to| RegistryMessage::Relay {
            from,
            room_id,
            target,
            signal,
            respond_to,
        })
        .await
    }

    /// Merge `patch` over the current settings; `None` if the room is absent.
    pub async fn update_settings(
        &self,
        room_id: RoomId,
        patch: SettingsPatch,
    ) -> Result<Option<Room>, SignalingError> {
        self.request(|respond_to| RegistryMessage::UpdateSettings {
            room_id,
            patch,
            respond_to,
        })
        .await
    }

    pub async fn update_participant(
        &self,
        connection_id: ConnectionId,
        patch: ParticipantPatch,
    ) -> Result<Option<Participant>, SignalingError> {
        self.request(|respond_to| RegistryMessage::UpdateParticipant {
            connection_id,
            patch,
            respond_to,
        })
        .await
    }

    pub async fn reap_idle_rooms(&self, idle_timeout: Duration) -> Result<Vec<RoomId>, SignalingError> {
        self.request(|respond_to| RegistryMessage::ReapIdle {
            idle_timeout,
            respond_to,
        })
        .await
    }

    pub async fn stats(&self) -> Result<RegistryStats, SignalingError> {
        self.request(|respond_to| RegistryMessage::Stats { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct Member {
    participant: Participant,
    outbox: ConnectionOutbox,
}

struct RoomEntry {
    room: Room,
    /// Join order.
    members: Vec<Member>,
    /// Set while the room has no members.
    empty_since: Option<Instant>,
}

impl RoomEntry {
    fn member(&self, connection_id: ConnectionId) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.participant.connection_id == connection_id)
    }

    fn participants(&self) -> Vec<Participant> {
        self.members.iter().map(|m| m.participant.clone()).collect()
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room: self.room.clone(),
            participant_count: self.members.len(),
        }
    }

    /// Deliver `event` to every member except `except`.
    fn broadcast(&self, except: Option<ConnectionId>, event: &RoomEvent) {
        for member in &self.members {
            if Some(member.participant.connection_id) == except {
                continue;
            }
            deliver(&member.outbox, member.participant.connection_id, event.clone());
        }
    }
}

fn deliver(outbox: &ConnectionOutbox, connection_id: ConnectionId, event: RoomEvent) {
    match outbox.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics::record_outbox_dropped();
            warn!(
                target: "sig.registry",
                connection_id = %connection_id,
                "Connection outbox full, event dropped"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                target: "sig.registry",
                connection_id = %connection_id,
                "Connection outbox closed, event discarded"
            );
        }
    }
}

/// Owns every local room.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    config: RegistryConfig,
    rooms: HashMap<RoomId, RoomEntry>,
    /// Connection -> room it is currently in.
    by_connection: HashMap<ConnectionId, RoomId>,
    /// Optional feed of room changes for cross-instance replication.
    changes: Option<mpsc::Sender<RoomChange>>,
    mailbox: Arc<MailboxMonitor>,
}

impl RegistryActor {
    /// Spawn the actor and return its handle.
    pub fn spawn(
        config: RegistryConfig,
        cancel_token: CancellationToken,
        changes: Option<mpsc::Sender<RoomChange>>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new());

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            config,
            rooms: HashMap::new(),
            by_connection: HashMap::new(),
            changes,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryHandle {
            sender,
            cancel_token,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sig.actor.registry", fields(instance_id = %self.config.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sig.registry",
            room_capacity = self.config.room_capacity,
            "RegistryActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "sig.registry", "RegistryActor received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                        }
                        None => {
                            info!(target: "sig.registry", "RegistryActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sig.registry",
            rooms = self.rooms.len(),
            participants = self.by_connection.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateRoom {
                new_room,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_create(new_room));
            }

            RegistryMessage::DeleteRoom {
                room_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_delete(room_id, reason));
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let snapshot = self.rooms.get(&room_id).map(|entry| RoomSnapshot {
                    room: entry.room.clone(),
                    participants: entry.participants(),
                });
                let _ = respond_to.send(snapshot);
            }

            RegistryMessage::ListRooms { respond_to } => {
                let mut rooms: Vec<RoomSummary> =
                    self.rooms.values().map(RoomEntry::summary).collect();
                rooms.sort_by(|a, b| a.room.created_at.cmp(&b.room.created_at));
                let _ = respond_to.send(rooms);
            }

            RegistryMessage::AddParticipant {
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_join(request));
            }

            RegistryMessage::RemoveParticipant {
                connection_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_leave(connection_id, reason));
            }

            RegistryMessage::RoomInfoForConnection {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.room_info(connection_id));
            }

            RegistryMessage::Relay {
                from,
                room_id,
                target,
                signal,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_relay(from, room_id, target, signal));
            }

            RegistryMessage::UpdateSettings {
                room_id,
                patch,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_update_settings(room_id, &patch));
            }

            RegistryMessage::UpdateParticipant {
                connection_id,
                patch,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_update_participant(connection_id, patch));
            }

            RegistryMessage::ReapIdle {
                idle_timeout,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_reap(idle_timeout));
            }

            RegistryMessage::Stats { respond_to } => {
                let _ = respond_to.send(RegistryStats {
                    rooms: self.rooms.len(),
                    participants: self.by_connection.len(),
                });
            }
        }
    }

    fn handle_create(&mut self, new_room: NewRoom) -> Room {
        let settings = RoomSettings::defaults_for(new_room.kind)
            .merged(&new_room.settings.unwrap_or_default());

        let room = Room {
            id: RoomId::new(),
            name: new_room.name,
            kind: new_room.kind,
            owner: new_room.owner,
            owner_instance: self.config.instance_id.clone(),
            created_at: Utc::now(),
            capacity: self.config.room_capacity,
            settings,
            topic: new_room.topic,
            connection_url: new_room.connection_url,
        };

        self.rooms.insert(
            room.id,
            RoomEntry {
                room: room.clone(),
                members: Vec::new(),
                empty_since: Some(Instant::now()),
            },
        );

        info!(
            target: "sig.registry",
            room_id = %room.id,
            kind = ?room.kind,
            capacity = room.capacity,
            "Room created"
        );

        self.publish(RoomChange::Created(room.clone()));
        self.update_gauges();
        room
    }

    fn handle_delete(&mut self, room_id: RoomId, reason: CloseReason) -> bool {
        let Some(entry) = self.rooms.remove(&room_id) else {
            return false;
        };

        for member in &entry.members {
            let connection_id = member.participant.connection_id;
            self.by_connection.remove(&connection_id);
            deliver(
                &member.outbox,
                connection_id,
                RoomEvent::RoomClosed { room_id, reason },
            );
        }

        info!(
            target: "sig.registry",
            room_id = %room_id,
            reason = ?reason,
            detached = entry.members.len(),
            "Room deleted"
        );

        self.publish(RoomChange::Deleted { room_id, reason });
        self.update_gauges();
        true
    }

    fn handle_join(&mut self, request: JoinRequest) -> Result<JoinOutcome, JoinRejection> {
        let connection_id = request.connection_id;
        let current_room = self.by_connection.get(&connection_id).copied();

        // Validate before touching any state so a refused join has no effect.
        let Some(target) = self.rooms.get(&request.room_id) else {
            metrics::record_join(JoinRejection::RoomNotFound.as_str());
            return Err(JoinRejection::RoomNotFound);
        };
        let already_here = usize::from(current_room == Some(request.room_id));
        if target.members.len() - already_here >= target.room.capacity {
            debug!(
                target: "sig.registry",
                room_id = %request.room_id,
                capacity = target.room.capacity,
                "Join refused: room full"
            );
            metrics::record_join(JoinRejection::RoomFull.as_str());
            return Err(JoinRejection::RoomFull);
        }

        let left = match current_room {
            Some(_) => self
                .handle_leave(connection_id, LeaveReason::Moved)
                .map(|p| p.room_id),
            None => None,
        };

        let Some(entry) = self.rooms.get_mut(&request.room_id) else {
            return Err(JoinRejection::RoomNotFound);
        };

        let role = request.role.unwrap_or(if request.identity == entry.room.owner {
            Role::Owner
        } else {
            Role::Participant
        });

        let participant = Participant {
            id: ParticipantId::new(),
            identity: request.identity,
            display_name: request.display_name,
            connection_id,
            room_id: request.room_id,
            joined_at: Utc::now(),
            role,
            muted: entry.room.settings.mute_on_entry,
            deafened: false,
            speaking: false,
            speaking_since: None,
        };

        let others = entry.participants();
        entry.broadcast(
            None,
            &RoomEvent::UserJoined {
                room_id: request.room_id,
                participant: participant.clone(),
            },
        );

        entry.members.push(Member {
            participant: participant.clone(),
            outbox: request.outbox,
        });
        entry.empty_since = None;
        let room = entry.room.clone();
        let count = entry.members.len();

        self.by_connection.insert(connection_id, request.room_id);

        info!(
            target: "sig.registry",
            room_id = %request.room_id,
            participant_id = %participant.id,
            connection_id = %connection_id,
            participants = count,
            "Participant joined"
        );

        metrics::record_join("joined");
        self.publish(RoomChange::CountChanged {
            room_id: request.room_id,
            count,
        });
        self.update_gauges();

        Ok(JoinOutcome {
            participant,
            room,
            others,
            left,
        })
    }

    fn handle_leave(&mut self, connection_id: ConnectionId, reason: LeaveReason) -> Option<Participant> {
        let room_id = self.by_connection.remove(&connection_id)?;
        let entry = self.rooms.get_mut(&room_id)?;

        let index = entry
            .members
            .iter()
            .position(|m| m.participant.connection_id == connection_id)?;
        let member = entry.members.remove(index);
        let participant = member.participant;

        entry.broadcast(
            None,
            &RoomEvent::UserLeft {
                room_id,
                participant: participant.clone(),
                reason,
            },
        );

        if entry.members.is_empty() {
            entry.empty_since = Some(Instant::now());
        }
        let count = entry.members.len();

        info!(
            target: "sig.registry",
            room_id = %room_id,
            participant_id = %participant.id,
            connection_id = %connection_id,
            reason = ?reason,
            participants = count,
            "Participant left"
        );

        self.publish(RoomChange::CountChanged { room_id, count });
        self.update_gauges();
        Some(participant)
    }

    fn room_info(&self, connection_id: ConnectionId) -> Option<ConnectionRoomInfo> {
        let room_id = self.by_connection.get(&connection_id)?;
        let entry = self.rooms.get(room_id)?;
        let member = entry.member(connection_id)?;

        Some(ConnectionRoomInfo {
            room: entry.room.clone(),
            participant: member.participant.clone(),
        })
    }

    fn handle_relay(
        &self,
        from: ConnectionId,
        room_id: RoomId,
        target: ConnectionId,
        signal: Signal,
    ) -> Result<(), RelayRejection> {
        // The registry's view of the sender's room is authoritative; the
        // room id in the message is only checked against it.
        if self.by_connection.get(&from) != Some(&room_id) {
            return Err(RelayRejection::NotInRoom);
        }
        let entry = self.rooms.get(&room_id).ok_or(RelayRejection::NotInRoom)?;
        let sender = entry.member(from).ok_or(RelayRejection::NotInRoom)?;

        let Some(recipient) = entry.member(target) else {
            if signal.kind == SignalKind::CandidateEnd {
                return Ok(());
            }
            return Err(RelayRejection::TargetNotFound);
        };

        deliver(
            &recipient.outbox,
            target,
            RoomEvent::Signal {
                room_id,
                from,
                from_participant: sender.participant.id,
                signal,
            },
        );

        Ok(())
    }

    fn handle_update_settings(&mut self, room_id: RoomId, patch: &SettingsPatch) -> Option<Room> {
        let entry = self.rooms.get_mut(&room_id)?;
        entry.room.settings = entry.room.settings.merged(patch);
        let room = entry.room.clone();

        debug!(target: "sig.registry", room_id = %room_id, "Room settings updated");
        self.publish(RoomChange::Updated(room.clone()));
        Some(room)
    }

    fn handle_update_participant(
        &mut self,
        connection_id: ConnectionId,
        patch: ParticipantPatch,
    ) -> Option<Participant> {
        let room_id = *self.by_connection.get(&connection_id)?;
        let entry = self.rooms.get_mut(&room_id)?;
        let member = entry
            .members
            .iter_mut()
            .find(|m| m.participant.connection_id == connection_id)?;

        let p = &mut member.participant;
        if let Some(muted) = patch.muted {
            p.muted = muted;
        }
        if let Some(deafened) = patch.deafened {
            p.deafened = deafened;
        }
        if let Some(speaking) = patch.speaking {
            if speaking && !p.speaking {
                p.speaking_since = Some(Utc::now());
            } else if !speaking {
                p.speaking_since = None;
            }
            p.speaking = speaking;
        }
        let participant = p.clone();

        entry.broadcast(
            Some(connection_id),
            &RoomEvent::ParticipantUpdated {
                room_id,
                participant: participant.clone(),
            },
        );

        Some(participant)
    }

    fn handle_reap(&mut self, idle_timeout: Duration) -> Vec<RoomId> {
        let now = Instant::now();
        let idle: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, entry)| entry.members.is_empty())
            .filter(|(_, entry)| {
                entry
                    .empty_since
                    .is_some_and(|since| now.duration_since(since) > idle_timeout)
            })
            .map(|(id, _)| *id)
            .collect();

        for room_id in &idle {
            self.handle_delete(*room_id, CloseReason::Idle);
        }

        if !idle.is_empty() {
            metrics::record_rooms_reaped(idle.len());
        }
        idle
    }

    fn publish(&self, change: RoomChange) {
        let Some(changes) = &self.changes else {
            return;
        };
        if let Err(e) = changes.try_send(change) {
            warn!(target: "sig.registry", error = %e, "Room change feed unavailable, change dropped");
        }
    }

    fn update_gauges(&self) {
        metrics::set_rooms_active(self.rooms.len());
        metrics::set_participants_active(self.by_connection.len());
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::registry::model::RoomKind;
    use serde_json::json;

    fn spawn_registry(capacity: usize) -> RegistryHandle {
        let (handle, _task) = RegistryActor::spawn(
            RegistryConfig {
                room_capacity: capacity,
                instance_id: "sig-test".to_string(),
            },
            CancellationToken::new(),
            None,
        );
        handle
    }

    fn new_room(owner: &str) -> NewRoom {
        NewRoom {
            name: "standup".to_string(),
            kind: RoomKind::Voice,
            owner: owner.to_string(),
            settings: None,
            ..NewRoom::default()
        }
    }

    struct TestConn {
        id: ConnectionId,
        outbox: ConnectionOutbox,
        events: mpsc::Receiver<RoomEvent>,
    }

    fn conn() -> TestConn {
        let (outbox, events) = mpsc::channel(32);
        TestConn {
            id: ConnectionId::new(),
            outbox,
            events,
        }
    }

    fn join_request(room_id: RoomId, identity: &str, c: &TestConn) -> JoinRequest {
        JoinRequest {
            room_id,
            identity: identity.to_string(),
            display_name: None,
            connection_id: c.id,
            role: None,
            outbox: c.outbox.clone(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_room() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();

        assert_eq!(room.capacity, 10);
        assert_eq!(room.owner_instance, "sig-test");

        let snapshot = registry.get_room(room.id).await.unwrap().unwrap();
        assert_eq!(snapshot.room, room);
        assert!(snapshot.participants.is_empty());
    }

    #[tokio::test]
    async fn test_room_names_need_not_be_unique() {
        let registry = spawn_registry(10);
        let a = registry.create_room(new_room("alice")).await.unwrap();
        let b = registry.create_room(new_room("alice")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(registry.list_rooms().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_join_snapshot_and_notifications() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let mut a = conn();
        let mut b = conn();

        let joined_a = registry
            .add_participant(join_request(room.id, "alice", &a))
            .await
            .unwrap()
            .unwrap();
        assert!(joined_a.others.is_empty());
        assert_eq!(joined_a.participant.role, Role::Owner);

        let joined_b = registry
            .add_participant(join_request(room.id, "bob", &b))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined_b.others.len(), 1);
        assert_eq!(joined_b.others[0].connection_id, a.id);
        assert_eq!(joined_b.participant.role, Role::Participant);

        match a.events.try_recv().unwrap() {
            RoomEvent::UserJoined { participant, .. } => assert_eq!(participant.connection_id, b.id),
            other => panic!("unexpected event: {other:?}"),
        }
        // The joiner never hears about itself.
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_missing_room_rejected() {
        let registry = spawn_registry(10);
        let a = conn();

        let result = registry
            .add_participant(join_request(RoomId::new(), "alice", &a))
            .await
            .unwrap();
        assert_eq!(result, Err(JoinRejection::RoomNotFound));
        assert!(registry.room_info_for_connection(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_full_room_rejected_without_side_effect() {
        let registry = spawn_registry(1);
        let room_a = registry.create_room(new_room("alice")).await.unwrap();
        let room_b = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();
        let b = conn();

        registry.add_participant(join_request(room_a.id, "alice", &a)).await.unwrap().unwrap();
        registry.add_participant(join_request(room_b.id, "bob", &b)).await.unwrap().unwrap();

        // b tries to move into the full room; it must stay where it was.
        let result = registry
            .add_participant(join_request(room_a.id, "bob", &b))
            .await
            .unwrap();
        assert_eq!(result, Err(JoinRejection::RoomFull));

        let info = registry.room_info_for_connection(b.id).await.unwrap().unwrap();
        assert_eq!(info.room.id, room_b.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_never_exceed_capacity() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();

        let mut tasks = Vec::new();
        let mut keep_alive = Vec::new();
        for i in 0..50 {
            let c = conn();
            let request = join_request(room.id, &format!("user-{i}"), &c);
            keep_alive.push(c);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.add_participant(request).await.unwrap()
            }));
        }

        let mut admitted = 0;
        let mut full = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(JoinRejection::RoomFull) => full += 1,
                Err(other) => panic!("unexpected rejection {other:?}"),
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(full, 40);
        let snapshot = registry.get_room(room.id).await.unwrap().unwrap();
        assert_eq!(snapshot.participants.len(), 10);
    }

    #[tokio::test]
    async fn test_remove_unknown_connection_is_noop() {
        let registry = spawn_registry(10);
        let removed = registry
            .remove_participant(ConnectionId::new(), LeaveReason::Left)
            .await
            .unwrap();
        assert!(removed.is_none());
        assert_eq!(registry.stats().await.unwrap().participants, 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_notifies_once() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let mut a = conn();
        let b = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        registry.add_participant(join_request(room.id, "bob", &b)).await.unwrap().unwrap();
        let _ = a.events.try_recv(); // user_joined(bob)

        assert!(registry
            .remove_participant(b.id, LeaveReason::Disconnected)
            .await
            .unwrap()
            .is_some());
        assert!(registry
            .remove_participant(b.id, LeaveReason::Disconnected)
            .await
            .unwrap()
            .is_none());

        match a.events.try_recv().unwrap() {
            RoomEvent::UserLeft { participant, reason, .. } => {
                assert_eq!(participant.connection_id, b.id);
                assert_eq!(reason, LeaveReason::Disconnected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_is_not_additive() {
        let registry = spawn_registry(10);
        let room_a = registry.create_room(new_room("alice")).await.unwrap();
        let room_b = registry.create_room(new_room("alice")).await.unwrap();
        let mut watcher = conn();
        let mover = conn();

        registry.add_participant(join_request(room_a.id, "watcher", &watcher)).await.unwrap().unwrap();
        registry.add_participant(join_request(room_a.id, "mover", &mover)).await.unwrap().unwrap();
        let _ = watcher.events.try_recv();

        let outcome = registry
            .add_participant(join_request(room_b.id, "mover", &mover))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.left, Some(room_a.id));

        let a = registry.get_room(room_a.id).await.unwrap().unwrap();
        let b = registry.get_room(room_b.id).await.unwrap().unwrap();
        assert_eq!(a.participants.len(), 1);
        assert_eq!(b.participants.len(), 1);
        assert_eq!(
            registry.room_info_for_connection(mover.id).await.unwrap().unwrap().room.id,
            room_b.id
        );

        assert!(matches!(
            watcher.events.try_recv().unwrap(),
            RoomEvent::UserLeft { reason: LeaveReason::Moved, .. }
        ));
    }

    #[tokio::test]
    async fn test_rejoin_same_room_at_capacity() {
        let registry = spawn_registry(1);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();

        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        let again = registry
            .add_participant(join_request(room.id, "alice", &a))
            .await
            .unwrap();
        assert!(again.is_ok());
        assert_eq!(registry.stats().await.unwrap().participants, 1);
    }

    #[tokio::test]
    async fn test_delete_room_cascades() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let mut a = conn();
        let mut b = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        registry.add_participant(join_request(room.id, "bob", &b)).await.unwrap().unwrap();
        let _ = a.events.try_recv();

        assert!(registry.delete_room(room.id, CloseReason::Deleted).await.unwrap());
        assert!(!registry.delete_room(room.id, CloseReason::Deleted).await.unwrap());

        assert!(registry.get_room(room.id).await.unwrap().is_none());
        assert!(registry.room_info_for_connection(a.id).await.unwrap().is_none());
        assert!(registry.room_info_for_connection(b.id).await.unwrap().is_none());

        for events in [&mut a.events, &mut b.events] {
            assert_eq!(
                events.try_recv().unwrap(),
                RoomEvent::RoomClosed {
                    room_id: room.id,
                    reason: CloseReason::Deleted
                }
            );
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_only_to_target() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let mut a = conn();
        let mut b = conn();
        let mut c = conn();
        for (x, name) in [(&a, "alice"), (&b, "bob"), (&c, "carol")] {
            registry.add_participant(join_request(room.id, name, x)).await.unwrap().unwrap();
        }
        while a.events.try_recv().is_ok() {}
        while b.events.try_recv().is_ok() {}
        while c.events.try_recv().is_ok() {}

        let signal = Signal {
            kind: SignalKind::Offer,
            payload: Some(json!("v=0 o=- 1 1 IN IP4 0.0.0.0")),
        };
        registry.relay(a.id, room.id, b.id, signal.clone()).await.unwrap().unwrap();

        match b.events.try_recv().unwrap() {
            RoomEvent::Signal { from, signal: got, .. } => {
                assert_eq!(from, a.id);
                assert_eq!(got, signal);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(a.events.try_recv().is_err());
        assert!(c.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relay_rejects_wrong_room_claim() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let other_room = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();
        let b = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        registry.add_participant(join_request(room.id, "bob", &b)).await.unwrap().unwrap();

        let signal = Signal {
            kind: SignalKind::Answer,
            payload: Some(json!("sdp")),
        };
        assert_eq!(
            registry.relay(a.id, other_room.id, b.id, signal.clone()).await.unwrap(),
            Err(RelayRejection::NotInRoom)
        );
        assert_eq!(
            registry.relay(ConnectionId::new(), room.id, b.id, signal).await.unwrap(),
            Err(RelayRejection::NotInRoom)
        );
    }

    #[tokio::test]
    async fn test_relay_missing_target() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();

        let candidate = Signal {
            kind: SignalKind::Candidate,
            payload: Some(json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"})),
        };
        assert_eq!(
            registry.relay(a.id, room.id, ConnectionId::new(), candidate).await.unwrap(),
            Err(RelayRejection::TargetNotFound)
        );

        let end = Signal {
            kind: SignalKind::CandidateEnd,
            payload: None,
        };
        assert_eq!(
            registry.relay(a.id, room.id, ConnectionId::new(), end).await.unwrap(),
            Ok(())
        );
    }

    #[tokio::test]
    async fn test_update_settings_merges_and_replaces() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();

        let updated = registry
            .update_settings(
                room.id,
                SettingsPatch {
                    mute_on_entry: Some(true),
                    ..SettingsPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.settings.mute_on_entry);
        assert_eq!(updated.settings.max_duration_minutes, room.settings.max_duration_minutes);

        // New joiners inherit mute-on-entry.
        let a = conn();
        let joined = registry
            .add_participant(join_request(room.id, "bob", &a))
            .await
            .unwrap()
            .unwrap();
        assert!(joined.participant.muted);

        assert!(registry
            .update_settings(RoomId::new(), SettingsPatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_participant_broadcasts_to_others() {
        let registry = spawn_registry(10);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let mut a = conn();
        let mut b = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        registry.add_participant(join_request(room.id, "bob", &b)).await.unwrap().unwrap();
        let _ = a.events.try_recv();

        let updated = registry
            .update_participant(
                b.id,
                ParticipantPatch {
                    speaking: Some(true),
                    ..ParticipantPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.speaking);
        assert!(updated.speaking_since.is_some());

        assert!(matches!(
            a.events.try_recv().unwrap(),
            RoomEvent::ParticipantUpdated { .. }
        ));
        assert!(b.events.try_recv().is_err());

        let stopped = registry
            .update_participant(
                b.id,
                ParticipantPatch {
                    speaking: Some(false),
                    ..ParticipantPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(stopped.speaking_since.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_respects_idle_timeout() {
        let registry = spawn_registry(10);
        let idle_timeout = Duration::from_secs(300);
        let room = registry.create_room(new_room("alice")).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(registry.reap_idle_rooms(idle_timeout).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.reap_idle_rooms(idle_timeout).await.unwrap(), vec![room.id]);
        assert!(registry.get_room(room.id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_never_deletes_occupied_room() {
        let registry = spawn_registry(10);
        let idle_timeout = Duration::from_secs(60);
        let room = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(registry.reap_idle_rooms(idle_timeout).await.unwrap().is_empty());

        // The idle clock starts when the last participant leaves.
        registry.remove_participant(a.id, LeaveReason::Left).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.reap_idle_rooms(idle_timeout).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.reap_idle_rooms(idle_timeout).await.unwrap(), vec![room.id]);
    }

    #[tokio::test]
    async fn test_change_feed() {
        let (changes_tx, mut changes) = mpsc::channel(16);
        let (registry, _task) = RegistryActor::spawn(
            RegistryConfig {
                room_capacity: 4,
                instance_id: "sig-feed".to_string(),
            },
            CancellationToken::new(),
            Some(changes_tx),
        );

        let room = registry.create_room(new_room("alice")).await.unwrap();
        let a = conn();
        registry.add_participant(join_request(room.id, "alice", &a)).await.unwrap().unwrap();
        registry.delete_room(room.id, CloseReason::Deleted).await.unwrap();

        assert_eq!(changes.recv().await.unwrap(), RoomChange::Created(room.clone()));
        assert_eq!(
            changes.recv().await.unwrap(),
            RoomChange::CountChanged { room_id: room.id, count: 1 }
        );
        assert_eq!(
            changes.recv().await.unwrap(),
            RoomChange::Deleted { room_id: room.id, reason: CloseReason::Deleted }
        );
    }

    #[tokio::test]
    async fn test_handle_fails_after_cancel() {
        let (registry, task) = RegistryActor::spawn(
            RegistryConfig {
                room_capacity: 4,
                instance_id: "sig-cancel".to_string(),
            },
            CancellationToken::new(),
            None,
        );

        registry.cancel();
        assert!(registry.is_cancelled());
        task.await.unwrap();

        assert!(matches!(
            registry.stats().await,
            Err(SignalingError::Internal(_))
        ));
    }
}
