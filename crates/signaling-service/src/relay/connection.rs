//! One relay connection: a message-dispatch loop over the WebSocket, the
//! connection's outbox, a heartbeat timer and the shutdown token.
//!
//! The loop has a single exit path, so disconnect cleanup (leave the room,
//! drop the session) runs exactly once whatever ended the connection.

use super::protocol::{participant_patch, ClientMessage, DirectedSignal, ServerMessage};
use super::RelayContext;
use crate::cluster::{RateClass, Session};
use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::registry::{JoinRejection, JoinRequest, LeaveReason, RoomEvent};
use axum::extract::ws::{Message, WebSocket};
use common::types::{ConnectionId, RoomId, SessionId};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Queued notifications per connection before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 256;

/// Who is on the other end, from the verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub subject: String,
    pub display_name: Option<String>,
    /// Set for room-join tokens: the only room this connection may join.
    pub scoped_room: Option<RoomId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    ClientClosed,
    SocketError,
    HeartbeatTimeout,
    Shutdown,
}

impl ExitReason {
    fn as_str(self) -> &'static str {
        match self {
            ExitReason::ClientClosed => "client_closed",
            ExitReason::SocketError => "socket_error",
            ExitReason::HeartbeatTimeout => "heartbeat_timeout",
            ExitReason::Shutdown => "shutdown",
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    identity: ConnectionIdentity,
    ctx: RelayContext,
    outbox: mpsc::Sender<RoomEvent>,
    session_id: Option<SessionId>,
}

impl Connection {
    /// Returns the connection and the receiving end of its outbox.
    #[must_use]
    pub fn new(
        identity: ConnectionIdentity,
        ctx: RelayContext,
    ) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (outbox, events) = mpsc::channel(OUTBOX_CAPACITY);
        let connection = Self {
            id: ConnectionId::new(),
            identity,
            ctx,
            outbox,
            session_id: None,
        };
        (connection, events)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drive the connection until it closes, then clean up.
    #[instrument(skip_all, name = "sig.relay.connection", fields(connection_id = %self.id))]
    pub async fn run(mut self, socket: WebSocket, mut events: mpsc::Receiver<RoomEvent>) {
        let (mut sink, mut stream) = socket.split();

        self.ctx.connections.fetch_add(1, Ordering::Relaxed);
        metrics::increment_connections_active();
        self.open_session().await;
        info!(
            target: "sig.relay",
            connection_id = %self.id,
            scoped = self.identity.scoped_room.is_some(),
            "Connection established"
        );

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.ctx.heartbeat_interval,
            self.ctx.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_activity = Instant::now();

        let exit = loop {
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break ExitReason::Shutdown;
                }

                frame = stream.next() => {
                    let message = match frame {
                        None => break ExitReason::ClientClosed,
                        Some(Err(e)) => {
                            debug!(target: "sig.relay", error = %e, "WebSocket receive failed");
                            break ExitReason::SocketError;
                        }
                        Some(Ok(message)) => message,
                    };
                    last_activity = Instant::now();

                    let replies = match message {
                        Message::Text(text) => self.handle_text(&text).await,
                        Message::Binary(_) => vec![ServerMessage::error(
                            &SignalingError::InvalidMessage("Binary frames are not supported".to_string()),
                        )],
                        Message::Close(_) => break ExitReason::ClientClosed,
                        Message::Ping(_) | Message::Pong(_) => Vec::new(),
                    };

                    if send_all(&mut sink, replies).await.is_err() {
                        break ExitReason::SocketError;
                    }
                }

                Some(event) = events.recv() => {
                    if let RoomEvent::RoomClosed { .. } = &event {
                        self.record_room(None).await;
                    }
                    if send_all(&mut sink, vec![ServerMessage::from(event)]).await.is_err() {
                        break ExitReason::SocketError;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_activity.elapsed() >= self.ctx.heartbeat_timeout {
                        break ExitReason::HeartbeatTimeout;
                    }
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break ExitReason::SocketError;
                    }
                    self.touch_session().await;
                }
            }
        };

        self.close(exit).await;
    }

    /// Parse and dispatch one text frame.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        let decision = self
            .ctx
            .rate_limiter
            .check(RateClass::Relay, &self.id.to_string())
            .await;
        if let Err(e) = decision.into_result() {
            metrics::record_relay_message("unknown", "rate_limited");
            return vec![ServerMessage::error(&e)];
        }

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "sig.relay", error = %e, "Malformed client message");
                metrics::record_relay_message("unknown", "invalid");
                return vec![ServerMessage::error(&SignalingError::InvalidMessage(
                    "Message is not a valid signaling message".to_string(),
                ))];
            }
        };

        let kind = message.kind();
        match self.handle_message(message).await {
            Ok(replies) => {
                metrics::record_relay_message(kind, "ok");
                replies
            }
            Err(e) => {
                debug!(
                    target: "sig.relay",
                    connection_id = %self.id,
                    message_type = kind,
                    code = e.error_code(),
                    "Client message rejected"
                );
                metrics::record_relay_message(kind, "rejected");
                vec![ServerMessage::error(&e)]
            }
        }
    }

    /// Dispatch a parsed message. Errors are reported to this connection only.
    pub async fn handle_message(
        &mut self,
        message: ClientMessage,
    ) -> Result<Vec<ServerMessage>, SignalingError> {
        match message {
            ClientMessage::Join { room_id } => self.join(room_id).await,
            ClientMessage::Leave => self.leave().await,
            ClientMessage::Ping => Ok(vec![ServerMessage::Pong]),
            ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::Candidate { .. }
            | ClientMessage::CandidateEnd { .. } => self.relay_signal(&message).await,
            ClientMessage::Mute { .. }
            | ClientMessage::Deafen { .. }
            | ClientMessage::Speaking { .. } => self.update_participant(&message).await,
        }
    }

    async fn relay_signal(
        &mut self,
        message: &ClientMessage,
    ) -> Result<Vec<ServerMessage>, SignalingError> {
        let Some(directed) = DirectedSignal::from_message(message) else {
            return Err(SignalingError::InvalidMessage(format!(
                "{} is not a directed signal",
                message.kind()
            )));
        };
        self.ctx
            .registry
            .relay(self.id, directed.room_id, directed.target, directed.signal)
            .await??;
        Ok(Vec::new())
    }

    async fn update_participant(
        &mut self,
        message: &ClientMessage,
    ) -> Result<Vec<ServerMessage>, SignalingError> {
        let Some(patch) = participant_patch(message) else {
            return Err(SignalingError::InvalidMessage(format!(
                "{} does not change participant state",
                message.kind()
            )));
        };
        let participant = self
            .ctx
            .registry
            .update_participant(self.id, patch)
            .await?
            .ok_or(SignalingError::NotInRoom)?;
        Ok(vec![ServerMessage::ParticipantUpdated {
            room_id: participant.room_id,
            participant,
        }])
    }

    async fn join(&mut self, room_id: RoomId) -> Result<Vec<ServerMessage>, SignalingError> {
        if let Some(scoped) = self.identity.scoped_room {
            if scoped != room_id {
                metrics::record_join("forbidden");
                return Err(SignalingError::Forbidden(
                    "Token is not valid for this room".to_string(),
                ));
            }
        }

        let request = JoinRequest {
            room_id,
            identity: self.identity.subject.clone(),
            display_name: self.identity.display_name.clone(),
            connection_id: self.id,
            role: None,
            outbox: self.outbox.clone(),
        };

        let outcome = match self.ctx.registry.add_participant(request).await? {
            Ok(outcome) => outcome,
            Err(JoinRejection::RoomNotFound) => {
                // A room owned elsewhere is reported as such so the client
                // can reconnect to the right instance.
                if let Some(remote) = self.ctx.directory.get(room_id).await {
                    metrics::record_join("not_local");
                    return Err(SignalingError::RoomNotLocal {
                        owner: remote.room.owner_instance,
                    });
                }
                return Err(SignalingError::RoomNotFound);
            }
            Err(rejection) => return Err(rejection.into()),
        };

        self.record_room(Some(room_id)).await;

        Ok(vec![ServerMessage::Joined {
            room_id,
            participant_id: outcome.participant.id,
            connection_id: self.id,
            participants: outcome.others,
        }])
    }

    async fn leave(&mut self) -> Result<Vec<ServerMessage>, SignalingError> {
        let Some(participant) = self
            .ctx
            .registry
            .remove_participant(self.id, LeaveReason::Left)
            .await?
        else {
            // Not in a room: nothing to notify.
            return Ok(Vec::new());
        };

        self.record_room(None).await;
        Ok(vec![ServerMessage::Left {
            room_id: participant.room_id,
        }])
    }

    async fn open_session(&mut self) {
        let session = Session::new(&self.identity.subject, self.id, &self.ctx.instance_id);
        match self.ctx.sessions.create(&session).await {
            Ok(()) => self.session_id = Some(session.id),
            Err(e) => warn!(
                target: "sig.relay",
                connection_id = %self.id,
                error = %e,
                "Failed to record session, continuing without one"
            ),
        }
    }

    async fn record_room(&self, room_id: Option<RoomId>) {
        let Some(session_id) = self.session_id else {
            return;
        };
        if let Err(e) = self.ctx.sessions.set_room(session_id, room_id).await {
            warn!(
                target: "sig.relay",
                connection_id = %self.id,
                error = %e,
                "Failed to update session room"
            );
        }
    }

    async fn touch_session(&self) {
        let Some(session_id) = self.session_id else {
            return;
        };
        if let Err(e) = self.ctx.sessions.touch(session_id).await {
            debug!(target: "sig.relay", error = %e, "Failed to refresh session TTL");
        }
    }

    /// Disconnect cleanup. Consumes the connection so it cannot run twice.
    async fn close(self, exit: ExitReason) {
        match self
            .ctx
            .registry
            .remove_participant(self.id, LeaveReason::Disconnected)
            .await
        {
            Ok(Some(participant)) => debug!(
                target: "sig.relay",
                connection_id = %self.id,
                room_id = %participant.room_id,
                "Removed participant on disconnect"
            ),
            Ok(None) => {}
            Err(e) => warn!(
                target: "sig.relay",
                connection_id = %self.id,
                error = %e,
                "Failed to remove participant on disconnect"
            ),
        }

        if let Some(session_id) = self.session_id {
            if let Err(e) = self.ctx.sessions.delete(session_id).await {
                warn!(
                    target: "sig.relay",
                    connection_id = %self.id,
                    error = %e,
                    "Failed to delete session on disconnect"
                );
            }
        }

        let _ = self
            .ctx
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        metrics::decrement_connections_active();
        info!(
            target: "sig.relay",
            connection_id = %self.id,
            reason = exit.as_str(),
            "Connection closed"
        );
    }
}

async fn send_all<S>(sink: &mut S, messages: Vec<ServerMessage>) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    for message in messages {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "sig.relay", error = %e, "Failed to encode server message");
                continue;
            }
        };
        sink.send(Message::Text(text)).await?;
    }
    Ok(())
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
    use crate::cluster::{
        InMemoryCounterBackend, InMemorySessionStore, RateLimiter, RoomDirectory, SessionStore,
    };
    use crate::config::RateLimitConfig;
    use crate::registry::{
        NewRoom, RegistryActor, RegistryConfig, RegistryHandle, Room, RoomKind, RoomSettings,
    };
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        registry: RegistryHandle,
        directory: RoomDirectory,
        sessions: Arc<InMemorySessionStore>,
        ctx: RelayContext,
    }

    fn harness(capacity: usize, relay_limit: u64) -> Harness {
        let (registry, _task) = RegistryActor::spawn(
            RegistryConfig {
                room_capacity: capacity,
                instance_id: "sig-a".to_string(),
            },
            CancellationToken::new(),
            None,
        );
        let directory = RoomDirectory::new();
        let sessions = Arc::new(InMemorySessionStore::new(Duration::from_secs(60)));
        let limits = RateLimitConfig {
            relay: relay_limit,
            ..RateLimitConfig::default()
        };
        let ctx = RelayContext {
            registry: registry.clone(),
            directory: directory.clone(),
            sessions: sessions.clone(),
            rate_limiter: Arc::new(RateLimiter::new(
                Arc::new(InMemoryCounterBackend::new()),
                limits,
            )),
            instance_id: "sig-a".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            heartbeat_timeout: Duration::from_secs(60),
            shutdown: CancellationToken::new(),
            connections: Arc::new(AtomicUsize::new(0)),
        };
        Harness {
            registry,
            directory,
            sessions,
            ctx,
        }
    }

    fn identity(subject: &str) -> ConnectionIdentity {
        ConnectionIdentity {
            subject: subject.to_string(),
            display_name: None,
            scoped_room: None,
        }
    }

    async fn create_room(h: &Harness) -> RoomId {
        h.registry
            .create_room(NewRoom {
                name: "r1".to_string(),
                kind: RoomKind::Voice,
                owner: "alice".to_string(),
                settings: None,
                ..NewRoom::default()
            })
            .await
            .unwrap()
            .id
    }

    fn error_code(replies: &[ServerMessage]) -> String {
        match replies {
            [ServerMessage::Error { code, .. }] => code.clone(),
            other => panic!("expected one error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_replies_with_snapshot_and_notifies_others() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;

        let (mut a, mut a_events) = Connection::new(identity("alice"), h.ctx.clone());
        let (mut b, _b_events) = Connection::new(identity("bob"), h.ctx.clone());

        let replies = a.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        assert!(matches!(&replies[..], [ServerMessage::Joined { participants, .. }] if participants.is_empty()));

        let replies = b.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        match &replies[..] {
            [ServerMessage::Joined { participants, connection_id, .. }] => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].connection_id, a.id());
                assert_eq!(*connection_id, b.id());
            }
            other => panic!("unexpected replies {other:?}"),
        }

        match a_events.try_recv().unwrap() {
            RoomEvent::UserJoined { participant, .. } => assert_eq!(participant.connection_id, b.id()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let h = harness(10, 100);
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        let err = a
            .handle_message(ClientMessage::Join { room_id: RoomId::new() })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_join_remote_room_reports_owner() {
        let h = harness(10, 100);
        let remote = Room {
            id: RoomId::new(),
            name: "remote".to_string(),
            kind: RoomKind::Voice,
            owner: "carol".to_string(),
            owner_instance: "sig-b".to_string(),
            created_at: Utc::now(),
            capacity: 10,
            settings: RoomSettings::defaults_for(RoomKind::Voice),
            topic: None,
            connection_url: None,
        };
        h.directory.upsert(remote.clone()).await;

        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        let err = a
            .handle_message(ClientMessage::Join { room_id: remote.id })
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::RoomNotLocal { ref owner } if owner == "sig-b"));
    }

    #[tokio::test]
    async fn test_join_full_room() {
        let h = harness(1, 100);
        let room_id = create_room(&h).await;
        let (mut a, _a_events) = Connection::new(identity("alice"), h.ctx.clone());
        let (mut b, _b_events) = Connection::new(identity("bob"), h.ctx.clone());

        a.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        let err = b.handle_message(ClientMessage::Join { room_id }).await.unwrap_err();
        assert_eq!(err.error_code(), "ROOM_FULL");
    }

    #[tokio::test]
    async fn test_scoped_token_limits_join() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let other = create_room(&h).await;

        let scoped = ConnectionIdentity {
            scoped_room: Some(room_id),
            ..identity("bob")
        };
        let (mut b, _events) = Connection::new(scoped, h.ctx.clone());

        let err = b.handle_message(ClientMessage::Join { room_id: other }).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
        assert!(b.handle_message(ClientMessage::Join { room_id }).await.is_ok());
    }

    #[tokio::test]
    async fn test_offer_reaches_only_target() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, mut a_events) = Connection::new(identity("alice"), h.ctx.clone());
        let (mut b, mut b_events) = Connection::new(identity("bob"), h.ctx.clone());
        let (mut c, mut c_events) = Connection::new(identity("carol"), h.ctx.clone());
        for conn in [&mut a, &mut b, &mut c] {
            conn.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        }
        while a_events.try_recv().is_ok() {}
        while b_events.try_recv().is_ok() {}
        while c_events.try_recv().is_ok() {}

        let sdp = json!("v=0");
        let replies = a
            .handle_message(ClientMessage::Offer {
                room_id,
                target: b.id(),
                sdp: sdp.clone(),
            })
            .await
            .unwrap();
        assert!(replies.is_empty());

        match ServerMessage::from(b_events.try_recv().unwrap()) {
            ServerMessage::Offer { from, sdp: got, .. } => {
                assert_eq!(from, a.id());
                assert_eq!(got, sdp);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(c_events.try_recv().is_err());
        assert!(a_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signal_to_missing_target() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        a.handle_message(ClientMessage::Join { room_id }).await.unwrap();

        let err = a
            .handle_message(ClientMessage::Answer {
                room_id,
                target: ConnectionId::new(),
                sdp: json!("v=0"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TARGET_NOT_FOUND");

        let ok = a
            .handle_message(ClientMessage::CandidateEnd {
                room_id,
                target: ConnectionId::new(),
            })
            .await
            .unwrap();
        assert!(ok.is_empty());
    }

    #[tokio::test]
    async fn test_signal_for_room_not_joined() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());

        let err = a
            .handle_message(ClientMessage::Candidate {
                room_id,
                target: ConnectionId::new(),
                candidate: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_IN_ROOM");
    }

    #[tokio::test]
    async fn test_malformed_text_yields_invalid_message() {
        let h = harness(10, 100);
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        assert_eq!(error_code(&a.handle_text("{not json").await), "INVALID_MESSAGE");
        assert_eq!(error_code(&a.handle_text(r#"{"type":"fly"}"#).await), "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let h = harness(10, 100);
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        assert_eq!(a.handle_text(r#"{"type":"ping"}"#).await, vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_relay_rate_limit() {
        let h = harness(10, 2);
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());

        assert_eq!(a.handle_text(r#"{"type":"ping"}"#).await, vec![ServerMessage::Pong]);
        assert_eq!(a.handle_text(r#"{"type":"ping"}"#).await, vec![ServerMessage::Pong]);
        // A third within the same window is refused unless the window rolled over.
        let third = a.handle_text(r#"{"type":"ping"}"#).await;
        if third != vec![ServerMessage::Pong] {
            assert_eq!(error_code(&third), "RATE_LIMITED");
        }
    }

    #[tokio::test]
    async fn test_mute_requires_room_and_updates_state() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());

        let err = a.handle_message(ClientMessage::Mute { muted: true }).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_IN_ROOM");

        a.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        let replies = a.handle_message(ClientMessage::Mute { muted: true }).await.unwrap();
        assert!(matches!(
            &replies[..],
            [ServerMessage::ParticipantUpdated { participant, .. }] if participant.muted
        ));
    }

    #[tokio::test]
    async fn test_deafen_and_speaking_update_state() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, _events) = Connection::new(identity("alice"), h.ctx.clone());
        a.handle_message(ClientMessage::Join { room_id }).await.unwrap();

        let replies = a.handle_message(ClientMessage::Deafen { deafened: true }).await.unwrap();
        assert!(matches!(
            &replies[..],
            [ServerMessage::ParticipantUpdated { participant, .. }] if participant.deafened
        ));

        let replies = a.handle_message(ClientMessage::Speaking { speaking: true }).await.unwrap();
        match &replies[..] {
            [ServerMessage::ParticipantUpdated { participant, .. }] => {
                assert!(participant.speaking);
                assert!(participant.speaking_since.is_some());
                assert!(participant.deafened);
            }
            other => panic!("unexpected replies {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_and_disconnect_cleanup() {
        let h = harness(10, 100);
        let room_id = create_room(&h).await;
        let (mut a, mut a_events) = Connection::new(identity("alice"), h.ctx.clone());
        let (mut b, _b_events) = Connection::new(identity("bob"), h.ctx.clone());
        a.open_session().await;
        a.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        b.handle_message(ClientMessage::Join { room_id }).await.unwrap();
        let _ = a_events.try_recv();

        let session = h.sessions.get_by_connection(a.id()).await.unwrap().unwrap();
        assert_eq!(session.room_id, Some(room_id));

        // Explicit leave acknowledges and clears the session's room.
        let replies = a.handle_message(ClientMessage::Leave).await.unwrap();
        assert_eq!(replies, vec![ServerMessage::Left { room_id }]);
        assert_eq!(h.sessions.get(session.id).await.unwrap().unwrap().room_id, None);

        // Leaving twice is a silent no-op.
        assert!(a.handle_message(ClientMessage::Leave).await.unwrap().is_empty());

        // Disconnect removes the participant and the session.
        let b_id = b.id();
        b.close(ExitReason::ClientClosed).await;
        assert!(h.registry.room_info_for_connection(b_id).await.unwrap().is_none());

        let a_id = a.id();
        a.close(ExitReason::HeartbeatTimeout).await;
        assert!(h.sessions.get_by_connection(a_id).await.unwrap().is_none());
    }
}
