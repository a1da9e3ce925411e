//! Session store: discovery index from session, connection and subject to
//! the instance and room a client is currently attached to.
//!
//! # Key Patterns
//!
//! - `session:{id}` - Session record (JSON), TTL = session TTL
//! - `session:conn:{connection_id}` - Session id for a connection, same TTL
//! - `session:subject:{sub}` - SET of session ids for a subject
//!
//! The store is not authoritative for join/leave races; the room registry
//! is. It lets control-plane calls on any instance find "where is this
//! connection".

use super::lua_scripts;
use crate::errors::SignalingError;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{ConnectionId, RoomId, SessionId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub subject: String,
    pub connection_id: ConnectionId,
    /// Instance terminating the connection.
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(subject: &str, connection_id: ConnectionId, instance_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            subject: subject.to_string(),
            connection_id,
            instance_id: instance_id.to_string(),
            room_id: None,
            created_at: now,
            last_seen: now,
        }
    }
}

/// Session persistence with a sliding TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), SignalingError>;

    async fn get(&self, id: SessionId) -> Result<Option<Session>, SignalingError>;

    async fn get_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Session>, SignalingError>;

    async fn list_for_subject(&self, subject: &str) -> Result<Vec<Session>, SignalingError>;

    /// Record the session's current room and refresh its TTL.
    /// Returns `false` if the session no longer exists.
    async fn set_room(&self, id: SessionId, room_id: Option<RoomId>) -> Result<bool, SignalingError>;

    /// Slide the TTL forward. Returns `false` if the session no longer exists.
    async fn touch(&self, id: SessionId) -> Result<bool, SignalingError>;

    async fn delete(&self, id: SessionId) -> Result<bool, SignalingError>;

    /// Drop expired records and prune index entries pointing at them.
    /// Returns the number of entries removed.
    async fn cleanup_expired(&self) -> Result<usize, SignalingError>;
}

fn session_key(id: SessionId) -> String {
    format!("session:{id}")
}

fn connection_key(connection_id: ConnectionId) -> String {
    format!("session:conn:{connection_id}")
}

fn subject_key(subject: &str) -> String {
    format!("session:subject:{subject}")
}

const SUBJECT_KEY_PATTERN: &str = "session:subject:*";

// ============================================================================
// Redis
// ============================================================================

/// Redis-backed session store.
///
/// Cheaply cloneable; the `MultiplexedConnection` is cloned per operation.
#[derive(Clone)]
pub struct RedisSessionStore {
    connection: MultiplexedConnection,
    ttl: Duration,
    touch_script: Script,
}

impl RedisSessionStore {
    #[must_use]
    pub fn new(connection: MultiplexedConnection, ttl: Duration) -> Self {
        Self {
            connection,
            ttl,
            touch_script: Script::new(lua_scripts::TOUCH_SESSION),
        }
    }

    async fn write(&self, session: &Session) -> Result<(), SignalingError> {
        let mut conn = self.connection.clone();
        let record = serde_json::to_string(session)
            .map_err(|e| SignalingError::Internal(format!("session encode failed: {e}")))?;
        let ttl = self.ttl.as_secs();

        let start = std::time::Instant::now();
        let result: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .set_ex(session_key(session.id), record, ttl)
            .ignore()
            .set_ex(connection_key(session.connection_id), session.id.to_string(), ttl)
            .ignore()
            .sadd(subject_key(&session.subject), session.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await;
        metrics::record_store_latency("session_write", start.elapsed());

        result.map_err(|e| {
            warn!(
                target: "sig.cluster",
                error = %e,
                session_id = %session.id,
                "Failed to write session"
            );
            SignalingError::from(e)
        })
    }

    async fn read(&self, key: String) -> Result<Option<Session>, SignalingError> {
        let mut conn = self.connection.clone();
        let start = std::time::Instant::now();
        let raw: Option<String> = conn.get(&key).await?;
        metrics::record_store_latency("session_read", start.elapsed());

        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(target: "sig.cluster", error = %e, "Discarding undecodable session record");
                None
            }
        }))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip_all, fields(session_id = %session.id))]
    async fn create(&self, session: &Session) -> Result<(), SignalingError> {
        self.write(session).await?;
        debug!(target: "sig.cluster", session_id = %session.id, "Session created");
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, SignalingError> {
        self.read(session_key(id)).await
    }

    async fn get_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Session>, SignalingError> {
        let mut conn = self.connection.clone();
        let id: Option<String> = conn.get(connection_key(connection_id)).await?;
        match id {
            Some(id) => self.read(format!("session:{id}")).await,
            None => Ok(None),
        }
    }

    async fn list_for_subject(&self, subject: &str) -> Result<Vec<Session>, SignalingError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(subject_key(subject)).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.read(format!("session:{id}")).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn set_room(&self, id: SessionId, room_id: Option<RoomId>) -> Result<bool, SignalingError> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(false);
        };
        session.room_id = room_id;
        session.last_seen = Utc::now();
        self.write(&session).await?;
        Ok(true)
    }

    async fn touch(&self, id: SessionId) -> Result<bool, SignalingError> {
        let Some(session) = self.get(id).await? else {
            return Ok(false);
        };
        let mut conn = self.connection.clone();

        let start = std::time::Instant::now();
        let refreshed: i64 = self
            .touch_script
            .key(session_key(id))
            .key(connection_key(session.connection_id))
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        metrics::record_store_latency("session_touch", start.elapsed());

        Ok(refreshed == 1)
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn delete(&self, id: SessionId) -> Result<bool, SignalingError> {
        let Some(session) = self.get(id).await? else {
            return Ok(false);
        };
        let mut conn = self.connection.clone();

        let () = redis::pipe()
            .atomic()
            .del(session_key(id))
            .ignore()
            .del(connection_key(session.connection_id))
            .ignore()
            .srem(subject_key(&session.subject), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(target: "sig.cluster", session_id = %id, "Session deleted");
        Ok(true)
    }

    /// Redis expires session records itself; this prunes subject index
    /// members whose record is gone.
    async fn cleanup_expired(&self) -> Result<usize, SignalingError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(SUBJECT_KEY_PATTERN)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let members: Vec<String> = conn.smembers(&key).await?;
                for member in members {
                    let exists: bool = conn.exists(format!("session:{member}")).await?;
                    if !exists {
                        let _: i64 = conn.srem(&key, &member).await?;
                        removed += 1;
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, (Session, Instant)>,
    by_connection: HashMap<ConnectionId, SessionId>,
    by_subject: HashMap<String, HashSet<SessionId>>,
}

impl MemoryState {
    fn live(&self, id: SessionId, now: Instant) -> Option<&Session> {
        self.sessions
            .get(&id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(session, _)| session)
    }

    fn remove(&mut self, id: SessionId) -> Option<Session> {
        let (session, _) = self.sessions.remove(&id)?;
        self.by_connection.remove(&session.connection_id);
        if let Some(ids) = self.by_subject.get_mut(&session.subject) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_subject.remove(&session.subject);
            }
        }
        Some(session)
    }
}

/// Single-process session store. Expiry follows `tokio::time`, so paused-clock
/// tests can drive it.
pub struct InMemorySessionStore {
    state: Mutex<MemoryState>,
    ttl: Duration,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ttl,
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), SignalingError> {
        let mut state = self.state.lock().await;
        let expires_at = Instant::now() + self.ttl;
        state.by_connection.insert(session.connection_id, session.id);
        state
            .by_subject
            .entry(session.subject.clone())
            .or_default()
            .insert(session.id);
        state.sessions.insert(session.id, (session.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, SignalingError> {
        let state = self.state.lock().await;
        Ok(state.live(id, Instant::now()).cloned())
    }

    async fn get_by_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Session>, SignalingError> {
        let state = self.state.lock().await;
        Ok(state
            .by_connection
            .get(&connection_id)
            .and_then(|id| state.live(*id, Instant::now()))
            .cloned())
    }

    async fn list_for_subject(&self, subject: &str) -> Result<Vec<Session>, SignalingError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut sessions: Vec<Session> = state
            .by_subject
            .get(subject)
            .into_iter()
            .flatten()
            .filter_map(|id| state.live(*id, now).cloned())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn set_room(&self, id: SessionId, room_id: Option<RoomId>) -> Result<bool, SignalingError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.sessions.get_mut(&id) {
            Some((session, expires_at)) if *expires_at > now => {
                session.room_id = room_id;
                session.last_seen = Utc::now();
                *expires_at = now + self.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, id: SessionId) -> Result<bool, SignalingError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.sessions.get_mut(&id) {
            Some((session, expires_at)) if *expires_at > now => {
                session.last_seen = Utc::now();
                *expires_at = now + self.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: SessionId) -> Result<bool, SignalingError> {
        let mut state = self.state.lock().await;
        Ok(state.remove(id).is_some())
    }

    async fn cleanup_expired(&self) -> Result<usize, SignalingError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            state.remove(*id);
        }
        Ok(expired.len())
    }
}
