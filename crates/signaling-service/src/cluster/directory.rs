//! Cache of rooms owned by other instances, fed by the event bus.
//!
//! Local rooms never appear here; the registry is their source of truth.
//! Every event from an instance refreshes its last-seen time. Rooms whose
//! owner has been silent longer than the staleness bound are evicted by
//! [`RoomDirectory::evict_stale`].

use crate::registry::{Room, RoomSummary};
use common::types::RoomId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, RoomSummary>,
    last_seen: HashMap<String, Instant>,
}

impl DirectoryState {
    fn remove_owned_by(&mut self, instance_id: &str) -> Vec<RoomId> {
        let gone: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, summary)| summary.room.owner_instance == instance_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.rooms.remove(id);
        }
        gone
    }
}

#[derive(Clone, Default)]
pub struct RoomDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `instance_id` is alive.
    pub async fn touch_instance(&self, instance_id: &str) {
        self.state
            .write()
            .await
            .last_seen
            .insert(instance_id.to_string(), Instant::now());
    }

    /// Insert or replace a room record, keeping the last known count.
    pub async fn upsert(&self, room: Room) {
        let mut state = self.state.write().await;
        state
            .last_seen
            .insert(room.owner_instance.clone(), Instant::now());
        let participant_count = state
            .rooms
            .get(&room.id)
            .map_or(0, |r| r.participant_count);
        state.rooms.insert(
            room.id,
            RoomSummary {
                room,
                participant_count,
            },
        );
    }

    /// Replace everything known about `instance_id` with its announced rooms.
    /// Rooms it no longer lists are dropped.
    pub async fn replace_instance_rooms(&self, instance_id: &str, rooms: Vec<RoomSummary>) {
        let mut state = self.state.write().await;
        state
            .last_seen
            .insert(instance_id.to_string(), Instant::now());

        let announced: HashSet<RoomId> = rooms.iter().map(|r| r.room.id).collect();
        state.rooms.retain(|id, summary| {
            summary.room.owner_instance != instance_id || announced.contains(id)
        });
        for summary in rooms {
            if summary.room.owner_instance == instance_id {
                state.rooms.insert(summary.room.id, summary);
            }
        }
    }

    /// Forget `instance_id` and every room it owns.
    pub async fn remove_instance(&self, instance_id: &str) -> Vec<RoomId> {
        let mut state = self.state.write().await;
        state.last_seen.remove(instance_id);
        state.remove_owned_by(instance_id)
    }

    /// Drop rooms whose owner has not been heard from within `stale_after`.
    pub async fn evict_stale(&self, stale_after: Duration) -> Vec<RoomId> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        let stale: Vec<String> = state
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > stale_after)
            .map(|(instance, _)| instance.clone())
            .collect();

        let mut evicted = Vec::new();
        for instance in stale {
            state.last_seen.remove(&instance);
            evicted.extend(state.remove_owned_by(&instance));
        }
        evicted
    }

    /// Returns `false` for a room not in the directory.
    pub async fn set_count(&self, room_id: RoomId, count: usize) -> bool {
        let mut state = self.state.write().await;
        match state.rooms.get_mut(&room_id) {
            Some(summary) => {
                summary.participant_count = count;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, room_id: RoomId) -> Option<RoomSummary> {
        self.state.write().await.rooms.remove(&room_id)
    }

    pub async fn get(&self, room_id: RoomId) -> Option<RoomSummary> {
        self.state.read().await.rooms.get(&room_id).cloned()
    }

    pub async fn list(&self) -> Vec<RoomSummary> {
        self.state.read().await.rooms.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.rooms.is_empty()
    }
}
