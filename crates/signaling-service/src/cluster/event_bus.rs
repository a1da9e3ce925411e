//! Cross-instance event bus.
//!
//! Room lifecycle events are published on the Redis channel
//! `signaling:events` as JSON. Every event is tagged with the publishing
//! instance id so subscribers can drop their own echoes.

use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::registry::{CloseReason, Room, RoomSummary};
use async_trait::async_trait;
use common::types::RoomId;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const EVENT_CHANNEL: &str = "signaling:events";

const IN_MEMORY_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEventKind {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomDeleted {
        room_id: RoomId,
        reason: CloseReason,
    },
    ParticipantCountChanged {
        room_id: RoomId,
        count: usize,
    },
    /// Ask the owning instance to delete a room. The sender has already
    /// checked the caller's ownership against its directory copy.
    DeleteRequested {
        room_id: RoomId,
        requested_by: String,
    },
    /// Periodic liveness beacon carrying every room the instance owns.
    InstanceAnnounce {
        rooms: Vec<RoomSummary>,
    },
    /// The instance is shutting down; its rooms go with it.
    InstanceDeparted,
}

impl ClusterEventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterEventKind::RoomCreated { .. } => "room_created",
            ClusterEventKind::RoomUpdated { .. } => "room_updated",
            ClusterEventKind::RoomDeleted { .. } => "room_deleted",
            ClusterEventKind::ParticipantCountChanged { .. } => "participant_count_changed",
            ClusterEventKind::DeleteRequested { .. } => "delete_requested",
            ClusterEventKind::InstanceAnnounce { .. } => "instance_announce",
            ClusterEventKind::InstanceDeparted => "instance_departed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Publishing instance id.
    pub origin: String,
    #[serde(flatten)]
    pub event: ClusterEventKind,
}

pub type EventStream = BoxStream<'static, ClusterEvent>;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &ClusterEvent) -> Result<(), SignalingError>;

    /// Start receiving every event published after this call, including
    /// this instance's own.
    async fn subscribe(&self) -> Result<EventStream, SignalingError>;
}

/// Redis pub/sub bus.
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisEventBus {
    #[must_use]
    pub fn new(client: Client, connection: MultiplexedConnection) -> Self {
        Self { client, connection }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &ClusterEvent) -> Result<(), SignalingError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| SignalingError::Internal(format!("event encode failed: {e}")))?;
        let mut conn = self.connection.clone();

        let start = std::time::Instant::now();
        let receivers: i64 = conn.publish(EVENT_CHANNEL, payload).await?;
        metrics::record_store_latency("event_publish", start.elapsed());

        debug!(
            target: "sig.cluster",
            event = event.event.as_str(),
            receivers,
            "Published cluster event"
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, SignalingError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(EVENT_CHANNEL).await?;

        let events = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(target: "sig.cluster", error = %e, "Unreadable event bus payload");
                    return None;
                }
            };
            match serde_json::from_str::<ClusterEvent>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(target: "sig.cluster", error = %e, "Undecodable cluster event dropped");
                    None
                }
            }
        });

        Ok(events.boxed())
    }
}

/// Process-local bus. Clones share one channel, so tests can wire several
/// service instances to the same bus.
#[derive(Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<ClusterEvent>,
}

impl InMemoryEventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(IN_MEMORY_BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &ClusterEvent) -> Result<(), SignalingError> {
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, SignalingError> {
        let receiver = self.sender.subscribe();

        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "sig.cluster", skipped, "Event bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_flat_and_tagged() {
        let room_id = RoomId::new();
        let event = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::ParticipantCountChanged { room_id, count: 3 },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["origin"], "sig-a");
        assert_eq!(json["type"], "participant_count_changed");
        assert_eq!(json["count"], 3);

        let decoded: ClusterEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_departure_wire_format() {
        let event = ClusterEvent {
            origin: "sig-b".to_string(),
            event: ClusterEventKind::InstanceDeparted,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "instance_departed");

        let decoded: ClusterEvent = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn test_in_memory_bus_fans_out_to_all_subscribers() {
        let bus = InMemoryEventBus::new();
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.clone().subscribe().await.unwrap();

        let event = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::DeleteRequested {
                room_id: RoomId::new(),
                requested_by: "agent-1".to_string(),
            },
        };
        bus.publish(&event).await.unwrap();

        assert_eq!(first.next().await.unwrap(), event);
        assert_eq!(second.next().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryEventBus::new();
        let event = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::RoomDeleted {
                room_id: RoomId::new(),
                reason: CloseReason::Idle,
            },
        };
        assert!(bus.publish(&event).await.is_ok());
    }
}
