//! Room replication between instances.
//!
//! Each room has exactly one owner: the instance that created it. The
//! publisher turns the local registry's change feed into bus events; the
//! subscriber applies other instances' events to the [`RoomDirectory`] and
//! executes `DeleteRequested` for rooms this instance owns.
//!
//! The announcer publishes the full list of owned rooms on a fixed interval
//! and an `InstanceDeparted` on shutdown. Peers that miss several
//! announcements in a row are evicted from the directory by the subscriber's
//! sweep, which also covers instances that crashed.

use super::directory::RoomDirectory;
use super::event_bus::{ClusterEvent, ClusterEventKind, EventBus, EventStream};
use crate::observability::metrics;
use crate::registry::{CloseReason, RegistryHandle, RoomChange};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer between the registry and the publisher.
pub const CHANGE_FEED_BUFFER: usize = 1024;

pub const DIRECTORY_SWEEPS_PER_BOUND: u32 = 3;

impl From<RoomChange> for ClusterEventKind {
    fn from(change: RoomChange) -> Self {
        match change {
            RoomChange::Created(room) => ClusterEventKind::RoomCreated { room },
            RoomChange::Updated(room) => ClusterEventKind::RoomUpdated { room },
            RoomChange::Deleted { room_id, reason } => {
                ClusterEventKind::RoomDeleted { room_id, reason }
            }
            RoomChange::CountChanged { room_id, count } => {
                ClusterEventKind::ParticipantCountChanged { room_id, count }
            }
        }
    }
}

/// Publish local room changes until cancelled or the feed closes.
pub async fn run_publisher(
    mut changes: mpsc::Receiver<RoomChange>,
    bus: Arc<dyn EventBus>,
    instance_id: String,
    cancel_token: CancellationToken,
) {
    info!(target: "sig.cluster", "Cluster publisher started");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "sig.cluster", "Cluster publisher received shutdown signal, exiting");
                break;
            }

            change = changes.recv() => {
                let Some(change) = change else {
                    info!(target: "sig.cluster", "Room change feed closed, publisher exiting");
                    break;
                };

                let event = ClusterEvent {
                    origin: instance_id.clone(),
                    event: change.into(),
                };
                publish(bus.as_ref(), event).await;
            }
        }
    }
}

/// Announce owned rooms every `interval` until cancelled, then announce
/// departure.
pub async fn run_announcer(
    registry: RegistryHandle,
    bus: Arc<dyn EventBus>,
    instance_id: String,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    // A fresh instance owns nothing, so the first announcement waits a period.
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "sig.cluster",
        interval_secs = interval.as_secs(),
        "Cluster announcer started"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            _ = ticker.tick() => {
                let rooms = match registry.list_rooms().await {
                    Ok(rooms) => rooms,
                    Err(e) => {
                        warn!(target: "sig.cluster", error = %e, "Failed to list rooms for announcement");
                        continue;
                    }
                };
                publish(
                    bus.as_ref(),
                    ClusterEvent {
                        origin: instance_id.clone(),
                        event: ClusterEventKind::InstanceAnnounce { rooms },
                    },
                )
                .await;
            }
        }
    }

    publish(
        bus.as_ref(),
        ClusterEvent {
            origin: instance_id,
            event: ClusterEventKind::InstanceDeparted,
        },
    )
    .await;
    info!(target: "sig.cluster", "Cluster announcer received shutdown signal, departure announced");
}

async fn publish(bus: &dyn EventBus, event: ClusterEvent) {
    let name = event.event.as_str();
    match bus.publish(&event).await {
        Ok(()) => metrics::record_event_bus_event(name, "published"),
        Err(e) => warn!(
            target: "sig.cluster",
            error = %e,
            event = name,
            "Failed to publish cluster event"
        ),
    }
}

/// Apply events from other instances until cancelled or the stream ends.
///
/// Every `stale_after / DIRECTORY_SWEEPS_PER_BOUND` the directory drops rooms
/// of instances silent for longer than `stale_after`.
pub async fn run_subscriber(
    mut events: EventStream,
    directory: RoomDirectory,
    registry: RegistryHandle,
    instance_id: String,
    stale_after: Duration,
    cancel_token: CancellationToken,
) {
    let mut sweep = tokio::time::interval(stale_after / DIRECTORY_SWEEPS_PER_BOUND);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(target: "sig.cluster", "Cluster subscriber started");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "sig.cluster", "Cluster subscriber received shutdown signal, exiting");
                break;
            }

            event = events.next() => {
                let Some(event) = event else {
                    warn!(target: "sig.cluster", "Event bus stream ended, subscriber exiting");
                    break;
                };
                apply_event(event, &directory, &registry, &instance_id).await;
            }

            _ = sweep.tick() => {
                let evicted = directory.evict_stale(stale_after).await;
                if !evicted.is_empty() {
                    warn!(
                        target: "sig.cluster",
                        count = evicted.len(),
                        "Evicted rooms of instances that stopped announcing"
                    );
                }
            }
        }
    }
}

/// Apply one bus event. Own echoes are ignored.
pub async fn apply_event(
    event: ClusterEvent,
    directory: &RoomDirectory,
    registry: &RegistryHandle,
    instance_id: &str,
) {
    let name = event.event.as_str();
    if event.origin == instance_id {
        metrics::record_event_bus_event(name, "ignored");
        return;
    }
    metrics::record_event_bus_event(name, "received");
    directory.touch_instance(&event.origin).await;

    match event.event {
        ClusterEventKind::RoomCreated { room } | ClusterEventKind::RoomUpdated { room } => {
            if room.owner_instance != instance_id {
                directory.upsert(room).await;
            }
        }
        ClusterEventKind::RoomDeleted { room_id, .. } => {
            directory.remove(room_id).await;
        }
        ClusterEventKind::ParticipantCountChanged { room_id, count } => {
            directory.set_count(room_id, count).await;
        }
        ClusterEventKind::DeleteRequested {
            room_id,
            requested_by,
        } => match registry.delete_room(room_id, CloseReason::Deleted).await {
            Ok(true) => info!(
                target: "sig.cluster",
                room_id = %room_id,
                origin = %event.origin,
                requested_by = %requested_by,
                "Deleted owned room on remote request"
            ),
            Ok(false) => debug!(
                target: "sig.cluster",
                room_id = %room_id,
                "Delete request for a room not owned here"
            ),
            Err(e) => warn!(
                target: "sig.cluster",
                room_id = %room_id,
                error = %e,
                "Failed to execute remote delete request"
            ),
        },
        ClusterEventKind::InstanceAnnounce { rooms } => {
            directory.replace_instance_rooms(&event.origin, rooms).await;
        }
        ClusterEventKind::InstanceDeparted => {
            let dropped = directory.remove_instance(&event.origin).await;
            info!(
                target: "sig.cluster",
                origin = %event.origin,
                rooms = dropped.len(),
                "Instance departed, dropped its rooms"
            );
        }
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
    use crate::cluster::event_bus::InMemoryEventBus;
    use crate::registry::{NewRoom, RegistryActor, RegistryConfig, RoomKind};
    use common::types::RoomId;
    use std::time::Duration;

    fn spawn_registry(
        instance_id: &str,
        changes: Option<mpsc::Sender<RoomChange>>,
    ) -> RegistryHandle {
        RegistryActor::spawn(
            RegistryConfig {
                room_capacity: 10,
                instance_id: instance_id.to_string(),
            },
            CancellationToken::new(),
            changes,
        )
        .0
    }

    fn new_room() -> NewRoom {
        NewRoom {
            name: "standup".to_string(),
            kind: RoomKind::Voice,
            owner: "agent-1".to_string(),
            settings: None,
            ..NewRoom::default()
        }
    }

    #[tokio::test]
    async fn test_own_echo_ignored() {
        let directory = RoomDirectory::new();
        let registry = spawn_registry("sig-a", None);
        let room = registry.create_room(new_room()).await.unwrap();

        let echo = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::RoomCreated { room },
        };
        apply_event(echo, &directory, &registry, "sig-a").await;
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_remote_delete_request_executed_by_owner() {
        let directory = RoomDirectory::new();
        let registry = spawn_registry("sig-a", None);
        let room = registry.create_room(new_room()).await.unwrap();

        let request = ClusterEvent {
            origin: "sig-b".to_string(),
            event: ClusterEventKind::DeleteRequested {
                room_id: room.id,
                requested_by: "agent-1".to_string(),
            },
        };
        apply_event(request, &directory, &registry, "sig-a").await;
        assert!(registry.get_room(room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_instances_share_room_directory() {
        let bus = InMemoryEventBus::new();
        let cancel = CancellationToken::new();

        // Instance A publishes; instance B subscribes.
        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_FEED_BUFFER);
        let registry_a = spawn_registry("sig-a", Some(changes_tx));
        let registry_b = spawn_registry("sig-b", None);
        let directory_b = RoomDirectory::new();

        let stream = bus.subscribe().await.unwrap();
        tokio::spawn(run_subscriber(
            stream,
            directory_b.clone(),
            registry_b,
            "sig-b".to_string(),
            Duration::from_secs(45),
            cancel.clone(),
        ));
        tokio::spawn(run_publisher(
            changes_rx,
            Arc::new(bus.clone()),
            "sig-a".to_string(),
            cancel.clone(),
        ));

        let room = registry_a.create_room(new_room()).await.unwrap();

        let mut seen = None;
        for _ in 0..50 {
            seen = directory_b.get(room.id).await;
            if seen.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = seen.unwrap();
        assert_eq!(seen.room.owner_instance, "sig-a");

        registry_a
            .delete_room(room.id, CloseReason::Deleted)
            .await
            .unwrap();
        for _ in 0..50 {
            if directory_b.get(room.id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(directory_b.get(room.id).await.is_none());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_count_change_for_unknown_room_is_ignored() {
        let directory = RoomDirectory::new();
        let registry = spawn_registry("sig-a", None);
        let event = ClusterEvent {
            origin: "sig-b".to_string(),
            event: ClusterEventKind::ParticipantCountChanged {
                room_id: RoomId::new(),
                count: 2,
            },
        };
        apply_event(event, &directory, &registry, "sig-a").await;
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_departure_drops_origin_rooms() {
        let directory = RoomDirectory::new();
        let registry_b = spawn_registry("sig-b", None);
        let remote = spawn_registry("sig-a", None)
            .create_room(new_room())
            .await
            .unwrap();

        let created = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::RoomCreated {
                room: remote.clone(),
            },
        };
        apply_event(created, &directory, &registry_b, "sig-b").await;
        assert!(directory.get(remote.id).await.is_some());

        let departed = ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::InstanceDeparted,
        };
        apply_event(departed, &directory, &registry_b, "sig-b").await;
        assert!(directory.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcer_lists_rooms_then_departs() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe().await.unwrap();
        let registry = spawn_registry("sig-a", None);
        let room = registry.create_room(new_room()).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_announcer(
            registry,
            Arc::new(bus.clone()),
            "sig-a".to_string(),
            Duration::from_secs(60),
            cancel.clone(),
        ));

        let announce = stream.next().await.unwrap();
        assert_eq!(announce.origin, "sig-a");
        match announce.event {
            ClusterEventKind::InstanceAnnounce { rooms } => {
                assert_eq!(rooms.len(), 1);
                assert_eq!(rooms[0].room.id, room.id);
            }
            other => panic!("unexpected event {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().event,
            ClusterEventKind::InstanceDeparted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_evicts_silent_instance() {
        let bus = InMemoryEventBus::new();
        let directory = RoomDirectory::new();
        let registry_b = spawn_registry("sig-b", None);
        let remote = spawn_registry("sig-a", None)
            .create_room(new_room())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        tokio::spawn(run_subscriber(
            bus.subscribe().await.unwrap(),
            directory.clone(),
            registry_b,
            "sig-b".to_string(),
            Duration::from_secs(45),
            cancel.clone(),
        ));

        bus.publish(&ClusterEvent {
            origin: "sig-a".to_string(),
            event: ClusterEventKind::RoomCreated {
                room: remote.clone(),
            },
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(directory.get(remote.id).await.is_some());

        // No announcements from sig-a: gone after the bound plus one sweep.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(directory.get(remote.id).await.is_none());

        cancel.cancel();
    }
}
