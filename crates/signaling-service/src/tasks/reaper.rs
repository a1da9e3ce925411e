//! Idle room reaper.
//!
//! Deletes rooms that have had no participants for longer than the idle
//! timeout. Participants never remain in a reaped room, so only the
//! `RoomDeleted` change reaches other instances. The registry counts reaped
//! rooms itself.

use crate::registry::RegistryHandle;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

#[instrument(skip_all, name = "sig.tasks.reaper")]
pub async fn start_room_reaper(
    registry: RegistryHandle,
    interval: Duration,
    idle_timeout: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        target: "sig.tasks",
        interval_secs = interval.as_secs(),
        idle_timeout_secs = idle_timeout.as_secs(),
        "Room reaper started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match registry.reap_idle_rooms(idle_timeout).await {
                    Ok(reaped) if !reaped.is_empty() => {
                        info!(target: "sig.tasks", count = reaped.len(), "Reaped idle rooms");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(target: "sig.tasks", error = %e, "Failed to reap idle rooms");
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "sig.tasks", "Room reaper received shutdown signal, exiting");
                break;
            }
        }
    }
}
