//! Session index cleanup.
//!
//! Session records expire on their own; this prunes subject index entries
//! that still point at expired sessions.

use crate::cluster::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[instrument(skip_all, name = "sig.tasks.session_cleanup")]
pub async fn start_session_cleanup(
    sessions: Arc<dyn SessionStore>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(target: "sig.tasks", interval_secs = interval.as_secs(), "Session cleanup started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sessions.cleanup_expired().await {
                    Ok(0) => debug!(target: "sig.tasks", "No stale session entries"),
                    Ok(pruned) => info!(target: "sig.tasks", pruned, "Pruned stale session entries"),
                    Err(e) => warn!(target: "sig.tasks", error = %e, "Session cleanup failed, retrying next interval"),
                }
            }
            () = cancel_token.cancelled() => {
                info!(target: "sig.tasks", "Session cleanup received shutdown signal, exiting");
                break;
            }
        }
    }
}
