//! Relay service: authenticated WebSocket connections that join rooms and
//! exchange directed offer/answer/candidate messages.

pub mod connection;
pub mod handler;
pub mod protocol;

pub use connection::{Connection, ConnectionIdentity, OUTBOX_CAPACITY};
pub use handler::ws_handler;
pub use protocol::{ClientMessage, ServerMessage};

use crate::cluster::{RateLimiter, RoomDirectory, SessionStore};
use crate::registry::RegistryHandle;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a connection needs, cloned into each connection task.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: RegistryHandle,
    pub directory: RoomDirectory,
    pub sessions: Arc<dyn SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Cancelled at shutdown; every connection closes and cleans up.
    pub shutdown: CancellationToken,
    /// Live connections on this instance.
    pub connections: Arc<AtomicUsize>,
}
