//! Distributed consistency layer: session store, rate limiter, event bus.
//!
//! With `REDIS_URL` set every component is Redis-backed and rooms replicate
//! between instances. Without it, or when Redis is unreachable at startup,
//! the in-memory implementations run and the instance is an independent
//! island.

pub mod directory;
pub mod event_bus;
pub mod lua_scripts;
pub mod rate_limiter;
pub mod session_store;
pub mod sync;

pub use directory::RoomDirectory;
pub use event_bus::{
    ClusterEvent, ClusterEventKind, EventBus, EventStream, InMemoryEventBus, RedisEventBus,
};
pub use rate_limiter::{
    CounterBackend, InMemoryCounterBackend, RateClass, RateDecision, RateLimiter,
    RedisCounterBackend,
};
pub use session_store::{InMemorySessionStore, RedisSessionStore, Session, SessionStore};

use crate::config::Config;
use crate::errors::SignalingError;
use common::secret::ExposeSecret;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    /// Redis-backed, shared with other instances.
    Shared,
    /// In-process only.
    Standalone,
}

impl ClusterMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterMode::Shared => "shared",
            ClusterMode::Standalone => "standalone",
        }
    }
}

/// The three backends, constructed once at startup.
#[derive(Clone)]
pub struct ClusterBackends {
    pub mode: ClusterMode,
    pub sessions: Arc<dyn SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub event_bus: Arc<dyn EventBus>,
}

impl ClusterBackends {
    /// In-memory backends for single-process mode.
    #[must_use]
    pub fn standalone(config: &Config) -> Self {
        Self::with_event_bus(config, Arc::new(InMemoryEventBus::new()))
    }

    /// In-memory sessions and counters around a caller-supplied bus, so
    /// several in-process instances can share one bus.
    #[must_use]
    pub fn with_event_bus(config: &Config, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            mode: ClusterMode::Standalone,
            sessions: Arc::new(InMemorySessionStore::new(config.session_ttl)),
            rate_limiter: Arc::new(RateLimiter::new(
                Arc::new(InMemoryCounterBackend::new()),
                config.rate_limits,
            )),
            event_bus,
        }
    }

    /// Redis-backed backends sharing one multiplexed connection.
    #[must_use]
    pub fn redis(config: &Config, client: Client, connection: MultiplexedConnection) -> Self {
        Self {
            mode: ClusterMode::Shared,
            sessions: Arc::new(RedisSessionStore::new(
                connection.clone(),
                config.session_ttl,
            )),
            rate_limiter: Arc::new(RateLimiter::new(
                Arc::new(RedisCounterBackend::new(connection.clone())),
                config.rate_limits,
            )),
            event_bus: Arc::new(RedisEventBus::new(client, connection)),
        }
    }

    /// Connect to Redis if configured, falling back to standalone mode with a
    /// warning when it is absent or unreachable.
    pub async fn connect(config: &Config) -> Self {
        let Some(redis_url) = &config.redis_url else {
            info!(target: "sig.cluster", "REDIS_URL not set, running standalone");
            return Self::standalone(config);
        };

        match open_redis(redis_url.expose_secret()).await {
            Ok((client, connection)) => {
                info!(target: "sig.cluster", "Connected to Redis, cluster mode enabled");
                Self::redis(config, client, connection)
            }
            Err(e) => {
                warn!(
                    target: "sig.cluster",
                    error = %e,
                    "Redis unavailable, falling back to standalone mode"
                );
                Self::standalone(config)
            }
        }
    }
}

async fn open_redis(redis_url: &str) -> Result<(Client, MultiplexedConnection), SignalingError> {
    // Never log the URL; it may carry credentials.
    let client = Client::open(redis_url).map_err(|e| {
        error!(target: "sig.cluster", error = %e, "Failed to open Redis client");
        SignalingError::Store(format!("Failed to open Redis client: {e}"))
    })?;

    let connection = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| SignalingError::Store(format!("Failed to connect to Redis: {e}")))?;

    Ok((client, connection))
}
