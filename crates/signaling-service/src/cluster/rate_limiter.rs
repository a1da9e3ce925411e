//! Fixed-window rate limiter.
//!
//! Counter key: `ratelimit:{class}:{identity}:{window_index}` where
//! `window_index = unix_seconds / window_seconds`. Every instance derives
//! the same window from wall-clock time, so no coordination is needed.
//! A request is allowed iff the post-increment count is <= the class limit.
//!
//! Counter storage is pluggable ([`CounterBackend`]): Redis for clusters,
//! in-memory for single-process mode. On backend failure the limiter fails
//! open and logs a warning.

use super::lua_scripts;
use crate::config::RateLimitConfig;
use crate::errors::SignalingError;
use crate::observability::metrics;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Endpoint class; each has its own limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    /// Registration and token refresh.
    Auth,
    /// Mutating API calls.
    Write,
    /// Listing and lookups.
    Read,
    /// Messages on one relay connection.
    Relay,
}

impl RateClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RateClass::Auth => "auth",
            RateClass::Write => "write",
            RateClass::Read => "read",
            RateClass::Relay => "relay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl RateDecision {
    /// Convert a refusal into the error the API and relay return.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::RateLimited` when the request was refused.
    pub fn into_result(self) -> Result<Self, SignalingError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(SignalingError::RateLimited {
                retry_after_secs: self.reset_after.as_secs().max(1),
            })
        }
    }
}

/// Atomic increment-with-expiry.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Increment `key` and return the new count. The first increment sets
    /// the key's TTL to `ttl`.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, SignalingError>;
}

pub struct RateLimiter {
    backend: Arc<dyn CounterBackend>,
    limits: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(backend: Arc<dyn CounterBackend>, limits: RateLimitConfig) -> Self {
        Self { backend, limits }
    }

    #[must_use]
    pub fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Auth => self.limits.auth,
            RateClass::Write => self.limits.write,
            RateClass::Read => self.limits.read,
            RateClass::Relay => self.limits.relay,
        }
    }

    /// Count one request by `identity` against `class`.
    pub async fn check(&self, class: RateClass, identity: &str) -> RateDecision {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.check_at(class, identity, now).await
    }

    /// [`RateLimiter::check`] with an explicit wall-clock time.
    pub async fn check_at(&self, class: RateClass, identity: &str, unix_seconds: u64) -> RateDecision {
        let window = self.limits.window_seconds.max(1);
        let window_index = unix_seconds / window;
        let reset_after = Duration::from_secs(window - unix_seconds % window);
        let limit = self.limit_for(class);

        let key = format!("ratelimit:{}:{identity}:{window_index}", class.as_str());

        let count = match self
            .backend
            .increment(&key, Duration::from_secs(window))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    target: "sig.cluster",
                    error = %e,
                    class = class.as_str(),
                    "Rate limit store unavailable, allowing request"
                );
                metrics::record_rate_limit_decision(class.as_str(), "store_error");
                return RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_after,
                };
            }
        };

        let allowed = count <= limit;
        metrics::record_rate_limit_decision(
            class.as_str(),
            if allowed { "allowed" } else { "rejected" },
        );

        RateDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after,
        }
    }
}

/// Redis counters via an atomic Lua INCR + EXPIRE.
#[derive(Clone)]
pub struct RedisCounterBackend {
    connection: MultiplexedConnection,
    script: Script,
}

impl RedisCounterBackend {
    #[must_use]
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            script: Script::new(lua_scripts::FIXED_WINDOW_INCREMENT),
        }
    }
}

#[async_trait]
impl CounterBackend for RedisCounterBackend {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, SignalingError> {
        let mut conn = self.connection.clone();
        let start = std::time::Instant::now();
        let count: u64 = self
            .script
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        metrics::record_store_latency("rate_limit_increment", start.elapsed());
        Ok(count)
    }
}

/// Process-local counters.
#[derive(Default)]
pub struct InMemoryCounterBackend {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl InMemoryCounterBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterBackend for InMemoryCounterBackend {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, SignalingError> {
        let mut counters = self.counters.lock().await;
        let now = Instant::now();
        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        entry.0 += 1;
        Ok(entry.0)
    }
}
