//! HTTP routes for the signaling service.
//!
//! Defines the Axum router and application state.

use crate::auth::CredentialService;
use crate::cluster::{ClusterBackends, RoomDirectory};
use crate::config::Config;
use crate::handlers;
use crate::middleware::{enforce_rate_limit, http_metrics_middleware};
use crate::observability::{health_router, HealthState};
use crate::registry::RegistryHandle;
use crate::relay::{self, RelayContext};
use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, patch, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

/// Request timeout for Control API routes. `/ws` is exempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    pub credentials: Arc<CredentialService>,

    /// Rooms owned by this instance.
    pub registry: RegistryHandle,

    /// Rooms owned by other instances, as last announced on the event bus.
    pub directory: RoomDirectory,

    /// Session store, rate limiter and event bus (Redis or in-memory).
    pub cluster: ClusterBackends,

    /// Parent token for every relay connection.
    pub shutdown: CancellationToken,

    /// Live relay connections on this instance.
    pub connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Context handed to each new relay connection.
    #[must_use]
    pub fn relay_context(&self) -> RelayContext {
        RelayContext {
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            sessions: Arc::clone(&self.cluster.sessions),
            rate_limiter: Arc::clone(&self.cluster.rate_limiter),
            instance_id: self.config.instance_id.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            shutdown: self.shutdown.child_token(),
            connections: Arc::clone(&self.connections),
        }
    }
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return layer.allow_origin(Any);
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(value),
        Err(e) => {
            warn!(target: "sig.api", error = %e, "Invalid CORS_ORIGIN, cross-origin requests disabled");
            layer
        }
    }
}

/// Build the application routes.
///
/// - `/health`, `/ready` - liveness and readiness
/// - `/metrics` - Prometheus exposition
/// - `/ws` - relay WebSocket
/// - `/api/...` - Control API, rate limited per class, 30 second timeout
///
/// CORS applies to everything; HTTP metrics wrap everything (outermost).
pub fn build_routes(
    state: AppState,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    let api_routes = Router::new()
        .route(
            "/api/rooms",
            get(handlers::list_rooms).post(handlers::create_room),
        )
        .route(
            "/api/rooms/:id",
            get(handlers::get_room).delete(handlers::delete_room),
        )
        .route(
            "/api/rooms/:id/settings",
            patch(handlers::update_room_settings),
        )
        .route("/api/rooms/:id/join", post(handlers::join_room))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/agents/register", post(handlers::register_agent))
        .route("/api/agents/me", get(handlers::get_me))
        .route("/api/auth/refresh", post(handlers::refresh_token))
        .route("/api/sessions", get(handlers::list_sessions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let relay_routes = Router::new().route("/ws", get(relay::ws_handler));

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TraceLayer - log request details
    // 2. CorsLayer - answer preflight, tag responses
    // 3. http_metrics_middleware - record ALL responses (outermost)
    api_routes
        .merge(relay_routes)
        .with_state(state)
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(middleware::from_fn(http_metrics_middleware))
}
