//! Signaling Service
//!
//! Entry point for the WebRTC signaling relay.

use anyhow::Context;
use signaling_service::auth::{CredentialService, SecretPolicy, TokenTtls};
use signaling_service::cluster::{sync, ClusterBackends, RoomDirectory};
use signaling_service::config::Config;
use signaling_service::observability::{init_metrics_recorder, HealthState};
use signaling_service::registry::{RegistryActor, RegistryConfig};
use signaling_service::routes::{self, AppState};
use signaling_service::tasks;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on waiting for background tasks after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "signaling_service=info,tower_http=info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Signaling Service");

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    info!(
        bind_address = %config.bind_address,
        port = config.port,
        instance_id = %config.instance_id,
        max_participants_per_room = config.max_participants_per_room,
        "Configuration loaded successfully"
    );

    let credentials = CredentialService::new(
        &config.jwt_secret,
        &SecretPolicy::new(&config.weak_secret_patterns),
        TokenTtls {
            access: config.access_token_ttl,
            room_join: config.join_token_ttl,
            refresh: config.refresh_token_ttl,
        },
    )
    .map_err(|e| {
        error!(error = %e, "Refusing to start with an insecure signing secret");
        e
    })?;

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    let cluster = ClusterBackends::connect(&config).await;
    info!(mode = cluster.mode.as_str(), "Consistency layer ready");

    let (changes_tx, changes_rx) = mpsc::channel(sync::CHANGE_FEED_BUFFER);
    let (registry, registry_task) = RegistryActor::spawn(
        RegistryConfig {
            room_capacity: config.max_participants_per_room,
            instance_id: config.instance_id.clone(),
        },
        shutdown_token.child_token(),
        Some(changes_tx),
    );
    let directory = RoomDirectory::new();

    let events = cluster
        .event_bus
        .subscribe()
        .await
        .context("failed to subscribe to the event bus")?;

    let mut background = Vec::new();
    background.push(tokio::spawn(sync::run_publisher(
        changes_rx,
        Arc::clone(&cluster.event_bus),
        config.instance_id.clone(),
        shutdown_token.child_token(),
    )));
    background.push(tokio::spawn(sync::run_subscriber(
        events,
        directory.clone(),
        registry.clone(),
        config.instance_id.clone(),
        config.directory_stale_after(),
        shutdown_token.child_token(),
    )));
    background.push(tokio::spawn(sync::run_announcer(
        registry.clone(),
        Arc::clone(&cluster.event_bus),
        config.instance_id.clone(),
        config.instance_announce_interval,
        shutdown_token.child_token(),
    )));
    background.push(tokio::spawn(tasks::start_room_reaper(
        registry.clone(),
        config.reaper_interval,
        config.room_idle_timeout,
        shutdown_token.child_token(),
    )));
    background.push(tokio::spawn(tasks::start_session_cleanup(
        Arc::clone(&cluster.sessions),
        config.session_cleanup_interval,
        shutdown_token.child_token(),
    )));

    let addr: SocketAddr = config.listen_address().parse().map_err(|e| {
        error!(error = %e, "Invalid bind address");
        e
    })?;

    // Relay connections close first, while the registry can still process
    // their leave; everything else is cancelled after the server drains.
    let relay_shutdown = CancellationToken::new();

    let state = AppState {
        config: Arc::new(config),
        credentials: Arc::new(credentials),
        registry,
        directory,
        cluster,
        shutdown: relay_shutdown.clone(),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

    // Bind before reporting ready so a bind failure is fatal.
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, addr = %addr, "Failed to bind listener");
        e
    })?;
    info!(addr = %addr, "Signaling Service listening");

    health_state.set_ready();

    let server_health = Arc::clone(&health_state);
    let server_shutdown = relay_shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        server_health.set_not_ready();
        server_shutdown.cancel();
    })
    .await?;

    shutdown_token.cancel();

    let drain = async {
        for task in background {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        if let Err(e) = registry_task.await {
            warn!(error = %e, "Registry actor ended abnormally");
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Background tasks did not finish within the shutdown grace period");
    }

    info!("Signaling Service shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
