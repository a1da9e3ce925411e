//! Test server harness for E2E testing
//!
//! Provides `TestSignalingServer` for spawning real signaling instances in
//! tests. Several instances can share one in-memory event bus to exercise
//! room replication without Redis.

use metrics_exporter_prometheus::PrometheusBuilder;
use signaling_service::auth::{AgentProfile, CredentialService, SecretPolicy, TokenTtls};
use signaling_service::cluster::{sync, ClusterBackends, EventBus, RoomDirectory};
use signaling_service::config::Config;
use signaling_service::observability::HealthState;
use signaling_service::registry::{RegistryActor, RegistryConfig, RegistryHandle};
use signaling_service::routes::{self, AppState};
use signaling_service::tasks;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::fixtures::test_config;

/// Test harness for spawning a signaling server in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> Result<(), anyhow::Error> {
///     let server = TestSignalingServer::spawn().await?;
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestSignalingServer {
    addr: SocketAddr,
    config: Config,
    credentials: Arc<CredentialService>,
    registry: RegistryHandle,
    directory: RoomDirectory,
    shutdown: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestSignalingServer {
    /// Spawn a standalone instance with default test configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with("sig-test", &[], None).await
    }

    /// Spawn an instance named `instance_id`.
    ///
    /// `overrides` replace test config variables. With `event_bus` set, the
    /// instance publishes and subscribes on that bus instead of a private one.
    pub async fn spawn_with(
        instance_id: &str,
        overrides: &[(&str, &str)],
        event_bus: Option<Arc<dyn EventBus>>,
    ) -> Result<Self, anyhow::Error> {
        let config = test_config(instance_id, overrides)?;

        let credentials = Arc::new(
            CredentialService::new(
                &config.jwt_secret,
                &SecretPolicy::new(&config.weak_secret_patterns),
                TokenTtls {
                    access: config.access_token_ttl,
                    room_join: config.join_token_ttl,
                    refresh: config.refresh_token_ttl,
                },
            )
            .map_err(|e| anyhow::anyhow!("Failed to create credential service: {}", e))?,
        );

        let cluster = match event_bus {
            Some(bus) => ClusterBackends::with_event_bus(&config, bus),
            None => ClusterBackends::standalone(&config),
        };

        let shutdown = CancellationToken::new();
        let (changes_tx, changes_rx) = mpsc::channel(sync::CHANGE_FEED_BUFFER);
        let (registry, _registry_task) = RegistryActor::spawn(
            RegistryConfig {
                room_capacity: config.max_participants_per_room,
                instance_id: config.instance_id.clone(),
            },
            shutdown.child_token(),
            Some(changes_tx),
        );
        let directory = RoomDirectory::new();

        let events = cluster
            .event_bus
            .subscribe()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to event bus: {}", e))?;
        tokio::spawn(sync::run_publisher(
            changes_rx,
            Arc::clone(&cluster.event_bus),
            config.instance_id.clone(),
            shutdown.child_token(),
        ));
        tokio::spawn(sync::run_subscriber(
            events,
            directory.clone(),
            registry.clone(),
            config.instance_id.clone(),
            config.directory_stale_after(),
            shutdown.child_token(),
        ));
        tokio::spawn(sync::run_announcer(
            registry.clone(),
            Arc::clone(&cluster.event_bus),
            config.instance_id.clone(),
            config.instance_announce_interval,
            shutdown.child_token(),
        ));
        tokio::spawn(tasks::start_room_reaper(
            registry.clone(),
            config.reaper_interval,
            config.room_idle_timeout,
            shutdown.child_token(),
        ));

        let health_state = Arc::new(HealthState::new());
        health_state.set_ready();

        // A recorder handle without installing it globally, so many servers
        // can coexist in one test process.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let state = AppState {
            config: Arc::new(config.clone()),
            credentials: Arc::clone(&credentials),
            registry: registry.clone(),
            directory: directory.clone(),
            cluster,
            shutdown: shutdown.child_token(),
            connections: Arc::new(AtomicUsize::new(0)),
        };
        let app = routes::build_routes(state, health_state, metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            let server = axum::serve(listener, make_service)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            credentials,
            registry,
            directory,
            shutdown,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Relay WebSocket URL carrying `token` in the query string.
    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    /// Access token for `subject`, signed with this server's secret.
    pub fn access_token(&self, subject: &str) -> Result<String, anyhow::Error> {
        self.credentials
            .issue_access(subject, &AgentProfile::named(subject))
            .map(|issued| issued.token)
            .map_err(|e| anyhow::anyhow!("Failed to issue token: {}", e))
    }

    pub fn refresh_token(&self, subject: &str) -> Result<String, anyhow::Error> {
        self.credentials
            .issue_refresh(subject, &AgentProfile::named(subject))
            .map(|issued| issued.token)
            .map_err(|e| anyhow::anyhow!("Failed to issue token: {}", e))
    }

    /// Cancel every task and connection owned by this instance.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self._handle.abort();
    }
}
