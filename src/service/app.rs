//! Main application state and service coordination
//!
//! `AppState` wires the coordination store, queue manager, pending match
//! coordinator and rating trigger together, and owns the background tasks:
//! both periodic loops, the notification fan-out, the HTTP servers and the
//! optional AMQP consumer.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::SessionMetricsConsumer;
use crate::amqp::publisher::{AmqpRatingPublisher, MirroringEventPublisher, PublisherConfig, RatingEventSink};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, StoreBackend};
use crate::matching::{
    ExpirationLoop, MatchmakingLoop, PendingMatchConfig, PendingMatchCoordinator, RoomTokenIssuer,
};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector};
use crate::notify::{ConnectionRegistry, EventPublisher, NotificationFanout, StoreEventPublisher};
use crate::questions::{QuestionBank, UnassignedQuestionBank};
use crate::queue::{QueueManager, StageThresholds};
use crate::rating::RatingUpdateTrigger;
use crate::service::api;
use crate::service::health::{HealthCheck, HealthStatus};
use crate::store::{
    CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore, RedisStoreConfig,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Coordination store error: {message}")]
    Store { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

const HEALTH_METRICS_INTERVAL: Duration = Duration::from_secs(15);

/// Collaborators that differ between production and tests
pub struct Dependencies {
    pub store: Arc<dyn CoordinationStore>,
    pub clock: Arc<dyn Clock>,
    pub question_bank: Arc<dyn QuestionBank>,
    pub rating_mirror: Option<Arc<dyn RatingEventSink>>,
    pub amqp_connection: Option<Arc<AmqpConnection>>,
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    event_publisher: Arc<dyn EventPublisher>,

    /// Core matchmaking components
    queue: Arc<QueueManager>,
    coordinator: Arc<PendingMatchCoordinator>,
    rating_trigger: Arc<RatingUpdateTrigger>,
    tokens: Arc<RoomTokenIssuer>,

    /// Realtime connections held by this instance
    connections: Arc<ConnectionRegistry>,

    metrics_collector: Arc<MetricsCollector>,

    /// AMQP connection, when telemetry ingestion is enabled
    amqp_connection: Option<Arc<AmqpConnection>>,
    session_consumer: Mutex<Option<SessionMetricsConsumer>>,

    health_server: Mutex<Option<Arc<HealthServer>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,

    /// Service status
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl AppState {
    /// Initialize the application, connecting to the configured store and broker
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing pairing-room matchmaking service");
        info!(
            "Configuration: service={}, instance={}, store={:?}, amqp_enabled={}",
            config.service.name,
            config.service.instance_id,
            config.store.backend,
            config.amqp.enabled
        );

        let metrics_collector = Self::initialize_metrics()?;
        let store = Self::initialize_store(&config).await?;

        let (amqp_connection, rating_mirror) = if config.amqp.enabled {
            let connection = Self::initialize_amqp(&config).await?;
            let mirror = Self::initialize_rating_mirror(&config, &connection, &metrics_collector).await?;
            (Some(connection), Some(mirror))
        } else {
            info!("AMQP disabled - telemetry accepted over HTTP only");
            (None, None)
        };

        Self::assemble(
            config,
            Dependencies {
                store,
                clock: Arc::new(SystemClock),
                question_bank: Arc::new(UnassignedQuestionBank),
                rating_mirror,
                amqp_connection,
            },
            metrics_collector,
        )
    }

    /// Single-process state on the in-memory store, without AMQP
    pub fn in_memory(config: AppConfig) -> Result<Self, ServiceError> {
        Self::with_dependencies(
            config,
            Dependencies {
                store: Arc::new(InMemoryCoordinationStore::new()),
                clock: Arc::new(SystemClock),
                question_bank: Arc::new(UnassignedQuestionBank),
                rating_mirror: None,
                amqp_connection: None,
            },
        )
    }

    /// Build the state around explicitly supplied collaborators
    pub fn with_dependencies(config: AppConfig, deps: Dependencies) -> Result<Self, ServiceError> {
        let metrics_collector = Self::initialize_metrics()?;
        Self::assemble(config, deps, metrics_collector)
    }

    fn assemble(
        config: AppConfig,
        deps: Dependencies,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Self, ServiceError> {
        crate::config::validate_config(&config).map_err(|e| ServiceError::Configuration {
            message: e.to_string(),
        })?;

        let store_publisher: Arc<dyn EventPublisher> =
            Arc::new(StoreEventPublisher::new(deps.store.clone()));
        let event_publisher: Arc<dyn EventPublisher> = match deps.rating_mirror {
            Some(mirror) => Arc::new(MirroringEventPublisher::new(store_publisher, mirror)),
            None => store_publisher,
        };

        let [t1, t2, t3] = config.stage_thresholds();
        let queue = Arc::new(QueueManager::new(
            deps.store.clone(),
            event_publisher.clone(),
            deps.clock.clone(),
            StageThresholds { t1, t2, t3 },
            metrics_collector.clone(),
        ));

        let tokens = Arc::new(RoomTokenIssuer::new(&config.tokens.room_token_secret));
        let coordinator = Arc::new(PendingMatchCoordinator::new(
            deps.store.clone(),
            queue.clone(),
            event_publisher.clone(),
            tokens.clone(),
            deps.question_bank,
            deps.clock.clone(),
            PendingMatchConfig {
                pending_ttl: config.pending_match_ttl(),
                room_ttl: config.room_ttl(),
                retention_grace: config.pending_retention_grace(),
                requeue_unconfirmed_on_expiry: config.matchmaking.requeue_unconfirmed_on_expiry,
            },
            metrics_collector.clone(),
        ));

        let rating_trigger = Arc::new(RatingUpdateTrigger::new(
            deps.store.clone(),
            event_publisher.clone(),
            deps.clock.clone(),
            config.rating_ttl(),
            metrics_collector.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store: deps.store,
            clock: deps.clock,
            event_publisher,
            queue,
            coordinator,
            rating_trigger,
            tokens,
            connections: Arc::new(ConnectionRegistry::new()),
            metrics_collector,
            amqp_connection: deps.amqp_connection,
            session_consumer: Mutex::new(None),
            health_server: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            is_running: Arc::new(RwLock::new(false)),
            started_at: Instant::now(),
        })
    }

    /// Start servers, loops and message consumption
    pub async fn start(self: &Arc<Self>) -> Result<(), ServiceError> {
        info!("Starting pairing-room matchmaking service");

        self.mark_running(true).await;

        self.start_health_server().await;
        self.start_api_server().await?;
        self.start_amqp_consumption().await?;
        self.start_background_tasks().await;

        info!("✅ Pairing-room matchmaking service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of pairing-room service");

        self.mark_running(false).await;

        if let Some(consumer) = self.session_consumer.lock().await.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop AMQP consumer: {}", e);
            } else {
                info!("✅ AMQP message consumption stopped");
            }
        }

        // Loops and the API server observe this; tasks still running are aborted below
        if self.shutdown_tx.send(()).is_err() {
            debug!("No background task was listening for shutdown");
        }

        if let Some(server) = self.health_server.lock().await.take() {
            server.stop();
            info!("✅ Health server stopped");
        }

        self.stop_background_tasks().await;

        match self.queue.queue_snapshot().await {
            Ok(snapshot) => info!(
                "Final queue state: {} waiting, by category: {:?}",
                snapshot.waiting, snapshot.by_category
            ),
            Err(e) => warn!("Failed to read final queue state: {}", e),
        }

        info!("✅ Pairing-room service shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn mark_running(&self, running: bool) {
        *self.is_running.write().await = running;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn event_publisher(&self) -> Arc<dyn EventPublisher> {
        self.event_publisher.clone()
    }

    pub fn queue(&self) -> Arc<QueueManager> {
        self.queue.clone()
    }

    pub fn coordinator(&self) -> Arc<PendingMatchCoordinator> {
        self.coordinator.clone()
    }

    pub fn rating_trigger(&self) -> Arc<RatingUpdateTrigger> {
        self.rating_trigger.clone()
    }

    pub fn tokens(&self) -> Arc<RoomTokenIssuer> {
        self.tokens.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        self.connections.clone()
    }

    pub fn metrics_collector(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// AMQP connection for health checks
    pub fn amqp_connection(&self) -> Option<&Arc<AmqpConnection>> {
        self.amqp_connection.as_ref()
    }

    /// Matchmaking loop over this state's components
    pub fn matchmaking_loop(&self) -> MatchmakingLoop {
        MatchmakingLoop::new(
            self.queue.clone(),
            self.coordinator.clone(),
            self.clock.clone(),
            self.config.matchmaking_tick(),
            self.metrics_collector.clone(),
        )
    }

    /// Expiration loop over this state's components
    pub fn expiration_loop(&self) -> ExpirationLoop {
        ExpirationLoop::new(
            self.coordinator.clone(),
            self.config.expiration_tick(),
            self.metrics_collector.clone(),
        )
    }

    fn initialize_metrics() -> Result<Arc<MetricsCollector>, ServiceError> {
        MetricsCollector::new()
            .map(Arc::new)
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            })
    }

    async fn initialize_store(config: &AppConfig) -> Result<Arc<dyn CoordinationStore>, ServiceError> {
        match config.store.backend {
            StoreBackend::Redis => {
                info!("Connecting to coordination store: {}", config.store.redis_url);
                let store = RedisCoordinationStore::connect(&RedisStoreConfig {
                    url: config.store.redis_url.clone(),
                    key_prefix: config.store.key_prefix.clone(),
                    max_retries: config.store.max_retries,
                    retry_delay_ms: config.store.retry_delay_ms,
                })
                .await
                .map_err(|e| ServiceError::Store {
                    message: format!("Failed to connect to Redis: {}", e),
                })?;
                Ok(Arc::new(store))
            }
            StoreBackend::Memory => {
                warn!("Using in-memory coordination store - state is not shared between instances");
                Ok(Arc::new(InMemoryCoordinationStore::new()))
            }
        }
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let mut amqp_config =
            AmqpConfig::from_url(&config.amqp.url).map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?;
        amqp_config.max_retries = config.amqp.max_retry_attempts;
        amqp_config.retry_delay_ms = config.amqp.retry_delay_ms;
        amqp_config.connection_timeout_ms = config.amqp.connection_timeout_seconds * 1000;

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn initialize_rating_mirror(
        config: &AppConfig,
        connection: &AmqpConnection,
        metrics_collector: &Arc<MetricsCollector>,
    ) -> Result<Arc<dyn RatingEventSink>, ServiceError> {
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open publisher channel: {}", e),
            })?;

        let publisher = AmqpRatingPublisher::new(
            channel,
            PublisherConfig {
                exchange: config.amqp.exchange_name.clone(),
                ..PublisherConfig::default()
            },
            metrics_collector.clone(),
        )
        .await
        .map_err(|e| ServiceError::Initialization {
            message: format!("Failed to initialize rating event publisher: {}", e),
        })?;

        Ok(Arc::new(publisher))
    }

    async fn start_health_server(self: &Arc<Self>) {
        let port = self.config.service.metrics_port;
        let server = Arc::new(
            HealthServer::new(
                HealthServerConfig {
                    port,
                    host: "0.0.0.0".to_string(),
                },
                self.metrics_collector.clone(),
            )
            .with_app_state(self.clone()),
        );

        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("Health server failed: {}", e);
                }
            })
        };

        *self.health_server.lock().await = Some(server);
        self.background_tasks.lock().await.push(handle);
        info!("✅ Health and metrics endpoints starting on port {}", port);
    }

    async fn start_api_server(self: &Arc<Self>) -> Result<(), ServiceError> {
        let addr = format!("0.0.0.0:{}", self.config.service.http_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to bind request API to {}: {}", addr, e),
            })?;

        let router = api::router(self.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            if let Err(e) = result {
                error!("Request API server failed: {}", e);
            }
            info!("Request API server stopped");
        });

        self.background_tasks.lock().await.push(handle);
        info!("✅ Request API listening on http://{}", addr);
        Ok(())
    }

    async fn start_amqp_consumption(&self) -> Result<(), ServiceError> {
        let Some(connection) = &self.amqp_connection else {
            return Ok(());
        };

        let queue_name = &self.config.amqp.session_metrics_queue;
        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {}", e),
            })?;

        let consumer = SessionMetricsConsumer::new(
            self.rating_trigger.clone(),
            channel,
            self.metrics_collector.clone(),
        );
        consumer
            .start_consuming(queue_name)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming messages: {}", e),
            })?;

        *self.session_consumer.lock().await = Some(consumer);
        info!(
            "✅ Consuming session metrics from queue '{}'",
            queue_name
        );
        Ok(())
    }

    async fn start_background_tasks(&self) {
        let mut tasks = Vec::new();

        let matchmaking = self.matchmaking_loop();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { matchmaking.run(shutdown).await }));

        let expiration = self.expiration_loop();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { expiration.run(shutdown).await }));

        let fanout = NotificationFanout::new(self.store.clone(), self.connections.clone());
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(fanout.run(shutdown)));

        tasks.push(self.spawn_health_metrics_task());

        info!("{} background tasks started", tasks.len());
        self.background_tasks.lock().await.extend(tasks);
    }

    /// Periodically refresh uptime, health and queue gauges
    fn spawn_health_metrics_task(&self) -> JoinHandle<()> {
        let metrics_collector = self.metrics_collector.clone();
        let queue = self.queue.clone();
        let store = self.store.clone();
        let amqp_enabled = self.amqp_connection.is_some();
        let started_at = self.started_at;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_METRICS_INTERVAL);
            info!("Health metrics task started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.recv() => break,
                }

                metrics_collector
                    .service()
                    .uptime_seconds
                    .set(started_at.elapsed().as_secs() as i64);

                let store_healthy = match store.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Coordination store ping failed: {}", e);
                        metrics_collector.record_store_error("ping");
                        false
                    }
                };
                metrics_collector.update_component_health("coordination_store", store_healthy);
                metrics_collector.update_component_health("amqp", amqp_enabled);
                let status = if store_healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                };
                metrics_collector.update_health_status(status.as_gauge());

                if let Err(e) = queue.queue_snapshot().await {
                    debug!("Failed to refresh queue gauges: {}", e);
                }
            }

            info!("Health metrics task stopped");
        })
    }

    /// Stop all background tasks
    async fn stop_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        let task_count = tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        let grace = self.config.shutdown_timeout();
        for (i, mut task) in tasks.into_iter().enumerate() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!("Aborting background task {}/{}", i + 1, task_count);
                task.abort();
            }
        }

        info!("✅ All {} background tasks stopped", task_count);
    }

    /// Health summary used by the `--health-check` CLI mode
    pub async fn health_summary(self: &Arc<Self>) -> anyhow::Result<HealthCheck> {
        HealthCheck::check(self.clone()).await
    }
}
