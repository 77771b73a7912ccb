//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the pairing-room matchmaking
//! service using Prometheus metrics.

use crate::types::Difficulty;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue-related metrics
    queue_metrics: QueueMetrics,

    /// Pending match and room metrics
    match_metrics: MatchMetrics,

    /// Rating metrics
    rating_metrics: RatingMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// Coordination store failures by operation
    pub store_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue-related metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Join attempts by outcome
    pub joins_total: IntCounterVec,

    /// Cancels that removed a wait entry
    pub cancels_total: IntCounter,

    /// Users currently waiting
    pub players_waiting: IntGauge,

    /// Wait time until paired, by the stage the pair was formed at
    pub wait_until_paired_seconds: HistogramVec,
}

/// Pending match and room metrics
#[derive(Clone)]
pub struct MatchMetrics {
    /// Pending matches created, by negotiated difficulty
    pub pending_created_total: IntCounterVec,

    /// Pending matches currently awaiting confirmation
    pub pending_matches: IntGauge,

    /// Handshake calls by outcome
    pub handshakes_total: IntCounterVec,

    /// Rooms promoted to ready
    pub rooms_ready_total: IntCounter,

    /// Rooms finished
    pub rooms_finished_total: IntCounter,

    /// Pending matches reclaimed after expiry
    pub matches_expired_total: IntCounter,

    /// Users handled by expiry, by whether they were requeued
    pub expired_users_total: IntCounterVec,
}

/// Rating metrics
#[derive(Clone)]
pub struct RatingMetrics {
    /// Rating records updated
    pub ratings_updated_total: IntCounter,

    /// Size of rating changes
    pub rating_delta: Histogram,

    /// Adjusted engagement scores
    pub engagement_score: HistogramVec,

    /// Session telemetry received again after it was already rated
    pub duplicate_sessions_total: IntCounter,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Periodic loop tick duration
    pub tick_duration: HistogramVec,

    /// Periodic loop ticks that failed
    pub tick_failures_total: IntCounterVec,

    /// Rating calculation time
    pub rating_calculation_duration: Histogram,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let match_metrics = MatchMetrics::new(&registry)?;
        let rating_metrics = RatingMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            match_metrics,
            rating_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn matches(&self) -> &MatchMetrics {
        &self.match_metrics
    }

    pub fn rating(&self) -> &RatingMetrics {
        &self.rating_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record a join attempt
    pub fn record_join(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "conflict" };
        self.queue_metrics
            .joins_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record a pending match being formed
    pub fn record_pending_created(&self, difficulty: Difficulty, stage: u8, waited: Duration) {
        self.match_metrics
            .pending_created_total
            .with_label_values(&[difficulty.as_str()])
            .inc();

        let stage_label = stage.to_string();
        self.queue_metrics
            .wait_until_paired_seconds
            .with_label_values(&[stage_label.as_str()])
            .observe(waited.as_secs_f64());
    }

    /// Record a handshake outcome (`accepted`, `rejected`, `room_ready`, `expired`, `not_found`)
    pub fn record_handshake(&self, outcome: &str) {
        self.match_metrics
            .handshakes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record one expired pending match and how each party was handled
    pub fn record_expiry(&self, requeued: usize, dropped: usize) {
        self.match_metrics.matches_expired_total.inc();
        self.match_metrics
            .expired_users_total
            .with_label_values(&["requeued"])
            .inc_by(requeued as u64);
        self.match_metrics
            .expired_users_total
            .with_label_values(&["dropped"])
            .inc_by(dropped as u64);
    }

    /// Record a rating update for one user
    pub fn record_rating_update(&self, change: f64, engagement: f64, difficulty: &str) {
        self.rating_metrics.ratings_updated_total.inc();
        self.rating_metrics.rating_delta.observe(change.abs());
        self.rating_metrics
            .engagement_score
            .with_label_values(&[difficulty])
            .observe(engagement);
    }

    /// Record rating calculation duration
    pub fn record_rating_calculation(&self, duration: Duration) {
        self.performance_metrics
            .rating_calculation_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a periodic loop tick
    pub fn record_tick(&self, loop_name: &str, success: bool, duration: Duration) {
        self.performance_metrics
            .tick_duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());

        if !success {
            self.performance_metrics
                .tick_failures_total
                .with_label_values(&[loop_name])
                .inc();
        }
    }

    /// Record a failed coordination store call
    pub fn record_store_error(&self, operation: &str) {
        self.service_metrics
            .store_errors_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("pairing_room_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "pairing_room_amqp_messages_total",
                "Total AMQP messages processed",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("pairing_room_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let store_errors_total = IntCounterVec::new(
            Opts::new(
                "pairing_room_store_errors_total",
                "Coordination store failures",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "pairing_room_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("pairing_room_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            store_errors_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let joins_total = IntCounterVec::new(
            Opts::new("pairing_room_joins_total", "Queue join attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(joins_total.clone()))?;

        let cancels_total =
            IntCounter::new("pairing_room_cancels_total", "Queue entries cancelled")?;
        registry.register(Box::new(cancels_total.clone()))?;

        let players_waiting =
            IntGauge::new("pairing_room_players_waiting", "Users currently waiting")?;
        registry.register(Box::new(players_waiting.clone()))?;

        let wait_until_paired_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pairing_room_wait_until_paired_seconds",
                "Time spent queued before a pending match was formed",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["stage"],
        )?;
        registry.register(Box::new(wait_until_paired_seconds.clone()))?;

        Ok(Self {
            joins_total,
            cancels_total,
            players_waiting,
            wait_until_paired_seconds,
        })
    }
}

impl MatchMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let pending_created_total = IntCounterVec::new(
            Opts::new(
                "pairing_room_pending_matches_created_total",
                "Pending matches created",
            ),
            &["difficulty"],
        )?;
        registry.register(Box::new(pending_created_total.clone()))?;

        let pending_matches = IntGauge::new(
            "pairing_room_pending_matches",
            "Pending matches awaiting confirmation",
        )?;
        registry.register(Box::new(pending_matches.clone()))?;

        let handshakes_total = IntCounterVec::new(
            Opts::new("pairing_room_handshakes_total", "Handshake calls"),
            &["outcome"],
        )?;
        registry.register(Box::new(handshakes_total.clone()))?;

        let rooms_ready_total =
            IntCounter::new("pairing_room_rooms_ready_total", "Rooms promoted to ready")?;
        registry.register(Box::new(rooms_ready_total.clone()))?;

        let rooms_finished_total =
            IntCounter::new("pairing_room_rooms_finished_total", "Rooms finished")?;
        registry.register(Box::new(rooms_finished_total.clone()))?;

        let matches_expired_total = IntCounter::new(
            "pairing_room_matches_expired_total",
            "Pending matches reclaimed after expiry",
        )?;
        registry.register(Box::new(matches_expired_total.clone()))?;

        let expired_users_total = IntCounterVec::new(
            Opts::new(
                "pairing_room_expired_users_total",
                "Users in expired pending matches",
            ),
            &["result"],
        )?;
        registry.register(Box::new(expired_users_total.clone()))?;

        Ok(Self {
            pending_created_total,
            pending_matches,
            handshakes_total,
            rooms_ready_total,
            rooms_finished_total,
            matches_expired_total,
            expired_users_total,
        })
    }
}

impl RatingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let ratings_updated_total = IntCounter::new(
            "pairing_room_ratings_updated_total",
            "Rating records updated",
        )?;
        registry.register(Box::new(ratings_updated_total.clone()))?;

        let rating_delta = Histogram::with_opts(
            HistogramOpts::new("pairing_room_rating_delta", "Absolute rating change")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 25.0, 32.0]),
        )?;
        registry.register(Box::new(rating_delta.clone()))?;

        let engagement_score = HistogramVec::new(
            HistogramOpts::new(
                "pairing_room_engagement_score",
                "Adjusted engagement score",
            )
            .buckets(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]),
            &["difficulty"],
        )?;
        registry.register(Box::new(engagement_score.clone()))?;

        let duplicate_sessions_total = IntCounter::new(
            "pairing_room_duplicate_sessions_total",
            "Session telemetry ignored because the session was already rated",
        )?;
        registry.register(Box::new(duplicate_sessions_total.clone()))?;

        Ok(Self {
            ratings_updated_total,
            rating_delta,
            engagement_score,
            duplicate_sessions_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let tick_duration = HistogramVec::new(
            HistogramOpts::new(
                "pairing_room_tick_duration_seconds",
                "Periodic loop tick duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["loop"],
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        let tick_failures_total = IntCounterVec::new(
            Opts::new(
                "pairing_room_tick_failures_total",
                "Periodic loop ticks that failed",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(tick_failures_total.clone()))?;

        let rating_calculation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pairing_room_rating_calculation_duration_seconds",
                "Rating calculation time",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(rating_calculation_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "pairing_room_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            tick_duration,
            tick_failures_total,
            rating_calculation_duration,
            amqp_operation_duration,
        })
    }
}
