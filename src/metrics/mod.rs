//! Metrics and monitoring for the pairing-room matchmaking service
//!
//! Prometheus collection plus the HTTP server exposing health probes and
//! the scrape endpoint.

pub mod collector;
pub mod health;

pub use collector::{
    MatchMetrics, MetricsCollector, MetricsTimer, PerformanceMetrics, QueueMetrics,
    RatingMetrics, ServiceMetrics,
};
pub use health::{HealthServer, HealthServerConfig};
