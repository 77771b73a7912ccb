//! Pending match expiration loop

use crate::error::Result;
use crate::matching::coordinator::PendingMatchCoordinator;
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const LOOP_NAME: &str = "expiration";

/// Sweeps pending matches whose handshake window has closed
pub struct ExpirationLoop {
    coordinator: Arc<PendingMatchCoordinator>,
    interval: Duration,
    metrics_collector: Arc<MetricsCollector>,
}

impl ExpirationLoop {
    pub fn new(
        coordinator: Arc<PendingMatchCoordinator>,
        interval: Duration,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            coordinator,
            interval,
            metrics_collector,
        }
    }

    /// Resolve every overdue pending match, returning how many were resolved
    pub async fn tick(&self) -> Result<usize> {
        self.coordinator.expire_due().await
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Expiration loop started ({}ms interval)",
            self.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let timer = self.metrics_collector.start_timer();
                    let result = self.tick().await;
                    match &result {
                        Ok(resolved) if *resolved > 0 => {
                            info!("Resolved {} overdue pending match(es)", resolved)
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Expiration tick failed: {}", e);
                            self.metrics_collector.record_store_error(LOOP_NAME);
                        }
                    }
                    self.metrics_collector
                        .record_tick(LOOP_NAME, result.is_ok(), timer.stop());
                }
                _ = shutdown.recv() => {
                    info!("Expiration loop received shutdown signal");
                    break;
                }
            }
        }
    }
}
