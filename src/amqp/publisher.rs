//! Mirroring of rating changes to an AMQP exchange

use crate::amqp::messages::{MessageEnvelope, ELO_UPDATED_ROUTING_KEY, RATING_EVENTS_EXCHANGE};
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::notify::EventPublisher;
use crate::types::{EloUpdate, UserEvent};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Outbound sink for rating events
#[async_trait]
pub trait RatingEventSink: Send + Sync {
    async fn publish_rating_event(&self, update: &EloUpdate) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: RATING_EVENTS_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
        }
    }
}

/// AMQP-based rating event publisher
pub struct AmqpRatingPublisher {
    channel: Channel,
    config: PublisherConfig,
    metrics_collector: Arc<MetricsCollector>,
    published_messages: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl AmqpRatingPublisher {
    /// Create a publisher and declare its exchange
    pub async fn new(
        channel: Channel,
        config: PublisherConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            metrics_collector,
            published_messages: std::sync::Mutex::new(std::collections::HashSet::new()),
        };

        publisher.setup_exchange().await?;

        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic");
        self.channel.exchange_declare(args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare exchange {}: {}",
                    self.config.exchange, e
                ),
            }
        })?;

        info!("Declared AMQP exchange {}", self.config.exchange);
        Ok(())
    }

    /// Publish an envelope with retry, skipping already published correlation ids
    async fn publish_envelope<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        if self.config.enable_deduplication && self.was_published(&envelope.correlation_id)? {
            debug!(
                "Message {} already published, skipping",
                envelope.correlation_id
            );
            return Ok(());
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            let timer = self.metrics_collector.start_timer();
            let result = self.try_publish(envelope).await;
            self.metrics_collector
                .record_amqp_operation("publish_rating_event", result.is_ok(), timer.stop());

            match result {
                Ok(()) => {
                    if self.config.enable_deduplication {
                        let mut published_messages =
                            self.published_messages.lock().map_err(|_| {
                                MatchmakingError::InternalError {
                                    message: "Failed to acquire published messages lock"
                                        .to_string(),
                                }
                            })?;
                        published_messages.insert(envelope.correlation_id.clone());
                    }

                    debug!(
                        "Published message {} to exchange {}",
                        envelope.correlation_id, self.config.exchange
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    fn was_published(&self, correlation_id: &str) -> Result<bool> {
        let published_messages =
            self.published_messages
                .lock()
                .map_err(|_| MatchmakingError::InternalError {
                    message: "Failed to acquire published messages lock".to_string(),
                })?;
        Ok(published_messages.contains(correlation_id))
    }

    async fn try_publish<T>(&self, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    pub fn cached_message_count(&self) -> usize {
        self.published_messages
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RatingEventSink for AmqpRatingPublisher {
    async fn publish_rating_event(&self, update: &EloUpdate) -> Result<()> {
        let envelope = MessageEnvelope::new(update.clone(), ELO_UPDATED_ROUTING_KEY.to_string());
        self.publish_envelope(&envelope).await
    }
}

/// Event publisher that also mirrors rating changes to a `RatingEventSink`.
///
/// The inner publisher stays authoritative; a mirror failure is logged and
/// does not fail the caller.
pub struct MirroringEventPublisher {
    inner: Arc<dyn EventPublisher>,
    mirror: Arc<dyn RatingEventSink>,
}

impl MirroringEventPublisher {
    pub fn new(inner: Arc<dyn EventPublisher>, mirror: Arc<dyn RatingEventSink>) -> Self {
        Self { inner, mirror }
    }
}

#[async_trait]
impl EventPublisher for MirroringEventPublisher {
    async fn publish_user_event(&self, event: UserEvent) -> Result<()> {
        self.inner.publish_user_event(event).await
    }

    async fn publish_elo_update(&self, update: EloUpdate) -> Result<()> {
        if let Err(e) = self.mirror.publish_rating_event(&update).await {
            warn!(
                "Failed to mirror rating update for '{}': {}",
                update.user_id, e
            );
        }
        self.inner.publish_elo_update(update).await
    }
}

/// Recording sink for tests
#[derive(Debug, Default)]
pub struct MockRatingEventSink {
    published: std::sync::Mutex<Vec<EloUpdate>>,
    fail: bool,
}

impl MockRatingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose every publish fails
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<EloUpdate> {
        self.published
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RatingEventSink for MockRatingEventSink {
    async fn publish_rating_event(&self, update: &EloUpdate) -> Result<()> {
        if self.fail {
            return Err(MatchmakingError::AmqpConnectionFailed {
                message: "mock broker unavailable".to_string(),
            }
            .into());
        }
        if let Ok(mut events) = self.published.lock() {
            events.push(update.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MockEventPublisher;

    fn update() -> EloUpdate {
        EloUpdate {
            user_id: "alice".to_string(),
            old_rating: 1500.0,
            new_rating: 1516.0,
            change: 16.0,
            opponent_elo: 1500.0,
            engagement: 100.0,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.exchange, "matchmaking.rating_events");
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_deduplication);
    }

    #[tokio::test]
    async fn test_mirror_forwards_rating_updates() {
        let inner = Arc::new(MockEventPublisher::new());
        let sink = Arc::new(MockRatingEventSink::new());
        let publisher = MirroringEventPublisher::new(inner.clone(), sink.clone());

        publisher.publish_elo_update(update()).await.unwrap();

        assert_eq!(sink.published().len(), 1);
        assert_eq!(inner.elo_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_failure_is_not_fatal() {
        let inner = Arc::new(MockEventPublisher::new());
        let publisher =
            MirroringEventPublisher::new(inner.clone(), Arc::new(MockRatingEventSink::failing()));

        publisher.publish_elo_update(update()).await.unwrap();
        assert_eq!(inner.elo_updates().len(), 1);
    }
}
