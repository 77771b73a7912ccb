//! AMQP consumer for session-end telemetry
//!
//! Each delivery carries one `SessionMetrics`. Deliveries are acked once the
//! rating update is persisted. Malformed payloads are acked and dropped;
//! anything else is nacked back onto the queue.

use crate::amqp::messages::MessageUtils;
use crate::error::{error_kind, ErrorKind, MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::rating::RatingUpdateTrigger;
use crate::types::SessionMetrics;
use amqprs::{
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicNackArguments,
        Channel, QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Trait defining the interface for handling telemetry messages
#[async_trait]
pub trait SessionMetricsHandler: Send + Sync {
    async fn handle_session_metrics(&self, metrics: SessionMetrics) -> Result<()>;
}

#[async_trait]
impl SessionMetricsHandler for RatingUpdateTrigger {
    async fn handle_session_metrics(&self, metrics: SessionMetrics) -> Result<()> {
        self.process_session_metrics(&metrics).await.map(|_| ())
    }
}

/// What to do with a delivery after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Malformed or unprocessable; acked so it is not redelivered
    Drop,
    Requeue,
}

impl Disposition {
    pub fn for_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) => match error_kind(e) {
                ErrorKind::Invalid | ErrorKind::Conflict | ErrorKind::NotFound => {
                    Disposition::Drop
                }
                _ => Disposition::Requeue,
            },
        }
    }
}

/// Consumer for the session metrics queue
pub struct SessionMetricsConsumer {
    handler: Arc<dyn SessionMetricsHandler>,
    channel: Channel,
    consumer_tag: String,
    metrics_collector: Arc<MetricsCollector>,
}

impl SessionMetricsConsumer {
    pub fn new(
        handler: Arc<dyn SessionMetricsHandler>,
        channel: Channel,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        let consumer_tag = format!("session-metrics-consumer-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
            metrics_collector,
        }
    }

    /// Declare the queue and start consuming from it
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        self.channel
            .queue_declare(QueueDeclareArguments::durable_client_named(queue_name))
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to declare queue {}: {}", queue_name, e),
            })?;

        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);
        self.channel
            .basic_consume(
                MetricsConsumer::new(self.handler.clone(), self.metrics_collector.clone()),
                args,
            )
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming session metrics from queue: {}", queue_name);
        Ok(())
    }

    /// Stop consuming messages
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel.basic_cancel(args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!("Stopped consuming session metrics");
        Ok(())
    }
}

struct MetricsConsumer {
    handler: Arc<dyn SessionMetricsHandler>,
    metrics_collector: Arc<MetricsCollector>,
}

impl MetricsConsumer {
    fn new(handler: Arc<dyn SessionMetricsHandler>, metrics_collector: Arc<MetricsCollector>) -> Self {
        Self {
            handler,
            metrics_collector,
        }
    }

    async fn process_message(&self, content: &[u8]) -> Result<()> {
        let metrics = MessageUtils::deserialize_session_metrics(content)?;
        debug!(
            "Session metrics parsed - session: '{}', match: '{}', users: '{}' & '{}', difficulty: '{}', duration: {}s",
            metrics.session_id,
            metrics.match_id,
            metrics.user1_id,
            metrics.user2_id,
            metrics.difficulty,
            metrics.session_duration_sec
        );
        self.handler.handle_session_metrics(metrics).await
    }
}

#[async_trait]
impl AsyncConsumer for MetricsConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let timer = self.metrics_collector.start_timer();

        let result = self.process_message(&content).await;
        let disposition = Disposition::for_result(&result);
        let elapsed = timer.stop();
        self.metrics_collector
            .record_amqp_operation("consume_session_metrics", result.is_ok(), elapsed);

        match &result {
            Ok(()) => info!(
                "Session metrics processed - delivery_tag: {}, processing_time: {:.2}ms",
                delivery_tag,
                elapsed.as_secs_f64() * 1000.0
            ),
            Err(e) => error!(
                "Session metrics processing failed - delivery_tag: {}, size: {} bytes, disposition: {:?}, error: {}",
                delivery_tag,
                content.len(),
                disposition,
                e
            ),
        }

        let settled = match disposition {
            Disposition::Ack | Disposition::Drop => channel
                .basic_ack(BasicAckArguments::new(delivery_tag, false))
                .await,
            Disposition::Requeue => channel
                .basic_nack(BasicNackArguments::new(delivery_tag, false, true))
                .await,
        };
        if let Err(e) = settled {
            warn!("Failed to settle delivery {}: {}", delivery_tag, e);
        }
    }
}

/// Handler that records every message, for tests
#[derive(Default)]
pub struct MockSessionMetricsHandler {
    pub received: tokio::sync::Mutex<Vec<SessionMetrics>>,
}

impl MockSessionMetricsHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionMetricsHandler for MockSessionMetricsHandler {
    async fn handle_session_metrics(&self, metrics: SessionMetrics) -> Result<()> {
        self.received.lock().await.push(metrics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParticipantMetrics;

    #[tokio::test]
    async fn test_consumer_forwards_decoded_metrics() {
        let handler = Arc::new(MockSessionMetricsHandler::new());
        let consumer = MetricsConsumer::new(
            handler.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        let metrics = SessionMetrics {
            session_id: "s".to_string(),
            match_id: "m".to_string(),
            user1_id: "a".to_string(),
            user2_id: "b".to_string(),
            difficulty: "easy".to_string(),
            session_duration_sec: 60,
            user1_metrics: ParticipantMetrics::default(),
            user2_metrics: ParticipantMetrics::default(),
        };

        let bytes = serde_json::to_vec(&metrics).unwrap();
        consumer.process_message(&bytes).await.unwrap();
        assert!(consumer.process_message(b"not json").await.is_err());

        assert_eq!(handler.received.lock().await.as_slice(), &[metrics]);
    }

    #[test]
    fn test_disposition() {
        assert_eq!(Disposition::for_result(&Ok(())), Disposition::Ack);

        let invalid: Result<()> = Err(MatchmakingError::InvalidRequest {
            reason: "bad".to_string(),
        }
        .into());
        assert_eq!(Disposition::for_result(&invalid), Disposition::Drop);

        let unavailable: Result<()> = Err(MatchmakingError::StoreUnavailable {
            message: "down".to_string(),
        }
        .into());
        assert_eq!(Disposition::for_result(&unavailable), Disposition::Requeue);
    }
}
