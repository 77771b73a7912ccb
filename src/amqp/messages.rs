//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::SessionMetrics;

/// Queue carrying session-end telemetry
pub const SESSION_METRICS_QUEUE: &str = "matchmaking.session_metrics";
/// Exchange rating changes are mirrored to
pub const RATING_EVENTS_EXCHANGE: &str = "matchmaking.rating_events";

pub const ELO_UPDATED_ROUTING_KEY: &str = "elo.updated";
pub const SESSION_METRICS_ROUTING_KEY: &str = "session.metrics";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchmakingError::InvalidRequest {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Decode session metrics sent either bare or inside a `MessageEnvelope`
    pub fn deserialize_session_metrics(bytes: &[u8]) -> Result<SessionMetrics> {
        let metrics = match MessageEnvelope::<SessionMetrics>::from_bytes(bytes) {
            Ok(envelope) => envelope.payload,
            Err(_) => serde_json::from_slice::<SessionMetrics>(bytes).map_err(|e| {
                MatchmakingError::InvalidRequest {
                    reason: format!("Failed to deserialize session metrics: {}", e),
                }
            })?,
        };

        Self::validate_session_metrics(&metrics)?;
        Ok(metrics)
    }

    pub fn validate_session_metrics(metrics: &SessionMetrics) -> Result<()> {
        if metrics.session_id.is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Session ID cannot be empty".to_string(),
            }
            .into());
        }

        if metrics.match_id.is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Match ID cannot be empty".to_string(),
            }
            .into());
        }

        if metrics.user1_id.is_empty() || metrics.user2_id.is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Both participant IDs are required".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Serialize any AMQP message to bytes
    pub fn serialize_message<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }
}
