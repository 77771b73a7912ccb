//! Event publishing for user notifications and rating changes

use crate::error::Result;
use crate::store::{CoordinationStore, Topic};
use crate::types::{EloUpdate, MatchEvent, UserEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for publishing matchmaking events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event addressed to a single user
    async fn publish_user_event(&self, event: UserEvent) -> Result<()>;

    /// Publish a rating change
    async fn publish_elo_update(&self, update: EloUpdate) -> Result<()>;
}

/// Publish a user event without failing the caller.
///
/// Events are a latency optimisation over polling `check`; the durable state
/// has already changed by the time they are sent, so a failed publish is
/// logged and dropped.
pub async fn notify_user(
    publisher: &dyn EventPublisher,
    user_id: &str,
    event: MatchEvent,
    timestamp: DateTime<Utc>,
) {
    let name = event.name();
    let event = UserEvent {
        user_id: user_id.to_string(),
        event,
        timestamp,
    };
    match publisher.publish_user_event(event).await {
        Ok(()) => debug!("Published {} event to user '{}'", name, user_id),
        Err(e) => warn!(
            "Failed to publish {} event to user '{}': {}",
            name, user_id, e
        ),
    }
}

/// Publisher that fans events out through the coordination store's pub/sub
pub struct StoreEventPublisher {
    store: Arc<dyn CoordinationStore>,
}

impl StoreEventPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventPublisher for StoreEventPublisher {
    async fn publish_user_event(&self, event: UserEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        self.store.publish(Topic::UserEvents, payload).await
    }

    async fn publish_elo_update(&self, update: EloUpdate) -> Result<()> {
        let payload = serde_json::to_string(&update)?;
        self.store.publish(Topic::EloUpdates, payload).await
    }
}

/// Mock event publisher for testing
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    user_events: std::sync::Mutex<Vec<UserEvent>>,
    elo_updates: std::sync::Mutex<Vec<EloUpdate>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All user events published so far
    pub fn user_events(&self) -> Vec<UserEvent> {
        self.user_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event names delivered to one user, in order
    pub fn event_names_for(&self, user_id: &str) -> Vec<&'static str> {
        self.user_events()
            .iter()
            .filter(|event| event.user_id == user_id)
            .map(|event| event.event.name())
            .collect()
    }

    pub fn elo_updates(&self) -> Vec<EloUpdate> {
        self.elo_updates
            .lock()
            .map(|updates| updates.clone())
            .unwrap_or_default()
    }

    /// Clear published events (for testing)
    pub fn clear_events(&self) {
        if let Ok(mut events) = self.user_events.lock() {
            events.clear();
        }
        if let Ok(mut updates) = self.elo_updates.lock() {
            updates.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_user_event(&self, event: UserEvent) -> Result<()> {
        if let Ok(mut events) = self.user_events.lock() {
            events.push(event);
        }
        Ok(())
    }

    async fn publish_elo_update(&self, update: EloUpdate) -> Result<()> {
        if let Ok(mut updates) = self.elo_updates.lock() {
            updates.push(update);
        }
        Ok(())
    }
}
