//! Cross-instance delivery of user events
//!
//! Every instance subscribes to the user-events topic and forwards the events
//! whose recipient holds a connection on this instance; the rest are ignored.

use crate::notify::registry::ConnectionRegistry;
use crate::store::{CoordinationStore, Topic};
use crate::types::UserEvent;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Background task bridging the store's pub/sub to local connections
pub struct NotificationFanout {
    store: Arc<dyn CoordinationStore>,
    registry: Arc<ConnectionRegistry>,
    resubscribe_delay: Duration,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn CoordinationStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            resubscribe_delay: Duration::from_secs(1),
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Deliver one raw pub/sub payload. Returns whether it reached a local connection.
    pub fn dispatch(&self, payload: &str) -> bool {
        match serde_json::from_str::<UserEvent>(payload) {
            Ok(event) => {
                let delivered = self.registry.deliver(&event);
                if delivered {
                    debug!(
                        "Delivered {} event to user '{}'",
                        event.event.name(),
                        event.user_id
                    );
                }
                delivered
            }
            Err(e) => {
                warn!("Dropping undecodable user event: {}", e);
                false
            }
        }
    }

    /// Run until shutdown, resubscribing whenever the subscription ends
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Notification fan-out started");

        loop {
            let mut stream = match self.store.subscribe(Topic::UserEvents).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        "Failed to subscribe to user events: {}. Retrying in {:?}",
                        e, self.resubscribe_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.resubscribe_delay) => continue,
                        _ = shutdown.recv() => break,
                    }
                }
            };

            loop {
                tokio::select! {
                    message = stream.next() => match message {
                        Some(payload) => {
                            self.dispatch(&payload);
                        }
                        None => {
                            warn!("User event subscription ended, resubscribing");
                            break;
                        }
                    },
                    _ = shutdown.recv() => {
                        info!("Notification fan-out stopped");
                        return;
                    }
                }
            }
        }

        info!("Notification fan-out stopped");
    }
}
