//! Server-Sent Events channel delivering a user's matchmaking events
//!
//! The stream registers with this instance's `ConnectionRegistry` and claims
//! a connection generation in the shared store. When the client goes away
//! the stream is dropped; the disconnect is handed to the coordinator only if
//! no newer connection exists, here or on another instance.

use crate::error::Result;
use crate::matching::PendingMatchCoordinator;
use crate::notify::ConnectionRegistry;
use crate::service::api::{ApiError, AuthenticatedUser};
use crate::service::app::AppState;
use crate::store::CoordinationStore;
use crate::types::{MatchEvent, UserId};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> std::result::Result<
    Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>,
    ApiError,
> {
    let stream = subscribe(
        state.connections(),
        state.coordinator(),
        state.store(),
        user_id,
    )
    .await?;
    Ok(
        Sse::new(stream.map(|event| Event::default().event(event.name()).json_data(&event)))
            .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
}

/// Register a connection for the user and return its event stream
pub async fn subscribe(
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<PendingMatchCoordinator>,
    store: Arc<dyn CoordinationStore>,
    user_id: UserId,
) -> Result<UserEventStream> {
    let generation = store.claim_connection(&user_id).await?;
    let (connection_id, receiver) = registry.register(&user_id);
    info!(
        "Realtime channel opened for user '{}' (connection {}, generation {})",
        user_id, connection_id, generation
    );

    Ok(UserEventStream {
        inner: UnboundedReceiverStream::new(receiver),
        _guard: DisconnectGuard {
            user_id,
            connection_id,
            generation,
            registry,
            coordinator,
            store,
        },
    })
}

/// Events for one connected user; dropping it ends the connection
pub struct UserEventStream {
    inner: UnboundedReceiverStream<MatchEvent>,
    _guard: DisconnectGuard,
}

impl Stream for UserEventStream {
    type Item = MatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct DisconnectGuard {
    user_id: UserId,
    connection_id: Uuid,
    generation: u64,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<PendingMatchCoordinator>,
    store: Arc<dyn CoordinationStore>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.registry.unregister(&self.user_id, self.connection_id) {
            // A newer connection replaced this one
            debug!(
                "Stale connection {} for user '{}' closed",
                self.connection_id, self.user_id
            );
            return;
        }

        info!("Realtime channel closed for user '{}'", self.user_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to process disconnect of user '{}'",
                self.user_id
            );
            return;
        };

        let user_id = self.user_id.clone();
        let generation = self.generation;
        let coordinator = self.coordinator.clone();
        let store = self.store.clone();
        runtime.spawn(async move {
            match store.current_connection(&user_id).await {
                Ok(Some(current)) if current != generation => {
                    debug!(
                        "User '{}' reconnected elsewhere (generation {} -> {})",
                        user_id, generation, current
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "Connection generation lookup failed for '{}': {}",
                    user_id, e
                ),
            }
            if let Err(e) = coordinator.handle_disconnect(&user_id).await {
                warn!("Failed to process disconnect of user '{}': {}", user_id, e);
            }
        });
    }
}
