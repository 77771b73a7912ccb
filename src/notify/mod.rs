//! Realtime notification of matchmaking state changes
//!
//! Publishing goes through the coordination store so that whichever instance
//! holds a user's live connection can forward the event.

pub mod fanout;
pub mod publisher;
pub mod registry;

pub use fanout::NotificationFanout;
pub use publisher::{notify_user, EventPublisher, MockEventPublisher, StoreEventPublisher};
pub use registry::ConnectionRegistry;
