//! Pairing Room - matchmaking and skill-rating coordination for paired sessions
//!
//! Users join a shared queue, are paired by category, difficulty and Elo
//! under a widening tolerance, confirm through a two-party handshake, and
//! have their ratings recomputed from session telemetry afterwards. All
//! cross-request state lives in a coordination store so any number of
//! instances can serve the same queue.

pub mod amqp;
pub mod clock;
pub mod config;
pub mod error;
pub mod matching;
pub mod metrics;
pub mod notify;
pub mod questions;
pub mod queue;
pub mod rating;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use clock::{Clock, ManualClock, SystemClock};
pub use matching::{PendingMatchCoordinator, RoomTokenIssuer};
pub use notify::EventPublisher;
pub use queue::QueueManager;
pub use rating::RatingUpdateTrigger;
pub use store::{CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
