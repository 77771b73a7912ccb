//! AMQP integration
//!
//! Session telemetry arrives on a queue and is fed to the rating trigger;
//! rating changes can be mirrored to a topic exchange.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{SessionMetricsConsumer, SessionMetricsHandler};
pub use messages::*;
pub use publisher::{
    AmqpRatingPublisher, MirroringEventPublisher, PublisherConfig, RatingEventSink,
};
