//! Service layer for the pairing-room matchmaking service
//!
//! This module contains the application state and its lifecycle, the
//! request API, the realtime event channel and health checks.

pub mod api;
pub mod app;
pub mod health;
pub mod sse;

pub use api::{router, AuthenticatedUser, USER_ID_HEADER};
pub use app::{AppState, Dependencies, ServiceError};
pub use health::{HealthCheck, HealthStatus};
