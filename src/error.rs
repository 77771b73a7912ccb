//! Error types for the matchmaking service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application. Domain failures are raised as `MatchmakingError`
//! and recovered at the edges with `downcast_ref`.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Coarse classification used by callers to decide how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Already queued / already in a match. Reported, never retried.
    Conflict,
    /// Unknown match or user is not a party; the client view is stale.
    NotFound,
    /// The pending match timed out before both parties confirmed.
    Expired,
    /// The coordination store or broker could not be reached.
    Unavailable,
    /// Malformed request.
    Invalid,
    Internal,
}

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("User is already queued: {user_id}")]
    AlreadyQueued { user_id: String },

    #[error("User is already in a match: {user_id}")]
    AlreadyInMatch { user_id: String },

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: String },

    #[error("User {user_id} is not a party to match {match_id}")]
    NotAParty { user_id: String, match_id: String },

    #[error("Match has expired: {match_id}")]
    MatchExpired { match_id: String },

    #[error("Coordination store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Room token error: {reason}")]
    TokenError { reason: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchmakingError::AlreadyQueued { .. } | MatchmakingError::AlreadyInMatch { .. } => {
                ErrorKind::Conflict
            }
            MatchmakingError::MatchNotFound { .. } | MatchmakingError::NotAParty { .. } => {
                ErrorKind::NotFound
            }
            MatchmakingError::MatchExpired { .. } => ErrorKind::Expired,
            MatchmakingError::StoreUnavailable { .. }
            | MatchmakingError::AmqpConnectionFailed { .. } => ErrorKind::Unavailable,
            MatchmakingError::InvalidRequest { .. } => ErrorKind::Invalid,
            MatchmakingError::TokenError { .. }
            | MatchmakingError::ConfigurationError { .. }
            | MatchmakingError::InternalError { .. } => ErrorKind::Internal,
        }
    }
}

/// Classify an arbitrary error chain, defaulting to `Internal`
pub fn error_kind(error: &anyhow::Error) -> ErrorKind {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<MatchmakingError>())
        .map(MatchmakingError::kind)
        .unwrap_or(ErrorKind::Internal)
}
