//! Pairing, handshake, and expiry of matches

pub mod coordinator;
pub mod expiration;
pub mod matchmaker;
pub mod tokens;

pub use coordinator::{PendingMatchConfig, PendingMatchCoordinator};
pub use expiration::ExpirationLoop;
pub use matchmaker::MatchmakingLoop;
pub use tokens::{RoomClaims, RoomTokenIssuer};
