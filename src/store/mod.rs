//! Shared coordination store
//!
//! All cross-request state (queue entries, pending matches, rooms, ratings)
//! lives behind [`CoordinationStore`]. Every mutation that touches more than
//! one record is a single conditional operation so racing instances never
//! observe or produce a half-applied change.

pub mod memory;
pub mod redis;

use crate::error::Result;
use crate::types::{
    EloUpdate, Handshakes, MatchId, Membership, PendingMatch, Role, RoomInfo, UserEloInfo,
    WaitEntry,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

pub use memory::InMemoryCoordinationStore;
pub use self::redis::{RedisCoordinationStore, RedisStoreConfig};

/// Publish/subscribe topics carried by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `UserEvent` JSON addressed to a single user
    UserEvents,
    /// `EloUpdate` JSON
    EloUpdates,
}

impl Topic {
    pub fn suffix(self) -> &'static str {
        match self {
            Topic::UserEvents => "user-events",
            Topic::EloUpdates => "elo-updates",
        }
    }
}

/// Result of a conditional queue insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Inserted,
    /// The user already holds this membership; nothing was written
    Existing(Membership),
}

/// Result of recording a session's rating changes
#[derive(Debug, Clone, PartialEq)]
pub enum RatingWrite {
    Applied,
    /// The session was recorded before; these are the updates it produced
    AlreadyApplied(Vec<EloUpdate>),
}

/// Atomic operations over the shared coordination state
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Round-trip check used by health probes
    async fn ping(&self) -> Result<()>;

    /// Insert a wait entry only if the user has no membership at all
    async fn insert_wait_entry(&self, entry: &WaitEntry) -> Result<EnqueueResult>;

    /// Remove the user's wait entry if (and only if) they are queued
    async fn remove_wait_entry(&self, user_id: &str) -> Result<bool>;

    /// Snapshot of the queue ordered by `enqueued_at` (oldest first)
    async fn wait_entries(&self) -> Result<Vec<WaitEntry>>;

    async fn membership(&self, user_id: &str) -> Result<Option<Membership>>;

    /// Compare-and-pair: if both users are still queued with the entries
    /// given (same [`WaitEntry::stamp`]), remove them and create `pending` retained for `retain`. Returns false
    /// when another instance got there first.
    async fn create_pending_match(
        &self,
        first: &WaitEntry,
        second: &WaitEntry,
        pending: &PendingMatch,
        retain: Duration,
    ) -> Result<bool>;

    /// Pending match with its current confirmation flags
    async fn get_pending_match(&self, match_id: &str) -> Result<Option<PendingMatch>>;

    async fn pending_matches(&self) -> Result<Vec<PendingMatch>>;

    /// Set the role's confirmation flag; `None` if the match no longer exists
    async fn confirm_handshake(&self, match_id: &str, role: Role) -> Result<Option<Handshakes>>;

    /// Replace a fully confirmed pending match by `room`. Returns false if
    /// the match is gone or not confirmed by both parties.
    async fn promote_pending_match(
        &self,
        match_id: &str,
        room: &RoomInfo,
        room_ttl: Duration,
    ) -> Result<bool>;

    /// Delete a pending match and clear memberships still pointing at it.
    /// With `require_incomplete`, a match confirmed by both parties is left
    /// untouched. Returns the removed match with its final flags.
    async fn dissolve_pending_match(
        &self,
        pending: &PendingMatch,
        require_incomplete: bool,
    ) -> Result<Option<PendingMatch>>;

    async fn get_room(&self, match_id: &str) -> Result<Option<RoomInfo>>;

    /// Delete a room and both room memberships
    async fn finish_room(&self, match_id: &MatchId) -> Result<Option<RoomInfo>>;

    async fn get_elo(&self, user_id: &str) -> Result<Option<UserEloInfo>>;

    /// Write both rating records and mark `session_id` processed in one
    /// atomic step, refreshing the records' expiry. A session recorded
    /// before is left alone and its original updates are returned.
    async fn record_session_ratings(
        &self,
        session_id: &str,
        first: &UserEloInfo,
        second: &UserEloInfo,
        updates: &[EloUpdate],
        ttl: Duration,
    ) -> Result<RatingWrite>;

    /// Start a new realtime connection generation for the user
    async fn claim_connection(&self, user_id: &str) -> Result<u64>;

    /// Latest connection generation claimed for the user, on any instance
    async fn current_connection(&self, user_id: &str) -> Result<Option<u64>>;

    async fn publish(&self, topic: Topic, payload: String) -> Result<()>;

    async fn subscribe(&self, topic: Topic) -> Result<BoxStream<'static, String>>;
}
