//! Common types used throughout the matchmaking service

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Verified user identifier supplied by the upstream token verifier
pub type UserId = String;

/// Unique identifier for pending matches and the rooms they become
pub type MatchId = String;

/// Category value meaning "no preference"
pub const ANY_CATEGORY: &str = "any";

/// Default Elo rating for users without a rating record
pub const DEFAULT_ELO: f64 = 1500.0;

/// Requested problem difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Ordinal used for negotiation (Easy=1, Medium=2, Hard=3)
    pub fn ordinal(self) -> u8 {
        match self {
            Difficulty::Easy => 1,
            Difficulty::Medium => 2,
            Difficulty::Hard => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(Difficulty::Easy),
            2 => Some(Difficulty::Medium),
            3 => Some(Difficulty::Hard),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = crate::error::MatchmakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(crate::error::MatchmakingError::InvalidRequest {
                reason: format!("Unknown difficulty: {}", other),
            }),
        }
    }
}

/// A user's stated preferences when joining the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyPreference {
    pub category: String,
    pub difficulty: Difficulty,
    pub accept_any_category: bool,
}

/// A user's record while waiting to be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub user_id: UserId,
    pub category: String,
    pub difficulty: Difficulty,
    /// Whether the user accepts a counterpart from another category
    #[serde(default)]
    pub accept_any_category: bool,
    /// Elo snapshot taken at join time
    pub elo_rating: f64,
    pub enqueued_at: DateTime<Utc>,
}

impl WaitEntry {
    /// True when the user accepts counterparts from any category
    pub fn is_flexible(&self) -> bool {
        self.accept_any_category || self.category.eq_ignore_ascii_case(ANY_CATEGORY)
    }

    /// Time spent waiting as of `now` (never negative)
    pub fn wait_duration(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.enqueued_at).to_std().unwrap_or_default()
    }

    /// Identity of this particular queue entry, stable across JSON round trips
    pub fn stamp(&self) -> String {
        self.enqueued_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn preference(&self) -> PartyPreference {
        PartyPreference {
            category: self.category.clone(),
            difficulty: self.difficulty,
            accept_any_category: self.accept_any_category,
        }
    }
}

/// Which side of a pending match a user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User1,
    User2,
}

impl Role {
    pub fn other(self) -> Self {
        match self {
            Role::User1 => Role::User2,
            Role::User2 => Role::User1,
        }
    }

    /// Field name of this role's confirmation flag in the store
    pub fn confirmation_field(self) -> &'static str {
        match self {
            Role::User1 => "user1_confirmed",
            Role::User2 => "user2_confirmed",
        }
    }
}

/// Confirmation flags of a pending match, one slot per role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshakes {
    pub user1_confirmed: bool,
    pub user2_confirmed: bool,
}

impl Handshakes {
    pub fn confirm(&mut self, role: Role) {
        match role {
            Role::User1 => self.user1_confirmed = true,
            Role::User2 => self.user2_confirmed = true,
        }
    }

    pub fn is_confirmed(&self, role: Role) -> bool {
        match role {
            Role::User1 => self.user1_confirmed,
            Role::User2 => self.user2_confirmed,
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.user1_confirmed && self.user2_confirmed
    }

    pub fn confirmed_count(&self) -> usize {
        self.user1_confirmed as usize + self.user2_confirmed as usize
    }
}

/// A tentative pairing awaiting mutual confirmation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMatch {
    pub match_id: MatchId,
    pub user1: UserId,
    pub user2: UserId,
    /// Negotiated category
    pub category: String,
    /// Negotiated difficulty
    pub difficulty: Difficulty,
    pub user1_preference: PartyPreference,
    pub user2_preference: PartyPreference,
    pub room_token1: String,
    pub room_token2: String,
    #[serde(default)]
    pub handshakes: Handshakes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingMatch {
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.user1 == user_id {
            Some(Role::User1)
        } else if self.user2 == user_id {
            Some(Role::User2)
        } else {
            None
        }
    }

    pub fn user(&self, role: Role) -> &UserId {
        match role {
            Role::User1 => &self.user1,
            Role::User2 => &self.user2,
        }
    }

    pub fn token(&self, role: Role) -> &str {
        match role {
            Role::User1 => &self.room_token1,
            Role::User2 => &self.room_token2,
        }
    }

    pub fn preference(&self, role: Role) -> &PartyPreference {
        match role {
            Role::User1 => &self.user1_preference,
            Role::User2 => &self.user2_preference,
        }
    }

    /// Expired strictly after `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Lifecycle status of a confirmed room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Ready,
}

/// A confirmed, live session room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub match_id: MatchId,
    pub user1: UserId,
    pub user2: UserId,
    pub category: String,
    pub difficulty: Difficulty,
    pub status: RoomStatus,
    pub token1: String,
    pub token2: String,
    /// Problem supplied by the question bank, when one was assigned
    #[serde(default)]
    pub question_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RoomInfo {
    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.user1 == user_id {
            Some(Role::User1)
        } else if self.user2 == user_id {
            Some(Role::User2)
        } else {
            None
        }
    }

    pub fn token(&self, role: Role) -> &str {
        match role {
            Role::User1 => &self.token1,
            Role::User2 => &self.token2,
        }
    }

    pub fn opponent(&self, role: Role) -> &UserId {
        match role {
            Role::User1 => &self.user2,
            Role::User2 => &self.user1,
        }
    }
}

/// Persisted rating record for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEloInfo {
    pub user_id: UserId,
    pub elo_rating: f64,
    pub sessions_completed: u32,
}

impl UserEloInfo {
    /// Rating record for a user seen for the first time
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            elo_rating: DEFAULT_ELO,
            sessions_completed: 0,
        }
    }
}

/// Per-participant telemetry for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    pub voice_used: bool,
    pub voice_duration_sec: u64,
    pub code_changes: u32,
    pub messages_exchanged: u32,
}

/// Session-end telemetry emitted by the collaboration/voice services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub match_id: MatchId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    /// Raw difficulty string; unknown values fall back to the medium multiplier
    pub difficulty: String,
    pub session_duration_sec: u64,
    pub user1_metrics: ParticipantMetrics,
    pub user2_metrics: ParticipantMetrics,
}

/// Broadcast record of one rating recomputation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloUpdate {
    pub user_id: UserId,
    pub old_rating: f64,
    pub new_rating: f64,
    pub change: f64,
    pub opponent_elo: f64,
    pub engagement: f64,
    pub timestamp: DateTime<Utc>,
}

/// Which structure currently holds a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Queued,
    Pending(MatchId),
    Room(MatchId),
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Membership::Queued => write!(f, "queued"),
            Membership::Pending(match_id) => write!(f, "pending:{}", match_id),
            Membership::Room(match_id) => write!(f, "room:{}", match_id),
        }
    }
}

impl FromStr for Membership {
    type Err = crate::error::MatchmakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "queued" {
            return Ok(Membership::Queued);
        }
        if let Some(match_id) = s.strip_prefix("pending:") {
            return Ok(Membership::Pending(match_id.to_string()));
        }
        if let Some(match_id) = s.strip_prefix("room:") {
            return Ok(Membership::Room(match_id.to_string()));
        }
        Err(crate::error::MatchmakingError::InternalError {
            message: format!("Unrecognised membership record: {}", s),
        })
    }
}

/// Abstract state-change events delivered to a single user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MatchEvent {
    Queued {
        category: String,
        difficulty: Difficulty,
    },
    MatchFound {
        match_id: MatchId,
        opponent_id: UserId,
        category: String,
        difficulty: Difficulty,
        token: String,
        expires_at: DateTime<Utc>,
    },
    MatchCancelled {
        match_id: MatchId,
        requeued: bool,
    },
    MatchExpired {
        match_id: MatchId,
        requeued: bool,
    },
    RoomReady {
        match_id: MatchId,
        opponent_id: UserId,
        category: String,
        difficulty: Difficulty,
        token: String,
        question_id: Option<String>,
    },
    RatingUpdated {
        update: EloUpdate,
    },
}

impl MatchEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            MatchEvent::Queued { .. } => "queued",
            MatchEvent::MatchFound { .. } => "match-found",
            MatchEvent::MatchCancelled { .. } => "match-cancelled",
            MatchEvent::MatchExpired { .. } => "match-expired",
            MatchEvent::RoomReady { .. } => "room-ready",
            MatchEvent::RatingUpdated { .. } => "rating-updated",
        }
    }
}

/// An event addressed to one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: UserId,
    pub event: MatchEvent,
    pub timestamp: DateTime<Utc>,
}

/// Request to join the matchmaking queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user_id: UserId,
    pub category: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub accept_any_category: bool,
}

/// Result of a polling `Check`, derived purely from durable state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub in_room: bool,
    pub queued: bool,
    pub pending: bool,
    pub room_id: Option<MatchId>,
    pub category: Option<String>,
    pub difficulty: Option<Difficulty>,
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful handshake call
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Accepted; still waiting on the other party
    Waiting,
    /// Both confirmed and the room is live
    RoomReady(RoomInfo),
    /// Rejected; the match was dissolved
    Rejected,
}
