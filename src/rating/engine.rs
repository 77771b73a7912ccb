//! Elo rating engine
//!
//! Engagement stands in for the match result: a participant who engages
//! more than their expected score against the opponent gains rating.
//! Everything here is pure and deterministic.

use crate::rating::engagement::{engagement_score, MAX_ENGAGEMENT};
use crate::types::{Difficulty, ParticipantMetrics, UserEloInfo};
use skillratings::elo::EloRating;

pub const MIN_RATING: f64 = 500.0;
pub const MAX_RATING: f64 = 3000.0;

/// Sessions after which ratings settle to the lower K-factor
pub const PROVISIONAL_SESSIONS: u32 = 5;
const PROVISIONAL_K: f64 = 32.0;
const ESTABLISHED_K: f64 = 24.0;

/// Logistic expected score of `self_elo` against `opponent_elo`
pub fn expected_score(self_elo: f64, opponent_elo: f64) -> f64 {
    let (expected, _) = skillratings::elo::expected_score(
        &EloRating { rating: self_elo },
        &EloRating {
            rating: opponent_elo,
        },
    );
    expected
}

pub fn k_factor(sessions_completed: u32) -> f64 {
    if sessions_completed < PROVISIONAL_SESSIONS {
        PROVISIONAL_K
    } else {
        ESTABLISHED_K
    }
}

/// Weight of a session's difficulty. Unknown strings count as medium.
pub fn difficulty_multiplier(difficulty: &str) -> f64 {
    match difficulty.parse::<Difficulty>() {
        Ok(Difficulty::Easy) => 0.8,
        Ok(Difficulty::Medium) => 1.0,
        Ok(Difficulty::Hard) => 1.3,
        Err(_) => 1.0,
    }
}

pub fn adjusted_engagement(engagement: f64, difficulty: &str) -> f64 {
    (engagement * difficulty_multiplier(difficulty)).min(MAX_ENGAGEMENT)
}

/// Rating after one session, clamped to the supported range
pub fn new_rating(
    old_elo: f64,
    opponent_elo: f64,
    adjusted_engagement: f64,
    sessions_completed: u32,
) -> f64 {
    let actual = adjusted_engagement / MAX_ENGAGEMENT;
    let delta = k_factor(sessions_completed) * (actual - expected_score(old_elo, opponent_elo));
    (old_elo + delta).clamp(MIN_RATING, MAX_RATING)
}

/// Outcome of rating one participant of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingOutcome {
    pub old_rating: f64,
    pub new_rating: f64,
    pub opponent_elo: f64,
    /// Difficulty-adjusted engagement used as the actual score
    pub engagement: f64,
}

impl RatingOutcome {
    pub fn change(&self) -> f64 {
        self.new_rating - self.old_rating
    }
}

/// Rate one participant against the opponent's pre-session rating
pub fn rate_participant(
    participant: &UserEloInfo,
    opponent: &UserEloInfo,
    metrics: &ParticipantMetrics,
    session_duration_sec: u64,
    difficulty: &str,
) -> RatingOutcome {
    let engagement = adjusted_engagement(
        engagement_score(metrics, session_duration_sec),
        difficulty,
    );
    RatingOutcome {
        old_rating: participant.elo_rating,
        new_rating: new_rating(
            participant.elo_rating,
            opponent.elo_rating,
            engagement,
            participant.sessions_completed,
        ),
        opponent_elo: opponent.elo_rating,
        engagement,
    }
}
