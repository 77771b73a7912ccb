//! Skill rating
//!
//! Engagement scoring and the Elo engine are pure; the trigger applies them
//! to session telemetry and persists the results.

pub mod engagement;
pub mod engine;
pub mod trigger;

pub use engagement::engagement_score;
pub use engine::{
    adjusted_engagement, difficulty_multiplier, expected_score, k_factor, new_rating,
    rate_participant, RatingOutcome, MAX_RATING, MIN_RATING,
};
pub use trigger::RatingUpdateTrigger;
