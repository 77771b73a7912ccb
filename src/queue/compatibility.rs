//! Compatibility rule between two waiting users
//!
//! Two entries are compatible when their categories agree (or either side
//! is flexible) and their Elo gap fits the stage reached by the scanning
//! entry's wait time. Stages relax the allowed gap as the wait grows.

use crate::types::{Difficulty, WaitEntry, ANY_CATEGORY};
use crate::utils::ratings_within_tolerance;
use rand::Rng;
use std::time::Duration;

/// Highest stage; no Elo restriction applies
pub const UNRESTRICTED_STAGE: u8 = 4;

/// Wait-time boundaries between stages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageThresholds {
    pub t1: Duration,
    pub t2: Duration,
    pub t3: Duration,
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self {
            t1: Duration::from_secs(15),
            t2: Duration::from_secs(30),
            t3: Duration::from_secs(60),
        }
    }
}

impl StageThresholds {
    /// Stage reached after waiting `wait`
    pub fn stage_for(&self, wait: Duration) -> u8 {
        if wait < self.t1 {
            1
        } else if wait < self.t2 {
            2
        } else if wait < self.t3 {
            3
        } else {
            UNRESTRICTED_STAGE
        }
    }
}

/// Maximum Elo difference allowed at a stage, `None` when unrestricted
pub fn elo_limit(stage: u8) -> Option<f64> {
    match stage {
        0 | 1 => Some(100.0),
        2 => Some(200.0),
        3 => Some(300.0),
        _ => None,
    }
}

pub fn check_elo_compatibility(elo1: f64, elo2: f64, stage: u8) -> bool {
    match elo_limit(stage) {
        Some(limit) => ratings_within_tolerance(elo1, elo2, limit),
        None => true,
    }
}

fn is_any(category: &str) -> bool {
    category.eq_ignore_ascii_case(ANY_CATEGORY)
}

pub fn categories_compatible(a: &WaitEntry, b: &WaitEntry) -> bool {
    a.category.eq_ignore_ascii_case(&b.category) || a.is_flexible() || b.is_flexible()
}

pub fn is_compatible(a: &WaitEntry, b: &WaitEntry, stage: u8) -> bool {
    a.user_id != b.user_id
        && categories_compatible(a, b)
        && check_elo_compatibility(a.elo_rating, b.elo_rating, stage)
}

/// Average of the two ordinals, rounded down
pub fn negotiate_difficulty(a: Difficulty, b: Difficulty) -> Difficulty {
    let ordinal = (a.ordinal() + b.ordinal()) / 2;
    Difficulty::from_ordinal(ordinal).unwrap_or(Difficulty::Medium)
}

/// Category the pair will practise.
///
/// Equal categories win outright; a flexible side defers to a strict one;
/// two flexible sides draw uniformly between their categories, except that
/// a literal `any` never beats a concrete category.
pub fn negotiate_category<R: Rng + ?Sized>(a: &WaitEntry, b: &WaitEntry, rng: &mut R) -> String {
    if a.category.eq_ignore_ascii_case(&b.category) {
        return a.category.clone();
    }

    match (a.is_flexible(), b.is_flexible()) {
        (true, false) => b.category.clone(),
        (false, true) => a.category.clone(),
        _ => match (is_any(&a.category), is_any(&b.category)) {
            (true, false) => b.category.clone(),
            (false, true) => a.category.clone(),
            _ => {
                if rng.gen_bool(0.5) {
                    a.category.clone()
                } else {
                    b.category.clone()
                }
            }
        },
    }
}
