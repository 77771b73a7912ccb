//! Matchmaking queue
//!
//! The queue manager owns wait entries; the compatibility module decides
//! which pairs of entries may be matched.

pub mod compatibility;
pub mod manager;

pub use compatibility::{
    check_elo_compatibility, negotiate_category, negotiate_difficulty, StageThresholds,
};
pub use manager::{QueueManager, QueueSnapshot};
