//! Utility functions for the matchmaking service

use uuid::Uuid;

use crate::types::MatchId;

/// Generate a new unique match ID
pub fn generate_match_id() -> MatchId {
    Uuid::new_v4().to_string()
}

/// Generate an ID for a locally held event connection
pub fn generate_connection_id() -> Uuid {
    Uuid::new_v4()
}

/// Calculate the absolute difference between two ratings
pub fn rating_difference(rating1: f64, rating2: f64) -> f64 {
    (rating1 - rating2).abs()
}

/// Check if two ratings are within the given tolerance
pub fn ratings_within_tolerance(rating1: f64, rating2: f64, tolerance: f64) -> bool {
    rating_difference(rating1, rating2) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_ids() {
        let id1 = generate_match_id();
        let id2 = generate_match_id();
        assert_ne!(id1, id2);
        assert!(Uuid::parse_str(&id1).is_ok());

        assert_ne!(generate_connection_id(), generate_connection_id());
    }

    #[test]
    fn test_rating_difference() {
        assert_eq!(rating_difference(1500.0, 1400.0), 100.0);
        assert_eq!(rating_difference(1400.0, 1500.0), 100.0);
        assert_eq!(rating_difference(1500.0, 1500.0), 0.0);
    }

    #[test]
    fn test_ratings_within_tolerance() {
        assert!(ratings_within_tolerance(1500.0, 1400.0, 100.0));
        assert!(!ratings_within_tolerance(1500.0, 1399.0, 100.0));
        assert!(ratings_within_tolerance(1500.0, 1500.0, 0.0));
    }
}
