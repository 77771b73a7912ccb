//! Engagement scoring from session telemetry
//!
//! The score is the sum of four banded components. Each band is a step
//! table, not an interpolation; downstream dashboards read these exact
//! values.
//!
//! | component | range | bands |
//! |-----------|-------|-------|
//! | voice     | 0-30  | 10 for using voice, plus 5/10/15/20 by voice-time ratio (>0, >=0.2, >=0.4, >=0.6) |
//! | code      | 0-30  | 1-4: 5, 5-9: 15, 10-19: 20, 20-49: 25, 50+: 30 |
//! | duration  | 0-30  | <1m: 0, <5m: 5, <10m: 15, 10-45m: 30, <=60m: 20, longer: 10 |
//! | messages  | 0-10  | 1-4: 2, 5-9: 4, 10-19: 7, 20+: 10 |

use crate::types::ParticipantMetrics;

/// Highest score any session can produce
pub const MAX_ENGAGEMENT: f64 = 100.0;

/// Voice usage band
pub fn voice_score(voice_used: bool, voice_duration_sec: u64, session_duration_sec: u64) -> f64 {
    if !voice_used {
        return 0.0;
    }

    let ratio = if session_duration_sec == 0 {
        0.0
    } else {
        voice_duration_sec as f64 / session_duration_sec as f64
    };

    let bonus = if ratio >= 0.6 {
        20.0
    } else if ratio >= 0.4 {
        15.0
    } else if ratio >= 0.2 {
        10.0
    } else if ratio > 0.0 {
        5.0
    } else {
        0.0
    };

    10.0 + bonus
}

/// Code edit band
pub fn code_score(code_changes: u32) -> f64 {
    match code_changes {
        0 => 0.0,
        1..=4 => 5.0,
        5..=9 => 15.0,
        10..=19 => 20.0,
        20..=49 => 25.0,
        _ => 30.0,
    }
}

/// Session length band, peaking between ten and forty-five minutes
pub fn duration_score(session_duration_sec: u64) -> f64 {
    match session_duration_sec {
        0..=59 => 0.0,
        60..=299 => 5.0,
        300..=599 => 15.0,
        600..=2700 => 30.0,
        2701..=3600 => 20.0,
        _ => 10.0,
    }
}

/// Chat activity band
pub fn message_score(messages_exchanged: u32) -> f64 {
    match messages_exchanged {
        0 => 0.0,
        1..=4 => 2.0,
        5..=9 => 4.0,
        10..=19 => 7.0,
        _ => 10.0,
    }
}

/// Raw engagement score (0-100) of one participant
pub fn engagement_score(metrics: &ParticipantMetrics, session_duration_sec: u64) -> f64 {
    voice_score(
        metrics.voice_used,
        metrics.voice_duration_sec,
        session_duration_sec,
    ) + code_score(metrics.code_changes)
        + duration_score(session_duration_sec)
        + message_score(metrics.messages_exchanged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_session_scores_87() {
        let metrics = ParticipantMetrics {
            voice_used: true,
            voice_duration_sec: 420,
            code_changes: 25,
            messages_exchanged: 12,
        };
        assert_eq!(voice_score(true, 420, 900), 25.0);
        assert_eq!(engagement_score(&metrics, 900), 87.0);
    }

    #[test]
    fn test_voice_bands() {
        assert_eq!(voice_score(false, 900, 900), 0.0);
        assert_eq!(voice_score(true, 0, 900), 10.0);
        assert_eq!(voice_score(true, 1, 900), 15.0);
        assert_eq!(voice_score(true, 180, 900), 20.0);
        assert_eq!(voice_score(true, 540, 900), 30.0);
        // Zero-length sessions cannot produce a ratio
        assert_eq!(voice_score(true, 60, 0), 10.0);
    }

    #[test]
    fn test_band_edges() {
        assert_eq!(code_score(0), 0.0);
        assert_eq!(code_score(4), 5.0);
        assert_eq!(code_score(5), 15.0);
        assert_eq!(code_score(10), 20.0);
        assert_eq!(code_score(50), 30.0);

        assert_eq!(duration_score(59), 0.0);
        assert_eq!(duration_score(60), 5.0);
        assert_eq!(duration_score(300), 15.0);
        assert_eq!(duration_score(600), 30.0);
        assert_eq!(duration_score(2700), 30.0);
        assert_eq!(duration_score(2701), 20.0);
        assert_eq!(duration_score(3600), 20.0);
        assert_eq!(duration_score(3601), 10.0);

        assert_eq!(message_score(0), 0.0);
        assert_eq!(message_score(4), 2.0);
        assert_eq!(message_score(5), 4.0);
        assert_eq!(message_score(19), 7.0);
        assert_eq!(message_score(20), 10.0);
    }

    #[test]
    fn test_maximum_is_one_hundred() {
        let metrics = ParticipantMetrics {
            voice_used: true,
            voice_duration_sec: 1200,
            code_changes: 100,
            messages_exchanged: 100,
        };
        assert_eq!(engagement_score(&metrics, 1200), MAX_ENGAGEMENT);
    }
}
