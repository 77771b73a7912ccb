//! Rating update trigger
//!
//! Turns one session's telemetry into two rating updates: both users are
//! rated against each other's pre-session rating, both records are written
//! in one atomic step, and only then are the updates published. A session
//! is applied at most once; redelivered telemetry gets the original updates
//! back.

use crate::clock::Clock;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::notify::{notify_user, EventPublisher};
use crate::rating::engine::{rate_participant, RatingOutcome};
use crate::store::{CoordinationStore, RatingWrite};
use crate::types::{Difficulty, EloUpdate, MatchEvent, SessionMetrics, UserEloInfo};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct RatingUpdateTrigger {
    store: Arc<dyn CoordinationStore>,
    event_publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    rating_ttl: Duration,
    metrics_collector: Arc<MetricsCollector>,
}

impl RatingUpdateTrigger {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        event_publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        rating_ttl: Duration,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            event_publisher,
            clock,
            rating_ttl,
            metrics_collector,
        }
    }

    /// Rating record of a user, defaulting for users never rated
    pub async fn rating_of(&self, user_id: &str) -> Result<UserEloInfo> {
        Ok(self
            .store
            .get_elo(user_id)
            .await?
            .unwrap_or_else(|| UserEloInfo::new(user_id)))
    }

    /// Recompute and persist both participants' ratings for a finished session
    pub async fn process_session_metrics(&self, metrics: &SessionMetrics) -> Result<Vec<EloUpdate>> {
        Self::validate(metrics)?;
        let session_key = Self::session_key(metrics);

        let user1 = self.rating_of(&metrics.user1_id).await?;
        let user2 = self.rating_of(&metrics.user2_id).await?;

        let timer = self.metrics_collector.start_timer();
        let outcome1 = rate_participant(
            &user1,
            &user2,
            &metrics.user1_metrics,
            metrics.session_duration_sec,
            &metrics.difficulty,
        );
        let outcome2 = rate_participant(
            &user2,
            &user1,
            &metrics.user2_metrics,
            metrics.session_duration_sec,
            &metrics.difficulty,
        );
        self.metrics_collector
            .record_rating_calculation(timer.stop());

        let updated1 = UserEloInfo {
            user_id: user1.user_id.clone(),
            elo_rating: outcome1.new_rating,
            sessions_completed: user1.sessions_completed.saturating_add(1),
        };
        let updated2 = UserEloInfo {
            user_id: user2.user_id.clone(),
            elo_rating: outcome2.new_rating,
            sessions_completed: user2.sessions_completed.saturating_add(1),
        };
        let now = self.clock.now();
        let updates = vec![
            Self::to_update(&updated1.user_id, &outcome1, now),
            Self::to_update(&updated2.user_id, &outcome2, now),
        ];

        match self
            .store
            .record_session_ratings(
                &session_key,
                &updated1,
                &updated2,
                &updates,
                self.rating_ttl,
            )
            .await?
        {
            RatingWrite::Applied => {}
            RatingWrite::AlreadyApplied(previous) => {
                self.metrics_collector
                    .rating()
                    .duplicate_sessions_total
                    .inc();
                info!(
                    "Session {} for match {} was already rated - returning the original updates",
                    metrics.session_id, metrics.match_id
                );
                return Ok(previous);
            }
        }

        let difficulty_label = metrics
            .difficulty
            .parse::<Difficulty>()
            .map(|d| d.as_str())
            .unwrap_or("unknown");
        for update in &updates {
            self.metrics_collector
                .record_rating_update(update.change, update.engagement, difficulty_label);
            info!(
                "Rating updated for '{}' after match {}: {:.1} -> {:.1} ({:+.1}), opponent: {:.1}, engagement: {:.1}",
                update.user_id,
                metrics.match_id,
                update.old_rating,
                update.new_rating,
                update.change,
                update.opponent_elo,
                update.engagement
            );
        }

        for update in &updates {
            if let Err(e) = self.event_publisher.publish_elo_update(update.clone()).await {
                warn!(
                    "Failed to publish rating update for '{}': {}",
                    update.user_id, e
                );
            }
            notify_user(
                self.event_publisher.as_ref(),
                &update.user_id,
                MatchEvent::RatingUpdated {
                    update: update.clone(),
                },
                now,
            )
            .await;
        }

        debug!(
            "Processed session {} for match {}",
            metrics.session_id, metrics.match_id
        );
        Ok(updates)
    }

    /// Identity used to apply a session once
    fn session_key(metrics: &SessionMetrics) -> String {
        if metrics.session_id.trim().is_empty() {
            format!("match:{}", metrics.match_id)
        } else {
            metrics.session_id.clone()
        }
    }

    fn validate(metrics: &SessionMetrics) -> Result<()> {
        if metrics.session_id.trim().is_empty() && metrics.match_id.trim().is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Session metrics must carry a session or match id".to_string(),
            }
            .into());
        }
        if metrics.user1_id.trim().is_empty() || metrics.user2_id.trim().is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Session metrics must name both participants".to_string(),
            }
            .into());
        }
        if metrics.user1_id == metrics.user2_id {
            return Err(MatchmakingError::InvalidRequest {
                reason: format!(
                    "Session {} names '{}' as both participants",
                    metrics.session_id, metrics.user1_id
                ),
            }
            .into());
        }
        Ok(())
    }

    fn to_update(user_id: &str, outcome: &RatingOutcome, timestamp: DateTime<Utc>) -> EloUpdate {
        EloUpdate {
            user_id: user_id.to_string(),
            old_rating: outcome.old_rating,
            new_rating: outcome.new_rating,
            change: outcome.change(),
            opponent_elo: outcome.opponent_elo,
            engagement: outcome.engagement,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{error_kind, ErrorKind};
    use crate::notify::MockEventPublisher;
    use crate::store::InMemoryCoordinationStore;
    use crate::types::ParticipantMetrics;

    fn trigger() -> (
        RatingUpdateTrigger,
        Arc<InMemoryCoordinationStore>,
        Arc<MockEventPublisher>,
    ) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let trigger = RatingUpdateTrigger::new(
            store.clone(),
            publisher.clone(),
            Arc::new(ManualClock::default()),
            Duration::from_secs(90 * 24 * 60 * 60),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        (trigger, store, publisher)
    }

    fn session(difficulty: &str) -> SessionMetrics {
        SessionMetrics {
            session_id: "s1".to_string(),
            match_id: "m1".to_string(),
            user1_id: "alice".to_string(),
            user2_id: "bob".to_string(),
            difficulty: difficulty.to_string(),
            session_duration_sec: 900,
            user1_metrics: ParticipantMetrics {
                voice_used: true,
                voice_duration_sec: 420,
                code_changes: 25,
                messages_exchanged: 12,
            },
            user2_metrics: ParticipantMetrics::default(),
        }
    }

    #[tokio::test]
    async fn test_updates_both_users_symmetrically() {
        let (trigger, store, publisher) = trigger();

        let updates = trigger
            .process_session_metrics(&session("hard"))
            .await
            .unwrap();
        assert_eq!(updates.len(), 2);

        // Engaged user gains, idle user loses, both from 1500
        assert_eq!(updates[0].engagement, 100.0);
        assert!((updates[0].new_rating - 1516.0).abs() < 1e-9);
        assert_eq!(updates[1].opponent_elo, 1500.0);
        assert!(updates[1].change < 0.0);

        let alice = store.get_elo("alice").await.unwrap().unwrap();
        assert_eq!(alice.sessions_completed, 1);
        assert_eq!(alice.elo_rating, updates[0].new_rating);

        assert_eq!(publisher.elo_updates(), updates);
        assert_eq!(publisher.event_names_for("bob"), vec!["rating-updated"]);
    }

    #[tokio::test]
    async fn test_unknown_difficulty_rates_as_medium() {
        let (trigger, _, _) = trigger();
        let updates = trigger
            .process_session_metrics(&session("legendary"))
            .await
            .unwrap();
        assert_eq!(updates[0].engagement, 87.0);
    }

    #[tokio::test]
    async fn test_rejects_self_session() {
        let (trigger, store, _) = trigger();
        let mut metrics = session("easy");
        metrics.user2_id = "alice".to_string();

        let err = trigger.process_session_metrics(&metrics).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Invalid);
        assert!(store.get_elo("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redelivered_session_is_applied_once() {
        let (trigger, store, publisher) = trigger();

        let first = trigger
            .process_session_metrics(&session("medium"))
            .await
            .unwrap();
        let replay = trigger
            .process_session_metrics(&session("medium"))
            .await
            .unwrap();
        assert_eq!(replay, first);

        let alice = store.get_elo("alice").await.unwrap().unwrap();
        assert_eq!(alice.sessions_completed, 1);
        assert_eq!(alice.elo_rating, first[0].new_rating);
        // Only the first delivery is broadcast
        assert_eq!(publisher.elo_updates().len(), 2);

        // A different session between the same users is rated normally
        let mut next = session("medium");
        next.session_id = "s2".to_string();
        trigger.process_session_metrics(&next).await.unwrap();
        let alice = store.get_elo("alice").await.unwrap().unwrap();
        assert_eq!(alice.sessions_completed, 2);
    }

    #[tokio::test]
    async fn test_requires_session_identity() {
        let (trigger, _, _) = trigger();
        let mut metrics = session("easy");
        metrics.session_id = String::new();
        metrics.match_id = " ".to_string();

        let err = trigger.process_session_metrics(&metrics).await.unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_default_rating_for_new_users() {
        let (trigger, _, _) = trigger();
        let info = trigger.rating_of("nobody").await.unwrap();
        assert_eq!(info, UserEloInfo::new("nobody"));
    }
}
