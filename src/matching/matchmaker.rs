//! Periodic matchmaking loop
//!
//! Each tick reads a FIFO snapshot of the queue and walks it oldest first.
//! For every entry not yet paired this tick, the first compatible counterpart
//! under the entry's current stage is claimed through the coordinator's
//! compare-and-pair. A failed claim means another instance got there first;
//! both entries are skipped until the next tick.

use crate::clock::Clock;
use crate::error::Result;
use crate::matching::coordinator::PendingMatchCoordinator;
use crate::metrics::MetricsCollector;
use crate::queue::compatibility::is_compatible;
use crate::queue::QueueManager;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const LOOP_NAME: &str = "matchmaking";

pub struct MatchmakingLoop {
    queue: Arc<QueueManager>,
    coordinator: Arc<PendingMatchCoordinator>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    metrics_collector: Arc<MetricsCollector>,
}

impl MatchmakingLoop {
    pub fn new(
        queue: Arc<QueueManager>,
        coordinator: Arc<PendingMatchCoordinator>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue,
            coordinator,
            clock,
            interval,
            metrics_collector,
        }
    }

    /// Run one matchmaking pass, returning the number of pending matches formed
    pub async fn tick(&self) -> Result<usize> {
        let entries = self.queue.waiting_entries().await?;
        if entries.len() < 2 {
            return Ok(0);
        }

        let now = self.clock.now();
        let mut claimed: HashSet<&str> = HashSet::new();
        let mut formed = 0;

        for candidate in &entries {
            if claimed.contains(candidate.user_id.as_str()) {
                continue;
            }

            let stage = self.queue.stage_of(candidate, now);
            let counterpart = entries.iter().find(|other| {
                !claimed.contains(other.user_id.as_str()) && is_compatible(candidate, other, stage)
            });

            let Some(counterpart) = counterpart else {
                continue;
            };

            // Either way, neither entry is reconsidered this tick
            claimed.insert(candidate.user_id.as_str());
            claimed.insert(counterpart.user_id.as_str());

            if self
                .coordinator
                .create_pending_match(candidate, counterpart, stage)
                .await?
                .is_some()
            {
                formed += 1;
            }
        }

        Ok(formed)
    }

    /// Tick on the configured interval until shutdown is signalled
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Matchmaking loop started ({}ms interval)",
            self.interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_tick().await,
                _ = shutdown.recv() => {
                    info!("Matchmaking loop received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn run_tick(&self) {
        let timer = self.metrics_collector.start_timer();
        let result = self.tick().await;
        let elapsed = timer.stop();

        match &result {
            Ok(formed) if *formed > 0 => {
                debug!("Matchmaking tick formed {} pending match(es)", formed)
            }
            Ok(_) => {}
            Err(e) => {
                // Next tick starts from a fresh snapshot
                warn!("Matchmaking tick failed: {}", e);
                self.metrics_collector.record_store_error(LOOP_NAME);
            }
        }
        self.metrics_collector
            .record_tick(LOOP_NAME, result.is_ok(), elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::matching::coordinator::PendingMatchConfig;
    use crate::matching::tokens::RoomTokenIssuer;
    use crate::notify::MockEventPublisher;
    use crate::questions::UnassignedQuestionBank;
    use crate::queue::StageThresholds;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};
    use crate::types::{Difficulty, JoinRequest, Membership, UserEloInfo};

    struct Harness {
        store: Arc<InMemoryCoordinationStore>,
        clock: ManualClock,
        queue: Arc<QueueManager>,
        matchmaker: MatchmakingLoop,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let clock = ManualClock::default();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            publisher.clone(),
            Arc::new(clock.clone()),
            StageThresholds::default(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(PendingMatchCoordinator::new(
            store.clone(),
            queue.clone(),
            publisher,
            Arc::new(RoomTokenIssuer::new("secret")),
            Arc::new(UnassignedQuestionBank),
            Arc::new(clock.clone()),
            PendingMatchConfig::default(),
            metrics.clone(),
        ));
        let matchmaker = MatchmakingLoop::new(
            queue.clone(),
            coordinator,
            Arc::new(clock.clone()),
            Duration::from_millis(10),
            metrics,
        );
        Harness {
            store,
            clock,
            queue,
            matchmaker,
        }
    }

    async fn join(h: &Harness, user: &str, category: &str, difficulty: Difficulty) {
        h.queue
            .enqueue(JoinRequest {
                user_id: user.to_string(),
                category: category.to_string(),
                difficulty,
                accept_any_category: false,
            })
            .await
            .unwrap();
        // Keep enqueue order strictly increasing
        h.clock.advance(chrono::Duration::milliseconds(1));
    }

    async fn is_pending(h: &Harness, user: &str) -> bool {
        matches!(
            h.store.membership(user).await.unwrap(),
            Some(Membership::Pending(_))
        )
    }

    #[tokio::test]
    async fn test_pairs_in_fifo_order() {
        let h = harness();
        join(&h, "a", "arrays", Difficulty::Easy).await;
        join(&h, "b", "arrays", Difficulty::Easy).await;
        join(&h, "c", "arrays", Difficulty::Easy).await;

        assert_eq!(h.matchmaker.tick().await.unwrap(), 1);
        assert!(is_pending(&h, "a").await);
        assert!(is_pending(&h, "b").await);
        assert_eq!(
            h.store.membership("c").await.unwrap(),
            Some(Membership::Queued)
        );
    }

    #[tokio::test]
    async fn test_each_user_paired_at_most_once_per_tick() {
        let h = harness();
        for user in ["a", "b", "c", "d", "e"] {
            join(&h, user, "graphs", Difficulty::Hard).await;
        }

        assert_eq!(h.matchmaker.tick().await.unwrap(), 2);
        assert_eq!(h.store.pending_matches().await.unwrap().len(), 2);
        assert_eq!(h.queue.waiting_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_elo_gap_relaxes_with_wait() {
        let h = harness();
        for (user, elo_rating) in [("strong", 1750.0), ("weak", 1500.0)] {
            h.store
                .set_rating(UserEloInfo {
                    user_id: user.to_string(),
                    elo_rating,
                    sessions_completed: 10,
                })
                .await;
        }
        join(&h, "strong", "arrays", Difficulty::Medium).await;
        join(&h, "weak", "arrays", Difficulty::Medium).await;

        // A 250 point gap fails the first two stages
        assert_eq!(h.matchmaker.tick().await.unwrap(), 0);
        h.clock.advance(chrono::Duration::seconds(20));
        assert_eq!(h.matchmaker.tick().await.unwrap(), 0);

        h.clock.advance(chrono::Duration::seconds(15));
        assert_eq!(h.matchmaker.tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_category_mismatch_never_pairs() {
        let h = harness();
        join(&h, "a", "arrays", Difficulty::Easy).await;
        join(&h, "b", "graphs", Difficulty::Easy).await;

        h.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(h.matchmaker.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        join(&h, "a", "arrays", Difficulty::Easy).await;
        join(&h, "b", "arrays", Difficulty::Easy).await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let matchmaker = Arc::new(h.matchmaker);
        let handle = {
            let matchmaker = matchmaker.clone();
            tokio::spawn(async move { matchmaker.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.store.pending_matches().await.unwrap().len(), 1);
    }
}
