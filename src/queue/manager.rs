//! Matchmaking queue manager
//!
//! Inserts and removes wait entries against the coordination store and answers
//! compatibility queries over queue snapshots.

use crate::clock::Clock;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::notify::{notify_user, EventPublisher};
use crate::queue::compatibility::{is_compatible, StageThresholds};
use crate::store::{CoordinationStore, EnqueueResult};
use crate::types::{
    JoinRequest, MatchEvent, Membership, PartyPreference, WaitEntry, DEFAULT_ELO,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Point-in-time view of the queue for stats and gauges
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub waiting: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_stage: BTreeMap<u8, usize>,
    pub oldest_wait_seconds: Option<f64>,
}

/// Queue manager backed by the shared coordination store
pub struct QueueManager {
    store: Arc<dyn CoordinationStore>,
    event_publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    thresholds: StageThresholds,
    metrics_collector: Arc<MetricsCollector>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        event_publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        thresholds: StageThresholds,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            event_publisher,
            clock,
            thresholds,
            metrics_collector,
        }
    }

    pub fn thresholds(&self) -> &StageThresholds {
        &self.thresholds
    }

    /// Add a user to the queue.
    ///
    /// Fails with `AlreadyQueued` if the user is waiting already, or
    /// `AlreadyInMatch` if they hold a pending match or a room.
    pub async fn enqueue(&self, request: JoinRequest) -> Result<WaitEntry> {
        Self::validate_request(&request)?;

        let preference = PartyPreference {
            category: request.category.trim().to_string(),
            difficulty: request.difficulty,
            accept_any_category: request.accept_any_category,
        };

        let entry = self.build_entry(&request.user_id, &preference).await?;
        match self.store.insert_wait_entry(&entry).await? {
            EnqueueResult::Inserted => {}
            EnqueueResult::Existing(membership) => {
                self.metrics_collector.record_join(false);
                debug!(
                    "Rejected join for user '{}' - existing membership: {}",
                    request.user_id, membership
                );
                return Err(Self::conflict(&request.user_id, &membership).into());
            }
        }

        self.metrics_collector.record_join(true);
        info!(
            "User '{}' queued - category: '{}', difficulty: {}, elo: {:.0}, flexible: {}",
            entry.user_id,
            entry.category,
            entry.difficulty,
            entry.elo_rating,
            entry.accept_any_category
        );

        notify_user(
            self.event_publisher.as_ref(),
            &entry.user_id,
            MatchEvent::Queued {
                category: entry.category.clone(),
                difficulty: entry.difficulty,
            },
            entry.enqueued_at,
        )
        .await;

        Ok(entry)
    }

    /// Put a user back in the queue with their original preferences and a
    /// fresh wait clock. Returns false if they already hold a membership.
    pub async fn requeue(&self, user_id: &str, preference: &PartyPreference) -> Result<bool> {
        let entry = self.build_entry(user_id, preference).await?;
        match self.store.insert_wait_entry(&entry).await? {
            EnqueueResult::Inserted => {
                info!(
                    "User '{}' requeued - category: '{}', difficulty: {}",
                    user_id, entry.category, entry.difficulty
                );
                Ok(true)
            }
            EnqueueResult::Existing(membership) => {
                debug!(
                    "Skipped requeue of user '{}' - existing membership: {}",
                    user_id, membership
                );
                Ok(false)
            }
        }
    }

    /// Remove a user's wait entry. Absent entries are a no-op.
    pub async fn cancel(&self, user_id: &str) -> Result<bool> {
        let removed = self.store.remove_wait_entry(user_id).await?;
        if removed {
            self.metrics_collector.queue().cancels_total.inc();
            info!("User '{}' left the queue", user_id);
        } else {
            debug!("Cancel for user '{}' ignored - not queued", user_id);
        }
        Ok(removed)
    }

    /// Current queue, oldest entry first
    pub async fn waiting_entries(&self) -> Result<Vec<WaitEntry>> {
        self.store.wait_entries().await
    }

    /// Best compatible counterpart for `candidate` from the current queue
    pub async fn scan_compatible(&self, candidate: &WaitEntry) -> Result<Option<WaitEntry>> {
        let entries = self.store.wait_entries().await?;
        let now = self.clock.now();
        Ok(self.find_compatible(candidate, &entries, now).cloned())
    }

    /// First compatible entry in FIFO order, using the candidate's stage
    pub fn find_compatible<'a>(
        &self,
        candidate: &WaitEntry,
        entries: &'a [WaitEntry],
        now: DateTime<Utc>,
    ) -> Option<&'a WaitEntry> {
        let stage = self.stage_of(candidate, now);
        entries
            .iter()
            .find(|other| is_compatible(candidate, other, stage))
    }

    /// Stage an entry has reached at `now`
    pub fn stage_of(&self, entry: &WaitEntry, now: DateTime<Utc>) -> u8 {
        self.thresholds.stage_for(entry.wait_duration(now))
    }

    pub async fn membership(&self, user_id: &str) -> Result<Option<Membership>> {
        self.store.membership(user_id).await
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let entries = self.store.wait_entries().await?;
        let now = self.clock.now();

        let mut snapshot = QueueSnapshot {
            waiting: entries.len(),
            ..QueueSnapshot::default()
        };
        for entry in &entries {
            *snapshot
                .by_category
                .entry(entry.category.to_lowercase())
                .or_insert(0) += 1;
            *snapshot
                .by_stage
                .entry(self.stage_of(entry, now))
                .or_insert(0) += 1;
        }
        snapshot.oldest_wait_seconds = entries
            .first()
            .map(|entry| entry.wait_duration(now).as_secs_f64());

        self.metrics_collector
            .queue()
            .players_waiting
            .set(snapshot.waiting as i64);
        Ok(snapshot)
    }

    async fn build_entry(&self, user_id: &str, preference: &PartyPreference) -> Result<WaitEntry> {
        let elo_rating = self
            .store
            .get_elo(user_id)
            .await?
            .map(|info| info.elo_rating)
            .unwrap_or(DEFAULT_ELO);

        Ok(WaitEntry {
            user_id: user_id.to_string(),
            category: preference.category.clone(),
            difficulty: preference.difficulty,
            accept_any_category: preference.accept_any_category,
            elo_rating,
            enqueued_at: self.clock.now(),
        })
    }

    fn validate_request(request: &JoinRequest) -> Result<()> {
        if request.user_id.trim().is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "User ID cannot be empty".to_string(),
            }
            .into());
        }

        if request.category.trim().is_empty() {
            return Err(MatchmakingError::InvalidRequest {
                reason: "Category cannot be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }

    fn conflict(user_id: &str, membership: &Membership) -> MatchmakingError {
        match membership {
            Membership::Queued => MatchmakingError::AlreadyQueued {
                user_id: user_id.to_string(),
            },
            Membership::Pending(_) | Membership::Room(_) => MatchmakingError::AlreadyInMatch {
                user_id: user_id.to_string(),
            },
        }
    }
}
