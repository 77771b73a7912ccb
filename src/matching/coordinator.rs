//! Pending match coordinator
//!
//! Owns the lifecycle of a pending match: creation from two compatible wait
//! entries, the two-party handshake, promotion to a room, and dissolution on
//! reject, expiry, or disconnect.
//!
//! ```text
//! created --(both accept)--> room
//! created --(reject | expiry)--> dissolved
//! ```
//!
//! A match whose two confirmations were recorded but whose promotion never
//! ran is promoted by the next handshake or expiration sweep that finds it.

use crate::clock::Clock;
use crate::error::{MatchmakingError, Result};
use crate::matching::tokens::RoomTokenIssuer;
use crate::metrics::MetricsCollector;
use crate::notify::{notify_user, EventPublisher};
use crate::queue::compatibility::{negotiate_category, negotiate_difficulty};
use crate::queue::QueueManager;
use crate::questions::QuestionBank;
use crate::store::CoordinationStore;
use crate::types::{
    CheckStatus, HandshakeOutcome, MatchEvent, Membership, PendingMatch, Role, RoomInfo,
    RoomStatus, WaitEntry,
};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and policy for pending matches
#[derive(Debug, Clone)]
pub struct PendingMatchConfig {
    /// Handshake window
    pub pending_ttl: Duration,
    /// Lifetime of a confirmed room and its tokens
    pub room_ttl: Duration,
    /// Extra retention of pending records past their deadline so the
    /// expiration loop can still reclaim them
    pub retention_grace: Duration,
    /// Whether a party who never confirmed is put back in the queue on expiry
    pub requeue_unconfirmed_on_expiry: bool,
}

impl Default for PendingMatchConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Duration::from_secs(30),
            room_ttl: Duration::from_secs(2 * 60 * 60),
            retention_grace: Duration::from_secs(300),
            requeue_unconfirmed_on_expiry: false,
        }
    }
}

pub struct PendingMatchCoordinator {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<QueueManager>,
    event_publisher: Arc<dyn EventPublisher>,
    tokens: Arc<RoomTokenIssuer>,
    question_bank: Arc<dyn QuestionBank>,
    clock: Arc<dyn Clock>,
    config: PendingMatchConfig,
    metrics_collector: Arc<MetricsCollector>,
}

impl PendingMatchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<QueueManager>,
        event_publisher: Arc<dyn EventPublisher>,
        tokens: Arc<RoomTokenIssuer>,
        question_bank: Arc<dyn QuestionBank>,
        clock: Arc<dyn Clock>,
        config: PendingMatchConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            queue,
            event_publisher,
            tokens,
            question_bank,
            clock,
            config,
            metrics_collector,
        }
    }

    pub fn config(&self) -> &PendingMatchConfig {
        &self.config
    }

    /// Atomically turn two queued entries into a pending match.
    ///
    /// Returns `None` when either entry changed or was taken by another
    /// instance since the snapshot was read.
    pub async fn create_pending_match(
        &self,
        first: &WaitEntry,
        second: &WaitEntry,
        stage: u8,
    ) -> Result<Option<PendingMatch>> {
        let now = self.clock.now();
        let match_id = generate_match_id();
        let category = negotiate_category(first, second, &mut rand::thread_rng());
        let difficulty = negotiate_difficulty(first.difficulty, second.difficulty);
        let expires_at = now + to_chrono(self.config.pending_ttl)?;

        let pending = PendingMatch {
            match_id: match_id.clone(),
            user1: first.user_id.clone(),
            user2: second.user_id.clone(),
            category,
            difficulty,
            user1_preference: first.preference(),
            user2_preference: second.preference(),
            room_token1: self
                .tokens
                .mint(&first.user_id, &match_id, now, self.config.pending_ttl)?,
            room_token2: self
                .tokens
                .mint(&second.user_id, &match_id, now, self.config.pending_ttl)?,
            handshakes: Default::default(),
            created_at: now,
            expires_at,
        };

        let retain = self.config.pending_ttl + self.config.retention_grace;
        if !self
            .store
            .create_pending_match(first, second, &pending, retain)
            .await?
        {
            debug!(
                "Pairing '{}' with '{}' skipped - entries changed concurrently",
                first.user_id, second.user_id
            );
            return Ok(None);
        }

        let waited = first.wait_duration(now).max(second.wait_duration(now));
        self.metrics_collector
            .record_pending_created(difficulty, stage, waited);
        info!(
            "Pending match {} created - users: '{}' & '{}', category: '{}', difficulty: {}, stage: {}, elo: {:.0}/{:.0}",
            match_id,
            pending.user1,
            pending.user2,
            pending.category,
            pending.difficulty,
            stage,
            first.elo_rating,
            second.elo_rating
        );

        for role in [Role::User1, Role::User2] {
            notify_user(
                self.event_publisher.as_ref(),
                pending.user(role),
                MatchEvent::MatchFound {
                    match_id: match_id.clone(),
                    opponent_id: pending.user(role.other()).clone(),
                    category: pending.category.clone(),
                    difficulty: pending.difficulty,
                    token: pending.token(role).to_string(),
                    expires_at,
                },
                now,
            )
            .await;
        }

        Ok(Some(pending))
    }

    /// Record a user's accept or reject for a pending match
    pub async fn handshake(
        &self,
        user_id: &str,
        match_id: &str,
        accept: bool,
    ) -> Result<HandshakeOutcome> {
        let pending = match self.store.get_pending_match(match_id).await? {
            Some(pending) => pending,
            None => {
                self.metrics_collector.record_handshake("not_found");
                return Err(MatchmakingError::MatchNotFound {
                    match_id: match_id.to_string(),
                }
                .into());
            }
        };

        let role = match pending.role_of(user_id) {
            Some(role) => role,
            None => {
                self.metrics_collector.record_handshake("not_found");
                return Err(MatchmakingError::NotAParty {
                    user_id: user_id.to_string(),
                    match_id: match_id.to_string(),
                }
                .into());
            }
        };

        let now = self.clock.now();
        if pending.handshakes.both_confirmed() {
            info!(
                "Match {} was confirmed by both parties - completing promotion for '{}'",
                pending.match_id, user_id
            );
            return self.promote(&pending, now).await;
        }

        if pending.is_expired(now) {
            // The sweep has not reached it yet
            self.expire_match(&pending).await?;
            self.metrics_collector.record_handshake("expired");
            return Err(MatchmakingError::MatchExpired {
                match_id: match_id.to_string(),
            }
            .into());
        }

        if accept {
            self.accept(&pending, role, now).await
        } else {
            self.reject(&pending, role, now).await
        }
    }

    async fn reject(
        &self,
        pending: &PendingMatch,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<HandshakeOutcome> {
        let removed = match self.store.dissolve_pending_match(pending, false).await? {
            Some(removed) => removed,
            None => {
                return Err(MatchmakingError::MatchNotFound {
                    match_id: pending.match_id.clone(),
                }
                .into())
            }
        };

        let other = role.other();
        let other_user = removed.user(other);
        let requeued = self
            .queue
            .requeue(other_user, removed.preference(other))
            .await?;

        self.metrics_collector.record_handshake("rejected");
        info!(
            "Pending match {} rejected by '{}' - '{}' requeued: {}",
            removed.match_id,
            removed.user(role),
            other_user,
            requeued
        );

        notify_user(
            self.event_publisher.as_ref(),
            other_user,
            MatchEvent::MatchCancelled {
                match_id: removed.match_id.clone(),
                requeued,
            },
            now,
        )
        .await;

        Ok(HandshakeOutcome::Rejected)
    }

    async fn accept(
        &self,
        pending: &PendingMatch,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<HandshakeOutcome> {
        let handshakes = match self.store.confirm_handshake(&pending.match_id, role).await? {
            Some(handshakes) => handshakes,
            None => {
                return Err(MatchmakingError::MatchNotFound {
                    match_id: pending.match_id.clone(),
                }
                .into())
            }
        };

        if !handshakes.both_confirmed() {
            self.metrics_collector.record_handshake("accepted");
            info!(
                "User '{}' accepted pending match {} - waiting for '{}'",
                pending.user(role),
                pending.match_id,
                pending.user(role.other())
            );
            return Ok(HandshakeOutcome::Waiting);
        }

        self.promote(pending, now).await
    }

    async fn promote(&self, pending: &PendingMatch, now: DateTime<Utc>) -> Result<HandshakeOutcome> {
        let question_id = match self
            .question_bank
            .pick_question(&pending.category, pending.difficulty)
            .await
        {
            Ok(question_id) => question_id,
            Err(e) => {
                warn!(
                    "Question lookup failed for match {}: {}. Room opens without a question",
                    pending.match_id, e
                );
                None
            }
        };

        let room_ttl = self.config.room_ttl;
        let room = RoomInfo {
            match_id: pending.match_id.clone(),
            user1: pending.user1.clone(),
            user2: pending.user2.clone(),
            category: pending.category.clone(),
            difficulty: pending.difficulty,
            status: RoomStatus::Ready,
            token1: self
                .tokens
                .mint(&pending.user1, &pending.match_id, now, room_ttl)?,
            token2: self
                .tokens
                .mint(&pending.user2, &pending.match_id, now, room_ttl)?,
            question_id,
            created_at: now,
        };

        if !self
            .store
            .promote_pending_match(&pending.match_id, &room, room_ttl)
            .await?
        {
            // The other party's confirmation promoted it first
            debug!(
                "Promotion of match {} already performed elsewhere",
                pending.match_id
            );
            self.metrics_collector.record_handshake("accepted");
            return match self.store.get_room(&pending.match_id).await? {
                Some(room) => Ok(HandshakeOutcome::RoomReady(room)),
                None => Ok(HandshakeOutcome::Waiting),
            };
        }

        self.metrics_collector.record_handshake("room_ready");
        self.metrics_collector.matches().rooms_ready_total.inc();
        info!(
            "Room {} ready - users: '{}' & '{}', category: '{}', difficulty: {}",
            room.match_id, room.user1, room.user2, room.category, room.difficulty
        );

        for role in [Role::User1, Role::User2] {
            notify_user(
                self.event_publisher.as_ref(),
                pending.user(role),
                MatchEvent::RoomReady {
                    match_id: room.match_id.clone(),
                    opponent_id: room.opponent(role).clone(),
                    category: room.category.clone(),
                    difficulty: room.difficulty,
                    token: room.token(role).to_string(),
                    question_id: room.question_id.clone(),
                },
                now,
            )
            .await;
        }

        Ok(HandshakeOutcome::RoomReady(room))
    }

    /// Reclaim one pending match past its deadline.
    ///
    /// Confirmed parties go back to the queue; unconfirmed parties only when
    /// configured to. Returns false if the match was already gone or has been
    /// confirmed by both parties.
    pub async fn expire_match(&self, pending: &PendingMatch) -> Result<bool> {
        let removed = match self.store.dissolve_pending_match(pending, true).await? {
            Some(removed) => removed,
            None => return Ok(false),
        };

        let now = self.clock.now();
        let mut requeued_count = 0;
        for role in [Role::User1, Role::User2] {
            let user_id = removed.user(role);
            let confirmed = removed.handshakes.is_confirmed(role);
            let requeued = if confirmed || self.config.requeue_unconfirmed_on_expiry {
                self.queue.requeue(user_id, removed.preference(role)).await?
            } else {
                false
            };
            if requeued {
                requeued_count += 1;
            }

            debug!(
                "Expired match {} - user '{}' confirmed: {}, requeued: {}",
                removed.match_id, user_id, confirmed, requeued
            );
            notify_user(
                self.event_publisher.as_ref(),
                user_id,
                MatchEvent::MatchExpired {
                    match_id: removed.match_id.clone(),
                    requeued,
                },
                now,
            )
            .await;
        }

        self.metrics_collector
            .record_expiry(requeued_count, 2 - requeued_count);
        info!(
            "Pending match {} expired with {} confirmation(s) - {} user(s) requeued",
            removed.match_id,
            removed.handshakes.confirmed_count(),
            requeued_count
        );
        Ok(true)
    }

    /// Resolve every pending match past its deadline.
    ///
    /// Incomplete matches are expired; matches confirmed by both parties are
    /// promoted. Returns how many matches were resolved.
    pub async fn expire_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let pending = self.store.pending_matches().await?;
        self.metrics_collector
            .matches()
            .pending_matches
            .set(pending.len() as i64);

        let mut resolved = 0;
        for candidate in pending.iter().filter(|p| p.is_expired(now)) {
            if candidate.handshakes.both_confirmed() {
                warn!(
                    "Match {} stalled after both confirmations - promoting",
                    candidate.match_id
                );
                if let HandshakeOutcome::RoomReady(_) = self.promote(candidate, now).await? {
                    resolved += 1;
                }
            } else if self.expire_match(candidate).await? {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Current matchmaking state of a user, derived from durable state only
    pub async fn check(&self, user_id: &str) -> Result<CheckStatus> {
        let membership = match self.store.membership(user_id).await? {
            Some(membership) => membership,
            None => return Ok(CheckStatus::default()),
        };

        let status = match membership {
            Membership::Queued => {
                let entry = self
                    .queue
                    .waiting_entries()
                    .await?
                    .into_iter()
                    .find(|entry| entry.user_id == user_id);
                CheckStatus {
                    queued: true,
                    category: entry.as_ref().map(|e| e.category.clone()),
                    difficulty: entry.as_ref().map(|e| e.difficulty),
                    ..CheckStatus::default()
                }
            }
            Membership::Pending(match_id) => match self.store.get_pending_match(&match_id).await? {
                Some(pending) => match pending.role_of(user_id) {
                    Some(role) => CheckStatus {
                        pending: true,
                        room_id: Some(pending.match_id.clone()),
                        category: Some(pending.category.clone()),
                        difficulty: Some(pending.difficulty),
                        token: Some(pending.token(role).to_string()),
                        expires_at: Some(pending.expires_at),
                        ..CheckStatus::default()
                    },
                    None => CheckStatus::default(),
                },
                None => CheckStatus::default(),
            },
            Membership::Room(match_id) => match self.store.get_room(&match_id).await? {
                Some(room) => match room.role_of(user_id) {
                    Some(role) => CheckStatus {
                        in_room: true,
                        room_id: Some(room.match_id.clone()),
                        category: Some(room.category.clone()),
                        difficulty: Some(room.difficulty),
                        token: Some(room.token(role).to_string()),
                        ..CheckStatus::default()
                    },
                    None => CheckStatus::default(),
                },
                None => CheckStatus::default(),
            },
        };
        Ok(status)
    }

    /// End a session room on behalf of one of its parties
    pub async fn finish_room(&self, user_id: &str, match_id: &str) -> Result<RoomInfo> {
        let room = match self.store.get_room(match_id).await? {
            Some(room) => room,
            None => {
                return Err(MatchmakingError::MatchNotFound {
                    match_id: match_id.to_string(),
                }
                .into())
            }
        };
        if room.role_of(user_id).is_none() {
            return Err(MatchmakingError::NotAParty {
                user_id: user_id.to_string(),
                match_id: match_id.to_string(),
            }
            .into());
        }

        match self.store.finish_room(&room.match_id).await? {
            Some(room) => {
                self.metrics_collector.matches().rooms_finished_total.inc();
                info!(
                    "Room {} finished by '{}' - users: '{}' & '{}'",
                    room.match_id, user_id, room.user1, room.user2
                );
                Ok(room)
            }
            None => Err(MatchmakingError::MatchNotFound {
                match_id: match_id.to_string(),
            }
            .into()),
        }
    }

    /// Treat a lost connection as cancel (queued) or reject (pending)
    pub async fn handle_disconnect(&self, user_id: &str) -> Result<()> {
        match self.store.membership(user_id).await? {
            Some(Membership::Queued) => {
                self.queue.cancel(user_id).await?;
            }
            Some(Membership::Pending(match_id)) => {
                match self.handshake(user_id, &match_id, false).await {
                    Ok(_) => info!(
                        "User '{}' disconnected - pending match {} dissolved",
                        user_id, match_id
                    ),
                    Err(e) => match crate::error::error_kind(&e) {
                        crate::error::ErrorKind::NotFound | crate::error::ErrorKind::Expired => {
                            debug!(
                                "Disconnect of '{}' raced with match {} ending: {}",
                                user_id, match_id, e
                            )
                        }
                        _ => return Err(e),
                    },
                }
            }
            Some(Membership::Room(_)) | None => {}
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|e| {
        MatchmakingError::InvalidRequest {
            reason: format!("Duration out of range: {}", e),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{error_kind, ErrorKind};
    use crate::notify::MockEventPublisher;
    use crate::queue::StageThresholds;
    use crate::questions::{MockQuestionBank, UnassignedQuestionBank};
    use crate::store::InMemoryCoordinationStore;
    use crate::types::{Difficulty, JoinRequest};

    struct Harness {
        store: Arc<InMemoryCoordinationStore>,
        publisher: Arc<MockEventPublisher>,
        clock: ManualClock,
        queue: Arc<QueueManager>,
        coordinator: PendingMatchCoordinator,
    }

    fn harness_with(question_bank: Arc<dyn QuestionBank>, config: PendingMatchConfig) -> Harness {
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
        let coordinator = PendingMatchCoordinator::new(
            store.clone(),
            queue.clone(),
            publisher.clone(),
            Arc::new(RoomTokenIssuer::new("secret")),
            question_bank,
            Arc::new(clock.clone()),
            config,
            metrics,
        );
        Harness {
            store,
            publisher,
            clock,
            queue,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(UnassignedQuestionBank),
            PendingMatchConfig::default(),
        )
    }

    async fn paired(h: &Harness) -> PendingMatch {
        let mut entries = Vec::new();
        for user in ["alice", "bob"] {
            entries.push(
                h.queue
                    .enqueue(JoinRequest {
                        user_id: user.to_string(),
                        category: "arrays".to_string(),
                        difficulty: Difficulty::Medium,
                        accept_any_category: false,
                    })
                    .await
                    .unwrap(),
            );
        }
        h.coordinator
            .create_pending_match(&entries[0], &entries[1], 1)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_both_accept_promotes_room() {
        let h = harness();
        let pending = paired(&h).await;

        let first = h
            .coordinator
            .handshake("alice", &pending.match_id, true)
            .await
            .unwrap();
        assert_eq!(first, HandshakeOutcome::Waiting);

        let second = h
            .coordinator
            .handshake("bob", &pending.match_id, true)
            .await
            .unwrap();
        let room = match second {
            HandshakeOutcome::RoomReady(room) => room,
            other => panic!("expected room, got {:?}", other),
        };
        assert_eq!(room.status, RoomStatus::Ready);

        assert!(h
            .store
            .get_pending_match(&pending.match_id)
            .await
            .unwrap()
            .is_none());
        let status = h.coordinator.check("alice").await.unwrap();
        assert!(status.in_room);
        assert_eq!(status.token.as_deref(), Some(room.token1.as_str()));
        assert_eq!(
            h.publisher.event_names_for("bob"),
            vec!["queued", "match-found", "room-ready"]
        );
    }

    #[tokio::test]
    async fn test_reject_requeues_other_party() {
        let h = harness();
        let pending = paired(&h).await;

        let outcome = h
            .coordinator
            .handshake("alice", &pending.match_id, false)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Rejected);

        assert_eq!(
            h.store.membership("bob").await.unwrap(),
            Some(Membership::Queued)
        );
        assert_eq!(h.store.membership("alice").await.unwrap(), None);
        assert_eq!(
            h.publisher.event_names_for("bob").last(),
            Some(&"match-cancelled")
        );

        // Handshake after dissolution reports not found
        let err = h
            .coordinator
            .handshake("alice", &pending.match_id, true)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_outsider_cannot_handshake() {
        let h = harness();
        let pending = paired(&h).await;

        let err = h
            .coordinator
            .handshake("mallory", &pending.match_id, true)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_late_handshake_expires_lazily() {
        let h = harness();
        let pending = paired(&h).await;
        h.coordinator
            .handshake("alice", &pending.match_id, true)
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::seconds(31));
        let err = h
            .coordinator
            .handshake("bob", &pending.match_id, true)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::Expired);

        // Alice confirmed, so she is back in the queue; Bob is not
        assert_eq!(
            h.store.membership("alice").await.unwrap(),
            Some(Membership::Queued)
        );
        assert_eq!(h.store.membership("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry_policy_can_requeue_unconfirmed() {
        let config = PendingMatchConfig {
            requeue_unconfirmed_on_expiry: true,
            ..PendingMatchConfig::default()
        };
        let h = harness_with(Arc::new(UnassignedQuestionBank), config);
        let pending = paired(&h).await;

        h.clock.advance(chrono::Duration::seconds(31));
        assert_eq!(h.coordinator.expire_due().await.unwrap(), 1);
        assert_eq!(
            h.store.membership("bob").await.unwrap(),
            Some(Membership::Queued)
        );
        // Already reclaimed
        assert!(!h.coordinator.expire_match(&pending).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_promotes_stalled_confirmation() {
        let h = harness();
        let pending = paired(&h).await;
        // Both flags recorded, but the promoting instance never ran
        h.store
            .confirm_handshake(&pending.match_id, Role::User1)
            .await
            .unwrap();
        h.store
            .confirm_handshake(&pending.match_id, Role::User2)
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::hours(1));
        assert_eq!(h.coordinator.expire_due().await.unwrap(), 1);

        assert!(h
            .store
            .get_pending_match(&pending.match_id)
            .await
            .unwrap()
            .is_none());
        assert!(h.coordinator.check("alice").await.unwrap().in_room);
        assert_eq!(
            h.publisher.event_names_for("bob").last(),
            Some(&"room-ready")
        );

        h.coordinator
            .finish_room("alice", &pending.match_id)
            .await
            .unwrap();
        h.queue
            .enqueue(JoinRequest {
                user_id: "alice".to_string(),
                category: "arrays".to_string(),
                difficulty: Difficulty::Easy,
                accept_any_category: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_handshake_completes_stalled_confirmation() {
        let h = harness();
        let pending = paired(&h).await;
        for role in [Role::User1, Role::User2] {
            h.store
                .confirm_handshake(&pending.match_id, role)
                .await
                .unwrap();
        }

        h.clock.advance(chrono::Duration::hours(1));
        let outcome = h
            .coordinator
            .handshake("bob", &pending.match_id, true)
            .await
            .unwrap();
        let room = match outcome {
            HandshakeOutcome::RoomReady(room) => room,
            other => panic!("expected room, got {:?}", other),
        };
        assert_eq!(room.match_id, pending.match_id);
        assert_eq!(
            h.store.membership("alice").await.unwrap(),
            Some(Membership::Room(pending.match_id.clone()))
        );
        // Nothing left for the sweep
        assert_eq!(h.coordinator.expire_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_room_carries_question() {
        let mut bank = MockQuestionBank::new();
        bank.expect_pick_question()
            .times(1)
            .returning(|_, _| Ok(Some("two-sum".to_string())));
        let h = harness_with(Arc::new(bank), PendingMatchConfig::default());
        let pending = paired(&h).await;

        h.coordinator
            .handshake("bob", &pending.match_id, true)
            .await
            .unwrap();
        let outcome = h
            .coordinator
            .handshake("alice", &pending.match_id, true)
            .await
            .unwrap();
        match outcome {
            HandshakeOutcome::RoomReady(room) => {
                assert_eq!(room.question_id.as_deref(), Some("two-sum"))
            }
            other => panic!("expected room, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finish_room_frees_users() {
        let h = harness();
        let pending = paired(&h).await;
        h.coordinator
            .handshake("alice", &pending.match_id, true)
            .await
            .unwrap();
        h.coordinator
            .handshake("bob", &pending.match_id, true)
            .await
            .unwrap();

        let err = h
            .coordinator
            .finish_room("mallory", &pending.match_id)
            .await
            .unwrap_err();
        assert_eq!(error_kind(&err), ErrorKind::NotFound);

        h.coordinator
            .finish_room("alice", &pending.match_id)
            .await
            .unwrap();
        assert_eq!(h.coordinator.check("bob").await.unwrap(), CheckStatus::default());
    }

    #[tokio::test]
    async fn test_disconnect_while_pending_rejects() {
        let h = harness();
        let pending = paired(&h).await;

        h.coordinator.handle_disconnect("bob").await.unwrap();
        assert!(h
            .store
            .get_pending_match(&pending.match_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            h.store.membership("alice").await.unwrap(),
            Some(Membership::Queued)
        );

        // Disconnecting while queued cancels
        h.coordinator.handle_disconnect("alice").await.unwrap();
        assert_eq!(h.store.membership("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_while_pending() {
        let h = harness();
        let pending = paired(&h).await;

        let status = h.coordinator.check("bob").await.unwrap();
        assert!(status.pending);
        assert_eq!(status.room_id.as_deref(), Some(pending.match_id.as_str()));
        assert_eq!(status.token.as_deref(), Some(pending.room_token2.as_str()));
        assert_eq!(status.expires_at, Some(pending.expires_at));
    }
}
