//! Test fixtures for integration testing
//!
//! A `TestSystem` is a fully wired `AppState` on the in-memory store with a
//! manually driven clock. Several systems may share one store to stand in
//! for multiple service instances.

#![allow(dead_code)]

use futures::stream::BoxStream;
use futures::StreamExt;
use pairing_room::clock::ManualClock;
use pairing_room::config::AppConfig;
use pairing_room::questions::StaticQuestionBank;
use pairing_room::service::{AppState, Dependencies};
use pairing_room::store::{CoordinationStore, InMemoryCoordinationStore, Topic};
use pairing_room::types::{
    CheckStatus, Difficulty, JoinRequest, ParticipantMetrics, SessionMetrics, UserEvent,
};
use std::sync::Arc;
use std::time::Duration;

pub struct TestSystem {
    pub state: Arc<AppState>,
    pub store: Arc<InMemoryCoordinationStore>,
    pub clock: ManualClock,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::sharing(
            config,
            Arc::new(InMemoryCoordinationStore::new()),
            ManualClock::default(),
        )
    }

    /// Another instance over the same store and clock
    pub fn sharing(
        config: AppConfig,
        store: Arc<InMemoryCoordinationStore>,
        clock: ManualClock,
    ) -> Self {
        let question_bank = StaticQuestionBank::new()
            .with_question("arrays", Difficulty::Easy, "two-sum")
            .with_question("arrays", Difficulty::Medium, "three-sum")
            .with_question("graphs", Difficulty::Hard, "word-ladder");

        let state = AppState::with_dependencies(
            config,
            Dependencies {
                store: store.clone(),
                clock: Arc::new(clock.clone()),
                question_bank: Arc::new(question_bank),
                rating_mirror: None,
                amqp_connection: None,
            },
        )
        .expect("test system should assemble");

        Self {
            state: Arc::new(state),
            store,
            clock,
        }
    }

    pub async fn join(&self, user: &str, category: &str, difficulty: Difficulty) {
        self.state
            .queue()
            .enqueue(join_request(user, category, difficulty))
            .await
            .expect("join should succeed");
        // Keep enqueue order strictly increasing
        self.advance(Duration::from_millis(1));
    }

    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).expect("duration in range"));
    }

    pub async fn tick(&self) -> usize {
        self.state
            .matchmaking_loop()
            .tick()
            .await
            .expect("matchmaking tick should succeed")
    }

    pub async fn expire(&self) -> usize {
        self.state
            .expiration_loop()
            .tick()
            .await
            .expect("expiration tick should succeed")
    }

    pub async fn check(&self, user: &str) -> CheckStatus {
        self.state
            .coordinator()
            .check(user)
            .await
            .expect("check should succeed")
    }

    /// Pending match id for a user, panicking if there is none
    pub async fn pending_match_id(&self, user: &str) -> String {
        let status = self.check(user).await;
        assert!(status.pending, "user '{}' should be pending: {:?}", user, status);
        status.room_id.expect("pending status carries the match id")
    }

    pub async fn subscribe_events(&self) -> EventTap {
        EventTap {
            stream: self
                .store
                .subscribe(Topic::UserEvents)
                .await
                .expect("subscribe should succeed"),
        }
    }
}

/// Collects user events published through the store
pub struct EventTap {
    stream: BoxStream<'static, String>,
}

impl EventTap {
    /// Drain whatever has been published so far
    pub async fn drain(&mut self) -> Vec<UserEvent> {
        let mut events = Vec::new();
        while let Ok(Some(payload)) =
            tokio::time::timeout(Duration::from_millis(50), self.stream.next()).await
        {
            events.push(serde_json::from_str(&payload).expect("user event JSON"));
        }
        events
    }

    pub async fn names_for(&mut self, user: &str) -> Vec<&'static str> {
        self.drain()
            .await
            .into_iter()
            .filter(|event| event.user_id == user)
            .map(|event| event.event.name())
            .collect()
    }
}

pub fn join_request(user: &str, category: &str, difficulty: Difficulty) -> JoinRequest {
    JoinRequest {
        user_id: user.to_string(),
        category: category.to_string(),
        difficulty,
        accept_any_category: false,
    }
}

pub fn engaged() -> ParticipantMetrics {
    ParticipantMetrics {
        voice_used: true,
        voice_duration_sec: 1200,
        code_changes: 55,
        messages_exchanged: 25,
    }
}

pub fn session_metrics(
    match_id: &str,
    user1: &str,
    user2: &str,
    difficulty: &str,
    user1_metrics: ParticipantMetrics,
    user2_metrics: ParticipantMetrics,
) -> SessionMetrics {
    SessionMetrics {
        session_id: format!("session-{}", match_id),
        match_id: match_id.to_string(),
        user1_id: user1.to_string(),
        user2_id: user2.to_string(),
        difficulty: difficulty.to_string(),
        session_duration_sec: 1800,
        user1_metrics,
        user2_metrics,
    }
}
