//! In-process coordination store
//!
//! Performs the same conditional operations as the Redis store under a single
//! async mutex. Suitable for a single instance and for tests; expiry hints
//! are accepted but records are only removed by explicit operations.

use super::{CoordinationStore, EnqueueResult, RatingWrite, Topic};
use crate::error::Result;
use crate::types::{
    EloUpdate, Handshakes, MatchId, Membership, PendingMatch, Role, RoomInfo, UserEloInfo, UserId,
    WaitEntry,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct MemoryState {
    queue: HashMap<UserId, WaitEntry>,
    members: HashMap<UserId, Membership>,
    pending: HashMap<MatchId, PendingMatch>,
    rooms: HashMap<MatchId, RoomInfo>,
    ratings: HashMap<UserId, UserEloInfo>,
    sessions: HashMap<String, Vec<EloUpdate>>,
    connections: HashMap<UserId, u64>,
}

impl MemoryState {
    fn clear_membership_if(&mut self, user_id: &str, expected: &Membership) {
        if self.members.get(user_id) == Some(expected) {
            self.members.remove(user_id);
        }
    }
}

/// Coordination store held in local memory
pub struct InMemoryCoordinationStore {
    state: Mutex<MemoryState>,
    user_events: broadcast::Sender<String>,
    elo_updates: broadcast::Sender<String>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        let (user_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (elo_updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            user_events,
            elo_updates,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<String> {
        match topic {
            Topic::UserEvents => &self.user_events,
            Topic::EloUpdates => &self.elo_updates,
        }
    }

    /// Number of rooms currently live
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    /// Overwrite a rating record outside of any session
    pub async fn set_rating(&self, info: UserEloInfo) {
        self.state
            .lock()
            .await
            .ratings
            .insert(info.user_id.clone(), info);
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_wait_entry(&self, entry: &WaitEntry) -> Result<EnqueueResult> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.members.get(&entry.user_id) {
            return Ok(EnqueueResult::Existing(existing.clone()));
        }
        state
            .members
            .insert(entry.user_id.clone(), Membership::Queued);
        state.queue.insert(entry.user_id.clone(), entry.clone());
        Ok(EnqueueResult::Inserted)
    }

    async fn remove_wait_entry(&self, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.members.get(user_id) != Some(&Membership::Queued) {
            return Ok(false);
        }
        state.members.remove(user_id);
        state.queue.remove(user_id);
        Ok(true)
    }

    async fn wait_entries(&self) -> Result<Vec<WaitEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<WaitEntry> = state.queue.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(entries)
    }

    async fn membership(&self, user_id: &str) -> Result<Option<Membership>> {
        Ok(self.state.lock().await.members.get(user_id).cloned())
    }

    async fn create_pending_match(
        &self,
        first: &WaitEntry,
        second: &WaitEntry,
        pending: &PendingMatch,
        _retain: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let still_queued = |entry: &WaitEntry| {
            state.queue.get(&entry.user_id) == Some(entry)
                && state.members.get(&entry.user_id) == Some(&Membership::Queued)
        };
        if !still_queued(first) || !still_queued(second) {
            debug!(
                "Pairing {} with {} lost to a concurrent change",
                first.user_id, second.user_id
            );
            return Ok(false);
        }

        state.queue.remove(&first.user_id);
        state.queue.remove(&second.user_id);
        let membership = Membership::Pending(pending.match_id.clone());
        state
            .members
            .insert(first.user_id.clone(), membership.clone());
        state.members.insert(second.user_id.clone(), membership);
        let mut record = pending.clone();
        record.handshakes = Handshakes::default();
        state.pending.insert(pending.match_id.clone(), record);
        Ok(true)
    }

    async fn get_pending_match(&self, match_id: &str) -> Result<Option<PendingMatch>> {
        Ok(self.state.lock().await.pending.get(match_id).cloned())
    }

    async fn pending_matches(&self) -> Result<Vec<PendingMatch>> {
        let state = self.state.lock().await;
        let mut matches: Vec<PendingMatch> = state.pending.values().cloned().collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn confirm_handshake(&self, match_id: &str, role: Role) -> Result<Option<Handshakes>> {
        let mut state = self.state.lock().await;
        Ok(state.pending.get_mut(match_id).map(|pending| {
            pending.handshakes.confirm(role);
            pending.handshakes
        }))
    }

    async fn promote_pending_match(
        &self,
        match_id: &str,
        room: &RoomInfo,
        _room_ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let confirmed = state
            .pending
            .get(match_id)
            .map(|pending| pending.handshakes.both_confirmed())
            .unwrap_or(false);
        if !confirmed {
            return Ok(false);
        }

        state.pending.remove(match_id);
        let membership = Membership::Room(match_id.to_string());
        state.members.insert(room.user1.clone(), membership.clone());
        state.members.insert(room.user2.clone(), membership);
        state.rooms.insert(match_id.to_string(), room.clone());
        Ok(true)
    }

    async fn dissolve_pending_match(
        &self,
        pending: &PendingMatch,
        require_incomplete: bool,
    ) -> Result<Option<PendingMatch>> {
        let mut state = self.state.lock().await;
        let complete = match state.pending.get(&pending.match_id) {
            None => return Ok(None),
            Some(current) => current.handshakes.both_confirmed(),
        };
        if require_incomplete && complete {
            return Ok(None);
        }

        let removed = state.pending.remove(&pending.match_id);
        let membership = Membership::Pending(pending.match_id.clone());
        state.clear_membership_if(&pending.user1, &membership);
        state.clear_membership_if(&pending.user2, &membership);
        Ok(removed)
    }

    async fn get_room(&self, match_id: &str) -> Result<Option<RoomInfo>> {
        Ok(self.state.lock().await.rooms.get(match_id).cloned())
    }

    async fn finish_room(&self, match_id: &MatchId) -> Result<Option<RoomInfo>> {
        let mut state = self.state.lock().await;
        let room = match state.rooms.remove(match_id) {
            Some(room) => room,
            None => return Ok(None),
        };
        let membership = Membership::Room(match_id.clone());
        state.clear_membership_if(&room.user1, &membership);
        state.clear_membership_if(&room.user2, &membership);
        Ok(Some(room))
    }

    async fn get_elo(&self, user_id: &str) -> Result<Option<UserEloInfo>> {
        Ok(self.state.lock().await.ratings.get(user_id).cloned())
    }

    async fn record_session_ratings(
        &self,
        session_id: &str,
        first: &UserEloInfo,
        second: &UserEloInfo,
        updates: &[EloUpdate],
        _ttl: Duration,
    ) -> Result<RatingWrite> {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.sessions.get(session_id) {
            return Ok(RatingWrite::AlreadyApplied(previous.clone()));
        }
        state
            .sessions
            .insert(session_id.to_string(), updates.to_vec());
        state.ratings.insert(first.user_id.clone(), first.clone());
        state.ratings.insert(second.user_id.clone(), second.clone());
        Ok(RatingWrite::Applied)
    }

    async fn claim_connection(&self, user_id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let generation = state.connections.entry(user_id.to_string()).or_insert(0);
        *generation += 1;
        Ok(*generation)
    }

    async fn current_connection(&self, user_id: &str) -> Result<Option<u64>> {
        Ok(self.state.lock().await.connections.get(user_id).copied())
    }

    async fn publish(&self, topic: Topic, payload: String) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<BoxStream<'static, String>> {
        let receiver = self.sender(topic).subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|message| future::ready(message.ok()));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Difficulty, PartyPreference, RoomStatus};
    use chrono::Utc;

    fn entry(user_id: &str) -> WaitEntry {
        WaitEntry {
            user_id: user_id.to_string(),
            category: "arrays".to_string(),
            difficulty: Difficulty::Medium,
            accept_any_category: false,
            elo_rating: 1500.0,
            enqueued_at: Utc::now(),
        }
    }

    fn pending_for(a: &WaitEntry, b: &WaitEntry) -> PendingMatch {
        let now = Utc::now();
        let preference = PartyPreference {
            category: "arrays".to_string(),
            difficulty: Difficulty::Medium,
            accept_any_category: false,
        };
        PendingMatch {
            match_id: "m1".to_string(),
            user1: a.user_id.clone(),
            user2: b.user_id.clone(),
            category: "arrays".to_string(),
            difficulty: Difficulty::Medium,
            user1_preference: preference.clone(),
            user2_preference: preference,
            room_token1: "t1".to_string(),
            room_token2: "t2".to_string(),
            handshakes: Handshakes::default(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_insert_is_conditional() {
        let store = InMemoryCoordinationStore::new();
        let alice = entry("alice");

        assert_eq!(
            store.insert_wait_entry(&alice).await.unwrap(),
            EnqueueResult::Inserted
        );
        assert_eq!(
            store.insert_wait_entry(&alice).await.unwrap(),
            EnqueueResult::Existing(Membership::Queued)
        );
        assert_eq!(store.wait_entries().await.unwrap().len(), 1);

        assert!(store.remove_wait_entry("alice").await.unwrap());
        assert!(!store.remove_wait_entry("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_pairing_is_compare_and_delete() {
        let store = InMemoryCoordinationStore::new();
        let (alice, bob) = (entry("alice"), entry("bob"));
        store.insert_wait_entry(&alice).await.unwrap();
        store.insert_wait_entry(&bob).await.unwrap();
        let pending = pending_for(&alice, &bob);

        let retain = Duration::from_secs(60);
        assert!(store
            .create_pending_match(&alice, &bob, &pending, retain)
            .await
            .unwrap());
        // Second attempt with the same snapshot loses
        assert!(!store
            .create_pending_match(&alice, &bob, &pending, retain)
            .await
            .unwrap());

        assert!(store.wait_entries().await.unwrap().is_empty());
        assert_eq!(
            store.membership("bob").await.unwrap(),
            Some(Membership::Pending("m1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_promote_requires_both_flags() {
        let store = InMemoryCoordinationStore::new();
        let (alice, bob) = (entry("alice"), entry("bob"));
        store.insert_wait_entry(&alice).await.unwrap();
        store.insert_wait_entry(&bob).await.unwrap();
        let pending = pending_for(&alice, &bob);
        store
            .create_pending_match(&alice, &bob, &pending, Duration::from_secs(60))
            .await
            .unwrap();

        let room = RoomInfo {
            match_id: "m1".to_string(),
            user1: "alice".to_string(),
            user2: "bob".to_string(),
            category: "arrays".to_string(),
            difficulty: Difficulty::Medium,
            status: RoomStatus::Ready,
            token1: "t1".to_string(),
            token2: "t2".to_string(),
            question_id: None,
            created_at: Utc::now(),
        };
        let ttl = Duration::from_secs(3600);

        store.confirm_handshake("m1", Role::User1).await.unwrap();
        assert!(!store.promote_pending_match("m1", &room, ttl).await.unwrap());

        let flags = store.confirm_handshake("m1", Role::User2).await.unwrap();
        assert!(flags.unwrap().both_confirmed());
        assert!(store
            .dissolve_pending_match(&pending, true)
            .await
            .unwrap()
            .is_none());
        assert!(store.promote_pending_match("m1", &room, ttl).await.unwrap());
        assert!(!store.promote_pending_match("m1", &room, ttl).await.unwrap());

        assert_eq!(
            store.membership("alice").await.unwrap(),
            Some(Membership::Room("m1".to_string()))
        );
        assert!(store.finish_room(&"m1".to_string()).await.unwrap().is_some());
        assert_eq!(store.membership("alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_session_ratings_recorded_once() {
        let store = InMemoryCoordinationStore::new();
        let mut alice = UserEloInfo::new("alice");
        alice.elo_rating = 1516.0;
        alice.sessions_completed = 1;
        let bob = UserEloInfo::new("bob");
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store
                .record_session_ratings("s1", &alice, &bob, &[], ttl)
                .await
                .unwrap(),
            RatingWrite::Applied
        );

        alice.sessions_completed = 2;
        let replay = store
            .record_session_ratings("s1", &alice, &bob, &[], ttl)
            .await
            .unwrap();
        assert_eq!(replay, RatingWrite::AlreadyApplied(Vec::new()));
        assert_eq!(
            store.get_elo("alice").await.unwrap().unwrap().sessions_completed,
            1
        );
    }

    #[tokio::test]
    async fn test_connection_generations_increase() {
        let store = InMemoryCoordinationStore::new();
        assert_eq!(store.current_connection("alice").await.unwrap(), None);
        assert_eq!(store.claim_connection("alice").await.unwrap(), 1);
        assert_eq!(store.claim_connection("alice").await.unwrap(), 2);
        assert_eq!(store.current_connection("alice").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = InMemoryCoordinationStore::new();
        let mut stream = store.subscribe(Topic::UserEvents).await.unwrap();

        store
            .publish(Topic::EloUpdates, "ignored".to_string())
            .await
            .unwrap();
        store
            .publish(Topic::UserEvents, "hello".to_string())
            .await
            .unwrap();

        assert_eq!(stream.next().await, Some("hello".to_string()));
    }
}
