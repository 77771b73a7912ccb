//! Redis-backed coordination store
//!
//! Multi-key mutations are Lua scripts so that each one executes atomically on
//! the server. Queue entries are identified by their stamp, kept in a hash
//! beside the entry JSON, so pairing never compares re-serialized bodies.

use super::{CoordinationStore, EnqueueResult, RatingWrite, Topic};
use crate::error::{MatchmakingError, Result};
use crate::types::{
    EloUpdate, Handshakes, MatchId, Membership, PendingMatch, Role, RoomInfo, UserEloInfo,
    WaitEntry,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const ENQUEUE_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
  return existing
end
redis.call('SET', KEYS[1], 'queued')
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
return false
"#;

const CANCEL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == 'queued' then
  redis.call('DEL', KEYS[1])
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('HDEL', KEYS[3], ARGV[1])
  return 1
end
return 0
"#;

const PAIR_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[3] then return 0 end
if redis.call('HGET', KEYS[6], ARGV[2]) ~= ARGV[4] then return 0 end
if redis.call('GET', KEYS[2]) ~= 'queued' then return 0 end
if redis.call('GET', KEYS[3]) ~= 'queued' then return 0 end
redis.call('HDEL', KEYS[1], ARGV[1], ARGV[2])
redis.call('HDEL', KEYS[6], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[4], 'record', ARGV[5], 'user1_confirmed', '0', 'user2_confirmed', '0')
redis.call('PEXPIRE', KEYS[4], ARGV[7])
local membership = 'pending:' .. ARGV[6]
redis.call('SET', KEYS[2], membership, 'PX', ARGV[7])
redis.call('SET', KEYS[3], membership, 'PX', ARGV[7])
redis.call('SADD', KEYS[5], ARGV[6])
return 1
"#;

const CONFIRM_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
redis.call('HSET', KEYS[1], ARGV[1], '1')
return redis.call('HMGET', KEYS[1], 'user1_confirmed', 'user2_confirmed')
"#;

const PROMOTE_SCRIPT: &str = r#"
local flags = redis.call('HMGET', KEYS[1], 'user1_confirmed', 'user2_confirmed')
if flags[1] ~= '1' or flags[2] ~= '1' then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[3], ARGV[2], 'PX', ARGV[3])
local membership = 'room:' .. ARGV[1]
redis.call('SET', KEYS[4], membership, 'PX', ARGV[3])
redis.call('SET', KEYS[5], membership, 'PX', ARGV[3])
return 1
"#;

const DISSOLVE_SCRIPT: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'record', 'user1_confirmed', 'user2_confirmed')
if not fields[1] then
  redis.call('SREM', KEYS[2], ARGV[1])
  return false
end
if ARGV[2] == '1' and fields[2] == '1' and fields[3] == '1' then
  return false
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
local membership = 'pending:' .. ARGV[1]
if redis.call('GET', KEYS[3]) == membership then redis.call('DEL', KEYS[3]) end
if redis.call('GET', KEYS[4]) == membership then redis.call('DEL', KEYS[4]) end
return fields
"#;

const FINISH_SCRIPT: &str = r#"
local room = redis.call('GET', KEYS[1])
if not room then
  return false
end
redis.call('DEL', KEYS[1])
local membership = 'room:' .. ARGV[1]
if redis.call('GET', KEYS[2]) == membership then redis.call('DEL', KEYS[2]) end
if redis.call('GET', KEYS[3]) == membership then redis.call('DEL', KEYS[3]) end
return room
"#;

const RATINGS_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[1])
if previous then
  return previous
end
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[4])
redis.call('SET', KEYS[3], ARGV[2], 'EX', ARGV[4])
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
return false
"#;

/// Connection generations outlive any realistic stream
const CONNECTION_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Connection settings for the Redis store
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    pub key_prefix: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "pairing".to_string(),
            max_retries: 5,
            retry_delay_ms: 1000,
        }
    }
}

fn unavailable(e: redis::RedisError) -> anyhow::Error {
    MatchmakingError::StoreUnavailable {
        message: e.to_string(),
    }
    .into()
}

fn corrupt(what: &str, e: serde_json::Error) -> anyhow::Error {
    MatchmakingError::InternalError {
        message: format!("Failed to decode {}: {}", what, e),
    }
    .into()
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

struct Scripts {
    enqueue: Script,
    cancel: Script,
    pair: Script,
    confirm: Script,
    promote: Script,
    dissolve: Script,
    finish: Script,
    ratings: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
            pair: Script::new(PAIR_SCRIPT),
            confirm: Script::new(CONFIRM_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            dissolve: Script::new(DISSOLVE_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            ratings: Script::new(RATINGS_SCRIPT),
        }
    }
}

/// Coordination store shared by every instance through Redis
pub struct RedisCoordinationStore {
    client: Client,
    connection: MultiplexedConnection,
    prefix: String,
    scripts: Scripts,
}

impl RedisCoordinationStore {
    /// Connect with exponential backoff
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(unavailable)?;
        let connection = Self::connect_with_retry(&client, config).await?;
        info!("Connected to coordination store at {}", config.url);

        Ok(Self {
            client,
            connection,
            prefix: config.key_prefix.clone(),
            scripts: Scripts::load(),
        })
    }

    async fn connect_with_retry(
        client: &Client,
        config: &RedisStoreConfig,
    ) -> Result<MultiplexedConnection> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(config.retry_delay_ms);

        loop {
            match client.get_multiplexed_async_connection().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    retry_count += 1;
                    if retry_count > config.max_retries {
                        error!(
                            "Failed to connect to coordination store after {} retries",
                            config.max_retries
                        );
                        return Err(unavailable(e));
                    }

                    warn!(
                        "Coordination store connection attempt {} failed: {}. Retrying in {:?}",
                        retry_count, e, delay
                    );
                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(30000));
                }
            }
        }
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    fn stamps_key(&self) -> String {
        format!("{}:queue-stamps", self.prefix)
    }

    fn member_key(&self, user_id: &str) -> String {
        format!("{}:member:{}", self.prefix, user_id)
    }

    fn pending_key(&self, match_id: &str) -> String {
        format!("{}:pending:{}", self.prefix, match_id)
    }

    fn pending_index_key(&self) -> String {
        format!("{}:pending-index", self.prefix)
    }

    fn room_key(&self, match_id: &str) -> String {
        format!("{}:room:{}", self.prefix, match_id)
    }

    fn elo_key(&self, user_id: &str) -> String {
        format!("{}:elo:{}", self.prefix, user_id)
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    fn connection_key(&self, user_id: &str) -> String {
        format!("{}:connection:{}", self.prefix, user_id)
    }

    fn channel(&self, topic: Topic) -> String {
        format!("{}:{}", self.prefix, topic.suffix())
    }

    fn decode_pending(record: &str, flags: (&str, &str)) -> Result<PendingMatch> {
        let mut pending: PendingMatch =
            serde_json::from_str(record).map_err(|e| corrupt("pending match", e))?;
        pending.handshakes = Handshakes {
            user1_confirmed: flags.0 == "1",
            user2_confirmed: flags.1 == "1",
        };
        Ok(pending)
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn insert_wait_entry(&self, entry: &WaitEntry) -> Result<EnqueueResult> {
        let mut conn = self.connection.clone();
        let payload = serde_json::to_string(entry)?;
        let existing: Option<String> = self
            .scripts
            .enqueue
            .key(self.member_key(&entry.user_id))
            .key(self.queue_key())
            .key(self.stamps_key())
            .arg(&entry.user_id)
            .arg(payload)
            .arg(entry.stamp())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match existing {
            None => Ok(EnqueueResult::Inserted),
            Some(membership) => Ok(EnqueueResult::Existing(membership.parse()?)),
        }
    }

    async fn remove_wait_entry(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .scripts
            .cancel
            .key(self.member_key(user_id))
            .key(self.queue_key())
            .key(self.stamps_key())
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed == 1)
    }

    async fn wait_entries(&self) -> Result<Vec<WaitEntry>> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.queue_key())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut entries = Vec::with_capacity(raw.len());
        for payload in raw {
            match serde_json::from_str::<WaitEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping undecodable queue entry: {}", e),
            }
        }
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(entries)
    }

    async fn membership(&self, user_id: &str) -> Result<Option<Membership>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.member_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|value| value.parse::<Membership>().map_err(Into::into))
            .transpose()
    }

    async fn create_pending_match(
        &self,
        first: &WaitEntry,
        second: &WaitEntry,
        pending: &PendingMatch,
        retain: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let created: i64 = self
            .scripts
            .pair
            .key(self.queue_key())
            .key(self.member_key(&first.user_id))
            .key(self.member_key(&second.user_id))
            .key(self.pending_key(&pending.match_id))
            .key(self.pending_index_key())
            .key(self.stamps_key())
            .arg(&first.user_id)
            .arg(&second.user_id)
            .arg(first.stamp())
            .arg(second.stamp())
            .arg(serde_json::to_string(pending)?)
            .arg(&pending.match_id)
            .arg(millis(retain))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(created == 1)
    }

    async fn get_pending_match(&self, match_id: &str) -> Result<Option<PendingMatch>> {
        let mut conn = self.connection.clone();
        let fields: (Option<String>, Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.pending_key(match_id))
            .arg("record")
            .arg("user1_confirmed")
            .arg("user2_confirmed")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match fields {
            (Some(record), flag1, flag2) => Ok(Some(Self::decode_pending(
                &record,
                (
                    flag1.as_deref().unwrap_or("0"),
                    flag2.as_deref().unwrap_or("0"),
                ),
            )?)),
            _ => Ok(None),
        }
    }

    async fn pending_matches(&self) -> Result<Vec<PendingMatch>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.pending_index_key())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut matches = Vec::with_capacity(ids.len());
        for match_id in ids {
            match self.get_pending_match(&match_id).await? {
                Some(pending) => matches.push(pending),
                None => {
                    debug!("Pruning stale pending index entry {}", match_id);
                    let _: i64 = redis::cmd("SREM")
                        .arg(self.pending_index_key())
                        .arg(&match_id)
                        .query_async(&mut conn)
                        .await
                        .map_err(unavailable)?;
                }
            }
        }
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn confirm_handshake(&self, match_id: &str, role: Role) -> Result<Option<Handshakes>> {
        let mut conn = self.connection.clone();
        let flags: Option<(Option<String>, Option<String>)> = self
            .scripts
            .confirm
            .key(self.pending_key(match_id))
            .arg(role.confirmation_field())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(flags.map(|(flag1, flag2)| Handshakes {
            user1_confirmed: flag1.as_deref() == Some("1"),
            user2_confirmed: flag2.as_deref() == Some("1"),
        }))
    }

    async fn promote_pending_match(
        &self,
        match_id: &str,
        room: &RoomInfo,
        room_ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let promoted: i64 = self
            .scripts
            .promote
            .key(self.pending_key(match_id))
            .key(self.pending_index_key())
            .key(self.room_key(match_id))
            .key(self.member_key(&room.user1))
            .key(self.member_key(&room.user2))
            .arg(match_id)
            .arg(serde_json::to_string(room)?)
            .arg(millis(room_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(promoted == 1)
    }

    async fn dissolve_pending_match(
        &self,
        pending: &PendingMatch,
        require_incomplete: bool,
    ) -> Result<Option<PendingMatch>> {
        let mut conn = self.connection.clone();
        let fields: Option<(String, String, String)> = self
            .scripts
            .dissolve
            .key(self.pending_key(&pending.match_id))
            .key(self.pending_index_key())
            .key(self.member_key(&pending.user1))
            .key(self.member_key(&pending.user2))
            .arg(&pending.match_id)
            .arg(if require_incomplete { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        fields
            .map(|(record, flag1, flag2)| Self::decode_pending(&record, (&flag1, &flag2)))
            .transpose()
    }

    async fn get_room(&self, match_id: &str) -> Result<Option<RoomInfo>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.room_key(match_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|payload| serde_json::from_str(&payload).map_err(|e| corrupt("room", e)))
            .transpose()
    }

    async fn finish_room(&self, match_id: &MatchId) -> Result<Option<RoomInfo>> {
        let room = match self.get_room(match_id).await? {
            Some(room) => room,
            None => return Ok(None),
        };

        let mut conn = self.connection.clone();
        let removed: Option<String> = self
            .scripts
            .finish
            .key(self.room_key(match_id))
            .key(self.member_key(&room.user1))
            .key(self.member_key(&room.user2))
            .arg(match_id)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(removed.map(|_| room))
    }

    async fn get_elo(&self, user_id: &str) -> Result<Option<UserEloInfo>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.elo_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        raw.map(|payload| serde_json::from_str(&payload).map_err(|e| corrupt("rating", e)))
            .transpose()
    }

    async fn record_session_ratings(
        &self,
        session_id: &str,
        first: &UserEloInfo,
        second: &UserEloInfo,
        updates: &[EloUpdate],
        ttl: Duration,
    ) -> Result<RatingWrite> {
        let mut conn = self.connection.clone();
        let previous: Option<String> = self
            .scripts
            .ratings
            .key(self.session_key(session_id))
            .key(self.elo_key(&first.user_id))
            .key(self.elo_key(&second.user_id))
            .arg(serde_json::to_string(first)?)
            .arg(serde_json::to_string(second)?)
            .arg(serde_json::to_string(updates)?)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match previous {
            None => Ok(RatingWrite::Applied),
            Some(payload) => Ok(RatingWrite::AlreadyApplied(
                serde_json::from_str(&payload).map_err(|e| corrupt("session updates", e))?,
            )),
        }
    }

    async fn claim_connection(&self, user_id: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let key = self.connection_key(user_id);
        let (generation,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(CONNECTION_TTL_SECONDS)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(generation)
    }

    async fn current_connection(&self, user_id: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        redis::cmd("GET")
            .arg(self.connection_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn publish(&self, topic: Topic, payload: String) -> Result<()> {
        let mut conn = self.connection.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!("Published to {} ({} receivers)", self.channel(topic), receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub
            .subscribe(self.channel(topic))
            .await
            .map_err(unavailable)?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|message| future::ready(message.get_payload::<String>().ok()));
        Ok(stream.boxed())
    }
}
