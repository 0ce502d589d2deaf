//! Redis-backed queue store.
//!
//! The queue store is the only authority for whether a task is currently
//! schedulable, delayed, or dead. It uses three physical collections plus an
//! index:
//!
//! - `task:delayed` (ZSET): tasks waiting for their execute time
//! - `task:ready` (LIST): FIFO of schedulable tasks, LPUSH in / BRPOP out
//! - `task:dead` (ZSET): failed tasks, scored by next retry time
//! - `task:index` (HASH): task id -> key of the collection holding it
//!
//! # Atomicity
//!
//! Moving tasks between collections (delayed -> ready, dead -> ready) happens
//! inside Lua scripts so that a payload is never visible in two collections
//! at once, and never lost between them.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;

use super::task::QueuedTask;

/// Key of the delayed sorted set.
pub const DELAYED_QUEUE_KEY: &str = "task:delayed";
/// Key of the ready list.
pub const READY_QUEUE_KEY: &str = "task:ready";
/// Key of the dead-letter sorted set.
pub const DEAD_LETTER_QUEUE_KEY: &str = "task:dead";
/// Key of the task index hash.
pub const TASK_INDEX_KEY: &str = "task:index";
/// Key of the concurrency counter.
pub const CONCURRENCY_LOCK_KEY: &str = "task:concurrency_lock";

/// Moves every due member of the delayed set to the ready list and points
/// the index at the ready list. Returns the promoted members.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
    local ok, decoded = pcall(cjson.decode, member)
    if ok and type(decoded) == 'table' and type(decoded['task_id']) == 'string' then
        redis.call('HSET', KEYS[3], decoded['task_id'], KEYS[2])
    end
end
return due
"#;

/// Removes the first list element whose task_id matches. The element is
/// overwritten with a unique marker before LREM so that concurrent pushes
/// cannot shift the index between the scan and the removal.
const REMOVE_FROM_LIST_SCRIPT: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for i, item in ipairs(items) do
    local ok, decoded = pcall(cjson.decode, item)
    if ok and type(decoded) == 'table' and decoded['task_id'] == ARGV[1] then
        redis.call('LSET', KEYS[1], i - 1, ARGV[2])
        redis.call('LREM', KEYS[1], 1, ARGV[2])
        return 1
    end
end
return 0
"#;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize a queue entry.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// The three physical collections a task can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueueName {
    Delayed,
    Ready,
    DeadLetter,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Delayed, QueueName::Ready, QueueName::DeadLetter];

    /// Redis key of this collection.
    pub fn key(&self) -> &'static str {
        match self {
            QueueName::Delayed => DELAYED_QUEUE_KEY,
            QueueName::Ready => READY_QUEUE_KEY,
            QueueName::DeadLetter => DEAD_LETTER_QUEUE_KEY,
        }
    }

    /// Resolves an index value back to a collection.
    pub fn from_key(key: &str) -> Option<Self> {
        QueueName::ALL.into_iter().find(|q| q.key() == key)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting for their execute time.
    pub delayed: usize,
    /// Tasks waiting for a worker.
    pub ready: usize,
    /// Tasks in the dead-letter set (retryable and permanent).
    pub dead: usize,
}

impl QueueStats {
    /// Returns the total number of queued entries.
    pub fn total(&self) -> usize {
        self.delayed + self.ready + self.dead
    }
}

/// Wraps an unusable queue entry for operator triage.
///
/// When `raw` still carries a task id it is kept on the envelope, so the index
/// follows the entry into the dead-letter set.
pub fn poison_envelope(raw: &str, reason: &str) -> Result<String, serde_json::Error> {
    let mut envelope = serde_json::json!({
        "poison": true,
        "reason": reason,
        "raw": raw,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(task_id) = QueuedTask::peek_task_id(raw) {
        envelope["task_id"] = serde_json::Value::String(task_id);
    }
    serde_json::to_string(&envelope)
}

/// Operations offered by a queue store.
///
/// All errors are store errors; callers treat them as transient.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Pushes a payload onto the ready list and indexes it as ready.
    async fn submit_immediate(&self, payload: &str, task_id: &str) -> Result<(), QueueError>;

    /// Adds a payload to the delayed set scored by `execute_time`.
    async fn submit_delayed(
        &self,
        payload: &str,
        task_id: &str,
        execute_time: i64,
    ) -> Result<(), QueueError>;

    /// Atomically moves every delayed member with score <= `now` to the ready list.
    async fn promote_due(&self, now: i64) -> Result<Vec<String>, QueueError>;

    /// Pops the oldest ready payload, waiting up to `timeout`.
    async fn blocking_take(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Adds a payload to the dead-letter set, scored `now + backoff`.
    ///
    /// A `None` backoff marks the entry permanent: it is never replayed.
    async fn dead_letter(&self, payload: &str, backoff: Option<Duration>)
        -> Result<(), QueueError>;

    /// Dead-letters an entry that could not be decoded. Poison entries are
    /// permanent and wrapped so operators can see why they were rejected.
    async fn dead_letter_poison(&self, raw: &str, reason: &str) -> Result<(), QueueError> {
        let envelope = poison_envelope(raw, reason)?;
        self.dead_letter(&envelope, None).await
    }

    /// Atomically moves every dead-letter member with score <= `now` back to the ready list.
    async fn replay_dead_letters(&self, now: i64) -> Result<Vec<String>, QueueError>;

    /// Removes the entry for `task_id` from `queue`. Returns whether anything was removed.
    async fn remove_by_id(&self, queue: QueueName, task_id: &str) -> Result<bool, QueueError>;

    /// Deletes the index entry for `task_id`.
    async fn unset_index(&self, task_id: &str) -> Result<(), QueueError>;

    /// Returns the collection the index currently points at for `task_id`.
    async fn index_of(&self, task_id: &str) -> Result<Option<QueueName>, QueueError>;

    /// Returns up to `limit` dead-letter entries, oldest score first.
    async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<(String, f64)>, QueueError>;

    /// Returns the size of each collection.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Computes the dead-letter score for a backoff.
pub(crate) fn dead_letter_score(now: i64, backoff: Option<Duration>) -> f64 {
    match backoff {
        Some(d) => (now + d.as_secs() as i64) as f64,
        None => f64::INFINITY,
    }
}

/// Redis implementation of [`QueueBackend`].
pub struct RedisQueue {
    /// Client used to open dedicated connections for blocking commands.
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Idle connections reserved for BRPOP, one per concurrent taker.
    blocking_pool: Mutex<Vec<MultiplexedConnection>>,
    promote_script: redis::Script,
    remove_script: redis::Script,
}

impl RedisQueue {
    /// Connects to Redis and creates a new queue store.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_parts(client, redis))
    }

    /// Creates a queue store from an existing client and connection.
    ///
    /// Useful when sharing a connection across the queue, gate and event store.
    pub fn from_parts(client: redis::Client, redis: ConnectionManager) -> Self {
        Self {
            client,
            redis,
            blocking_pool: Mutex::new(Vec::new()),
            promote_script: redis::Script::new(PROMOTE_DUE_SCRIPT),
            remove_script: redis::Script::new(REMOVE_FROM_LIST_SCRIPT),
        }
    }

    /// Shared connection, for building a gate or event store on the same link.
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, QueueError> {
        let idle = self
            .blocking_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_tokio_connection().await?),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    /// Runs the promotion script from `from` into the ready list.
    async fn move_due(&self, from: &str, now: i64) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let moved: Vec<String> = self
            .promote_script
            .key(from)
            .key(READY_QUEUE_KEY)
            .key(TASK_INDEX_KEY)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn remove_from_sorted_set(&self, key: &str, task_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.zrange(key, 0, -1).await?;

        for member in members {
            if QueuedTask::peek_task_id(&member).as_deref() == Some(task_id) {
                let removed: i64 = conn.zrem(key, &member).await?;
                return Ok(removed > 0);
            }
        }

        Ok(false)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn submit_immediate(&self, payload: &str, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(READY_QUEUE_KEY, payload)
            .hset(TASK_INDEX_KEY, task_id, READY_QUEUE_KEY);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn submit_delayed(
        &self,
        payload: &str,
        task_id: &str,
        execute_time: i64,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(DELAYED_QUEUE_KEY, payload, execute_time)
            .hset(TASK_INDEX_KEY, task_id, DELAYED_QUEUE_KEY);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn promote_due(&self, now: i64) -> Result<Vec<String>, QueueError> {
        self.move_due(DELAYED_QUEUE_KEY, now).await
    }

    async fn blocking_take(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.checkout_blocking().await?;
        // BRPOP accepts fractional seconds since Redis 6.
        let timeout_secs = timeout.as_secs_f64().max(0.01);

        let result: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(READY_QUEUE_KEY)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        self.checkin_blocking(conn);
        Ok(result.map(|(_, payload)| payload))
    }

    async fn dead_letter(
        &self,
        payload: &str,
        backoff: Option<Duration>,
    ) -> Result<(), QueueError> {
        let now = chrono::Utc::now().timestamp();
        let score = dead_letter_score(now, backoff);
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().zadd(DEAD_LETTER_QUEUE_KEY, payload, score);
        if let Some(task_id) = QueuedTask::peek_task_id(payload) {
            pipe.hset(TASK_INDEX_KEY, task_id, DEAD_LETTER_QUEUE_KEY);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn replay_dead_letters(&self, now: i64) -> Result<Vec<String>, QueueError> {
        self.move_due(DEAD_LETTER_QUEUE_KEY, now).await
    }

    async fn remove_by_id(&self, queue: QueueName, task_id: &str) -> Result<bool, QueueError> {
        match queue {
            QueueName::Ready => {
                let mut conn = self.redis.clone();
                let marker = format!("__removed__:{}:{}", task_id, uuid::Uuid::new_v4());
                let removed: i64 = self
                    .remove_script
                    .key(READY_QUEUE_KEY)
                    .arg(task_id)
                    .arg(marker)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(removed == 1)
            }
            QueueName::Delayed | QueueName::DeadLetter => {
                self.remove_from_sorted_set(queue.key(), task_id).await
            }
        }
    }

    async fn unset_index(&self, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(TASK_INDEX_KEY, task_id).await?;
        Ok(())
    }

    async fn index_of(&self, task_id: &str) -> Result<Option<QueueName>, QueueError> {
        let mut conn = self.redis.clone();
        let key: Option<String> = conn.hget(TASK_INDEX_KEY, task_id).await?;
        Ok(key.as_deref().and_then(QueueName::from_key))
    }

    async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<(String, f64)>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let entries: Vec<(String, f64)> = conn
            .zrange_withscores(DEAD_LETTER_QUEUE_KEY, 0, limit as isize - 1)
            .await?;
        Ok(entries)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (delayed, ready, dead): (usize, usize, usize) = redis::pipe()
            .zcard(DELAYED_QUEUE_KEY)
            .llen(READY_QUEUE_KEY)
            .zcard(DEAD_LETTER_QUEUE_KEY)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            delayed,
            ready,
            dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_queue_name_keys_are_stable() {
        assert_eq!(QueueName::Delayed.key(), "task:delayed");
        assert_eq!(QueueName::Ready.key(), "task:ready");
        assert_eq!(QueueName::DeadLetter.key(), "task:dead");
        assert_eq!(TASK_INDEX_KEY, "task:index");
        assert_eq!(CONCURRENCY_LOCK_KEY, "task:concurrency_lock");
    }

    #[test]
    fn test_queue_name_from_key() {
        for q in QueueName::ALL {
            assert_eq!(QueueName::from_key(q.key()), Some(q));
        }
        assert_eq!(QueueName::from_key("task:other"), None);
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            delayed: 3,
            ready: 2,
            dead: 1,
        };
        assert_eq!(stats.total(), 6);
    }

    #[test]
    fn test_dead_letter_score() {
        assert_eq!(dead_letter_score(100, Some(Duration::from_secs(5))), 105.0);
        assert!(dead_letter_score(100, None).is_infinite());
    }

    #[test]
    fn test_poison_envelope_structure() {
        let entry = poison_envelope("{broken", "expected value").expect("serialize");
        let parsed: serde_json::Value = serde_json::from_str(&entry).expect("json");

        assert_eq!(parsed["poison"], true);
        assert_eq!(parsed["raw"], "{broken");
        assert!(parsed.get("moved_at").is_some());
        // Poison entries never look like a task.
        assert!(QueuedTask::decode(&entry).is_err());
    }

    #[test]
    fn test_poison_envelope_keeps_task_id() {
        let raw = r#"{"task_id":"t-9","task_type":"NotAType"}"#;
        let entry = poison_envelope(raw, "unknown variant").expect("serialize");

        assert_eq!(QueuedTask::peek_task_id(&entry).as_deref(), Some("t-9"));
        assert!(QueuedTask::decode(&entry).is_err());
        assert!(QueuedTask::peek_task_id(&poison_envelope("{broken", "eof").unwrap()).is_none());
    }
}
