//! Per-trace event streams.
//!
//! Each trace owns an append-only Redis stream at `log:{trace_id}`, capped at
//! roughly `STREAM_MAXLEN` entries (oldest evicted). Entry ids are assigned
//! by the server and strictly increase within a stream; their millisecond
//! prefix is the authoritative event time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Notify;

use super::types::{EventError, StreamEntry, StreamId, TraceEvent};

/// Default approximate cap on entries per stream.
pub const DEFAULT_STREAM_MAXLEN: usize = 10_000;

/// Returns the stream key for a trace.
pub fn stream_key(trace_id: &str) -> String {
    format!("log:{}", trace_id)
}

/// Append/replay access to trace event streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event to the trace stream and returns its id.
    async fn publish(&self, trace_id: &str, event: &TraceEvent) -> Result<StreamId, EventError>;

    /// Reads up to `max_count` entries with id greater than `from`.
    ///
    /// With a non-zero `block`, waits up to that long for new entries when
    /// none are available yet.
    async fn read(
        &self,
        trace_id: &str,
        from: StreamId,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, EventError>;

    /// Number of entries currently retained for the trace.
    async fn len(&self, trace_id: &str) -> Result<usize, EventError>;

    /// Drops the whole stream of a trace.
    async fn delete(&self, trace_id: &str) -> Result<(), EventError>;
}

/// Redis implementation of [`EventStore`].
pub struct RedisEventStore {
    client: redis::Client,
    redis: ConnectionManager,
    max_len: usize,
}

impl RedisEventStore {
    /// Connects to Redis and creates a new event store.
    pub async fn connect(redis_url: &str, max_len: usize) -> Result<Self, EventError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EventError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| EventError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_parts(client, redis, max_len))
    }

    pub fn from_parts(client: redis::Client, redis: ConnectionManager, max_len: usize) -> Self {
        Self {
            client,
            redis,
            max_len,
        }
    }

    fn parse_entry(entry: &redis::streams::StreamId) -> Result<StreamEntry, EventError> {
        let field = |name: &str| -> Result<String, EventError> {
            entry
                .get::<String>(name)
                .ok_or_else(|| EventError::MalformedEntry {
                    id: entry.id.clone(),
                    message: format!("missing field '{}'", name),
                })
        };

        Ok(StreamEntry {
            id: entry.id.parse()?,
            task_id: field("task_id")?,
            task_type: field("task_type")?,
            event_name: field("event_name")?,
            payload: field("payload")?,
            file: entry.get::<String>("file").unwrap_or_default(),
            line: entry
                .get::<String>("line")
                .and_then(|l| l.parse().ok())
                .unwrap_or_default(),
            function: entry.get::<String>("fn").unwrap_or_default(),
        })
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn publish(&self, trace_id: &str, event: &TraceEvent) -> Result<StreamId, EventError> {
        let fields = event.to_fields()?;
        let mut conn = self.redis.clone();
        let id: String = conn
            .xadd_maxlen(
                stream_key(trace_id),
                StreamMaxlen::Approx(self.max_len),
                "*",
                &fields,
            )
            .await?;
        id.parse()
    }

    async fn read(
        &self,
        trace_id: &str,
        from: StreamId,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, EventError> {
        let key = stream_key(trace_id);
        let from = from.to_string();
        let mut options = StreamReadOptions::default().count(max_count.max(1));

        let reply: Option<StreamReadReply> = if block.is_zero() {
            let mut conn = self.redis.clone();
            conn.xread_options(&[&key], &[&from], &options).await?
        } else {
            // Blocking reads get their own connection so they do not stall
            // the shared multiplexed one.
            options = options.block(block.as_millis().max(1) as usize);
            let mut conn = self.client.get_multiplexed_tokio_connection().await?;
            conn.xread_options(&[&key], &[&from], &options).await?
        };

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for stream in reply.keys {
                for entry in &stream.ids {
                    entries.push(Self::parse_entry(entry)?);
                }
            }
        }
        Ok(entries)
    }

    async fn len(&self, trace_id: &str) -> Result<usize, EventError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.xlen(stream_key(trace_id)).await?;
        Ok(len)
    }

    async fn delete(&self, trace_id: &str) -> Result<(), EventError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(stream_key(trace_id)).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryStreams {
    streams: HashMap<String, Vec<StreamEntry>>,
    last_id: HashMap<String, StreamId>,
}

/// In-process [`EventStore`] with exact length capping.
#[derive(Debug)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryStreams>,
    appended: Notify,
    max_len: usize,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_MAXLEN)
    }
}

impl MemoryEventStore {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryStreams::default()),
            appended: Notify::new(),
            max_len,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStreams> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All retained entries of a trace, in id order.
    pub fn entries(&self, trace_id: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(trace_id)
            .cloned()
            .unwrap_or_default()
    }

    fn read_now(&self, trace_id: &str, from: StreamId, max_count: usize) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(trace_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > from)
                    .take(max_count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn publish(&self, trace_id: &str, event: &TraceEvent) -> Result<StreamId, EventError> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = {
            let mut inner = self.lock();
            let last = inner.last_id.get(trace_id).copied().unwrap_or_default();
            let id = if now_ms > last.ms {
                StreamId::new(now_ms, 0)
            } else {
                StreamId::new(last.ms, last.seq + 1)
            };
            let entry = StreamEntry::from_event(id, event)?;

            let stream = inner.streams.entry(trace_id.to_string()).or_default();
            stream.push(entry);
            if stream.len() > self.max_len {
                let excess = stream.len() - self.max_len;
                stream.drain(..excess);
            }
            inner.last_id.insert(trace_id.to_string(), id);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        trace_id: &str,
        from: StreamId,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, EventError> {
        let max_count = max_count.max(1);
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            let entries = self.read_now(trace_id, from, max_count);
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.read_now(trace_id, from, max_count));
            }
        }
    }

    async fn len(&self, trace_id: &str) -> Result<usize, EventError> {
        Ok(self.lock().streams.get(trace_id).map_or(0, Vec::len))
    }

    async fn delete(&self, trace_id: &str) -> Result<(), EventError> {
        let mut inner = self.lock();
        inner.streams.remove(trace_id);
        inner.last_id.remove(trace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventPayload, TaskStatusKind};
    use crate::scheduler::task::TaskType;

    fn status_event(task_id: &str) -> TraceEvent {
        TraceEvent::new(
            task_id,
            TaskType::Custom,
            EventPayload::status(TaskStatusKind::Running, None),
        )
    }

    #[test]
    fn test_stream_key_layout() {
        assert_eq!(stream_key("abc"), "log:abc");
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let store = MemoryEventStore::default();
        let mut last = StreamId::ZERO;
        for i in 0..50 {
            let id = store
                .publish("t", &status_event(&format!("task-{}", i)))
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_two_readers_see_identical_sequence() {
        let store = MemoryEventStore::default();
        for i in 0..10 {
            store
                .publish("t", &status_event(&format!("task-{}", i)))
                .await
                .unwrap();
        }

        let a = store.read("t", StreamId::ZERO, 100, Duration::ZERO).await.unwrap();
        let b = store.read("t", StreamId::ZERO, 100, Duration::ZERO).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_read_after_id_and_count() {
        let store = MemoryEventStore::default();
        let first = store.publish("t", &status_event("a")).await.unwrap();
        store.publish("t", &status_event("b")).await.unwrap();
        store.publish("t", &status_event("c")).await.unwrap();

        let rest = store.read("t", first, 1, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].task_id, "b");
    }

    #[tokio::test]
    async fn test_max_len_evicts_oldest() {
        let store = MemoryEventStore::new(3);
        for id in ["a", "b", "c", "d", "e"] {
            store.publish("t", &status_event(id)).await.unwrap();
        }

        let entries = store.entries("t");
        let ids: Vec<&str> = entries.iter().map(|e| e.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);
        assert_eq!(store.len("t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let store = std::sync::Arc::new(MemoryEventStore::default());
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read("t", StreamId::ZERO, 10, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.publish("t", &status_event("late")).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task_id, "late");
    }

    #[tokio::test]
    async fn test_streams_are_per_trace() {
        let store = MemoryEventStore::default();
        store.publish("t1", &status_event("a")).await.unwrap();
        store.publish("t2", &status_event("b")).await.unwrap();
        store.delete("t1").await.unwrap();

        assert_eq!(store.len("t1").await.unwrap(), 0);
        assert_eq!(store.len("t2").await.unwrap(), 1);
    }
}
