//! Integration tests for the Redis-backed stores.
//!
//! These tests need a running Redis and FLUSH the selected database.
//! Run with: REDIS_URL=redis://127.0.0.1:6379/15 cargo test --test redis_integration -- --ignored

use std::time::Duration;

use rcabench_dispatch::events::{
    EventPayload, EventStore, RedisEventStore, StreamId, TaskStatusKind, TraceEvent,
};
use rcabench_dispatch::scheduler::{
    ConcurrencyGate, QueueBackend, QueueName, QueuedTask, RedisGate, RedisQueue, TaskType,
};

/// Tests in this file share the queue keys.
static REDIS_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
}

async fn flushed_queue() -> RedisQueue {
    let queue = RedisQueue::connect(&redis_url())
        .await
        .expect("Redis must be reachable for integration tests");
    let mut conn = queue.connection();
    redis::cmd("FLUSHDB")
        .query_async::<_, ()>(&mut conn)
        .await
        .expect("FLUSHDB");
    queue
}

fn entry(task_id: &str) -> String {
    QueuedTask {
        task_id: task_id.to_string(),
        task_type: TaskType::Custom,
        trace_id: format!("trace-{}", task_id),
        group_id: None,
        parent_task_id: None,
        level: 0,
        execute_time: None,
        retry_count: 0,
        deadline: None,
        payload: serde_json::json!({}),
    }
    .encode()
    .expect("encode")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_delayed_task_is_promoted_once_due() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;

    queue.submit_delayed(&entry("t1"), "t1", 100).await.unwrap();
    queue.submit_delayed(&entry("t2"), "t2", 200).await.unwrap();
    assert_eq!(queue.index_of("t1").await.unwrap(), Some(QueueName::Delayed));

    let promoted = queue.promote_due(150).await.unwrap();
    assert_eq!(promoted.len(), 1);
    assert_eq!(queue.index_of("t1").await.unwrap(), Some(QueueName::Ready));
    assert_eq!(queue.index_of("t2").await.unwrap(), Some(QueueName::Delayed));

    let taken = queue
        .blocking_take(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("promoted task is ready");
    assert_eq!(QueuedTask::peek_task_id(&taken).as_deref(), Some("t1"));
    assert!(queue
        .blocking_take(Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_ready_list_is_fifo() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;

    for id in ["a", "b", "c"] {
        queue.submit_immediate(&entry(id), id).await.unwrap();
    }
    let mut order = Vec::new();
    while let Some(raw) = queue.blocking_take(Duration::from_millis(100)).await.unwrap() {
        order.extend(QueuedTask::peek_task_id(&raw));
    }
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
#[ignore]
async fn test_dead_letters_replay_and_permanent_entries() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;

    queue
        .dead_letter(&entry("retry"), Some(Duration::ZERO))
        .await
        .unwrap();
    queue.dead_letter(&entry("gone"), None).await.unwrap();
    queue.dead_letter_poison("not json", "bad entry").await.unwrap();

    let now = chrono::Utc::now().timestamp() + 1;
    let replayed = queue.replay_dead_letters(now).await.unwrap();
    assert_eq!(replayed.len(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.dead, 2);
    let remaining = queue.peek_dead_letters(10).await.unwrap();
    assert!(remaining.iter().all(|(_, score)| score.is_infinite()));
}

#[tokio::test]
#[ignore]
async fn test_remove_by_id_from_every_collection() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;

    queue.submit_immediate(&entry("r"), "r").await.unwrap();
    queue.submit_delayed(&entry("d"), "d", i64::MAX / 2).await.unwrap();

    assert!(queue.remove_by_id(QueueName::Ready, "r").await.unwrap());
    assert!(queue.remove_by_id(QueueName::Delayed, "d").await.unwrap());
    assert!(!queue.remove_by_id(QueueName::Ready, "r").await.unwrap());
    assert_eq!(queue.stats().await.unwrap().total(), 0);
}

#[tokio::test]
#[ignore]
async fn test_gate_never_exceeds_max() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;
    let gate = RedisGate::new(queue.connection());

    gate.reset().await.unwrap();
    assert!(gate.try_acquire(2).await.unwrap());
    assert!(gate.try_acquire(2).await.unwrap());
    assert!(!gate.try_acquire(2).await.unwrap());
    assert_eq!(gate.current().await.unwrap(), 2);

    gate.release().await.unwrap();
    gate.release().await.unwrap();
    gate.release().await.unwrap();
    assert_eq!(gate.current().await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_event_stream_append_and_read() {
    let _guard = REDIS_LOCK.lock().await;
    let queue = flushed_queue().await;
    drop(queue);

    let store = RedisEventStore::connect(&redis_url(), 100).await.unwrap();
    let trace_id = "trace-events";
    for status in [TaskStatusKind::Running, TaskStatusKind::Completed] {
        let event = TraceEvent::new("t1", TaskType::Custom, EventPayload::status(status, None));
        store.publish(trace_id, &event).await.unwrap();
    }

    let entries = store
        .read(trace_id, StreamId::ZERO, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].id < entries[1].id);
    let second = entries[1].decode().unwrap();
    assert_eq!(
        second.payload,
        EventPayload::status(TaskStatusKind::Completed, None)
    );

    let tail = store
        .read(trace_id, entries[1].id, 10, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(tail.is_empty());
    assert_eq!(store.len(trace_id).await.unwrap(), 2);
}
