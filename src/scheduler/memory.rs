//! In-process queue store.
//!
//! `MemoryQueue` implements [`QueueBackend`] with the same collection
//! semantics as the Redis store. It backs dry runs and the dispatcher tests;
//! every operation holds a single lock, which gives the same atomicity the
//! Lua scripts give on Redis.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::queue::{dead_letter_score, QueueBackend, QueueError, QueueName, QueueStats};
use super::task::QueuedTask;

#[derive(Debug, Default)]
struct State {
    /// (score, member) kept sorted by score, then insertion.
    delayed: Vec<(f64, String)>,
    /// Front = left (newest), back = right (oldest).
    ready: VecDeque<String>,
    dead: Vec<(f64, String)>,
    index: HashMap<String, QueueName>,
}

impl State {
    fn zadd(set: &mut Vec<(f64, String)>, score: f64, member: String) {
        set.retain(|(_, m)| *m != member);
        let pos = set.partition_point(|(s, _)| *s <= score);
        set.insert(pos, (score, member));
    }

    fn move_due(&mut self, from: QueueName, now: i64) -> Vec<String> {
        let set = match from {
            QueueName::Delayed => &mut self.delayed,
            QueueName::DeadLetter => &mut self.dead,
            QueueName::Ready => return Vec::new(),
        };
        let split = set.partition_point(|(s, _)| *s <= now as f64);
        let due: Vec<String> = set.drain(..split).map(|(_, m)| m).collect();

        for member in &due {
            self.ready.push_front(member.clone());
            if let Some(task_id) = QueuedTask::peek_task_id(member) {
                self.index.insert(task_id, QueueName::Ready);
            }
        }
        due
    }
}

/// In-memory [`QueueBackend`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    ready_signal: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the ready list, left-most (newest) first.
    pub fn ready_snapshot(&self) -> Vec<String> {
        self.lock().ready.iter().cloned().collect()
    }

    /// Snapshot of the delayed set, lowest score first.
    pub fn delayed_snapshot(&self) -> Vec<(f64, String)> {
        self.lock().delayed.clone()
    }

    /// Snapshot of the dead-letter set, lowest score first.
    pub fn dead_snapshot(&self) -> Vec<(f64, String)> {
        self.lock().dead.clone()
    }

    /// Rescores every dead-letter entry with a finite score to `score`.
    ///
    /// Lets tests fast-forward the backoff without sleeping.
    pub fn rescore_dead_letters(&self, score: f64) {
        let mut state = self.lock();
        for entry in state.dead.iter_mut() {
            if entry.0.is_finite() {
                entry.0 = score;
            }
        }
    }

    fn try_pop(&self) -> Option<String> {
        self.lock().ready.pop_back()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn submit_immediate(&self, payload: &str, task_id: &str) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            state.ready.push_front(payload.to_string());
            state.index.insert(task_id.to_string(), QueueName::Ready);
        }
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn submit_delayed(
        &self,
        payload: &str,
        task_id: &str,
        execute_time: i64,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        State::zadd(&mut state.delayed, execute_time as f64, payload.to_string());
        state.index.insert(task_id.to_string(), QueueName::Delayed);
        Ok(())
    }

    async fn promote_due(&self, now: i64) -> Result<Vec<String>, QueueError> {
        let due = self.lock().move_due(QueueName::Delayed, now);
        if !due.is_empty() {
            self.ready_signal.notify_waiters();
        }
        Ok(due)
    }

    async fn blocking_take(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.ready_signal.notified();
            if let Some(payload) = self.try_pop() {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop());
            }
        }
    }

    async fn dead_letter(
        &self,
        payload: &str,
        backoff: Option<Duration>,
    ) -> Result<(), QueueError> {
        let score = dead_letter_score(chrono::Utc::now().timestamp(), backoff);
        let mut state = self.lock();
        State::zadd(&mut state.dead, score, payload.to_string());
        if let Some(task_id) = QueuedTask::peek_task_id(payload) {
            state.index.insert(task_id, QueueName::DeadLetter);
        }
        Ok(())
    }

    async fn replay_dead_letters(&self, now: i64) -> Result<Vec<String>, QueueError> {
        let due = self.lock().move_due(QueueName::DeadLetter, now);
        if !due.is_empty() {
            self.ready_signal.notify_waiters();
        }
        Ok(due)
    }

    async fn remove_by_id(&self, queue: QueueName, task_id: &str) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let matches = |member: &String| QueuedTask::peek_task_id(member).as_deref() == Some(task_id);

        let removed = match queue {
            QueueName::Ready => match state.ready.iter().position(matches) {
                Some(pos) => state.ready.remove(pos).is_some(),
                None => false,
            },
            QueueName::Delayed => match state.delayed.iter().position(|(_, m)| matches(m)) {
                Some(pos) => {
                    state.delayed.remove(pos);
                    true
                }
                None => false,
            },
            QueueName::DeadLetter => match state.dead.iter().position(|(_, m)| matches(m)) {
                Some(pos) => {
                    state.dead.remove(pos);
                    true
                }
                None => false,
            },
        };
        Ok(removed)
    }

    async fn unset_index(&self, task_id: &str) -> Result<(), QueueError> {
        self.lock().index.remove(task_id);
        Ok(())
    }

    async fn index_of(&self, task_id: &str) -> Result<Option<QueueName>, QueueError> {
        Ok(self.lock().index.get(task_id).copied())
    }

    async fn peek_dead_letters(&self, limit: usize) -> Result<Vec<(String, f64)>, QueueError> {
        Ok(self
            .lock()
            .dead
            .iter()
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(QueueStats {
            delayed: state.delayed.len(),
            ready: state.ready.len(),
            dead: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskType;

    fn payload(task_id: &str) -> String {
        QueuedTask {
            task_id: task_id.to_string(),
            task_type: TaskType::Custom,
            trace_id: "trace".to_string(),
            group_id: None,
            parent_task_id: None,
            level: 0,
            execute_time: None,
            retry_count: 0,
            deadline: None,
            payload: serde_json::Value::Null,
        }
        .encode()
        .expect("encode")
    }

    #[tokio::test]
    async fn test_delayed_promotion_respects_score() {
        let queue = MemoryQueue::new();
        let now = 1_000;
        let a = payload("a");
        queue.submit_delayed(&a, "a", now + 2).await.unwrap();

        assert!(queue.promote_due(now + 1).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().ready, 0);

        let promoted = queue.promote_due(now + 3).await.unwrap();
        assert_eq!(promoted, vec![a.clone()]);
        assert_eq!(queue.ready_snapshot().first(), Some(&a));
        assert!(queue.delayed_snapshot().is_empty());
        assert_eq!(queue.index_of("a").await.unwrap(), Some(QueueName::Ready));
    }

    #[tokio::test]
    async fn test_promote_empty_is_ok() {
        let queue = MemoryQueue::new();
        assert!(queue.promote_due(i64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_undecodable_payload() {
        let queue = MemoryQueue::new();
        queue.submit_delayed("garbage", "g", 1).await.unwrap();

        let promoted = queue.promote_due(2).await.unwrap();
        assert_eq!(promoted, vec!["garbage".to_string()]);
        assert_eq!(queue.ready_snapshot(), vec!["garbage".to_string()]);
    }

    #[tokio::test]
    async fn test_poisoned_task_stays_indexed_in_dead_letters() {
        let queue = MemoryQueue::new();
        let raw = payload("p");
        queue.submit_immediate(&raw, "p").await.unwrap();
        let taken = queue
            .blocking_take(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        queue.dead_letter_poison(&taken, "encode failed").await.unwrap();

        assert_eq!(queue.index_of("p").await.unwrap(), Some(QueueName::DeadLetter));
        assert!(queue.dead_snapshot()[0].0.is_infinite());
        assert!(queue.replay_dead_letters(i64::MAX).await.unwrap().is_empty());
        assert!(queue.remove_by_id(QueueName::DeadLetter, "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_ready_is_fifo() {
        let queue = MemoryQueue::new();
        for id in ["a", "b", "c"] {
            queue.submit_immediate(&payload(id), id).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(p) = queue.blocking_take(Duration::from_millis(10)).await.unwrap() {
            order.push(QueuedTask::decode(&p).unwrap().task_id);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_blocking_take_times_out() {
        let queue = MemoryQueue::new();
        let started = tokio::time::Instant::now();
        let taken = queue.blocking_take(Duration::from_millis(50)).await.unwrap();

        assert!(taken.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocking_take_wakes_on_push() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let taker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.blocking_take(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.submit_immediate(&payload("x"), "x").await.unwrap();

        let taken = taker.await.unwrap().unwrap();
        assert_eq!(taken, Some(payload("x")));
    }

    #[tokio::test]
    async fn test_dead_letter_permanent_entries_never_replay() {
        let queue = MemoryQueue::new();
        queue
            .dead_letter(&payload("retry"), Some(Duration::from_secs(0)))
            .await
            .unwrap();
        queue.dead_letter(&payload("stuck"), None).await.unwrap();
        assert_eq!(
            queue.index_of("stuck").await.unwrap(),
            Some(QueueName::DeadLetter)
        );

        let replayed = queue.replay_dead_letters(i64::MAX / 2).await.unwrap();
        assert_eq!(replayed, vec![payload("retry")]);
        assert_eq!(queue.dead_snapshot().len(), 1);
        assert_eq!(queue.index_of("retry").await.unwrap(), Some(QueueName::Ready));
    }

    #[tokio::test]
    async fn test_remove_by_id_each_queue() {
        let queue = MemoryQueue::new();
        queue.submit_immediate(&payload("r"), "r").await.unwrap();
        queue.submit_delayed(&payload("d"), "d", 10).await.unwrap();
        queue.dead_letter(&payload("x"), None).await.unwrap();

        assert!(queue.remove_by_id(QueueName::Ready, "r").await.unwrap());
        assert!(queue.remove_by_id(QueueName::Delayed, "d").await.unwrap());
        assert!(queue.remove_by_id(QueueName::DeadLetter, "x").await.unwrap());
        assert!(!queue.remove_by_id(QueueName::Ready, "r").await.unwrap());
        assert_eq!(queue.stats().await.unwrap().total(), 0);

        queue.unset_index("r").await.unwrap();
        assert_eq!(queue.index_of("r").await.unwrap(), None);
    }
}
