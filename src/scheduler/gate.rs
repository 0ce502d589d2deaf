//! Global concurrency gate.
//!
//! A single integer counter at `task:concurrency_lock` caps the number of
//! tasks in flight. Acquire is a scripted compare-and-increment so that
//! several dispatcher processes can never push the counter past the ceiling;
//! release decrements with a floor at zero.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::queue::{QueueError, CONCURRENCY_LOCK_KEY};

const ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return 0
end
redis.call('INCR', KEYS[1])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 0 then
    redis.call('SET', KEYS[1], 0)
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Counter that bounds in-flight work.
#[async_trait]
pub trait ConcurrencyGate: Send + Sync {
    /// Increments the counter if it is below `max`. Returns whether a slot was taken.
    async fn try_acquire(&self, max: u64) -> Result<bool, QueueError>;

    /// Gives a slot back. Never drives the counter below zero.
    async fn release(&self) -> Result<(), QueueError>;

    /// Forces the counter to zero.
    ///
    /// Called once at dispatcher startup, when no worker can hold a slot.
    async fn reset(&self) -> Result<(), QueueError>;

    /// Current counter value.
    async fn current(&self) -> Result<u64, QueueError>;
}

/// Redis-backed [`ConcurrencyGate`].
pub struct RedisGate {
    redis: ConnectionManager,
    acquire: redis::Script,
    release: redis::Script,
}

impl RedisGate {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            acquire: redis::Script::new(ACQUIRE_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl ConcurrencyGate for RedisGate {
    async fn try_acquire(&self, max: u64) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let acquired: i64 = self
            .acquire
            .key(CONCURRENCY_LOCK_KEY)
            .arg(max)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        self.release
            .key(CONCURRENCY_LOCK_KEY)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(CONCURRENCY_LOCK_KEY, 0).await?;
        Ok(())
    }

    async fn current(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let value: Option<i64> = conn.get(CONCURRENCY_LOCK_KEY).await?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }
}

/// In-process [`ConcurrencyGate`].
#[derive(Debug, Default)]
pub struct MemoryGate {
    counter: AtomicU64,
}

impl MemoryGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConcurrencyGate for MemoryGate {
    async fn try_acquire(&self, max: u64) -> Result<bool, QueueError> {
        Ok(self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < max).then_some(c + 1)
            })
            .is_ok())
    }

    async fn release(&self) -> Result<(), QueueError> {
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        Ok(())
    }

    async fn reset(&self) -> Result<(), QueueError> {
        self.counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn current(&self) -> Result<u64, QueueError> {
        Ok(self.counter.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_gate_caps_at_max() {
        let gate = MemoryGate::new();

        assert!(gate.try_acquire(2).await.unwrap());
        assert!(gate.try_acquire(2).await.unwrap());
        assert!(!gate.try_acquire(2).await.unwrap());
        assert_eq!(gate.current().await.unwrap(), 2);

        gate.release().await.unwrap();
        assert!(gate.try_acquire(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_gate_release_floors_at_zero() {
        let gate = MemoryGate::new();
        gate.release().await.unwrap();
        gate.release().await.unwrap();
        assert_eq!(gate.current().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_gate_reset() {
        let gate = MemoryGate::new();
        gate.try_acquire(10).await.unwrap();
        gate.try_acquire(10).await.unwrap();
        gate.reset().await.unwrap();
        assert_eq!(gate.current().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_gate_concurrent_acquire_never_exceeds_max() {
        let gate = std::sync::Arc::new(MemoryGate::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.try_acquire(7).await.unwrap() }));
        }

        let mut acquired = 0;
        for h in handles {
            if h.await.unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 7);
        assert_eq!(gate.current().await.unwrap(), 7);
    }
}
