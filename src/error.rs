//! Error classification for rcabench-dispatch.
//!
//! Each subsystem owns its error enum:
//! - Queue store and concurrency gate: [`QueueError`]
//! - Event streams: [`EventError`]
//! - Task repository: [`StorageError`]
//! - Submission: [`SubmitError`]
//! - Handlers: [`HandlerError`]
//! - Dispatcher lifecycle: [`DispatcherError`]
//! - Configuration: [`ConfigError`]
//!
//! Callers that need to decide what to do with a failure ask for its
//! [`ErrorKind`] through [`Classify`] instead of matching on variants of
//! another module's enum.

use std::fmt;
use std::time::Duration;

use rand::RngExt;

use crate::config::ConfigError;
use crate::events::EventError;
use crate::scheduler::dispatcher::DispatcherError;
use crate::scheduler::handler::HandlerError;
use crate::scheduler::queue::QueueError;
use crate::scheduler::submitter::SubmitError;
use crate::storage::{MigrationError, StorageError};

/// Upper bound for transient retry sleeps.
pub const MAX_TRANSIENT_BACKOFF: Duration = Duration::from_secs(30);

const BASE_TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// What kind of failure an error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Store unavailable; retry with backoff, never dead-letter.
    Transient,
    /// Business failure reported by a handler.
    Handler,
    /// Undecodable queue entry.
    Poison,
    /// Rejected input; nothing was written.
    Validation,
    NotFound,
    AlreadyExists,
    /// Explicit cancellation or an expired deadline.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Handler => "handler",
            ErrorKind::Poison => "poison",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_transient(&self) -> bool {
        *self == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto the failure taxonomy.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            QueueError::ConnectionFailed(_) | QueueError::RedisError(_) => ErrorKind::Transient,
            QueueError::SerializationFailed(_) => ErrorKind::Poison,
        }
    }
}

impl Classify for EventError {
    fn kind(&self) -> ErrorKind {
        match self {
            EventError::ConnectionFailed(_) | EventError::RedisError(_) => ErrorKind::Transient,
            EventError::UnknownEvent(_)
            | EventError::PayloadMismatch { .. }
            | EventError::MalformedEntry { .. }
            | EventError::SerializationFailed(_) => ErrorKind::Validation,
        }
    }
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::ConnectionFailed(_) | StorageError::QueryFailed(_) => {
                ErrorKind::Transient
            }
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::InvalidData(_) | StorageError::Serialization(_) => {
                ErrorKind::Validation
            }
            StorageError::Migration(MigrationError::Database(_)) => ErrorKind::Transient,
            StorageError::Migration(_) => ErrorKind::Validation,
        }
    }
}

impl Classify for SubmitError {
    fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Validation(_) | SubmitError::Serialization(_) => ErrorKind::Validation,
            SubmitError::ParentNotFound(_) => ErrorKind::NotFound,
            SubmitError::Storage(e) => e.kind(),
            SubmitError::Queue(e) => e.kind(),
        }
    }
}

impl Classify for HandlerError {
    fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Failed(_) | HandlerError::NoHandler(_) => ErrorKind::Handler,
            HandlerError::InvalidPayload(_) => ErrorKind::Poison,
            HandlerError::Rejected(_) => ErrorKind::Validation,
            HandlerError::Cancelled | HandlerError::DeadlineExceeded(_) => ErrorKind::Cancelled,
            HandlerError::Storage(e) => e.kind(),
            HandlerError::Event(e) => e.kind(),
            HandlerError::Submit(e) => e.kind(),
        }
    }
}

impl Classify for DispatcherError {
    fn kind(&self) -> ErrorKind {
        match self {
            DispatcherError::AlreadyRunning
            | DispatcherError::NotRunning
            | DispatcherError::InvalidConfig(_) => ErrorKind::Validation,
            DispatcherError::ShutdownTimeout(_) => ErrorKind::Transient,
            DispatcherError::Queue(e) => e.kind(),
        }
    }
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Sleep before transient retry number `attempt` (starting at 0).
///
/// Exponential from 100 ms, capped at [`MAX_TRANSIENT_BACKOFF`], with up to
/// half of the delay replaced by random jitter.
pub fn transient_backoff(attempt: u32) -> Duration {
    let exp = BASE_TRANSIENT_BACKOFF
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(MAX_TRANSIENT_BACKOFF);
    let half = exp.as_millis() as u64 / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..=half)
    };
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kinds() {
        assert_eq!(
            StorageError::NotFound("x".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            StorageError::AlreadyExists("x".to_string()).kind(),
            ErrorKind::AlreadyExists
        );
        assert!(StorageError::ConnectionFailed("down".to_string())
            .kind()
            .is_transient());
    }

    #[test]
    fn test_nested_kinds_pass_through() {
        let err = HandlerError::Storage(StorageError::ConnectionFailed("down".to_string()));
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = HandlerError::Submit(SubmitError::Validation("bad".to_string()));
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert_eq!(HandlerError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            HandlerError::Failed("boom".to_string()).kind(),
            ErrorKind::Handler
        );
    }

    #[test]
    fn test_queue_kinds() {
        assert_eq!(
            QueueError::ConnectionFailed("x".to_string()).kind(),
            ErrorKind::Transient
        );
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(QueueError::SerializationFailed(json_err).kind(), ErrorKind::Poison);
    }

    #[test]
    fn test_transient_backoff_bounds() {
        for attempt in 0..40 {
            let d = transient_backoff(attempt);
            assert!(d <= MAX_TRANSIENT_BACKOFF);
            assert!(d >= Duration::from_millis(50));
        }
        assert!(transient_backoff(30) >= MAX_TRANSIENT_BACKOFF / 2);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::AlreadyExists.to_string(), "already_exists");
    }
}
