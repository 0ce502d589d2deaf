//! Trace event model.
//!
//! Every event kind carries a fixed payload schema. Publishers can only build
//! events through [`EventPayload`], so unknown kinds never reach a stream;
//! readers route on the wire `event_name` and reject payloads that do not
//! match the schema of that kind.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::task::TaskType;

/// Errors that can occur while publishing or reading events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The entry names an event kind outside the closed set.
    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    /// The payload does not match the schema of its event kind.
    #[error("Invalid payload for {event}: {message}")]
    PayloadMismatch { event: String, message: String },

    /// A required stream field is missing or malformed.
    #[error("Malformed stream entry {id}: {message}")]
    MalformedEntry { id: String, message: String },

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    ImageBuildSucceed,
    ImageBuildFailed,
    FaultInjected,
    FaultInjectFailed,
    AlgoRunSucceed,
    AlgoRunFailed,
    DatapackNoAnomaly,
    DatapackNoDetectorData,
    DatapackResultCollection,
    TaskStatusUpdate,
}

impl EventName {
    pub const ALL: [EventName; 10] = [
        EventName::ImageBuildSucceed,
        EventName::ImageBuildFailed,
        EventName::FaultInjected,
        EventName::FaultInjectFailed,
        EventName::AlgoRunSucceed,
        EventName::AlgoRunFailed,
        EventName::DatapackNoAnomaly,
        EventName::DatapackNoDetectorData,
        EventName::DatapackResultCollection,
        EventName::TaskStatusUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ImageBuildSucceed => "ImageBuildSucceed",
            EventName::ImageBuildFailed => "ImageBuildFailed",
            EventName::FaultInjected => "FaultInjected",
            EventName::FaultInjectFailed => "FaultInjectFailed",
            EventName::AlgoRunSucceed => "AlgoRunSucceed",
            EventName::AlgoRunFailed => "AlgoRunFailed",
            EventName::DatapackNoAnomaly => "DatapackNoAnomaly",
            EventName::DatapackNoDetectorData => "DatapackNoDetectorData",
            EventName::DatapackResultCollection => "DatapackResultCollection",
            EventName::TaskStatusUpdate => "TaskStatusUpdate",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .iter()
            .copied()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| EventError::UnknownEvent(s.to_string()))
    }
}

/// Status carried by `TaskStatusUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatusKind {
    Pending,
    Running,
    Completed,
    Error,
}

/// Reference to an algorithm container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl AlgorithmRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            tag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageBuildInfo {
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureInfo {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionInfo {
    pub fault_injection_id: i64,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmRunInfo {
    pub algorithm: AlgorithmRef,
    pub datapack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatapackInfo {
    pub datapack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskStatusInfo {
    pub status: TaskStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Typed payload of a trace event, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    ImageBuildSucceed(ImageBuildInfo),
    ImageBuildFailed(FailureInfo),
    FaultInjected(InjectionInfo),
    FaultInjectFailed(FailureInfo),
    AlgoRunSucceed(AlgorithmRunInfo),
    AlgoRunFailed(AlgorithmRunInfo),
    DatapackNoAnomaly(DatapackInfo),
    DatapackNoDetectorData(DatapackInfo),
    DatapackResultCollection(DatapackInfo),
    TaskStatusUpdate(TaskStatusInfo),
}

impl EventPayload {
    /// Shorthand for a `TaskStatusUpdate` event.
    pub fn status(status: TaskStatusKind, message: Option<String>) -> Self {
        EventPayload::TaskStatusUpdate(TaskStatusInfo { status, message })
    }

    pub fn name(&self) -> EventName {
        match self {
            EventPayload::ImageBuildSucceed(_) => EventName::ImageBuildSucceed,
            EventPayload::ImageBuildFailed(_) => EventName::ImageBuildFailed,
            EventPayload::FaultInjected(_) => EventName::FaultInjected,
            EventPayload::FaultInjectFailed(_) => EventName::FaultInjectFailed,
            EventPayload::AlgoRunSucceed(_) => EventName::AlgoRunSucceed,
            EventPayload::AlgoRunFailed(_) => EventName::AlgoRunFailed,
            EventPayload::DatapackNoAnomaly(_) => EventName::DatapackNoAnomaly,
            EventPayload::DatapackNoDetectorData(_) => EventName::DatapackNoDetectorData,
            EventPayload::DatapackResultCollection(_) => EventName::DatapackResultCollection,
            EventPayload::TaskStatusUpdate(_) => EventName::TaskStatusUpdate,
        }
    }

    /// Encodes the payload body as the JSON string stored in the stream.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            EventPayload::ImageBuildSucceed(p) => serde_json::to_string(p),
            EventPayload::ImageBuildFailed(p) | EventPayload::FaultInjectFailed(p) => {
                serde_json::to_string(p)
            }
            EventPayload::FaultInjected(p) => serde_json::to_string(p),
            EventPayload::AlgoRunSucceed(p) | EventPayload::AlgoRunFailed(p) => {
                serde_json::to_string(p)
            }
            EventPayload::DatapackNoAnomaly(p)
            | EventPayload::DatapackNoDetectorData(p)
            | EventPayload::DatapackResultCollection(p) => serde_json::to_string(p),
            EventPayload::TaskStatusUpdate(p) => serde_json::to_string(p),
        }
    }

    /// Parses a payload body for the given event kind.
    pub fn from_json(name: EventName, json: &str) -> Result<Self, EventError> {
        fn parse<T: serde::de::DeserializeOwned>(
            name: EventName,
            json: &str,
        ) -> Result<T, EventError> {
            serde_json::from_str(json).map_err(|e| EventError::PayloadMismatch {
                event: name.to_string(),
                message: e.to_string(),
            })
        }

        Ok(match name {
            EventName::ImageBuildSucceed => EventPayload::ImageBuildSucceed(parse(name, json)?),
            EventName::ImageBuildFailed => EventPayload::ImageBuildFailed(parse(name, json)?),
            EventName::FaultInjected => EventPayload::FaultInjected(parse(name, json)?),
            EventName::FaultInjectFailed => EventPayload::FaultInjectFailed(parse(name, json)?),
            EventName::AlgoRunSucceed => EventPayload::AlgoRunSucceed(parse(name, json)?),
            EventName::AlgoRunFailed => EventPayload::AlgoRunFailed(parse(name, json)?),
            EventName::DatapackNoAnomaly => EventPayload::DatapackNoAnomaly(parse(name, json)?),
            EventName::DatapackNoDetectorData => {
                EventPayload::DatapackNoDetectorData(parse(name, json)?)
            }
            EventName::DatapackResultCollection => {
                EventPayload::DatapackResultCollection(parse(name, json)?)
            }
            EventName::TaskStatusUpdate => EventPayload::TaskStatusUpdate(parse(name, json)?),
        })
    }

    /// True for events that report a failure of the pipeline.
    pub fn is_failure(&self) -> bool {
        match self {
            EventPayload::ImageBuildFailed(_)
            | EventPayload::FaultInjectFailed(_)
            | EventPayload::AlgoRunFailed(_) => true,
            EventPayload::TaskStatusUpdate(info) => info.status == TaskStatusKind::Error,
            _ => false,
        }
    }
}

/// Source location of the code that published an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerInfo {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl CallerInfo {
    /// Captures the caller's file and line.
    #[track_caller]
    pub fn here(function: &str) -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
            function: function.to_string(),
        }
    }
}

/// Captures the current file, line and module path as a [`CallerInfo`].
#[macro_export]
macro_rules! caller_info {
    () => {
        $crate::events::CallerInfo {
            file: file!().to_string(),
            line: line!(),
            function: module_path!().to_string(),
        }
    };
}

/// An event about one task of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub task_id: String,
    pub task_type: TaskType,
    pub payload: EventPayload,
    pub caller: CallerInfo,
}

impl TraceEvent {
    pub fn new(task_id: impl Into<String>, task_type: TaskType, payload: EventPayload) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            payload,
            caller: CallerInfo::default(),
        }
    }

    pub fn with_caller(mut self, caller: CallerInfo) -> Self {
        self.caller = caller;
        self
    }

    pub fn name(&self) -> EventName {
        self.payload.name()
    }

    /// Flattens the event into the stream field list.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, EventError> {
        Ok(vec![
            ("task_id", self.task_id.clone()),
            ("task_type", self.task_type.to_string()),
            ("event_name", self.name().to_string()),
            ("payload", self.payload.to_json()?),
            ("file", self.caller.file.clone()),
            ("line", self.caller.line.to_string()),
            ("fn", self.caller.function.clone()),
        ])
    }
}

/// Id of a stream entry, `<epoch-ms>-<sequence>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// The id before every entry; reading from it replays the whole stream.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Server-assigned event time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.ms as i64)
            .single()
            .unwrap_or_default()
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || EventError::MalformedEntry {
            id: s.to_string(),
            message: "stream id must look like <ms>-<seq>".to_string(),
        };
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(StreamId {
            ms: ms.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

/// A raw stream entry as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub task_id: String,
    pub task_type: String,
    pub event_name: String,
    pub payload: String,
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl StreamEntry {
    /// Builds the stored form of an event.
    pub fn from_event(id: StreamId, event: &TraceEvent) -> Result<Self, EventError> {
        Ok(Self {
            id,
            task_id: event.task_id.clone(),
            task_type: event.task_type.to_string(),
            event_name: event.name().to_string(),
            payload: event.payload.to_json()?,
            file: event.caller.file.clone(),
            line: event.caller.line,
            function: event.caller.function.clone(),
        })
    }

    /// Decodes the entry into a typed event.
    ///
    /// Fails with `UnknownEvent` for names outside the closed set and with
    /// `PayloadMismatch` when the payload does not fit its kind.
    pub fn decode(&self) -> Result<TraceEvent, EventError> {
        let name: EventName = self.event_name.parse()?;
        let payload = EventPayload::from_json(name, &self.payload)?;
        let task_type: TaskType =
            self.task_type
                .parse()
                .map_err(|message| EventError::MalformedEntry {
                    id: self.id.to_string(),
                    message,
                })?;

        Ok(TraceEvent {
            task_id: self.task_id.clone(),
            task_type,
            payload,
            caller: CallerInfo {
                file: self.file.clone(),
                line: self.line,
                function: self.function.clone(),
            },
        })
    }

    /// Server-assigned event time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.id.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn algo_event(name: &str) -> TraceEvent {
        TraceEvent::new(
            "task-1",
            TaskType::RunAlgorithm,
            EventPayload::AlgoRunSucceed(AlgorithmRunInfo {
                algorithm: AlgorithmRef::named(name),
                datapack: "dp-1".to_string(),
                execution_id: Some(7),
                error: None,
            }),
        )
    }

    #[test]
    fn test_stream_id_parse_and_order() {
        let a: StreamId = "1700000000000-0".parse().unwrap();
        let b: StreamId = "1700000000000-1".parse().unwrap();
        let c: StreamId = "1700000000001-0".parse().unwrap();

        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "1700000000000-0");
        assert_eq!("5".parse::<StreamId>().unwrap(), StreamId::new(5, 0));
        assert!("abc-1".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_stream_id_timestamp_from_ms_prefix() {
        let id = StreamId::new(1_700_000_000_123, 4);
        assert_eq!(id.timestamp().timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_entry_decode_routes_on_name() {
        let event = algo_event("alpha");
        let entry = StreamEntry::from_event(StreamId::new(1, 0), &event).unwrap();
        assert_eq!(entry.event_name, "AlgoRunSucceed");

        let decoded = entry.decode().unwrap();
        assert_eq!(decoded.payload, event.payload);
        assert_eq!(decoded.task_type, TaskType::RunAlgorithm);
    }

    #[test]
    fn test_entry_decode_rejects_mismatched_payload() {
        let mut entry = StreamEntry::from_event(StreamId::new(1, 0), &algo_event("a")).unwrap();
        entry.event_name = "TaskStatusUpdate".to_string();

        match entry.decode() {
            Err(EventError::PayloadMismatch { event, .. }) => {
                assert_eq!(event, "TaskStatusUpdate")
            }
            other => panic!("expected payload mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_decode_rejects_unknown_event() {
        let mut entry = StreamEntry::from_event(StreamId::new(1, 0), &algo_event("a")).unwrap();
        entry.event_name = "PodRestarted".to_string();

        assert!(matches!(entry.decode(), Err(EventError::UnknownEvent(_))));
    }

    #[test]
    fn test_status_payload_wire_format() {
        let payload = EventPayload::status(TaskStatusKind::Error, Some("boom".to_string()));
        let json = payload.to_json().unwrap();
        assert_eq!(json, r#"{"status":"Error","message":"boom"}"#);
        assert!(payload.is_failure());
    }

    #[test]
    fn test_fields_layout() {
        let event = algo_event("alpha").with_caller(CallerInfo::here("tests"));
        let fields = event.to_fields().unwrap();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();

        assert_eq!(
            keys,
            vec!["task_id", "task_type", "event_name", "payload", "file", "line", "fn"]
        );
        assert!(fields[4].1.ends_with("types.rs"));
    }

    #[test]
    fn test_caller_info_macro() {
        let caller = crate::caller_info!();
        assert!(caller.function.contains("events::types"));
        assert!(caller.line > 0);
    }
}
