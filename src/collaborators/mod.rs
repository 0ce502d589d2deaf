//! External systems the pipeline handlers drive.
//!
//! The dispatcher never talks to a container builder, chaos engine or
//! algorithm runtime directly. Each is reached through a trait here so that
//! deployments can plug in their own client and tests can use fakes.
//! [`CommandHook`] is the stock adapter: it runs a shell command per call
//! and exchanges JSON with it.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::AlgorithmRef;
use crate::storage::{DetectorResult, GranularityResult};

pub use command::CommandHook;

/// Errors reported by an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The collaborator could not be reached or started.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered with something we cannot parse.
    #[error("Invalid collaborator response: {0}")]
    InvalidResponse(String),
}

/// Container image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub image: String,
    pub tag: String,
    /// Build context (path or URL), collaborator specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Fault to inject into a benchmark system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectRequest {
    pub name: String,
    pub fault_type: String,
    pub benchmark: String,
    pub pedestal: String,
    pub engine_config: serde_json::Value,
    /// Seconds of normal traffic recorded before the fault.
    pub pre_duration: i64,
    /// Seconds the fault stays active.
    pub duration: i64,
}

/// Where the injected fault sits in time (epoch seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionWindow {
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmRequest {
    pub algorithm: AlgorithmRef,
    pub datapack: String,
    pub execution_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmRun {
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectRequest {
    pub algorithm: AlgorithmRef,
    pub datapack: String,
    pub execution_id: i64,
}

/// Output of one algorithm run. RCA algorithms fill `granularity`, the
/// detector fills `detector`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectedResults {
    #[serde(default)]
    pub granularity: Vec<GranularityResult>,
    #[serde(default)]
    pub detector: Vec<DetectorResult>,
}

/// Builds container images.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, CollaboratorError>;
}

/// Injects faults through the chaos engine.
#[async_trait]
pub trait ChaosInjector: Send + Sync {
    async fn inject(&self, request: &InjectRequest) -> Result<InjectionWindow, CollaboratorError>;
}

/// Runs an algorithm container against a datapack.
#[async_trait]
pub trait AlgorithmRunner: Send + Sync {
    async fn run(&self, request: &AlgorithmRequest) -> Result<AlgorithmRun, CollaboratorError>;
}

/// Reads back what an algorithm run produced.
#[async_trait]
pub trait ResultCollector: Send + Sync {
    async fn collect(&self, request: &CollectRequest)
        -> Result<CollectedResults, CollaboratorError>;
}
