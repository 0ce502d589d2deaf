//! Pipeline handlers for the built-in task types.
//!
//! ```text
//! BuildImage ─► ImageBuildSucceed
//!
//! InjectFault ─► FaultInjected ─► RunAlgorithm(detector) ─► CollectResult(detector)
//!                                                             │
//!                      DatapackNoAnomaly / NoDetectorData ◄───┤
//!                                                             ▼
//!                                              DatapackResultCollection
//!                                                             │
//!                           RunAlgorithm(a) ... RunAlgorithm(z) (fan-out)
//!                                  │                  │
//!                           CollectResult(a) ... CollectResult(z)
//! ```
//!
//! Handlers may run more than once for the same task (retries). Each one
//! checks what an earlier attempt already wrote before writing again, and
//! children are only spawned if an identical child does not exist yet.

pub mod build_image;
pub mod collect_result;
pub mod inject_fault;
pub mod run_algorithm;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collaborators::{
    AlgorithmRunner, ChaosInjector, CollaboratorError, ImageBuilder, ResultCollector,
};
use crate::events::AlgorithmRef;
use crate::scheduler::handler::{DispatchContext, HandlerError, HandlerRegistry};
use crate::scheduler::submitter::NewTask;
use crate::scheduler::task::{Task, TaskStatus, TaskType};

pub use build_image::BuildImageHandler;
pub use collect_result::CollectResultHandler;
pub use inject_fault::InjectFaultHandler;
pub use run_algorithm::RunAlgorithmHandler;

/// Payload of a `BuildImage` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildImagePayload {
    pub image: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn default_pre_duration() -> i64 {
    60
}

/// Payload of an `InjectFault` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectFaultPayload {
    /// Datapack name; derived from the benchmark and task id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fault_type: String,
    pub benchmark: String,
    pub pedestal: String,
    pub engine_config: serde_json::Value,
    #[serde(default = "default_pre_duration")]
    pub pre_duration: i64,
    /// Seconds the fault stays active.
    pub duration: i64,
    /// Algorithms to run when the detector finds anomalies.
    #[serde(default)]
    pub algorithms: Vec<AlgorithmRef>,
}

/// Payload of a `RunAlgorithm` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAlgorithmPayload {
    pub algorithm: AlgorithmRef,
    pub datapack: String,
    pub datapack_id: i64,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmRef>,
}

/// Payload of a `CollectResult` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectResultPayload {
    pub algorithm: AlgorithmRef,
    pub datapack: String,
    pub datapack_id: i64,
    pub execution_id: i64,
    #[serde(default)]
    pub algorithms: Vec<AlgorithmRef>,
}

/// The external systems the pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn ImageBuilder>,
    pub injector: Arc<dyn ChaosInjector>,
    pub runner: Arc<dyn AlgorithmRunner>,
    pub collector: Arc<dyn ResultCollector>,
}

/// Registers the four pipeline handlers on `registry`.
pub fn register_pipeline(registry: &mut HandlerRegistry, collaborators: Collaborators) {
    registry
        .register(
            TaskType::BuildImage,
            Arc::new(BuildImageHandler::new(collaborators.builder)),
        )
        .register(
            TaskType::InjectFault,
            Arc::new(InjectFaultHandler::new(collaborators.injector)),
        )
        .register(
            TaskType::RunAlgorithm,
            Arc::new(RunAlgorithmHandler::new(collaborators.runner)),
        )
        .register(
            TaskType::CollectResult,
            Arc::new(CollectResultHandler::new(collaborators.collector)),
        );
}

pub(crate) fn collaborator_failure(e: CollaboratorError) -> HandlerError {
    HandlerError::Failed(e.to_string())
}

/// Submits `child` under the current task unless an earlier attempt of this
/// task already spawned an identical one.
pub(crate) async fn submit_child_once(
    ctx: &DispatchContext,
    child: NewTask,
) -> Result<Task, HandlerError> {
    let parent_id = ctx.task().task_id.clone();
    let existing = ctx.db().get_task_with_children(&parent_id).await?;
    if let Some(task) = existing.children.into_iter().find(|t| {
        t.status == TaskStatus::Enabled
            && t.task_type == child.task_type
            && t.payload == child.payload
    }) {
        tracing::debug!(
            parent_task_id = %parent_id,
            task_id = %task.task_id,
            "Child already submitted"
        );
        return Ok(task);
    }

    Ok(ctx.submitter().submit(child.child_of(parent_id)).await?)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::collaborators::{AlgorithmRun, BuiltImage, CollectedResults, InjectionWindow};
    use serde_json::json;

    #[test]
    fn test_inject_payload_defaults() {
        let payload: InjectFaultPayload = serde_json::from_value(json!({
            "fault_type": "pod-kill",
            "benchmark": "ts",
            "pedestal": "ts-ui",
            "engine_config": {"a": 1},
            "duration": 120
        }))
        .unwrap();
        assert_eq!(payload.pre_duration, 60);
        assert!(payload.algorithms.is_empty());
        assert!(payload.name.is_none());
    }

    #[test]
    fn test_register_pipeline_covers_builtin_types() {
        let mut registry = HandlerRegistry::new();
        register_pipeline(
            &mut registry,
            Collaborators {
                builder: Scripted::<BuiltImage>::answering(vec![]),
                injector: Scripted::<InjectionWindow>::answering(vec![]),
                runner: Scripted::<AlgorithmRun>::answering(vec![]),
                collector: Scripted::<CollectedResults>::answering(vec![]),
            },
        );
        for task_type in [
            TaskType::BuildImage,
            TaskType::InjectFault,
            TaskType::RunAlgorithm,
            TaskType::CollectResult,
        ] {
            assert!(registry.handles(task_type));
        }
        assert!(!registry.handles(TaskType::Custom));
    }

    #[tokio::test]
    async fn test_submit_child_once_deduplicates() {
        let env = Env::new().await;
        let parent = env.submit(TaskType::Custom, json!({})).await;
        let ctx = env.context(&parent);

        let child = NewTask::new(TaskType::Custom, json!({"n": 1})).immediate();
        let first = submit_child_once(&ctx, child.clone()).await.unwrap();
        let second = submit_child_once(&ctx, child).await.unwrap();
        assert_eq!(first.task_id, second.task_id);
        assert_eq!(first.level, 1);

        let other = NewTask::new(TaskType::Custom, json!({"n": 2})).immediate();
        let third = submit_child_once(&ctx, other).await.unwrap();
        assert_ne!(third.task_id, first.task_id);
        assert_eq!(env.children(&parent).await.len(), 2);
    }
}
