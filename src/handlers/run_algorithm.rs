//! `RunAlgorithm`: run one algorithm against a datapack, then hand its
//! output to a `CollectResult` child.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{collaborator_failure, submit_child_once, CollectResultPayload, RunAlgorithmPayload};
use crate::collaborators::{AlgorithmRequest, AlgorithmRunner};
use crate::events::{AlgorithmRunInfo, EventPayload};
use crate::scheduler::handler::{DispatchContext, HandlerError, TaskHandler};
use crate::scheduler::submitter::NewTask;
use crate::scheduler::task::TaskType;
use crate::storage::{DatapackState, ExecutionResult, ExecutionStatus};

pub struct RunAlgorithmHandler {
    runner: Arc<dyn AlgorithmRunner>,
}

impl RunAlgorithmHandler {
    pub fn new(runner: Arc<dyn AlgorithmRunner>) -> Self {
        Self { runner }
    }

    /// The execution row of this task, created on the first attempt.
    async fn execution(
        ctx: &DispatchContext,
        payload: &RunAlgorithmPayload,
    ) -> Result<ExecutionResult, HandlerError> {
        let task_id = &ctx.task().task_id;
        let db = ctx.db();
        if let Some(existing) = db
            .list_execution_results_for_task(task_id)
            .await?
            .into_iter()
            .next()
        {
            return Ok(existing);
        }
        Ok(db
            .create_execution_result(Some(task_id), &payload.algorithm.name, payload.datapack_id)
            .await?)
    }
}

#[async_trait]
impl TaskHandler for RunAlgorithmHandler {
    async fn handle(&self, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let payload: RunAlgorithmPayload = ctx.task().payload_as()?;
        let db = ctx.db();
        if db.get_fault_injection(payload.datapack_id).await?.is_none() {
            return Err(HandlerError::InvalidPayload(format!(
                "datapack {} does not exist",
                payload.datapack_id
            )));
        }

        let execution = Self::execution(ctx, &payload).await?;
        let run_info = |error: Option<String>| AlgorithmRunInfo {
            algorithm: payload.algorithm.clone(),
            datapack: payload.datapack.clone(),
            execution_id: Some(execution.id),
            error,
        };

        if execution.status != ExecutionStatus::Success {
            db.set_execution_result_status(execution.id, ExecutionStatus::Running, None)
                .await?;
            let request = AlgorithmRequest {
                algorithm: payload.algorithm.clone(),
                datapack: payload.datapack.clone(),
                execution_id: execution.id,
            };

            match self.runner.run(&request).await {
                Ok(run) => {
                    db.set_execution_result_status(
                        execution.id,
                        ExecutionStatus::Success,
                        Some(run.duration_ms as i64),
                    )
                    .await?;
                    info!(
                        task_id = %ctx.task().task_id,
                        algorithm = %payload.algorithm.name,
                        datapack = %payload.datapack,
                        execution_id = execution.id,
                        duration_ms = run.duration_ms,
                        "Algorithm finished"
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = %ctx.task().task_id,
                        algorithm = %payload.algorithm.name,
                        datapack = %payload.datapack,
                        error = %e,
                        "Algorithm failed"
                    );
                    db.set_execution_result_status(execution.id, ExecutionStatus::Failed, None)
                        .await?;
                    if payload.algorithm.name == ctx.detector_algorithm() {
                        db.set_fault_injection_state(
                            payload.datapack_id,
                            DatapackState::DetectorFailed,
                        )
                        .await?;
                    }
                    ctx.publish(
                        EventPayload::AlgoRunFailed(run_info(Some(e.to_string()))),
                        crate::caller_info!(),
                    )
                    .await?;
                    return Err(collaborator_failure(e));
                }
            }
        }

        ctx.publish(
            EventPayload::AlgoRunSucceed(run_info(None)),
            crate::caller_info!(),
        )
        .await?;

        let collect = CollectResultPayload {
            algorithm: payload.algorithm.clone(),
            datapack: payload.datapack.clone(),
            datapack_id: payload.datapack_id,
            execution_id: execution.id,
            algorithms: payload.algorithms.clone(),
        };
        submit_child_once(
            ctx,
            NewTask::new(TaskType::CollectResult, serde_json::to_value(&collect)?).immediate(),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AlgorithmRun;
    use crate::events::AlgorithmRef;
    use crate::handlers::testing::{Env, Scripted, DETECTOR};
    use crate::storage::{FaultInjection, NewFaultInjection};
    use serde_json::json;

    async fn datapack(env: &Env) -> FaultInjection {
        env.db
            .create_fault_injection(
                &NewFaultInjection::new("ts-pod-kill-1", "{}")
                    .with_state(DatapackState::InjectSuccess),
            )
            .await
            .unwrap()
    }

    fn payload(algorithm: &str, datapack: &FaultInjection) -> serde_json::Value {
        json!({
            "algorithm": {"name": algorithm},
            "datapack": datapack.name,
            "datapack_id": datapack.id,
            "algorithms": [{"name": "baro"}]
        })
    }

    #[tokio::test]
    async fn test_success_records_execution_and_spawns_collect() {
        let env = Env::new().await;
        let dp = datapack(&env).await;
        let handler =
            RunAlgorithmHandler::new(Scripted::answering(vec![Ok(AlgorithmRun { duration_ms: 42 })]));
        let task = env.submit(TaskType::RunAlgorithm, payload("baro", &dp)).await;

        handler.handle(&env.context(&task)).await.unwrap();

        let executions = env
            .db
            .list_execution_results_for_task(&task.task_id)
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(executions[0].duration_ms, Some(42));
        assert_eq!(executions[0].algorithm, "baro");

        match env.events(&task.trace_id).as_slice() {
            [EventPayload::AlgoRunSucceed(info)] => {
                assert_eq!(info.algorithm, AlgorithmRef::named("baro"));
                assert_eq!(info.execution_id, Some(executions[0].id));
            }
            other => panic!("unexpected events {:?}", other),
        }

        let children = env.children(&task).await;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].task_type, TaskType::CollectResult);
        let collect: CollectResultPayload =
            serde_json::from_value(children[0].payload.clone()).unwrap();
        assert_eq!(collect.execution_id, executions[0].id);
        assert_eq!(collect.algorithms, vec![AlgorithmRef::named("baro")]);
    }

    #[tokio::test]
    async fn test_retry_after_success_skips_runner() {
        let env = Env::new().await;
        let dp = datapack(&env).await;
        let runner = Scripted::answering(vec![Ok(AlgorithmRun { duration_ms: 1 })]);
        let handler = RunAlgorithmHandler::new(runner.clone());
        let task = env.submit(TaskType::RunAlgorithm, payload("baro", &dp)).await;

        handler.handle(&env.context(&task)).await.unwrap();
        handler.handle(&env.context(&task)).await.unwrap();

        assert_eq!(runner.call_count(), 1);
        assert_eq!(env.children(&task).await.len(), 1);
        assert_eq!(
            env.db
                .list_execution_results_for_task(&task.task_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_detector_failure_marks_datapack() {
        let env = Env::new().await;
        let dp = datapack(&env).await;
        let handler = RunAlgorithmHandler::new(Scripted::<AlgorithmRun>::answering(vec![Err(
            "oom".to_string(),
        )]));
        let task = env.submit(TaskType::RunAlgorithm, payload(DETECTOR, &dp)).await;

        let err = handler.handle(&env.context(&task)).await.unwrap_err();
        assert!(err.is_retryable());

        let dp = env.db.get_fault_injection(dp.id).await.unwrap().unwrap();
        assert_eq!(dp.state, DatapackState::DetectorFailed);
        match env.events(&task.trace_id).as_slice() {
            [EventPayload::AlgoRunFailed(info)] => {
                assert_eq!(info.error.as_deref(), Some("oom"));
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(env.children(&task).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_datapack_is_invalid() {
        let env = Env::new().await;
        let handler = RunAlgorithmHandler::new(Scripted::<AlgorithmRun>::answering(vec![]));
        let task = env
            .submit(
                TaskType::RunAlgorithm,
                json!({"algorithm": {"name": "baro"}, "datapack": "nope", "datapack_id": 999}),
            )
            .await;

        let err = handler.handle(&env.context(&task)).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
