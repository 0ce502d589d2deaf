//! `CollectResult`: store what an algorithm produced.
//!
//! For the detector this also classifies the datapack and, when anomalies
//! were found, fans out one `RunAlgorithm` per expected algorithm.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{collaborator_failure, submit_child_once, CollectResultPayload, RunAlgorithmPayload};
use crate::collaborators::{CollectRequest, ResultCollector};
use crate::events::{DatapackInfo, EventPayload};
use crate::scheduler::handler::{DispatchContext, HandlerError, TaskHandler};
use crate::scheduler::submitter::NewTask;
use crate::scheduler::task::TaskType;
use crate::storage::{DatapackState, DetectorResult, StorageError};

pub struct CollectResultHandler {
    collector: Arc<dyn ResultCollector>,
}

impl CollectResultHandler {
    pub fn new(collector: Arc<dyn ResultCollector>) -> Self {
        Self { collector }
    }

    async fn finish_detector(
        &self,
        ctx: &DispatchContext,
        payload: &CollectResultPayload,
        results: &[DetectorResult],
    ) -> Result<(), HandlerError> {
        let db = ctx.db();
        if db.count_detector_results(payload.execution_id).await? == 0 {
            db.save_detector_results(payload.execution_id, results).await?;
        }

        let info = DatapackInfo {
            datapack: payload.datapack.clone(),
            execution_id: Some(payload.execution_id),
        };
        let anomalous = results.iter().any(DetectorResult::has_issues);

        let (event, state) = if results.is_empty() {
            (
                EventPayload::DatapackNoDetectorData(info),
                DatapackState::DetectorFailed,
            )
        } else if !anomalous {
            (
                EventPayload::DatapackNoAnomaly(info),
                DatapackState::DetectorSuccess,
            )
        } else {
            (
                EventPayload::DatapackResultCollection(info),
                DatapackState::DetectorSuccess,
            )
        };
        db.set_fault_injection_state(payload.datapack_id, state)
            .await?;
        info!(
            task_id = %ctx.task().task_id,
            datapack = %payload.datapack,
            spans = results.len(),
            event = %event.name(),
            "Detector results collected"
        );
        ctx.publish(event, crate::caller_info!()).await?;

        if anomalous {
            for algorithm in &payload.algorithms {
                if algorithm.name == ctx.detector_algorithm() {
                    continue;
                }
                let run = RunAlgorithmPayload {
                    algorithm: algorithm.clone(),
                    datapack: payload.datapack.clone(),
                    datapack_id: payload.datapack_id,
                    algorithms: payload.algorithms.clone(),
                };
                submit_child_once(
                    ctx,
                    NewTask::new(TaskType::RunAlgorithm, serde_json::to_value(&run)?).immediate(),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for CollectResultHandler {
    async fn handle(&self, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let payload: CollectResultPayload = ctx.task().payload_as()?;
        let request = CollectRequest {
            algorithm: payload.algorithm.clone(),
            datapack: payload.datapack.clone(),
            execution_id: payload.execution_id,
        };
        let collected = self
            .collector
            .collect(&request)
            .await
            .map_err(collaborator_failure)?;

        if payload.algorithm.name == ctx.detector_algorithm() {
            return self
                .finish_detector(ctx, &payload, &collected.detector)
                .await;
        }

        match ctx
            .db()
            .save_granularity_results(payload.execution_id, &collected.granularity)
            .await
        {
            Ok(saved) => {
                info!(
                    task_id = %ctx.task().task_id,
                    algorithm = %payload.algorithm.name,
                    execution_id = payload.execution_id,
                    saved,
                    "Granularity results collected"
                );
                Ok(())
            }
            Err(StorageError::AlreadyExists(_)) => {
                debug!(execution_id = payload.execution_id, "Granularity results already stored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
