//! `InjectFault`: inject a fault, record the datapack and schedule the
//! detector for when the fault window closes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::{collaborator_failure, submit_child_once, InjectFaultPayload, RunAlgorithmPayload};
use crate::collaborators::{ChaosInjector, InjectRequest};
use crate::events::{AlgorithmRef, EventPayload, FailureInfo, InjectionInfo};
use crate::scheduler::handler::{DispatchContext, HandlerError, TaskHandler};
use crate::scheduler::submitter::NewTask;
use crate::scheduler::task::TaskType;
use crate::storage::{canonical_engine_config, DatapackState, FaultInjection, NewFaultInjection};

pub struct InjectFaultHandler {
    injector: Arc<dyn ChaosInjector>,
}

impl InjectFaultHandler {
    pub fn new(injector: Arc<dyn ChaosInjector>) -> Self {
        Self { injector }
    }

    /// Injects the fault and stores the datapack row.
    async fn inject(
        &self,
        ctx: &DispatchContext,
        payload: &InjectFaultPayload,
        name: String,
    ) -> Result<FaultInjection, HandlerError> {
        let engine_config = canonical_engine_config(&payload.engine_config)?;
        let existing = ctx
            .db()
            .list_existing_engine_configs(std::slice::from_ref(&engine_config))
            .await?;
        if !existing.is_empty() {
            let reason = "engine config already has a built datapack".to_string();
            warn!(task_id = %ctx.task().task_id, datapack = %name, "Skipping duplicate injection");
            ctx.publish(
                EventPayload::FaultInjectFailed(FailureInfo {
                    error: reason.clone(),
                }),
                crate::caller_info!(),
            )
            .await?;
            return Err(HandlerError::Rejected(reason));
        }

        let request = InjectRequest {
            name: name.clone(),
            fault_type: payload.fault_type.clone(),
            benchmark: payload.benchmark.clone(),
            pedestal: payload.pedestal.clone(),
            engine_config: payload.engine_config.clone(),
            pre_duration: payload.pre_duration,
            duration: payload.duration,
        };
        let window = match self.injector.inject(&request).await {
            Ok(window) => window,
            Err(e) => {
                warn!(task_id = %ctx.task().task_id, datapack = %name, error = %e, "Fault injection failed");
                ctx.publish(
                    EventPayload::FaultInjectFailed(FailureInfo {
                        error: e.to_string(),
                    }),
                    crate::caller_info!(),
                )
                .await?;
                return Err(collaborator_failure(e));
            }
        };

        let record = NewFaultInjection::new(name, engine_config)
            .with_task(ctx.task().task_id.clone())
            .with_fault_type(payload.fault_type.clone())
            .with_benchmark(payload.benchmark.clone(), payload.pedestal.clone())
            .with_window(payload.pre_duration, window.start_time, window.end_time)
            .with_display_config(payload.engine_config.to_string())
            .with_state(DatapackState::InjectSuccess);
        Ok(ctx.db().create_fault_injection(&record).await?)
    }
}

#[async_trait]
impl TaskHandler for InjectFaultHandler {
    async fn handle(&self, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let payload: InjectFaultPayload = ctx.task().payload_as()?;
        if payload.duration <= 0 {
            return Err(HandlerError::InvalidPayload(
                "duration must be positive".to_string(),
            ));
        }
        let name = payload.name.clone().unwrap_or_else(|| {
            let short: String = ctx.task().task_id.chars().take(8).collect();
            format!("{}-{}", payload.benchmark, short)
        });

        // A previous attempt may have injected already; never inject twice.
        let injection = match ctx.db().get_fault_injection_by_task(&ctx.task().task_id).await? {
            Some(existing) => existing,
            None => self.inject(ctx, &payload, name).await?,
        };
        let (start_time, end_time) = match (injection.start_time, injection.end_time) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(HandlerError::Failed(format!(
                    "datapack {} has no fault window",
                    injection.name
                )))
            }
        };

        info!(
            task_id = %ctx.task().task_id,
            datapack = %injection.name,
            start_time,
            end_time,
            "Fault injected"
        );
        ctx.publish(
            EventPayload::FaultInjected(InjectionInfo {
                fault_injection_id: injection.id,
                name: injection.name.clone(),
                start_time,
                end_time,
            }),
            crate::caller_info!(),
        )
        .await?;

        let detector = RunAlgorithmPayload {
            algorithm: AlgorithmRef::named(ctx.detector_algorithm()),
            datapack: injection.name,
            datapack_id: injection.id,
            algorithms: payload.algorithms,
        };
        let child = NewTask::new(TaskType::RunAlgorithm, serde_json::to_value(&detector)?);
        let child = if end_time > Utc::now().timestamp() {
            child.at(end_time)
        } else {
            child.immediate()
        };
        submit_child_once(ctx, child).await?;
        Ok(())
    }
}
