//! `BuildImage`: build a container image and report the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{collaborator_failure, BuildImagePayload};
use crate::collaborators::{BuildRequest, ImageBuilder};
use crate::events::{EventPayload, FailureInfo, ImageBuildInfo};
use crate::scheduler::handler::{DispatchContext, HandlerError, TaskHandler};

pub struct BuildImageHandler {
    builder: Arc<dyn ImageBuilder>,
}

impl BuildImageHandler {
    pub fn new(builder: Arc<dyn ImageBuilder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl TaskHandler for BuildImageHandler {
    async fn handle(&self, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let payload: BuildImagePayload = ctx.task().payload_as()?;
        let request = BuildRequest {
            image: payload.image,
            tag: payload.tag,
            context: payload.context,
        };

        match self.builder.build(&request).await {
            Ok(built) => {
                info!(
                    task_id = %ctx.task().task_id,
                    image = %built.image,
                    tag = %built.tag,
                    duration_ms = built.duration_ms,
                    "Image built"
                );
                ctx.publish(
                    EventPayload::ImageBuildSucceed(ImageBuildInfo {
                        image: built.image,
                        tag: built.tag,
                        duration_ms: built.duration_ms,
                    }),
                    crate::caller_info!(),
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %ctx.task().task_id, image = %request.image, error = %e, "Image build failed");
                ctx.publish(
                    EventPayload::ImageBuildFailed(FailureInfo {
                        error: e.to_string(),
                    }),
                    crate::caller_info!(),
                )
                .await?;
                Err(collaborator_failure(e))
            }
        }
    }
}
