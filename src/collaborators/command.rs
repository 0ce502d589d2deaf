//! Collaborator adapter that shells out to an operator-provided command.
//!
//! The request is handed over as JSON in the `RCABENCH_REQUEST` environment
//! variable; the command must print a JSON response on stdout and exit 0.
//! A non-zero exit is a collaborator failure carrying the tail of stderr.

use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    AlgorithmRequest, AlgorithmRun, AlgorithmRunner, BuildRequest, BuiltImage, ChaosInjector,
    CollaboratorError, CollectRequest, CollectedResults, ImageBuilder, InjectRequest,
    InjectionWindow, ResultCollector,
};

/// Environment variable carrying the JSON request.
pub const REQUEST_ENV: &str = "RCABENCH_REQUEST";

/// Longest stderr excerpt kept in an error message.
const STDERR_TAIL: usize = 2000;

/// Runs `sh -c <command>` for every call.
///
/// The child is killed if the calling future is dropped, so task
/// cancellation and deadlines stop it.
#[derive(Debug, Clone)]
pub struct CommandHook {
    command: String,
}

impl CommandHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp, CollaboratorError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_string(request)
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

        let start = Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(REQUEST_ENV, &body)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CollaboratorError::Unavailable(format!("failed to run '{}': {}", self.command, e))
            })?;

        debug!(
            command = %self.command,
            exit_code = ?output.status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Collaborator command finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = {
                let trimmed = stderr.trim();
                let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
                trimmed.chars().skip(skip).collect()
            };
            return Err(CollaboratorError::Failed(format!(
                "command exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                tail
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ImageBuilder for CommandHook {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, CollaboratorError> {
        self.call(request).await
    }
}

#[async_trait]
impl ChaosInjector for CommandHook {
    async fn inject(&self, request: &InjectRequest) -> Result<InjectionWindow, CollaboratorError> {
        self.call(request).await
    }
}

#[async_trait]
impl AlgorithmRunner for CommandHook {
    async fn run(&self, request: &AlgorithmRequest) -> Result<AlgorithmRun, CollaboratorError> {
        self.call(request).await
    }
}

#[async_trait]
impl ResultCollector for CommandHook {
    async fn collect(
        &self,
        request: &CollectRequest,
    ) -> Result<CollectedResults, CollaboratorError> {
        self.call(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_request() -> BuildRequest {
        BuildRequest {
            image: "detector".to_string(),
            tag: "v1".to_string(),
            context: None,
        }
    }

    #[tokio::test]
    async fn test_parses_stdout_json() {
        let hook = CommandHook::new(r#"echo '{"image":"detector","tag":"v1","duration_ms":7}'"#);
        let built = hook.build(&build_request()).await.unwrap();
        assert_eq!(built.tag, "v1");
        assert_eq!(built.duration_ms, 7);
    }

    #[tokio::test]
    async fn test_request_is_passed_in_env() {
        let hook = CommandHook::new(format!("printf '%s' \"${}\"", REQUEST_ENV));
        let echoed: BuildRequest = hook.call(&build_request()).await.unwrap();
        assert_eq!(echoed, build_request());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let hook = CommandHook::new("echo 'registry down' >&2; exit 3");
        match hook.build(&build_request()).await {
            Err(CollaboratorError::Failed(msg)) => {
                assert!(msg.contains("3"));
                assert!(msg.contains("registry down"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_invalid_response() {
        let hook = CommandHook::new("echo not-json");
        assert!(matches!(
            hook.build(&build_request()).await,
            Err(CollaboratorError::InvalidResponse(_))
        ));
    }
}
