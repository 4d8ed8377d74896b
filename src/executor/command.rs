//! Subprocess-backed task executor.
//!
//! The invocation contract is JSON over pipes: the request is written
//! to the child's stdin, the response is the last JSON object on its
//! stdout. A response is either produced drafts plus metadata, or a
//! typed `{"error", "retryable"}` failure. The deadline is enforced
//! here; an overrunning child is killed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::artifact::{Artifact, ArtifactDraft, ArtifactId};
use crate::errors::ExecutorError;
use crate::executor::{ExecutionMetadata, InvocationOutput, InvocationRequest, TaskExecutor};
use crate::feedback::FeedbackRecord;

/// Runs a configured command per invocation.
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    working_dir: Option<std::path::PathBuf>,
    version: Option<String>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    task: &'a str,
    inputs: Vec<WireArtifact<'a>>,
    feedback: Option<&'a FeedbackRecord>,
    deadline_secs: u64,
}

#[derive(Serialize)]
struct WireArtifact<'a> {
    id: ArtifactId,
    kind: &'a str,
    digest: &'a str,
    content: &'a str,
    iteration: u32,
}

impl<'a> From<&'a Artifact> for WireArtifact<'a> {
    fn from(a: &'a Artifact) -> Self {
        Self {
            id: a.id,
            kind: &a.kind,
            digest: &a.digest,
            content: &a.content,
            iteration: a.iteration,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Failure {
        error: String,
        #[serde(default)]
        retryable: bool,
    },
    Success {
        outputs: Vec<ArtifactDraft>,
        #[serde(default)]
        metadata: ExecutionMetadata,
    },
}

impl CommandExecutor {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir: None,
            version: None,
        }
    }

    pub fn with_working_dir(mut self, dir: &std::path::Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    fn parse_response(&self, task: &str, stdout: &str) -> Result<WireResponse, ExecutorError> {
        let trimmed = stdout.trim();
        if let Ok(response) = serde_json::from_str::<WireResponse>(trimmed) {
            return Ok(response);
        }
        // Tolerate log noise around the response: take the last line
        // that parses.
        for line in trimmed.lines().rev() {
            if let Ok(response) = serde_json::from_str::<WireResponse>(line.trim()) {
                return Ok(response);
            }
        }
        Err(ExecutorError::MalformedOutput {
            task: task.to_string(),
            message: format!(
                "no JSON response on stdout (got {} bytes)",
                trimmed.len()
            ),
        })
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<InvocationOutput, ExecutorError> {
        let task = request.task.to_string();
        let payload = serde_json::to_string(&WireRequest {
            task: request.task,
            inputs: request.inputs.iter().map(WireArtifact::from).collect(),
            feedback: request.feedback,
            deadline_secs: request.deadline.as_secs(),
        })
        .map_err(|e| ExecutorError::MalformedOutput {
            task: task.clone(),
            message: format!("failed to encode request: {}", e),
        })?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(task = %task, command = %self.command, "spawning executor");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ExecutorError::Failed {
                    task: task.clone(),
                    reason: format!("failed to write request to stdin: {}", e),
                    retryable: false,
                })?;
            stdin.shutdown().await.map_err(|e| ExecutorError::Failed {
                task: task.clone(),
                reason: format!("failed to close stdin: {}", e),
                retryable: false,
            })?;
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain both pipes before waiting so a chatty child cannot
        // deadlock on a full pipe.
        let gathered = tokio::time::timeout(request.deadline, async {
            let mut out = String::new();
            let mut err = String::new();
            if let Some(stdout) = stdout {
                BufReader::new(stdout).read_to_string(&mut out).await?;
            }
            if let Some(stderr) = stderr {
                BufReader::new(stderr).read_to_string(&mut err).await?;
            }
            let status = child.wait().await?;
            std::io::Result::Ok((status, out, err))
        })
        .await;

        let (status, stdout, stderr) = match gathered {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                return Err(ExecutorError::Failed {
                    task,
                    reason: format!("io error while reading executor output: {}", e),
                    retryable: false,
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ExecutorError::TimedOut {
                    task,
                    deadline_secs: request.deadline.as_secs(),
                });
            }
        };

        match self.parse_response(&task, &stdout) {
            Ok(WireResponse::Failure { error, retryable }) => Err(ExecutorError::Failed {
                task,
                reason: error,
                retryable,
            }),
            Ok(WireResponse::Success {
                outputs,
                mut metadata,
            }) => {
                if metadata.duration_ms == 0 {
                    metadata.duration_ms = start.elapsed().as_millis() as u64;
                }
                if metadata.executor_version.is_none() {
                    metadata.executor_version = self.version.clone();
                }
                Ok(InvocationOutput {
                    artifacts: outputs,
                    metadata,
                })
            }
            Err(malformed) => {
                if status.success() {
                    Err(malformed)
                } else {
                    let reason = if stderr.trim().is_empty() {
                        format!(
                            "exited with code {}",
                            status.code().unwrap_or(-1)
                        )
                    } else {
                        stderr.trim().to_string()
                    };
                    Err(ExecutorError::Failed {
                        task,
                        reason,
                        retryable: false,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn request(task: &'static str) -> InvocationRequest<'static> {
        InvocationRequest {
            task,
            inputs: &[],
            feedback: None,
            deadline: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_successful_invocation() {
        let executor = sh(
            r#"cat > /dev/null; echo '{"outputs":[{"kind":"draft","content":"hello"}],"metadata":{"executor_version":"1.2.0"}}'"#,
        );
        let output = executor.invoke(request("draft")).await.unwrap();
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].kind, "draft");
        assert_eq!(output.artifacts[0].content, "hello");
        assert_eq!(output.metadata.executor_version.as_deref(), Some("1.2.0"));
        assert!(output.metadata.duration_ms > 0);
    }

    #[tokio::test]
    async fn test_response_amid_log_noise() {
        let executor = sh(
            r#"cat > /dev/null; echo "starting up"; echo "working..."; echo '{"outputs":[{"kind":"notes","content":"x"}]}'"#,
        );
        let output = executor.invoke(request("gather")).await.unwrap();
        assert_eq!(output.artifacts[0].kind, "notes");
    }

    #[tokio::test]
    async fn test_typed_retryable_failure() {
        let executor = sh(r#"cat > /dev/null; echo '{"error":"rate limited","retryable":true}'"#);
        let err = executor.invoke(request("draft")).await.unwrap_err();
        match &err {
            ExecutorError::Failed {
                reason, retryable, ..
            } => {
                assert_eq!(reason, "rate limited");
                assert!(*retryable);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_stderr() {
        let executor = sh(r#"cat > /dev/null; echo "boom" >&2; exit 3"#);
        let err = executor.invoke(request("draft")).await.unwrap_err();
        match err {
            ExecutorError::Failed {
                reason, retryable, ..
            } => {
                assert!(reason.contains("boom"));
                assert!(!retryable);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_output_on_clean_exit() {
        let executor = sh(r#"cat > /dev/null; echo "not json at all""#);
        let err = executor.invoke(request("draft")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedOutput { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_deadline_kills_child() {
        let executor = sh("sleep 30");
        let start = Instant::now();
        let err = executor
            .invoke(InvocationRequest {
                task: "slow",
                inputs: &[],
                feedback: None,
                deadline: Duration::from_millis(200),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TimedOut { .. }));
        assert!(err.is_retryable());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_binary() {
        let executor = CommandExecutor::new("definitely-not-a-real-binary-7f3a", vec![]);
        let err = executor.invoke(request("draft")).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SpawnFailed { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_request_reaches_child_stdin() {
        // The child greps the request JSON for the task name
        let executor = sh(
            r#"if grep -q '"task":"cite-check"'; then echo '{"outputs":[{"kind":"ok","content":"seen"}]}'; else echo '{"error":"wrong task","retryable":false}'; fi"#,
        );
        let output = executor.invoke(request("cite-check")).await.unwrap();
        assert_eq!(output.artifacts[0].content, "seen");
    }
}
