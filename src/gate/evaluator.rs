//! Gate evaluation: scorer contract, registry and the evaluator.
//!
//! Scorers are external collaborators behind the same kind of seam as
//! task executors. The evaluator is infallible by construction; any
//! scorer failure is folded into a failed result so a broken scorer can
//! fail a workflow but never crash it.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::artifact::{Artifact, ArtifactId};
use crate::gate::{QualityGateResult, ScoreReport};
use crate::pipeline::{CriterionSpec, PhaseDefinition};

/// One scoring request: the phase's artifacts plus the criteria the
/// gate declares.
#[derive(Debug)]
pub struct ScoreRequest<'a> {
    pub artifacts: &'a [Artifact],
    pub criteria: &'a [CriterionSpec],
    /// Hard deadline for the scoring call
    pub deadline: Duration,
}

/// Abstraction over scoring functions.
/// Real implementation: `CommandScorer`. Tests use closures via
/// `FnScorer`.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<ScoreReport>;
}

/// Named scoring capabilities, supplied once at startup.
#[derive(Default)]
pub struct ScorerRegistry {
    scorers: HashMap<String, Arc<dyn Scorer>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, scorer: Arc<dyn Scorer>) {
        self.scorers.insert(name.to_string(), scorer);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Scorer>> {
        self.scorers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scorers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scorers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }
}

/// Closure-backed scorer for tests and embedding.
pub struct FnScorer<F>(pub F);

#[async_trait]
impl<F> Scorer for FnScorer<F>
where
    F: Fn(ScoreRequest<'_>) -> Result<ScoreReport> + Send + Sync,
{
    async fn score(&self, request: ScoreRequest<'_>) -> Result<ScoreReport> {
        (self.0)(request)
    }
}

#[derive(Serialize)]
struct WireScoreRequest<'a> {
    artifacts: Vec<WireScoreArtifact<'a>>,
    criteria: Vec<WireCriterion<'a>>,
    deadline_secs: u64,
}

#[derive(Serialize)]
struct WireScoreArtifact<'a> {
    id: ArtifactId,
    kind: &'a str,
    digest: &'a str,
    content: &'a str,
    produced_by: &'a str,
    iteration: u32,
}

#[derive(Serialize)]
struct WireCriterion<'a> {
    name: &'a str,
    step: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass_threshold: Option<f64>,
}

/// Runs a configured command per scoring call. The request JSON goes to
/// stdin; the response is the last JSON object on stdout with
/// `aggregate_score` and optional `sub_scores`.
pub struct CommandScorer {
    command: String,
    args: Vec<String>,
    working_dir: Option<std::path::PathBuf>,
}

impl CommandScorer {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: &std::path::Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }
}

#[async_trait]
impl Scorer for CommandScorer {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<ScoreReport> {
        let payload = serde_json::to_string(&WireScoreRequest {
            artifacts: request
                .artifacts
                .iter()
                .map(|a| WireScoreArtifact {
                    id: a.id,
                    kind: &a.kind,
                    digest: &a.digest,
                    content: &a.content,
                    produced_by: &a.produced_by,
                    iteration: a.iteration,
                })
                .collect(),
            criteria: request
                .criteria
                .iter()
                .map(|c| WireCriterion {
                    name: &c.name,
                    step: &c.step,
                    pass_threshold: c.pass_threshold,
                })
                .collect(),
            deadline_secs: request.deadline.as_secs(),
        })
        .context("Failed to encode scoring request")?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn scorer command {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .context("Failed to write scoring request to stdin")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

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
            Ok(result) => result.context("Failed to read scorer output")?,
            Err(_) => {
                let _ = child.kill().await;
                bail!(
                    "Scorer timed out after {}s",
                    request.deadline.as_secs()
                );
            }
        };

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("exit code {}", status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            bail!("Scorer failed: {}", detail);
        }

        parse_score_output(&stdout)
    }
}

/// Parse the scorer's stdout, tolerating log noise before the response.
fn parse_score_output(stdout: &str) -> Result<ScoreReport> {
    let trimmed = stdout.trim();
    if let Ok(report) = serde_json::from_str::<ScoreReport>(trimmed) {
        return Ok(report);
    }
    for line in trimmed.lines().rev() {
        if let Ok(report) = serde_json::from_str::<ScoreReport>(line.trim()) {
            return Ok(report);
        }
    }
    bail!("Scorer produced no JSON score report on stdout")
}

/// Evaluates phase gates against registered scorers.
pub struct GateEvaluator {
    scorers: Arc<ScorerRegistry>,
}

impl GateEvaluator {
    pub fn new(scorers: Arc<ScorerRegistry>) -> Self {
        Self { scorers }
    }

    /// Evaluate the phase gate over the given artifacts. Always returns
    /// a result: unknown scorers, crashes and timeouts become a failed
    /// result with score 0 and the error recorded.
    pub async fn evaluate(
        &self,
        phase: &PhaseDefinition,
        iteration: u32,
        artifacts: &[Artifact],
        threshold: f64,
        deadline: Duration,
    ) -> QualityGateResult {
        let Some(scorer) = self.scorers.resolve(&phase.gate.scorer) else {
            warn!(phase = %phase.id, scorer = %phase.gate.scorer, "unknown scorer");
            return QualityGateResult::evaluation_error(
                &phase.id,
                iteration,
                threshold,
                &format!("unknown scorer {}", phase.gate.scorer),
            );
        };

        debug!(
            phase = %phase.id,
            iteration,
            scorer = %phase.gate.scorer,
            artifacts = artifacts.len(),
            "evaluating gate"
        );

        match scorer
            .score(ScoreRequest {
                artifacts,
                criteria: &phase.gate.criteria,
                deadline,
            })
            .await
        {
            Ok(report) => QualityGateResult::from_report(&phase.id, iteration, report, threshold),
            Err(e) => {
                warn!(phase = %phase.id, iteration, error = %e, "scorer failed");
                QualityGateResult::evaluation_error(
                    &phase.id,
                    iteration,
                    threshold,
                    &format!("{:#}", e),
                )
            }
        }
    }
}
