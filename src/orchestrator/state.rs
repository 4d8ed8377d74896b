//! Run and phase state machines.
//!
//! This module provides:
//! - `RunId` — workflow run identity
//! - `RunState` — overall run lifecycle
//! - `PhaseState` — per-phase sub-states inside a running workflow
//! - `TerminalReason` — why a run ended
//! - `RunOptions` — per-run configuration captured at submission

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{ExecutorError, RunError};

/// Unique workflow run identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First hex group, for compact display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Overall state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Accepted but not yet started
    #[default]
    Pending,
    /// The control loop is executing phases
    Running,
    /// Every phase passed its gate
    Passed,
    /// A phase escalated, a step failed permanently, or the definition
    /// was unusable
    Failed,
    /// Cancelled on external request
    Cancelled,
}

impl RunState {
    /// Check if the run has ended. A run that is not running is in
    /// exactly one terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown run state: {}", other)),
        }
    }
}

/// Per-phase sub-state inside a running workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    /// Waiting for earlier phases
    #[default]
    Pending,
    /// Steps are executing (first pass or a feedback retry)
    ExecutingSteps,
    /// All steps done, the gate is being evaluated
    GateEvaluating,
    /// The gate failed; the feedback controller is deciding
    GateFailed,
    /// Feedback issued, a retry is about to start
    FeedbackLoop,
    /// The gate passed; the phase is complete
    GatePassed,
    /// The iteration budget ran out
    Escalated,
    /// A step failed for a non-quality reason
    Failed,
    /// The run was cancelled before this phase completed
    Cancelled,
}

impl PhaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GatePassed | Self::Escalated | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::GatePassed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ExecutingSteps => "executing_steps",
            Self::GateEvaluating => "gate_evaluating",
            Self::GateFailed => "gate_failed",
            Self::FeedbackLoop => "feedback_loop",
            Self::GatePassed => "gate_passed",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    AllPhasesPassed,
    MaxIterationsExceeded {
        phase: String,
        iterations: u32,
        last_score: f64,
    },
    StepFailed {
        phase: String,
        step: String,
        error: String,
    },
    DependencyMissing {
        phase: String,
        step: String,
        kind: String,
    },
    InvalidDefinition {
        error: String,
    },
    Cancelled,
    Internal {
        error: String,
    },
}

impl TerminalReason {
    /// The run state this reason terminates into.
    pub fn state(&self) -> RunState {
        match self {
            Self::AllPhasesPassed => RunState::Passed,
            Self::Cancelled => RunState::Cancelled,
            _ => RunState::Failed,
        }
    }

    pub fn from_run_error(error: &RunError) -> Self {
        match error {
            RunError::DependencyMissing { phase, step, kind } => Self::DependencyMissing {
                phase: phase.clone(),
                step: step.clone(),
                kind: kind.clone(),
            },
            RunError::UnknownExecutor { .. } => Self::InvalidDefinition {
                error: error.to_string(),
            },
            RunError::StepFailed { phase, step, source } => Self::StepFailed {
                phase: phase.clone(),
                step: step.clone(),
                error: source.to_string(),
            },
            RunError::MaxIterationsExceeded {
                phase,
                iterations,
                last_score,
            } => Self::MaxIterationsExceeded {
                phase: phase.clone(),
                iterations: *iterations,
                last_score: *last_score,
            },
            RunError::Cancelled => Self::Cancelled,
            RunError::Pipeline(e) => Self::InvalidDefinition {
                error: e.to_string(),
            },
            RunError::RunNotFound(_) | RunError::Store(_) | RunError::Other(_) => Self::Internal {
                error: error.to_string(),
            },
        }
    }

    /// Short human-readable summary for status output.
    pub fn summary(&self) -> String {
        match self {
            Self::AllPhasesPassed => "all phases passed".to_string(),
            Self::MaxIterationsExceeded {
                phase,
                iterations,
                last_score,
            } => format!(
                "phase {} escalated after {} iterations (last score {:.1})",
                phase, iterations, last_score
            ),
            Self::StepFailed { phase, step, error } => {
                format!("step {} in phase {} failed: {}", step, phase, error)
            }
            Self::DependencyMissing { phase, step, kind } => format!(
                "step {} in phase {} is missing input kind {}",
                step, phase, kind
            ),
            Self::InvalidDefinition { error } => format!("invalid definition: {}", error),
            Self::Cancelled => "cancelled".to_string(),
            Self::Internal { error } => format!("internal error: {}", error),
        }
    }
}

fn default_transient_retries() -> u32 {
    2
}

fn default_step_timeout_secs() -> u64 {
    300
}

/// Per-run configuration captured at submission and recorded in the
/// journal. Overrides apply to every phase in the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunOptions {
    /// Replace every gate's threshold for this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_threshold: Option<f64>,
    /// Replace every gate's iteration budget for this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Step ids to skip entirely (no events, no artifacts)
    #[serde(default)]
    pub skip_steps: Vec<String>,
    /// Extra attempts for a retryable step failure within one quality
    /// iteration
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Default per-step deadline in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            quality_threshold: None,
            max_iterations: None,
            skip_steps: Vec::new(),
            transient_retries: default_transient_retries(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl RunOptions {
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_skip_steps(mut self, steps: Vec<String>) -> Self {
        self.skip_steps = steps;
        self
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_secs = timeout.as_secs();
        self
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}
