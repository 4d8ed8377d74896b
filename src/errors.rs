//! Typed error hierarchy for the Crucible orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `PipelineError` — definition loading and static validation failures
//! - `StoreError` — artifact store violations
//! - `ExecutorError` — task executor invocation failures
//! - `RunError` — run-level failures that terminate a workflow

use thiserror::Error;

use crate::artifact::ArtifactId;

/// Errors from loading or validating a pipeline definition.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to read pipeline file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline file at {path}: {message}")]
    ParseFailed {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Pipeline has no phases")]
    EmptyPipeline,

    #[error("Phase {phase} has no steps")]
    EmptyPhase { phase: String },

    #[error("Duplicate phase id {id}")]
    DuplicatePhase { id: String },

    #[error("Duplicate step id {id} in phase {phase}")]
    DuplicateStep { phase: String, id: String },

    #[error("Criterion {criterion} in phase {phase} targets unknown step {step}")]
    UnknownCriterionStep {
        phase: String,
        criterion: String,
        step: String,
    },

    #[error("Gate threshold {threshold} in phase {phase} is outside 0-100")]
    ThresholdOutOfRange { phase: String, threshold: f64 },

    #[error("Gate in phase {phase} allows zero iterations")]
    ZeroIterations { phase: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the per-run artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Artifact {0} not found")]
    NotFound(ArtifactId),

    #[error("Artifact {id} already stored")]
    Duplicate { id: ArtifactId },

    #[error("Artifact of kind {kind} depends on unknown artifact {dependency}")]
    DependencyMissing {
        kind: String,
        dependency: ArtifactId,
    },
}

/// Errors from a single task executor invocation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Task {task} failed: {reason}")]
    Failed {
        task: String,
        reason: String,
        retryable: bool,
    },

    #[error("Task {task} exceeded its {deadline_secs}s deadline")]
    TimedOut { task: String, deadline_secs: u64 },

    #[error("Failed to spawn executor command {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Task {task} produced malformed output: {message}")]
    MalformedOutput { task: String, message: String },
}

impl ExecutorError {
    /// Whether the failure is transient and worth retrying within the
    /// same quality iteration. Deadline expiry always is; executor
    /// failures only when the executor says so.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::Failed { retryable, .. } => *retryable,
            ExecutorError::TimedOut { .. } => true,
            ExecutorError::SpawnFailed { .. } => false,
            ExecutorError::MalformedOutput { .. } => false,
        }
    }
}

/// Errors that terminate a workflow run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Step {step} in phase {phase} requires artifact kind {kind} which nothing earlier produces")]
    DependencyMissing {
        phase: String,
        step: String,
        kind: String,
    },

    #[error("Step {step} in phase {phase} references unknown executor {executor}")]
    UnknownExecutor {
        phase: String,
        step: String,
        executor: String,
    },

    #[error("Step {step} in phase {phase} failed: {source}")]
    StepFailed {
        phase: String,
        step: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Phase {phase} escalated after {iterations} iterations (last score {last_score:.1})")]
    MaxIterationsExceeded {
        phase: String,
        iterations: u32,
        last_score: f64,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_read_failed_carries_path() {
        use std::path::PathBuf;
        let path = PathBuf::from("/work/pipeline.yaml");
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = PipelineError::ReadFailed {
            path: path.clone(),
            source: io_err,
        };
        match &err {
            PipelineError::ReadFailed { path: p, source: s } => {
                assert_eq!(p, &path);
                assert_eq!(s.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected ReadFailed"),
        }
    }

    #[test]
    fn pipeline_error_threshold_message_names_phase() {
        let err = PipelineError::ThresholdOutOfRange {
            phase: "design".to_string(),
            threshold: 120.0,
        };
        assert!(err.to_string().contains("design"));
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn store_error_dependency_missing_is_matchable() {
        let dep = ArtifactId::new();
        let err = StoreError::DependencyMissing {
            kind: "draft".to_string(),
            dependency: dep,
        };
        match &err {
            StoreError::DependencyMissing { kind, dependency } => {
                assert_eq!(kind, "draft");
                assert_eq!(*dependency, dep);
            }
            _ => panic!("Expected DependencyMissing"),
        }
    }

    #[test]
    fn executor_error_retryability() {
        let transient = ExecutorError::Failed {
            task: "draft".into(),
            reason: "rate limited".into(),
            retryable: true,
        };
        let permanent = ExecutorError::Failed {
            task: "draft".into(),
            reason: "bad input".into(),
            retryable: false,
        };
        let timeout = ExecutorError::TimedOut {
            task: "draft".into(),
            deadline_secs: 30,
        };
        let spawn = ExecutorError::SpawnFailed {
            command: "missing-bin".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!spawn.is_retryable());
    }

    #[test]
    fn run_error_converts_from_executor_error_via_step_failed() {
        let inner = ExecutorError::TimedOut {
            task: "review".into(),
            deadline_secs: 60,
        };
        let err = RunError::StepFailed {
            phase: "02".into(),
            step: "review".into(),
            source: inner,
        };
        match &err {
            RunError::StepFailed { phase, step, source } => {
                assert_eq!(phase, "02");
                assert_eq!(step, "review");
                assert!(matches!(source, ExecutorError::TimedOut { .. }));
            }
            _ => panic!("Expected StepFailed"),
        }
    }

    #[test]
    fn run_error_max_iterations_carries_last_score() {
        let err = RunError::MaxIterationsExceeded {
            phase: "draft".into(),
            iterations: 3,
            last_score: 61.5,
        };
        assert!(err.to_string().contains("3 iterations"));
        assert!(err.to_string().contains("61.5"));
    }

    #[test]
    fn run_error_converts_from_store_error() {
        let inner = StoreError::NotFound(ArtifactId::new());
        let run_err: RunError = inner.into();
        assert!(matches!(run_err, RunError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let pipeline_err = PipelineError::EmptyPipeline;
        assert_std_error(&pipeline_err);
        let store_err = StoreError::NotFound(ArtifactId::new());
        assert_std_error(&store_err);
        let exec_err = ExecutorError::TimedOut {
            task: "x".into(),
            deadline_secs: 1,
        };
        assert_std_error(&exec_err);
        let run_err = RunError::Cancelled;
        assert_std_error(&run_err);
    }
}
