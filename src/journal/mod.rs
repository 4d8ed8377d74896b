//! Run journal: the append-only event vocabulary.
//!
//! Every state change a run makes is recorded as a `RunEvent` in a
//! per-run JSONL file. The journal is the source of truth: replaying
//! it rebuilds the artifact store and the progress snapshot, which is
//! how `status` works after a restart and how `--resume` decides
//! where to pick up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::feedback::FeedbackRecord;
use crate::gate::QualityGateResult;
use crate::orchestrator::{RunId, RunOptions, RunState, TerminalReason};

mod log;

pub use log::{EventJournal, rebuild_store};

/// A single journal entry. Events are appended in the order they
/// happen and never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// First line of every journal. Captures the pipeline identity,
    /// the options the run was submitted with, and the seed artifacts
    /// so a replay can restore the store from nothing.
    RunStarted {
        run_id: RunId,
        pipeline: String,
        digest: String,
        options: RunOptions,
        #[serde(default)]
        seeds: Vec<Artifact>,
        at: DateTime<Utc>,
    },
    /// A step began executing
    StepStarted {
        phase: String,
        step: String,
        iteration: u32,
        at: DateTime<Utc>,
    },
    /// A step finished and its outputs were stored
    StepCompleted {
        phase: String,
        step: String,
        iteration: u32,
        artifacts: Vec<Artifact>,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    /// A quality gate was evaluated (pass or fail)
    GateEvaluated {
        result: Box<QualityGateResult>,
        at: DateTime<Utc>,
    },
    /// The gate failed and a retry was issued
    FeedbackIssued {
        record: FeedbackRecord,
        at: DateTime<Utc>,
    },
    /// A phase passed its gate and control moved on
    PhaseAdvanced {
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    /// The run reached a terminal state
    RunTerminated {
        state: RunState,
        reason: TerminalReason,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Timestamp of the event, whichever variant it is.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { at, .. }
            | Self::StepStarted { at, .. }
            | Self::StepCompleted { at, .. }
            | Self::GateEvaluated { at, .. }
            | Self::FeedbackIssued { at, .. }
            | Self::PhaseAdvanced { at, .. }
            | Self::RunTerminated { at, .. } => *at,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::GateEvaluated { .. } => "gate_evaluated",
            Self::FeedbackIssued { .. } => "feedback_issued",
            Self::PhaseAdvanced { .. } => "phase_advanced",
            Self::RunTerminated { .. } => "run_terminated",
        }
    }
}
