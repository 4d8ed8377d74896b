//! Progress tracking: fold journal events into a run snapshot.
//!
//! The tracker is a pure fold over `RunEvent`s. The live runner feeds
//! it events as they happen; `status` replays a journal from disk into
//! the same fold. Both paths produce the same `RunSnapshot`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::QualityGateResult;
use crate::journal::RunEvent;
use crate::orchestrator::{PhaseState, RunId, RunOptions, RunState, TerminalReason};

/// Progress of a single phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub id: String,
    pub state: PhaseState,
    /// Highest iteration number seen for this phase
    pub iterations_used: u32,
    /// Every gate evaluation, in order, sub-scores included
    pub gate_history: Vec<QualityGateResult>,
    /// Step currently executing, if any
    pub current_step: Option<String>,
}

impl PhaseProgress {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: PhaseState::Pending,
            iterations_used: 0,
            gate_history: Vec::new(),
            current_step: None,
        }
    }

    pub fn last_gate(&self) -> Option<&QualityGateResult> {
        self.gate_history.last()
    }
}

/// Everything `status` needs to describe a run, derived entirely from
/// journal events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Set by the `RunStarted` event; `None` only for an empty journal
    pub run_id: Option<RunId>,
    pub pipeline: String,
    pub digest: String,
    pub options: RunOptions,
    pub state: RunState,
    /// Phases in the order the run reached them
    pub phases: Vec<PhaseProgress>,
    pub current_phase: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub terminal_reason: Option<TerminalReason>,
    pub steps_completed: u32,
    pub artifact_count: usize,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            run_id: None,
            pipeline: String::new(),
            digest: String::new(),
            options: RunOptions::default(),
            state: RunState::Pending,
            phases: Vec::new(),
            current_phase: None,
            started_at: None,
            ended_at: None,
            terminal_reason: None,
            steps_completed: 0,
            artifact_count: 0,
        }
    }
}

impl RunSnapshot {
    pub fn phase(&self, id: &str) -> Option<&PhaseProgress> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Wall-clock time spent so far (or total, once terminal).
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}

/// Folds run events into a `RunSnapshot`.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    snapshot: RunSnapshot,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay a full event sequence into a snapshot.
    pub fn replay(events: &[RunEvent]) -> RunSnapshot {
        let mut tracker = Self::new();
        for event in events {
            tracker.apply(event);
        }
        tracker.into_snapshot()
    }

    pub fn snapshot(&self) -> &RunSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> RunSnapshot {
        self.snapshot
    }

    pub fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                run_id,
                pipeline,
                digest,
                options,
                seeds,
                at,
            } => {
                self.snapshot.run_id = Some(*run_id);
                self.snapshot.pipeline = pipeline.clone();
                self.snapshot.digest = digest.clone();
                self.snapshot.options = options.clone();
                self.snapshot.state = RunState::Running;
                self.snapshot.started_at = Some(*at);
                self.snapshot.artifact_count += seeds.len();
            }
            RunEvent::StepStarted {
                phase,
                step,
                iteration,
                ..
            } => {
                self.snapshot.current_phase = Some(phase.clone());
                let entry = self.phase_entry(phase);
                entry.state = PhaseState::ExecutingSteps;
                entry.iterations_used = entry.iterations_used.max(*iteration);
                entry.current_step = Some(step.clone());
            }
            RunEvent::StepCompleted {
                phase, artifacts, ..
            } => {
                self.snapshot.steps_completed += 1;
                self.snapshot.artifact_count += artifacts.len();
                let entry = self.phase_entry(phase);
                entry.current_step = None;
            }
            RunEvent::GateEvaluated { result, .. } => {
                let entry = self.phase_entry(&result.phase);
                entry.iterations_used = entry.iterations_used.max(result.iteration);
                entry.state = if result.passed {
                    PhaseState::GatePassed
                } else {
                    PhaseState::GateFailed
                };
                entry.gate_history.push(result.as_ref().clone());
            }
            RunEvent::FeedbackIssued { record, .. } => {
                let entry = self.phase_entry(&record.phase);
                entry.state = PhaseState::FeedbackLoop;
            }
            RunEvent::PhaseAdvanced { from, to, .. } => {
                self.phase_entry(from).state = PhaseState::GatePassed;
                self.phase_entry(to);
                self.snapshot.current_phase = Some(to.clone());
            }
            RunEvent::RunTerminated {
                state, reason, at, ..
            } => {
                self.snapshot.state = *state;
                self.snapshot.ended_at = Some(*at);
                self.snapshot.terminal_reason = Some(reason.clone());
                self.apply_terminal_phase_state(state, reason);
            }
        }
    }

    fn phase_entry(&mut self, id: &str) -> &mut PhaseProgress {
        if let Some(index) = self.snapshot.phases.iter().position(|p| p.id == id) {
            &mut self.snapshot.phases[index]
        } else {
            self.snapshot.phases.push(PhaseProgress::new(id));
            self.snapshot.phases.last_mut().unwrap()
        }
    }

    /// Settle the in-flight phase once the run ends.
    fn apply_terminal_phase_state(&mut self, state: &RunState, reason: &TerminalReason) {
        let failed_phase = match reason {
            TerminalReason::MaxIterationsExceeded { phase, .. } => {
                if let Some(entry) = self.find_phase_mut(phase) {
                    entry.state = PhaseState::Escalated;
                }
                return;
            }
            TerminalReason::StepFailed { phase, .. }
            | TerminalReason::DependencyMissing { phase, .. } => Some(phase.clone()),
            _ => None,
        };

        if let Some(phase) = failed_phase {
            if let Some(entry) = self.find_phase_mut(&phase) {
                entry.state = PhaseState::Failed;
            }
            return;
        }

        if *state == RunState::Cancelled {
            for entry in &mut self.snapshot.phases {
                if !entry.state.is_terminal() {
                    entry.state = PhaseState::Cancelled;
                }
            }
        }
    }

    fn find_phase_mut(&mut self, id: &str) -> Option<&mut PhaseProgress> {
        self.snapshot.phases.iter_mut().find(|p| p.id == id)
    }
}
