//! The per-run control loop.
//!
//! `WorkflowRunner` owns everything one run needs: the pipeline
//! definition, the executor and scorer registries, the artifact store
//! and the journal. It drives phases in order, steps in declaration
//! order, evaluates gates and routes feedback retries. Every state
//! change goes through `emit`, which journals the event before
//! anything else observes it.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::{RunId, RunOptions, RunState, TerminalReason};
use crate::artifact::{Artifact, ArtifactId, ArtifactStore};
use crate::errors::RunError;
use crate::executor::{ExecutorRegistry, InvocationRequest};
use crate::feedback::{FeedbackController, FeedbackDecision, FeedbackRecord};
use crate::gate::{GateEvaluator, ScorerRegistry};
use crate::journal::{EventJournal, RunEvent, rebuild_store};
use crate::pipeline::{PhaseDefinition, PipelineDefinition, StepDefinition};
use crate::tracker::{ProgressTracker, RunSnapshot};

pub struct WorkflowRunner {
    run_id: RunId,
    pipeline: PipelineDefinition,
    executors: Arc<ExecutorRegistry>,
    evaluator: GateEvaluator,
    feedback: FeedbackController,
    options: RunOptions,
    journal: EventJournal,
    store: ArtifactStore,
    tracker: ProgressTracker,
    seeds: Vec<Artifact>,
    resumed: bool,
    cancel_flag: Arc<AtomicBool>,
    cancel_marker: Option<PathBuf>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl WorkflowRunner {
    pub fn new(
        pipeline: PipelineDefinition,
        executors: Arc<ExecutorRegistry>,
        scorers: Arc<ScorerRegistry>,
        journal: EventJournal,
        options: RunOptions,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            pipeline,
            executors,
            evaluator: GateEvaluator::new(scorers),
            feedback: FeedbackController::new(),
            options,
            journal,
            store: ArtifactStore::new(),
            tracker: ProgressTracker::new(),
            seeds: Vec::new(),
            resumed: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            cancel_marker: None,
            event_tx: None,
        }
    }

    /// Rebuild a runner from an existing journal. Phases whose gate
    /// already passed are not re-executed; their artifacts come back
    /// through replay. The interrupted phase restarts from its first
    /// step with iteration numbering (and so the budget) carried over.
    pub fn resume(
        pipeline: PipelineDefinition,
        executors: Arc<ExecutorRegistry>,
        scorers: Arc<ScorerRegistry>,
        journal: EventJournal,
    ) -> Result<Self, RunError> {
        let events = journal.read_all()?;

        let mut header = None;
        for event in &events {
            if let RunEvent::RunStarted {
                run_id,
                digest,
                options,
                ..
            } = event
            {
                header = Some((*run_id, digest.clone(), options.clone()));
                break;
            }
        }
        let (run_id, digest, options) = header.ok_or_else(|| {
            RunError::Other(anyhow!(
                "Journal {} has no run_started event",
                journal.path().display()
            ))
        })?;

        if digest != pipeline.digest {
            warn!(run_id = %run_id, "Pipeline definition changed since the original run");
        }

        let store = rebuild_store(&events)?;
        let mut tracker = ProgressTracker::new();
        for event in &events {
            tracker.apply(event);
        }
        if tracker.snapshot().state == RunState::Passed {
            return Err(RunError::Other(anyhow!(
                "Run {} already passed; nothing to resume",
                run_id
            )));
        }

        info!(run_id = %run_id, events = events.len(), "Resuming run from journal");

        Ok(Self {
            run_id,
            pipeline,
            executors,
            evaluator: GateEvaluator::new(scorers),
            feedback: FeedbackController::new(),
            options,
            journal,
            store,
            tracker,
            seeds: Vec::new(),
            resumed: true,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            cancel_marker: None,
            event_tx: None,
        })
    }

    /// Seed initial artifacts, one per workflow input kind.
    pub fn with_seeds(mut self, seeds: Vec<(String, String)>) -> Self {
        for (kind, content) in seeds {
            let seq = self.store.next_seq();
            self.seeds.push(Artifact::seed(&kind, content, seq));
        }
        self
    }

    /// Adopt a pre-assigned run id, so callers can derive the journal
    /// path from the id before constructing the runner.
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// A file whose existence requests cancellation, so `cancel` works
    /// from another process.
    pub fn with_cancel_marker(mut self, marker: PathBuf) -> Self {
        self.cancel_marker = Some(marker);
        self
    }

    /// Set the event channel for live progress display. Every journaled
    /// event is forwarded after the journal write succeeds.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn journal_path(&self) -> &Path {
        self.journal.path()
    }

    /// Drive the run to a terminal state. Every outcome, including
    /// failure and cancellation, ends with a `RunTerminated` event;
    /// the error value never escapes, it becomes the terminal reason.
    pub async fn run(mut self) -> Result<RunSnapshot> {
        let outcome = self.execute().await;
        let reason = match outcome {
            Ok(()) => TerminalReason::AllPhasesPassed,
            Err(ref e) => TerminalReason::from_run_error(e),
        };
        let state = reason.state();
        info!(run_id = %self.run_id, state = %state, "Run finished");
        self.emit(RunEvent::RunTerminated {
            state,
            reason,
            at: Utc::now(),
        })
        .await?;
        Ok(self.tracker.into_snapshot())
    }

    async fn execute(&mut self) -> Result<(), RunError> {
        let skipped: HashSet<String> = self.options.skip_steps.iter().cloned().collect();

        if !self.resumed {
            let seeds = std::mem::take(&mut self.seeds);
            self.emit(RunEvent::RunStarted {
                run_id: self.run_id,
                pipeline: self.pipeline.name.clone(),
                digest: self.pipeline.digest.clone(),
                options: self.options.clone(),
                seeds: seeds.clone(),
                at: Utc::now(),
            })
            .await?;
            for artifact in seeds {
                self.store.put(artifact)?;
            }
        }

        self.preflight(&skipped)?;

        let phase_count = self.pipeline.phases.len();
        for index in 0..phase_count {
            self.check_cancelled()?;
            let phase = self.pipeline.phases[index].clone();
            if self.phase_already_passed(&phase.id) {
                debug!(phase = %phase.id, "Phase gate already passed, skipping");
                continue;
            }
            self.execute_phase(&phase, &skipped).await?;
            if index + 1 < phase_count {
                let next = self.pipeline.phases[index + 1].id.clone();
                self.emit(RunEvent::PhaseAdvanced {
                    from: phase.id.clone(),
                    to: next,
                    at: Utc::now(),
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Static checks before any step runs: every unskipped step has a
    /// registered executor and a satisfiable input chain.
    fn preflight(&self, skipped: &HashSet<String>) -> Result<(), RunError> {
        for phase in &self.pipeline.phases {
            for step in &phase.steps {
                if skipped.contains(&step.id) {
                    continue;
                }
                if !self.executors.contains(&step.executor) {
                    return Err(RunError::UnknownExecutor {
                        phase: phase.id.clone(),
                        step: step.id.clone(),
                        executor: step.executor.clone(),
                    });
                }
            }
        }

        let seeded: Vec<String> = self.store.all().map(|a| a.kind.clone()).collect();
        self.pipeline.validate_dataflow(&seeded, skipped)?;
        Ok(())
    }

    async fn execute_phase(
        &mut self,
        phase: &PhaseDefinition,
        skipped: &HashSet<String>,
    ) -> Result<(), RunError> {
        let threshold = self
            .options
            .quality_threshold
            .unwrap_or(phase.gate.threshold);
        let max_iterations = self.options.max_iterations.unwrap_or(phase.gate.max_iterations);

        let mut iteration = self.next_iteration(&phase.id);
        if iteration > max_iterations {
            // A crash can land between a failed final gate and its
            // escalation; settle it now.
            return Err(RunError::MaxIterationsExceeded {
                phase: phase.id.clone(),
                iterations: max_iterations,
                last_score: self.last_gate_score(&phase.id).unwrap_or(0.0),
            });
        }

        info!(phase = %phase.id, threshold, max_iterations, "Phase starting");

        let mut start_index = 0usize;
        let mut pending_feedback: Option<FeedbackRecord> = None;

        loop {
            self.check_cancelled()?;

            for (index, step) in phase.steps.iter().enumerate().skip(start_index) {
                if skipped.contains(&step.id) {
                    debug!(step = %step.id, "Step skipped by request");
                    continue;
                }
                self.check_cancelled()?;
                let feedback = pending_feedback.as_ref().filter(|_| index == start_index);
                self.execute_step(phase, step, iteration, feedback).await?;
            }

            self.check_cancelled()?;

            let artifacts = self.phase_artifacts(phase);
            let deadline = self.options.step_timeout();
            let result = self
                .evaluator
                .evaluate(phase, iteration, &artifacts, threshold, deadline)
                .await;
            self.emit(RunEvent::GateEvaluated {
                result: Box::new(result.clone()),
                at: Utc::now(),
            })
            .await?;

            if result.passed {
                info!(phase = %phase.id, iteration, score = result.score, "Gate passed");
                return Ok(());
            }

            match self.feedback.on_gate_failure(&result, phase, max_iterations) {
                FeedbackDecision::Retry(record) => {
                    warn!(
                        phase = %phase.id,
                        iteration,
                        score = result.score,
                        retry_step = %record.retry_step,
                        "Gate failed, retrying"
                    );
                    self.emit(RunEvent::FeedbackIssued {
                        record: record.clone(),
                        at: Utc::now(),
                    })
                    .await?;
                    start_index = phase.step_index(&record.retry_step).unwrap_or(0);
                    iteration = record.next_iteration;
                    pending_feedback = Some(record);
                }
                FeedbackDecision::Escalate(escalation) => {
                    warn!(
                        phase = %phase.id,
                        iterations = escalation.iterations,
                        last_score = escalation.last_score,
                        "Iteration budget exhausted"
                    );
                    return Err(RunError::MaxIterationsExceeded {
                        phase: escalation.phase,
                        iterations: escalation.iterations,
                        last_score: escalation.last_score,
                    });
                }
            }
        }
    }

    async fn execute_step(
        &mut self,
        phase: &PhaseDefinition,
        step: &StepDefinition,
        iteration: u32,
        feedback: Option<&FeedbackRecord>,
    ) -> Result<(), RunError> {
        let executor =
            self.executors
                .resolve(&step.executor)
                .ok_or_else(|| RunError::UnknownExecutor {
                    phase: phase.id.clone(),
                    step: step.id.clone(),
                    executor: step.executor.clone(),
                })?;

        let inputs = self.resolve_inputs(phase, step)?;
        let deadline = step.deadline(self.options.step_timeout());

        self.emit(RunEvent::StepStarted {
            phase: phase.id.clone(),
            step: step.id.clone(),
            iteration,
            at: Utc::now(),
        })
        .await?;
        debug!(
            phase = %phase.id,
            step = %step.id,
            iteration,
            inputs = inputs.len(),
            "Step starting"
        );

        let start = Instant::now();
        let mut attempt = 0u32;
        let output = loop {
            self.check_cancelled()?;
            let request = InvocationRequest {
                task: &step.id,
                inputs: &inputs,
                feedback,
                deadline,
            };
            match executor.invoke(request).await {
                Ok(output) => break output,
                Err(e) if e.is_retryable() && attempt < self.options.transient_retries => {
                    attempt += 1;
                    warn!(step = %step.id, attempt, error = %e, "Transient step failure, retrying");
                }
                Err(e) => {
                    return Err(RunError::StepFailed {
                        phase: phase.id.clone(),
                        step: step.id.clone(),
                        source: e,
                    });
                }
            }
        };

        let depends_on: Vec<ArtifactId> = inputs.iter().map(|a| a.id).collect();
        let mut stored = Vec::with_capacity(output.artifacts.len());
        for draft in output.artifacts {
            let seq = self.store.next_seq();
            let artifact =
                Artifact::from_draft(draft, &step.id, &phase.id, iteration, depends_on.clone(), seq);
            self.store.put(artifact.clone())?;
            stored.push(artifact);
        }

        self.emit(RunEvent::StepCompleted {
            phase: phase.id.clone(),
            step: step.id.clone(),
            iteration,
            artifacts: stored,
            duration_ms: start.elapsed().as_millis() as u64,
            at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    /// Latest artifact for each input kind a step declares. Pre-flight
    /// guarantees these resolve on the first iteration; retries always
    /// see the newest version.
    fn resolve_inputs(
        &self,
        phase: &PhaseDefinition,
        step: &StepDefinition,
    ) -> Result<Vec<Artifact>, RunError> {
        let mut inputs = Vec::with_capacity(step.inputs.len());
        for kind in &step.inputs {
            let artifact =
                self.store
                    .latest_by_kind(kind)
                    .ok_or_else(|| RunError::DependencyMissing {
                        phase: phase.id.clone(),
                        step: step.id.clone(),
                        kind: kind.clone(),
                    })?;
            inputs.push(artifact.clone());
        }
        Ok(inputs)
    }

    /// What the gate scores: the latest artifact of every output kind
    /// the phase declares, in declaration order.
    fn phase_artifacts(&self, phase: &PhaseDefinition) -> Vec<Artifact> {
        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for step in &phase.steps {
            for kind in &step.outputs {
                if seen.insert(kind.clone())
                    && let Some(artifact) = self.store.latest_by_kind(kind)
                {
                    artifacts.push(artifact.clone());
                }
            }
        }
        artifacts
    }

    /// First iteration to run for a phase: 1 for a fresh phase, after
    /// the last evaluated gate on a resume (re-running an interrupted
    /// iteration under its own number).
    fn next_iteration(&self, phase_id: &str) -> u32 {
        match self.tracker.snapshot().phase(phase_id) {
            None => 1,
            Some(progress) => {
                let evaluated = progress
                    .gate_history
                    .last()
                    .map(|g| g.iteration)
                    .unwrap_or(0);
                if progress.iterations_used > evaluated {
                    progress.iterations_used
                } else {
                    evaluated + 1
                }
            }
        }
    }

    fn last_gate_score(&self, phase_id: &str) -> Option<f64> {
        self.tracker
            .snapshot()
            .phase(phase_id)?
            .gate_history
            .last()
            .map(|g| g.score)
    }

    fn phase_already_passed(&self, phase_id: &str) -> bool {
        self.tracker
            .snapshot()
            .phase(phase_id)
            .is_some_and(|p| p.state.is_success())
    }

    fn check_cancelled(&self) -> Result<(), RunError> {
        if self.cancel_flag.load(Ordering::Relaxed) {
            return Err(RunError::Cancelled);
        }
        if let Some(ref marker) = self.cancel_marker
            && marker.exists()
        {
            return Err(RunError::Cancelled);
        }
        Ok(())
    }

    /// Journal first, then fold into the tracker and notify observers.
    async fn emit(&mut self, event: RunEvent) -> Result<()> {
        self.journal
            .append(&event)
            .with_context(|| format!("Failed to journal {} event", event.event_type()))?;
        self.tracker.apply(&event);
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
        Ok(())
    }
}
