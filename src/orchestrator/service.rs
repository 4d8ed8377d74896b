//! Hosts concurrent workflow runs.
//!
//! Each submitted runner becomes a background task. The service keeps
//! a handle per run so callers can cancel cooperatively, poll status,
//! and wait for terminal snapshots. Runs share nothing; a slow or
//! failing run never affects another.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;

use super::runner::WorkflowRunner;
use super::state::{RunId, RunOptions};
use crate::errors::RunError;
use crate::executor::ExecutorRegistry;
use crate::gate::ScorerRegistry;
use crate::journal::EventJournal;
use crate::pipeline::PipelineDefinition;
use crate::tracker::{ProgressTracker, RunSnapshot};

struct RunHandle {
    cancel_flag: Arc<AtomicBool>,
    journal_path: PathBuf,
    join: JoinHandle<Result<RunSnapshot>>,
}

pub struct WorkflowService {
    executors: Arc<ExecutorRegistry>,
    scorers: Arc<ScorerRegistry>,
    runs_dir: PathBuf,
    runs: Arc<tokio::sync::Mutex<HashMap<RunId, RunHandle>>>,
}

impl WorkflowService {
    pub fn new(
        executors: Arc<ExecutorRegistry>,
        scorers: Arc<ScorerRegistry>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executors,
            scorers,
            runs_dir: runs_dir.into(),
            runs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Start a workflow in the background and return its id
    /// immediately. The journal lands under `<runs_dir>/<run-id>/`.
    pub async fn run_workflow(
        &self,
        pipeline: PipelineDefinition,
        options: RunOptions,
        inputs: Vec<(String, String)>,
    ) -> RunId {
        let run_id = RunId::new();
        let journal = EventJournal::new(
            self.runs_dir
                .join(run_id.to_string())
                .join("journal.jsonl"),
        );
        let runner = WorkflowRunner::new(
            pipeline,
            Arc::clone(&self.executors),
            Arc::clone(&self.scorers),
            journal,
            options,
        )
        .with_run_id(run_id)
        .with_seeds(inputs);
        self.submit(runner).await
    }

    /// Start a pre-built runner in the background. Used when the caller
    /// needs runner extras such as a cancel marker or a progress UI.
    pub async fn submit(&self, runner: WorkflowRunner) -> RunId {
        let run_id = runner.run_id();
        let cancel_flag = runner.cancel_flag();
        let journal_path = runner.journal_path().to_path_buf();
        let join = tokio::spawn(async move { runner.run().await });
        self.runs.lock().await.insert(
            run_id,
            RunHandle {
                cancel_flag,
                journal_path,
                join,
            },
        );
        debug!(run_id = %run_id, "Run submitted");
        run_id
    }

    /// Snapshot a tracked run by replaying its journal. Works while
    /// the run is still executing; every event is flushed before the
    /// tracker observes it, so the journal is never behind.
    pub async fn status(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        let path = {
            let runs = self.runs.lock().await;
            let handle = runs
                .get(&run_id)
                .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))?;
            handle.journal_path.clone()
        };
        let journal = EventJournal::new(path);
        if !journal.exists() {
            // Submitted but the task has not written its header yet.
            return Ok(ProgressTracker::replay(&[]));
        }
        let events = journal.read_all()?;
        Ok(ProgressTracker::replay(&events))
    }

    /// Request cooperative cancellation. The run keeps going until its
    /// next check between steps, then terminates as cancelled.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), RunError> {
        let runs = self.runs.lock().await;
        let handle = runs
            .get(&run_id)
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))?;
        handle.cancel_flag.store(true, Ordering::Relaxed);
        debug!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// Wait for a run to reach a terminal state and take its snapshot.
    pub async fn wait(&self, run_id: RunId) -> Result<RunSnapshot, RunError> {
        let handle = self
            .runs
            .lock()
            .await
            .remove(&run_id)
            .ok_or_else(|| RunError::RunNotFound(run_id.to_string()))?;
        let snapshot = handle
            .join
            .await
            .map_err(|e| RunError::Other(anyhow!("Run task panicked: {}", e)))??;
        Ok(snapshot)
    }

    /// Wait for every tracked run. Outcomes come back in no particular
    /// order.
    pub async fn wait_all(&self) -> Vec<(RunId, Result<RunSnapshot, RunError>)> {
        let handles: Vec<(RunId, RunHandle)> = self.runs.lock().await.drain().collect();
        let joined = futures::future::join_all(
            handles
                .into_iter()
                .map(|(run_id, handle)| async move { (run_id, handle.join.await) }),
        )
        .await;

        joined
            .into_iter()
            .map(|(run_id, outcome)| {
                let outcome = match outcome {
                    Ok(Ok(snapshot)) => Ok(snapshot),
                    Ok(Err(e)) => Err(RunError::Other(e)),
                    Err(e) => Err(RunError::Other(anyhow!("Run task panicked: {}", e))),
                };
                (run_id, outcome)
            })
            .collect()
    }

    pub async fn is_tracked(&self, run_id: RunId) -> bool {
        self.runs.lock().await.contains_key(&run_id)
    }

    pub async fn tracked_count(&self) -> usize {
        self.runs.lock().await.len()
    }
}
