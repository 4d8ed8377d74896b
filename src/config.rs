use anyhow::{Context, Result, anyhow};
use glob::glob;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::orchestrator::RunId;

/// Runtime configuration for Crucible.
///
/// Bridges the unified CrucibleToml with the runtime needs of the
/// orchestrator: pipeline file discovery and the on-disk layout under
/// `.crucible/`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub crucible_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub pipeline_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Config {
    /// Create a Config for commands that operate on a pipeline file.
    /// Discovers the file when none is given explicitly.
    pub fn new(project_dir: PathBuf, verbose: bool, pipeline_file: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::without_pipeline(project_dir, verbose)?;
        let pipeline_file = match pipeline_file {
            Some(path) => path
                .canonicalize()
                .context("Failed to resolve pipeline file path")?,
            None => Self::find_pipeline_file(&config.project_dir)?,
        };
        config.pipeline_file = Some(pipeline_file);
        Ok(config)
    }

    /// Create a Config for commands that only touch recorded run state
    /// (status, list, cancel, reset).
    pub fn without_pipeline(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let crucible_dir = project_dir.join(".crucible");
        let runs_dir = crucible_dir.join("runs");
        Ok(Self {
            project_dir,
            crucible_dir,
            runs_dir,
            pipeline_file: None,
            verbose,
        })
    }

    /// The resolved pipeline file. Errors for configs built with
    /// `without_pipeline`.
    pub fn pipeline_file(&self) -> Result<&Path> {
        self.pipeline_file
            .as_deref()
            .ok_or_else(|| anyhow!("No pipeline file resolved for this command"))
    }

    /// Path of the unified TOML config file.
    pub fn config_file(&self) -> PathBuf {
        self.crucible_dir.join("crucible.toml")
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.runs_dir.join(run_id.to_string())
    }

    pub fn journal_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("journal.jsonl")
    }

    /// Marker file polled by the runner between steps; its existence
    /// requests cooperative cancellation from another process.
    pub fn cancel_marker_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join("cancel")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.runs_dir).context("Failed to create runs directory")?;
        Ok(())
    }

    /// Recorded runs, most recently modified first.
    pub fn list_runs(&self) -> Result<Vec<RunId>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<(RunId, Option<std::time::SystemTime>)> = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir).context("Failed to read runs directory")? {
            let entry = entry.context("Failed to read runs directory entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let Ok(run_id) = RunId::from_str(&name) else {
                continue;
            };
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            runs.push((run_id, modified));
        }

        runs.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(runs.into_iter().map(|(run_id, _)| run_id).collect())
    }

    /// The most recently recorded run, if any.
    pub fn latest_run(&self) -> Result<Option<RunId>> {
        Ok(self.list_runs()?.into_iter().next())
    }

    /// Find a pipeline file, checking `.crucible/pipeline.{yaml,yml,json}`
    /// first, then `*.pipeline.{yaml,yml,json}` in the project directory.
    /// Returns the most recently modified file if multiple match.
    fn find_pipeline_file(project_dir: &Path) -> Result<PathBuf> {
        for name in ["pipeline.yaml", "pipeline.yml", "pipeline.json"] {
            let candidate = project_dir.join(".crucible").join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        let mut matches: Vec<PathBuf> = Vec::new();
        for pattern in ["*.pipeline.yaml", "*.pipeline.yml", "*.pipeline.json"] {
            let pattern = project_dir.join(pattern).to_string_lossy().to_string();
            matches.extend(
                glob(&pattern)
                    .context("Failed to read glob pattern")?
                    .filter_map(|entry| entry.ok()),
            );
        }

        if matches.is_empty() {
            return Err(anyhow!(
                "No pipeline file found. Create .crucible/pipeline.yaml or provide --pipeline"
            ));
        }

        matches.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });

        Ok(matches.remove(0))
    }
}
