//! Pipeline definition and loading for the crucible orchestrator.
//!
//! This module provides:
//! - `PipelineDefinition` representing a full workflow (ordered phases)
//! - `PhaseDefinition`, `StepDefinition`, `GateSpec`, `CriterionSpec`
//! - YAML/JSON loading with content digests
//! - Static validation, run before anything executes
//!
//! Definitions are declarative data. They are parsed once, validated once,
//! and never re-interpreted from free text while a run is in flight.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::errors::{PipelineError, RunError};

/// A single unit of work inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    /// Step id, unique within its phase (e.g., "draft", "cite-check")
    pub id: String,
    /// Name of the executor capability that runs this step
    pub executor: String,
    /// Artifact kinds this step consumes; each must be produced by an
    /// earlier step or seeded as an initial input
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Artifact kinds this step produces
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Per-step deadline in seconds; falls back to the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    /// Deadline for this step, using `default` when none is declared.
    pub fn deadline(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// One scored criterion inside a quality gate, mapped to the step
/// responsible for satisfying it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionSpec {
    /// Criterion name as reported by the scorer (e.g., "completeness")
    pub name: String,
    /// Step id to re-execute when this criterion drags the score down
    pub step: String,
    /// Individual bar for listing this criterion as a deficiency;
    /// defaults to the gate threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
    /// Deficiency description template. Supports `{criterion}`, `{score}`,
    /// `{threshold}` and `{gap}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Quality gate configuration for a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateSpec {
    /// Name of the scoring capability to invoke
    pub scorer: String,
    /// Aggregate score required to pass, 0-100 inclusive.
    /// The comparison is `score >= threshold`.
    pub threshold: f64,
    /// Maximum quality iterations before the phase escalates
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Criteria the scorer reports on, with their retry targets
    #[serde(default)]
    pub criteria: Vec<CriterionSpec>,
}

fn default_max_iterations() -> u32 {
    3
}

impl GateSpec {
    /// Individual pass bar for a criterion, falling back to the gate
    /// threshold when none is declared.
    pub fn criterion_threshold(&self, criterion: &CriterionSpec) -> f64 {
        criterion.pass_threshold.unwrap_or(self.threshold)
    }

    /// Look up the criterion spec by scorer-reported name.
    pub fn criterion(&self, name: &str) -> Option<&CriterionSpec> {
        self.criteria.iter().find(|c| c.name == name)
    }
}

/// A single phase: ordered steps followed by a quality gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Phase id (e.g., "01", "research")
    pub id: String,
    /// Human-readable name of the phase
    pub name: String,
    /// Steps executed in declaration order
    pub steps: Vec<StepDefinition>,
    /// Gate evaluated after the steps complete
    pub gate: GateSpec,
}

impl PhaseDefinition {
    /// Index of a step by id, in declaration order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Get a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// The full workflow definition as loaded from a pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "grant-proposal")
    pub name: String,
    /// Artifact kinds the caller must seed when starting a run
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Phases executed strictly in declaration order
    pub phases: Vec<PhaseDefinition>,
    /// Digest of the file content this definition was loaded from.
    /// Empty when the definition was built in code.
    #[serde(skip)]
    pub digest: String,
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML or JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| PipelineError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let mut pipeline: PipelineDefinition = if is_json {
            serde_json::from_str(&content).map_err(|e| PipelineError::ParseFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| PipelineError::ParseFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        pipeline.digest = content_digest(&content);
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Validate the definition structure. Runs at load time and again
    /// before a run starts; nothing executes against an invalid pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.phases.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }

        let mut phase_ids = HashSet::new();
        for phase in &self.phases {
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(PipelineError::DuplicatePhase {
                    id: phase.id.clone(),
                });
            }

            if phase.steps.is_empty() {
                return Err(PipelineError::EmptyPhase {
                    phase: phase.id.clone(),
                });
            }

            let mut step_ids = HashSet::new();
            for step in &phase.steps {
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PipelineError::DuplicateStep {
                        phase: phase.id.clone(),
                        id: step.id.clone(),
                    });
                }
            }

            if !(0.0..=100.0).contains(&phase.gate.threshold) {
                return Err(PipelineError::ThresholdOutOfRange {
                    phase: phase.id.clone(),
                    threshold: phase.gate.threshold,
                });
            }

            if phase.gate.max_iterations == 0 {
                return Err(PipelineError::ZeroIterations {
                    phase: phase.id.clone(),
                });
            }

            for criterion in &phase.gate.criteria {
                if !step_ids.contains(criterion.step.as_str()) {
                    return Err(PipelineError::UnknownCriterionStep {
                        phase: phase.id.clone(),
                        criterion: criterion.name.clone(),
                        step: criterion.step.clone(),
                    });
                }
                if let Some(bar) = criterion.pass_threshold
                    && !(0.0..=100.0).contains(&bar)
                {
                    return Err(PipelineError::ThresholdOutOfRange {
                        phase: phase.id.clone(),
                        threshold: bar,
                    });
                }
            }
        }

        Ok(())
    }

    /// Check that every step's required input kinds are produced by an
    /// earlier step or seeded up front. Skipped steps produce nothing.
    ///
    /// Walks the effective execution order and fails on the first step
    /// whose requirement nothing satisfies, before any executor runs.
    pub fn validate_dataflow(
        &self,
        seeded: &[String],
        skipped: &HashSet<String>,
    ) -> Result<(), RunError> {
        let mut available: HashSet<&str> = seeded.iter().map(String::as_str).collect();

        for phase in &self.phases {
            for step in &phase.steps {
                if skipped.contains(&step.id) {
                    continue;
                }
                for kind in &step.inputs {
                    if !available.contains(kind.as_str()) {
                        return Err(RunError::DependencyMissing {
                            phase: phase.id.clone(),
                            step: step.id.clone(),
                            kind: kind.clone(),
                        });
                    }
                }
                for kind in &step.outputs {
                    available.insert(kind.as_str());
                }
            }
        }

        Ok(())
    }

    /// Get a phase by id.
    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Index of a phase by id, in declaration order.
    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }
}

/// Hex sha256 digest of raw file content.
pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
