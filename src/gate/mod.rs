//! Quality gate results.
//!
//! A gate compares a scorer's aggregate score against the phase
//! threshold. Evaluation always terminates with a [`QualityGateResult`]:
//! scorer crashes and timeouts become failed results carrying an error
//! message, never a propagated error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod evaluator;

pub use evaluator::{CommandScorer, FnScorer, GateEvaluator, ScoreRequest, Scorer, ScorerRegistry};

/// Synthetic criterion reported when the scorer itself failed.
pub const EVALUATION_ERROR_CRITERION: &str = "evaluation-error";

/// What a scorer returns: the aggregate score plus per-criterion
/// sub-scores, all on the 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreReport {
    pub aggregate_score: f64,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, f64>,
}

/// Immutable outcome of one gate evaluation. Exactly one exists per
/// (phase, iteration).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityGateResult {
    /// Phase the gate guards
    pub phase: String,
    /// Quality iteration this result scored (1-based)
    pub iteration: u32,
    /// Aggregate score, clamped to 0-100
    pub score: f64,
    /// Threshold the score was compared against
    pub threshold: f64,
    /// `score >= threshold`; passing exactly at the threshold passes
    pub passed: bool,
    /// Per-criterion sub-scores, clamped to 0-100
    pub sub_scores: BTreeMap<String, f64>,
    /// Set when the scorer itself failed; the result then scores 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityGateResult {
    /// Build a result from a scorer report, clamping scores into range
    /// and applying the inclusive threshold comparison.
    pub fn from_report(phase: &str, iteration: u32, report: ScoreReport, threshold: f64) -> Self {
        let score = clamp_score(report.aggregate_score);
        let sub_scores = report
            .sub_scores
            .into_iter()
            .map(|(name, value)| (name, clamp_score(value)))
            .collect();
        Self {
            phase: phase.to_string(),
            iteration,
            score,
            threshold,
            passed: score >= threshold,
            sub_scores,
            error: None,
            evaluated_at: Utc::now(),
        }
    }

    /// Build the score-0 failed result recorded when scoring itself
    /// broke (unknown scorer, crash, timeout).
    pub fn evaluation_error(phase: &str, iteration: u32, threshold: f64, message: &str) -> Self {
        let mut sub_scores = BTreeMap::new();
        sub_scores.insert(EVALUATION_ERROR_CRITERION.to_string(), 0.0);
        Self {
            phase: phase.to_string(),
            iteration,
            score: 0.0,
            threshold,
            passed: false,
            sub_scores,
            error: Some(message.to_string()),
            evaluated_at: Utc::now(),
        }
    }

    /// The lowest-scoring criterion. Ties resolve to the first name in
    /// lexicographic order so the pick is deterministic; the feedback
    /// controller then applies the step-order tie-break on top.
    pub fn worst_criterion(&self) -> Option<(&str, f64)> {
        self.sub_scores
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, score)| (name.as_str(), *score))
    }

    /// Whether this result reflects a scorer failure rather than a
    /// genuine quality judgment.
    pub fn is_evaluation_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Clamp a scorer-reported value into 0-100. NaN counts as 0.
fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
