//! Feedback loop control after a failed quality gate.
//!
//! The controller turns a failed [`QualityGateResult`] into either a
//! bounded retry with structured feedback or an escalation once the
//! iteration budget is spent. Retry targeting is a configured lookup
//! from criterion to step, never inference: the lowest-scoring
//! criterion names the step to re-execute, and the sequencer re-runs
//! that step and everything after it in the phase.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::gate::QualityGateResult;
use crate::pipeline::PhaseDefinition;

static TEMPLATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(criterion|score|threshold|gap)\}").unwrap());

const DEFAULT_TEMPLATE: &str = "{criterion} scored {score}, below the bar of {threshold}";

/// One criterion that dragged the gate down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deficiency {
    pub criterion: String,
    /// Rendered description, ready to hand to an executor
    pub description: String,
    pub score: f64,
    pub threshold: f64,
}

/// Structured feedback issued for one failed gate iteration. Passed
/// through unmodified to the retried step's executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackRecord {
    pub phase: String,
    /// The gate iteration that failed (1-based)
    pub iteration: u32,
    /// The iteration the retry will run as
    pub next_iteration: u32,
    /// Step to re-execute; every later step in the phase re-runs too
    pub retry_step: String,
    pub deficiencies: Vec<Deficiency>,
    pub gate_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Terminal phase failure after the iteration budget is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub phase: String,
    pub iterations: u32,
    pub last_score: f64,
}

/// What to do about a failed gate.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackDecision {
    Retry(FeedbackRecord),
    Escalate(Escalation),
}

/// Decides retry versus escalation and assembles feedback records.
pub struct FeedbackController {
    default_template: String,
}

impl Default for FeedbackController {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackController {
    pub fn new() -> Self {
        Self {
            default_template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    /// Override the description template used for criteria that declare
    /// none of their own.
    pub fn with_default_template(mut self, template: &str) -> Self {
        self.default_template = template.to_string();
        self
    }

    /// Decide the response to a failed gate.
    ///
    /// `max_iterations` is the effective budget (gate value unless the
    /// run overrode it). Escalates when the failed iteration already
    /// consumed the budget; otherwise issues feedback targeting the
    /// step mapped from the lowest-scoring criterion. Ties resolve to
    /// the earliest mapped step in declaration order; criteria with no
    /// mapping (including the synthetic evaluation-error criterion)
    /// target the phase's first step, which is always safe because
    /// every later step re-runs anyway.
    pub fn on_gate_failure(
        &self,
        result: &QualityGateResult,
        phase: &PhaseDefinition,
        max_iterations: u32,
    ) -> FeedbackDecision {
        if result.iteration >= max_iterations {
            debug!(
                phase = %phase.id,
                iterations = result.iteration,
                last_score = result.score,
                "iteration budget exhausted"
            );
            return FeedbackDecision::Escalate(Escalation {
                phase: phase.id.clone(),
                iterations: result.iteration,
                last_score: result.score,
            });
        }

        let retry_index = self.pick_retry_index(result, phase);
        let retry_step = phase.steps[retry_index].id.clone();

        let mut deficiencies = Vec::new();
        for (name, &score) in &result.sub_scores {
            let criterion = phase.gate.criterion(name);
            let bar = criterion
                .map(|c| phase.gate.criterion_threshold(c))
                .unwrap_or(result.threshold);
            if score < bar {
                let template = criterion
                    .and_then(|c| c.template.as_deref())
                    .unwrap_or(&self.default_template);
                deficiencies.push(Deficiency {
                    criterion: name.clone(),
                    description: render_template(template, name, score, bar),
                    score,
                    threshold: bar,
                });
            }
        }

        // An aggregate miss with every sub-score above its bar still
        // needs something actionable in the record.
        if deficiencies.is_empty() {
            deficiencies.push(Deficiency {
                criterion: "aggregate".to_string(),
                description: render_template(
                    &self.default_template,
                    "aggregate",
                    result.score,
                    result.threshold,
                ),
                score: result.score,
                threshold: result.threshold,
            });
        }

        FeedbackDecision::Retry(FeedbackRecord {
            phase: phase.id.clone(),
            iteration: result.iteration,
            next_iteration: result.iteration + 1,
            retry_step,
            deficiencies,
            gate_score: result.score,
            created_at: Utc::now(),
        })
    }

    /// Index of the step to restart from. Deterministic: lowest
    /// sub-score wins, ties go to the earliest mapped step, unmapped
    /// criteria count as the first step.
    fn pick_retry_index(&self, result: &QualityGateResult, phase: &PhaseDefinition) -> usize {
        let Some(min_score) = result
            .sub_scores
            .values()
            .copied()
            .fold(None::<f64>, |acc, v| {
                Some(acc.map_or(v, |m| if v < m { v } else { m }))
            })
        else {
            return 0;
        };

        result
            .sub_scores
            .iter()
            .filter(|&(_, &score)| score == min_score)
            .map(|(name, _)| {
                phase
                    .gate
                    .criterion(name)
                    .and_then(|c| phase.step_index(&c.step))
                    .unwrap_or(0)
            })
            .min()
            .unwrap_or(0)
    }
}

fn render_template(template: &str, criterion: &str, score: f64, threshold: f64) -> String {
    TEMPLATE_REGEX
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "criterion" => criterion.to_string(),
            "score" => score.to_string(),
            "threshold" => threshold.to_string(),
            "gap" => (threshold - score).to_string(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}
