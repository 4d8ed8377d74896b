//! Live run progress UI.
//!
//! This module renders journal events as a terminal UI during a run.
//! It supports multiple output modes:
//! - `full`: Rich terminal UI with progress bars and colors
//! - `minimal`: Single-line status updates
//! - `json`: JSON-formatted events for machine consumption

use crate::journal::RunEvent;
use crate::orchestrator::{RunState, TerminalReason};
use crate::pipeline::PipelineDefinition;
use crate::ui::icons::{CHECK, CROSS, GATE, RETRY, RUNNING, SPARKLE, STOP};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Rich terminal UI with progress bars
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    /// Parse UI mode from string (convenience method).
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Terminal UI for a workflow run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar — tracks how many phase gates have passed
/// - Step bar — spinner with the current step and iteration
///
/// Gate outcomes and retries are printed as lines above the bars.
///
/// # Thread Safety
///
/// The `current_phase` mutex is safe to unwrap: the locked section only
/// swaps a small value and events arrive sequentially from the run task.
pub struct RunUi {
    mode: UiMode,
    multi: MultiProgress,
    phase_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
    term: Term,
    phase_names: HashMap<String, String>,
    budgets: HashMap<String, u32>,
    current_phase: Mutex<Option<String>>,
}

impl RunUi {
    /// Create the UI for one pipeline. Phase names and iteration
    /// budgets come from the definition so events can be rendered with
    /// human-readable labels.
    pub fn new(pipeline: &PipelineDefinition, mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let term = Term::stdout();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let phase_bar = multi.add(ProgressBar::new(pipeline.phases.len() as u64));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        let phase_names = pipeline
            .phases
            .iter()
            .map(|phase| (phase.id.clone(), phase.name.clone()))
            .collect();
        let budgets = pipeline
            .phases
            .iter()
            .map(|phase| (phase.id.clone(), phase.gate.max_iterations))
            .collect();

        Self {
            mode,
            multi,
            phase_bar,
            step_bar,
            verbose,
            term,
            phase_names,
            budgets,
            current_phase: Mutex::new(None),
        }
    }

    /// Render one journal event.
    pub fn handle_event(&self, event: &RunEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    /// Handle event in JSON mode - just serialize and print.
    fn handle_json(&self, event: &RunEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    /// Handle event in minimal mode - single line updates.
    fn handle_minimal(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                run_id, pipeline, ..
            } => {
                let _ = writeln!(&self.term, "Run {} started: {}", run_id.short(), pipeline);
            }
            RunEvent::StepCompleted { phase, step, .. } => {
                let _ = writeln!(&self.term, "✓ {}/{}", phase, step);
            }
            RunEvent::GateEvaluated { result, .. } => {
                let verdict = if result.passed { "pass" } else { "fail" };
                let _ = writeln!(
                    &self.term,
                    "gate {} iter {}: {:.1}/{:.1} {}",
                    result.phase, result.iteration, result.score, result.threshold, verdict
                );
            }
            RunEvent::FeedbackIssued { record, .. } => {
                let _ = writeln!(
                    &self.term,
                    "↻ {} retrying from {} (iteration {})",
                    record.phase, record.retry_step, record.next_iteration
                );
            }
            RunEvent::RunTerminated { state, reason, .. } => {
                let _ = writeln!(&self.term, "Done: {} ({})", state, reason.summary());
            }
            _ => {}
        }
    }

    /// Handle event in full mode - rich terminal UI.
    fn handle_full(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted {
                run_id,
                pipeline,
                seeds,
                ..
            } => self.on_run_started(&run_id.short(), pipeline, seeds.len()),
            RunEvent::StepStarted {
                phase,
                step,
                iteration,
                ..
            } => self.on_step_started(phase, step, *iteration),
            RunEvent::StepCompleted {
                phase,
                step,
                artifacts,
                duration_ms,
                ..
            } => self.on_step_completed(phase, step, artifacts.len(), *duration_ms),
            RunEvent::GateEvaluated { result, .. } => self.on_gate_evaluated(result),
            RunEvent::FeedbackIssued { record, .. } => {
                self.on_feedback_issued(
                    &record.phase,
                    &record.retry_step,
                    record.next_iteration,
                    record.deficiencies.len(),
                );
            }
            RunEvent::PhaseAdvanced { .. } => {}
            RunEvent::RunTerminated { state, reason, .. } => self.on_run_terminated(*state, reason),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if
    /// the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn print_separator(&self) {
        self.print_line(format!("{}", style("═".repeat(60)).cyan()));
    }

    fn phase_name<'a>(&'a self, phase: &'a str) -> &'a str {
        self.phase_names
            .get(phase)
            .map(String::as_str)
            .unwrap_or(phase)
    }

    fn budget(&self, phase: &str) -> u32 {
        self.budgets.get(phase).copied().unwrap_or(0)
    }

    fn on_run_started(&self, run_id: &str, pipeline: &str, seed_count: usize) {
        self.print_line("");
        self.print_separator();
        self.print_line(format!(
            "{} Run {}: {}",
            style("▶").green().bold(),
            style(run_id).yellow().bold(),
            pipeline
        ));
        self.print_separator();
        if seed_count > 0 {
            self.print_line(format!(
                "{}  {} initial artifact{}",
                style("Inputs:").dim(),
                seed_count,
                if seed_count == 1 { "" } else { "s" }
            ));
        }
        self.print_line("");
    }

    fn on_step_started(&self, phase: &str, step: &str, iteration: u32) {
        // First step of a new phase prints that phase's header.
        let is_new_phase = {
            let mut current = self.current_phase.lock().unwrap();
            if current.as_deref() != Some(phase) {
                *current = Some(phase.to_string());
                true
            } else {
                false
            }
        };
        if is_new_phase {
            self.print_line(format!(
                "{} Phase {}: {}",
                RUNNING,
                style(phase).yellow().bold(),
                self.phase_name(phase)
            ));
            self.phase_bar
                .set_message(format!("{}: {}", style(phase).yellow(), self.phase_name(phase)));
        }

        self.step_bar.set_message(format!(
            "Running {} {}",
            style(step).cyan(),
            style(format!("(iteration {}/{})", iteration, self.budget(phase))).dim()
        ));
        self.step_bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn on_step_completed(&self, phase: &str, step: &str, artifact_count: usize, duration_ms: u64) {
        self.step_bar.set_message(format!(
            "{} complete {}",
            style(step).cyan(),
            style(format!(
                "({} artifact{}, {})",
                artifact_count,
                if artifact_count == 1 { "" } else { "s" },
                format_duration(Duration::from_millis(duration_ms))
            ))
            .dim()
        ));
        if self.verbose {
            self.print_line(format!(
                "    {} {}/{} produced {} artifact{}",
                CHECK,
                phase,
                style(step).cyan(),
                artifact_count,
                if artifact_count == 1 { "" } else { "s" }
            ));
        }
    }

    fn on_gate_evaluated(&self, result: &crate::gate::QualityGateResult) {
        if result.passed {
            self.phase_bar.inc(1);
            self.print_line(format!(
                "{} Gate {} passed: {} (iteration {})",
                CHECK,
                style(&result.phase).green().bold(),
                style(format!("{:.1}/{:.1}", result.score, result.threshold)).green(),
                result.iteration
            ));
            return;
        }

        let detail = match (&result.error, result.worst_criterion()) {
            (Some(error), _) => format!("scorer error: {}", error),
            (None, Some((name, score))) => format!("worst: {} {:.1}", name, score),
            (None, None) => "no sub-scores".to_string(),
        };
        self.print_line(format!(
            "{} Gate {} failed: {} ({})",
            GATE,
            style(&result.phase).red().bold(),
            style(format!("{:.1} < {:.1}", result.score, result.threshold)).red(),
            style(detail).dim()
        ));
    }

    fn on_feedback_issued(
        &self,
        phase: &str,
        retry_step: &str,
        next_iteration: u32,
        deficiency_count: usize,
    ) {
        self.print_line(format!(
            "{} Retrying {} from {} {}",
            RETRY,
            style(phase).yellow(),
            style(retry_step).cyan(),
            style(format!(
                "(iteration {}/{}, {} deficienc{})",
                next_iteration,
                self.budget(phase),
                deficiency_count,
                if deficiency_count == 1 { "y" } else { "ies" }
            ))
            .dim()
        ));
    }

    fn on_run_terminated(&self, state: RunState, reason: &TerminalReason) {
        self.step_bar.finish_and_clear();
        self.phase_bar.finish_and_clear();

        self.print_line("");
        self.print_separator();
        match state {
            RunState::Passed => {
                self.print_line(format!(
                    "{} Run {} {}",
                    SPARKLE,
                    style("PASSED").green().bold(),
                    SPARKLE
                ));
            }
            RunState::Cancelled => {
                self.print_line(format!("{} Run {}", STOP, style("CANCELLED").yellow().bold()));
            }
            _ => {
                self.print_line(format!(
                    "{} Run {}: {}",
                    CROSS,
                    style("FAILED").red().bold(),
                    reason.summary()
                ));
            }
        }
        self.print_separator();
        self.print_line("");
    }
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
