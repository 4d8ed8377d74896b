//! Workflow execution: `crucible run`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;

/// Parse `--input kind=path` seed arguments, reading each file's
/// content as the seed artifact body.
fn parse_inputs(inputs: &[String]) -> Result<Vec<(String, String)>> {
    let mut seeds = Vec::new();
    for raw in inputs {
        let Some((kind, path)) = raw.split_once('=') else {
            anyhow::bail!("Invalid --input '{}': expected kind=path", raw);
        };
        if kind.trim().is_empty() {
            anyhow::bail!("Invalid --input '{}': empty artifact kind", raw);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file for '{}': {}", kind, path))?;
        seeds.push((kind.trim().to_string(), content));
    }
    Ok(seeds)
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    inputs: &[String],
    quality_threshold: Option<f64>,
    max_iterations: Option<u32>,
    skip_steps: &[String],
    resume: Option<&str>,
    ui_mode: &str,
) -> Result<()> {
    use crucible::config::Config;
    use crucible::crucible_config::CrucibleToml;
    use crucible::journal::{EventJournal, RunEvent};
    use crucible::orchestrator::{RunId, RunState, WorkflowRunner};
    use crucible::pipeline::PipelineDefinition;
    use crucible::ui::{RunUi, UiMode};

    let config = Config::new(project_dir, cli.verbose, cli.pipeline.clone())?;
    config.ensure_directories()?;

    let toml = CrucibleToml::load_or_default(&config.crucible_dir)?;
    let pipeline = PipelineDefinition::load(config.pipeline_file()?)?;

    let executors = Arc::new(toml.build_executors(&config.project_dir));
    let scorers = Arc::new(toml.build_scorers(&config.project_dir));

    // File and environment defaults, then CLI flags on top.
    let mut options = toml.run_options();
    if let Some(threshold) = quality_threshold {
        options.quality_threshold = Some(threshold);
    }
    if let Some(max) = max_iterations {
        options.max_iterations = Some(max);
    }
    if !skip_steps.is_empty() {
        options.skip_steps = skip_steps.to_vec();
    }

    let runner = match resume {
        Some(text) => {
            if quality_threshold.is_some() || max_iterations.is_some() || !skip_steps.is_empty() {
                println!(
                    "note: option overrides are ignored when resuming; the recorded options apply"
                );
            }
            let run_id: RunId = text.parse().context("Invalid run id")?;
            let marker = config.cancel_marker_path(run_id);
            if marker.exists() {
                std::fs::remove_file(&marker).context("Failed to clear stale cancel marker")?;
            }
            println!("Resuming run {}", run_id.short());
            WorkflowRunner::resume(
                pipeline.clone(),
                executors,
                scorers,
                EventJournal::new(config.journal_path(run_id)),
            )?
        }
        None => {
            let run_id = RunId::new();
            WorkflowRunner::new(
                pipeline.clone(),
                executors,
                scorers,
                EventJournal::new(config.journal_path(run_id)),
                options,
            )
            .with_run_id(run_id)
            .with_seeds(parse_inputs(inputs)?)
        }
    };

    let run_id = runner.run_id();

    // Progress display task, fed by the runner's event channel.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<RunEvent>(100);
    let ui = RunUi::new(&pipeline, UiMode::parse(ui_mode), cli.verbose);
    let display = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            ui.handle_event(&event);
        }
    });

    let runner = runner
        .with_cancel_marker(config.cancel_marker_path(run_id))
        .with_event_channel(event_tx);

    let outcome = runner.run().await;
    // The runner held the only sender; the display task drains the
    // remaining events and exits before any outcome line prints.
    let _ = display.await;
    let snapshot = outcome?;

    match snapshot.state {
        RunState::Passed => Ok(()),
        RunState::Cancelled => {
            println!("Resume with: crucible run --resume {}", run_id);
            anyhow::bail!("Run {} cancelled", run_id.short())
        }
        _ => {
            let reason = snapshot
                .terminal_reason
                .as_ref()
                .map(|r| r.summary())
                .unwrap_or_else(|| "unknown".to_string());
            println!("Resume with: crucible run --resume {}", run_id);
            anyhow::bail!("Run {} failed: {}", run_id.short(), reason)
        }
    }
}
