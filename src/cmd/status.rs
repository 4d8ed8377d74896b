//! Run inspection commands: status, list, cancel, reset.

use anyhow::{Context, Result, anyhow};
use std::path::Path;

use super::super::Cli;
use crucible::config::Config;
use crucible::journal::EventJournal;
use crucible::orchestrator::{PhaseState, RunId};
use crucible::tracker::{ProgressTracker, RunSnapshot};

/// Resolve a run id argument. Accepts a full id, a unique prefix, or
/// nothing (most recent run).
fn resolve_run_id(config: &Config, arg: Option<&str>) -> Result<RunId> {
    let Some(text) = arg else {
        return config
            .latest_run()?
            .ok_or_else(|| anyhow!("No recorded runs. Run 'crucible run' to start one."));
    };

    if let Ok(run_id) = text.parse::<RunId>() {
        return Ok(run_id);
    }

    let matches: Vec<RunId> = config
        .list_runs()?
        .into_iter()
        .filter(|run_id| run_id.to_string().starts_with(text))
        .collect();
    match matches.len() {
        0 => Err(anyhow!("No recorded run matches '{}'", text)),
        1 => Ok(matches[0]),
        n => Err(anyhow!("'{}' is ambiguous: {} runs match", text, n)),
    }
}

fn load_snapshot(config: &Config, run_id: RunId) -> Result<RunSnapshot> {
    let journal = EventJournal::new(config.journal_path(run_id));
    if !journal.exists() {
        anyhow::bail!("No journal recorded for run {}", run_id);
    }
    let events = journal.read_all()?;
    Ok(ProgressTracker::replay(&events))
}

fn phase_icon(state: PhaseState) -> console::StyledObject<&'static str> {
    use console::style;
    match state {
        PhaseState::GatePassed => style("✓").green(),
        PhaseState::Failed | PhaseState::Escalated => style("✗").red(),
        PhaseState::Cancelled => style("-").yellow(),
        PhaseState::Pending => style("·").dim(),
        _ => style("▶").cyan(),
    }
}

pub fn cmd_status(project_dir: &Path, run_id: Option<&str>) -> Result<()> {
    use crucible::ui::progress::format_duration;

    let config = Config::without_pipeline(project_dir.to_path_buf(), false)?;
    let run_id = resolve_run_id(&config, run_id)?;
    let snapshot = load_snapshot(&config, run_id)?;

    println!();
    println!("Crucible Run Status");
    println!("===================");
    println!();
    println!("Run:      {}", run_id);
    println!(
        "Pipeline: {} (digest {})",
        snapshot.pipeline,
        snapshot.digest.get(..12).unwrap_or(&snapshot.digest)
    );
    println!("State:    {}", snapshot.state);
    if let Some(started) = snapshot.started_at {
        println!("Started:  {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(elapsed) = snapshot.elapsed().and_then(|d| d.to_std().ok()) {
        println!("Elapsed:  {}", format_duration(elapsed));
    }
    if let Some(ref reason) = snapshot.terminal_reason {
        println!("Outcome:  {}", reason.summary());
    }

    println!();
    println!("Phases:");
    for phase in &snapshot.phases {
        let mut line = format!(
            "  {} {:<12} {:<16}",
            phase_icon(phase.state),
            phase.id,
            phase.state.to_string()
        );
        if let Some(last) = phase.last_gate() {
            line.push_str(&format!(
                " {:.1}/{:.1} ({} iteration{})",
                last.score,
                last.threshold,
                phase.iterations_used,
                if phase.iterations_used == 1 { "" } else { "s" }
            ));
        } else if let Some(ref step) = phase.current_step {
            line.push_str(&format!(" step {}", step));
        }
        println!("{}", line);

        // The full gate history shows how scores moved across the
        // feedback loop.
        if phase.gate_history.len() > 1 {
            let scores: Vec<String> = phase
                .gate_history
                .iter()
                .map(|gate| format!("{:.1}", gate.score))
                .collect();
            println!("      scores: {}", scores.join(" → "));
        }
    }

    println!();
    println!(
        "Artifacts: {}   Steps completed: {}",
        snapshot.artifact_count, snapshot.steps_completed
    );
    println!();
    Ok(())
}

pub fn cmd_list(project_dir: &Path) -> Result<()> {
    let config = Config::without_pipeline(project_dir.to_path_buf(), false)?;
    let runs = config.list_runs()?;

    if runs.is_empty() {
        println!();
        println!("No recorded runs. Run 'crucible run' to start one.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<36} {:<20} {:<10} {}",
        "RUN ID", "PIPELINE", "STATE", "STARTED"
    );
    for run_id in &runs {
        match load_snapshot(&config, *run_id) {
            Ok(snapshot) => {
                let started = snapshot
                    .started_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36} {:<20} {:<10} {}",
                    run_id,
                    snapshot.pipeline,
                    snapshot.state.to_string(),
                    started
                );
            }
            Err(_) => {
                println!("{:<36} {:<20} {:<10} -", run_id, "(unreadable)", "-");
            }
        }
    }
    println!();
    println!("{} run(s)", runs.len());
    println!();
    Ok(())
}

pub fn cmd_cancel(project_dir: &Path, run_id: &str) -> Result<()> {
    let config = Config::without_pipeline(project_dir.to_path_buf(), false)?;
    let run_id = resolve_run_id(&config, Some(run_id))?;

    let snapshot = load_snapshot(&config, run_id)?;
    if snapshot.state.is_terminal() {
        println!("Run {} already finished ({})", run_id.short(), snapshot.state);
        return Ok(());
    }

    let marker = config.cancel_marker_path(run_id);
    std::fs::write(&marker, "cancel requested\n")
        .with_context(|| format!("Failed to write cancel marker: {}", marker.display()))?;

    println!("Cancellation requested for run {}", run_id.short());
    println!("The run stops at the next step boundary.");
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, cli: &Cli, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = Config::without_pipeline(project_dir.to_path_buf(), cli.verbose)?;
    let runs = config.list_runs()?;

    if runs.is_empty() {
        println!("Nothing to reset");
        return Ok(());
    }

    if !force && !cli.yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "This will delete {} recorded run(s). Are you sure?",
                runs.len()
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    std::fs::remove_dir_all(&config.runs_dir).context("Failed to remove runs directory")?;
    config.ensure_directories()?;

    println!("Reset complete ({} run(s) removed)", runs.len());
    Ok(())
}
