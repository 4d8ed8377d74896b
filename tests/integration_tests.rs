//! Integration tests for Crucible
//!
//! These drive the compiled binary against temporary projects whose
//! executors and scorers are small shell scripts speaking the JSON
//! wire contract over stdin/stdout.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a crucible Command
fn crucible() -> Command {
    cargo_bin_cmd!("crucible")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write a pipeline, a crucible.toml, the named shell scripts under
/// bin/, and a seed brief into a temp project.
fn write_project(dir: &TempDir, pipeline: &str, config: &str, scripts: &[(&str, &str)]) {
    let crucible_dir = dir.path().join(".crucible");
    fs::create_dir_all(&crucible_dir).unwrap();
    fs::write(crucible_dir.join("pipeline.yaml"), pipeline).unwrap();
    fs::write(crucible_dir.join("crucible.toml"), config).unwrap();

    let bin = dir.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    for (name, body) in scripts {
        fs::write(bin.join(name), body).unwrap();
    }

    fs::write(dir.path().join("brief.md"), "write about rust\n").unwrap();
}

/// The single recorded run id in a one-run project.
fn sole_run_id(dir: &TempDir) -> String {
    let runs = dir.path().join(".crucible").join("runs");
    let mut entries: Vec<String> = fs::read_dir(&runs)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one recorded run");
    entries.pop().unwrap()
}

fn journal_text(dir: &TempDir, run_id: &str) -> String {
    let path = dir
        .path()
        .join(".crucible")
        .join("runs")
        .join(run_id)
        .join("journal.jsonl");
    fs::read_to_string(path).unwrap()
}

fn count_events(journal: &str, event_type: &str) -> usize {
    let needle = format!("\"type\":\"{}\"", event_type);
    journal
        .lines()
        .filter(|line| line.contains(&needle))
        .count()
}

const SINGLE_PHASE_PIPELINE: &str = r#"
name: article
inputs:
  - brief
phases:
  - id: "01"
    name: Draft
    steps:
      - id: draft
        executor: writer
        inputs: [brief]
        outputs: [draft]
    gate:
      scorer: prose
      threshold: 80
      max_iterations: 3
"#;

const SINGLE_PHASE_CONFIG: &str = r#"
[executors.writer]
command = "sh"
args = ["bin/writer.sh"]

[scorers.prose]
command = "sh"
args = ["bin/prose.sh"]
"#;

const PASSING_WRITER: &str = r#"cat > /dev/null
echo '{"outputs":[{"kind":"draft","content":"the draft"}]}'
"#;

const PASSING_SCORER: &str = r#"cat > /dev/null
echo '{"aggregate_score": 92.0, "sub_scores": {"clarity": 92}}'
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_crucible_help() {
        crucible().arg("--help").assert().success();
    }

    #[test]
    fn test_crucible_version() {
        crucible().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized crucible project"));

        assert!(dir.path().join(".crucible").exists());
        assert!(dir.path().join(".crucible/pipeline.yaml").exists());
        assert!(dir.path().join(".crucible/crucible.toml").exists());
        assert!(dir.path().join(".crucible/runs").exists());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success();

        crucible()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_validate_sample_pipeline() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success();

        // The scaffolded sample wires every executor and scorer, so the
        // check passes without warnings.
        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid"))
            .stdout(predicate::str::contains("warning:").not());
    }

    #[test]
    fn test_list_no_runs() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No recorded runs"));
    }

    #[test]
    fn test_status_no_runs_fails() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No recorded runs"));
    }
}

// =============================================================================
// Pipeline Validation Tests
// =============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_validate_requires_pipeline_file() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No pipeline file found"));
    }

    #[test]
    fn test_validate_warns_on_unconfigured_names() {
        let dir = create_temp_project();
        // Config knows the scorer but not the executor.
        let config = r#"
[scorers.prose]
command = "sh"
args = ["bin/prose.sh"]
"#;
        write_project(&dir, SINGLE_PHASE_PIPELINE, config, &[]);

        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("warning:"))
            .stdout(predicate::str::contains("executor 'writer'"))
            .stdout(predicate::str::contains("is valid"));
    }

    #[test]
    fn test_validate_rejects_broken_dataflow() {
        let dir = create_temp_project();
        let pipeline = r#"
name: broken
inputs:
  - brief
phases:
  - id: "01"
    name: Draft
    steps:
      - id: draft
        executor: writer
        inputs: [never-produced]
        outputs: [draft]
    gate:
      scorer: prose
      threshold: 80
"#;
        write_project(&dir, pipeline, SINGLE_PHASE_CONFIG, &[]);

        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "requires artifact kind never-produced",
            ));
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids() {
        let dir = create_temp_project();
        let pipeline = r#"
name: duped
phases:
  - id: "01"
    name: Draft
    steps:
      - id: draft
        executor: writer
        outputs: [a]
      - id: draft
        executor: writer
        outputs: [b]
    gate:
      scorer: prose
      threshold: 80
"#;
        write_project(&dir, pipeline, SINGLE_PHASE_CONFIG, &[]);

        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Duplicate step id"));
    }

    #[test]
    fn test_explicit_pipeline_flag_overrides_discovery() {
        let dir = create_temp_project();
        write_project(&dir, SINGLE_PHASE_PIPELINE, SINGLE_PHASE_CONFIG, &[]);

        // A second definition outside the discovery locations.
        let other = dir.path().join("other.yaml");
        fs::write(
            &other,
            SINGLE_PHASE_PIPELINE.replace("name: article", "name: other-flow"),
        )
        .unwrap();

        crucible()
            .current_dir(dir.path())
            .arg("--pipeline")
            .arg(&other)
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("other-flow"));
    }

    #[test]
    fn test_project_level_pipeline_discovered() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("report.pipeline.yaml"),
            SINGLE_PHASE_PIPELINE,
        )
        .unwrap();

        crucible()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid"));
    }
}

// =============================================================================
// Workflow Run Tests
// =============================================================================

mod run_scenarios {
    use super::*;

    #[test]
    fn test_run_passes_first_try() {
        let dir = create_temp_project();
        write_project(
            &dir,
            SINGLE_PHASE_PIPELINE,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", PASSING_WRITER), ("prose.sh", PASSING_SCORER)],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .success()
            .stdout(predicate::str::contains("gate 01 iter 1: 92.0/80.0 pass"))
            .stdout(predicate::str::contains("Done: passed"));

        let run_id = sole_run_id(&dir);
        let journal = journal_text(&dir, &run_id);
        assert_eq!(count_events(&journal, "run_started"), 1);
        assert_eq!(count_events(&journal, "step_completed"), 1);
        assert_eq!(count_events(&journal, "gate_evaluated"), 1);
        assert_eq!(count_events(&journal, "feedback_issued"), 0);
        assert_eq!(count_events(&journal, "run_terminated"), 1);

        crucible()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Crucible Run Status"))
            .stdout(predicate::str::contains("article"))
            .stdout(predicate::str::contains("passed"))
            .stdout(predicate::str::contains("all phases passed"));
    }

    #[test]
    fn test_run_escalates_when_budget_exhausted() {
        let dir = create_temp_project();
        let pipeline = SINGLE_PHASE_PIPELINE.replace("threshold: 80", "threshold: 95");
        // Scores walk 80, 90, 93 across the three iterations; none
        // reaches the bar.
        let scorer = r#"cat > /dev/null
n=$(cat score_count 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > score_count
case "$n" in
  1) echo '{"aggregate_score": 80}' ;;
  2) echo '{"aggregate_score": 90}' ;;
  *) echo '{"aggregate_score": 93}' ;;
esac
"#;
        write_project(
            &dir,
            &pipeline,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", PASSING_WRITER), ("prose.sh", scorer)],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .failure()
            .stderr(predicate::str::contains(
                "escalated after 3 iterations (last score 93.0)",
            ))
            .stdout(predicate::str::contains("Resume with"));

        let run_id = sole_run_id(&dir);
        let journal = journal_text(&dir, &run_id);
        assert_eq!(count_events(&journal, "gate_evaluated"), 3);
        assert_eq!(count_events(&journal, "feedback_issued"), 2);
        assert_eq!(count_events(&journal, "step_completed"), 3);

        // Status shows the full score history for the phase.
        crucible()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("80.0 → 90.0 → 93.0"));
    }

    #[test]
    fn test_missing_seed_fails_before_any_step() {
        let dir = create_temp_project();
        let writer = r#"cat > /dev/null
echo invoked >> invocations.log
echo '{"outputs":[{"kind":"draft","content":"x"}]}'
"#;
        write_project(
            &dir,
            SINGLE_PHASE_PIPELINE,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", writer), ("prose.sh", PASSING_SCORER)],
        );

        // No --input: the pipeline's "brief" kind is never seeded.
        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .failure()
            .stderr(predicate::str::contains("missing input kind brief"));

        // The failure happened in pre-flight: no executor ever ran.
        assert!(!dir.path().join("invocations.log").exists());

        let run_id = sole_run_id(&dir);
        let journal = journal_text(&dir, &run_id);
        assert_eq!(count_events(&journal, "step_started"), 0);
        assert_eq!(count_events(&journal, "run_terminated"), 1);
    }

    #[test]
    fn test_feedback_retry_targets_mapped_step() {
        let dir = create_temp_project();
        let pipeline = r#"
name: essay
inputs:
  - brief
phases:
  - id: "01"
    name: Compose
    steps:
      - id: outline
        executor: planner
        inputs: [brief]
        outputs: [outline]
      - id: write
        executor: author
        inputs: [outline]
        outputs: [draft]
    gate:
      scorer: review
      threshold: 95
      max_iterations: 3
      criteria:
        - name: structure
          step: outline
        - name: clarity
          step: write
"#;
        let config = r#"
[executors.planner]
command = "sh"
args = ["bin/planner.sh"]

[executors.author]
command = "sh"
args = ["bin/author.sh"]

[scorers.review]
command = "sh"
args = ["bin/review.sh"]
"#;
        let planner = r#"cat > /dev/null
echo outline >> invocations.log
echo '{"outputs":[{"kind":"outline","content":"I. intro"}]}'
"#;
        let author = r#"cat > /dev/null
echo write >> invocations.log
echo '{"outputs":[{"kind":"draft","content":"prose"}]}'
"#;
        // First evaluation fails with clarity as the worst criterion;
        // the second passes.
        let review = r#"cat > /dev/null
if [ -f scored_once ]; then
  echo '{"aggregate_score": 96, "sub_scores": {"structure": 92, "clarity": 97}}'
else
  : > scored_once
  echo '{"aggregate_score": 70, "sub_scores": {"structure": 90, "clarity": 55}}'
fi
"#;
        write_project(
            &dir,
            pipeline,
            config,
            &[
                ("planner.sh", planner),
                ("author.sh", author),
                ("review.sh", review),
            ],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .success()
            .stdout(predicate::str::contains("retrying from write"));

        // Iteration 1 runs both steps; the retry re-executes only the
        // step mapped from the lowest sub-score and everything after it.
        let log = fs::read_to_string(dir.path().join("invocations.log")).unwrap();
        let invoked: Vec<&str> = log.lines().collect();
        assert_eq!(invoked, ["outline", "write", "write"]);

        let run_id = sole_run_id(&dir);
        let journal = journal_text(&dir, &run_id);
        assert_eq!(count_events(&journal, "feedback_issued"), 1);
        assert!(journal.contains("\"retry_step\":\"write\""));
    }

    #[test]
    fn test_cancel_marker_stops_run_and_resume_completes() {
        let dir = create_temp_project();
        let pipeline = r#"
name: stoppable
inputs:
  - brief
phases:
  - id: "01"
    name: Two
    steps:
      - id: halt
        executor: stopper
        inputs: [brief]
        outputs: [partial]
      - id: after
        executor: finisher
        inputs: [partial]
        outputs: [final]
    gate:
      scorer: prose
      threshold: 50
"#;
        let config = r#"
[executors.stopper]
command = "sh"
args = ["bin/stopper.sh"]

[executors.finisher]
command = "sh"
args = ["bin/finisher.sh"]

[scorers.prose]
command = "sh"
args = ["bin/prose.sh"]
"#;
        // The first invocation drops the cancel marker into the run
        // directory, as `crucible cancel` would from another process.
        let stopper = r#"cat > /dev/null
if [ ! -f cancel_dropped ]; then
  : > cancel_dropped
  for d in .crucible/runs/*/; do
    [ -d "$d" ] && : > "${d}cancel"
  done
fi
echo '{"outputs":[{"kind":"partial","content":"half done"}]}'
"#;
        let finisher = r#"cat > /dev/null
echo finisher >> invocations.log
echo '{"outputs":[{"kind":"final","content":"done"}]}'
"#;
        write_project(
            &dir,
            pipeline,
            config,
            &[
                ("stopper.sh", stopper),
                ("finisher.sh", finisher),
                ("prose.sh", PASSING_SCORER),
            ],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .failure()
            .stderr(predicate::str::contains("cancelled"))
            .stdout(predicate::str::contains("Resume with"));

        // The run stopped at the step boundary: the second step never ran.
        assert!(!dir.path().join("invocations.log").exists());

        let run_id = sole_run_id(&dir);
        crucible()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("cancelled"));

        // Resume clears the stale marker and finishes the run.
        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--resume")
            .arg(&run_id)
            .arg("--ui")
            .arg("minimal")
            .assert()
            .success()
            .stdout(predicate::str::contains("Resuming run"))
            .stdout(predicate::str::contains("Done: passed"));

        let log = fs::read_to_string(dir.path().join("invocations.log")).unwrap();
        assert_eq!(log.lines().collect::<Vec<_>>(), ["finisher"]);
    }

    #[test]
    fn test_run_requires_configured_executor() {
        let dir = create_temp_project();
        // Pipeline references an executor crucible.toml never defines.
        write_project(
            &dir,
            SINGLE_PHASE_PIPELINE,
            "[scorers.prose]\ncommand = \"sh\"\nargs = [\"bin/prose.sh\"]\n",
            &[("prose.sh", PASSING_SCORER)],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown executor writer"));
    }
}

// =============================================================================
// Run State Command Tests
// =============================================================================

mod run_state {
    use super::*;

    fn run_passing_project(dir: &TempDir) {
        write_project(
            dir,
            SINGLE_PHASE_PIPELINE,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", PASSING_WRITER), ("prose.sh", PASSING_SCORER)],
        );
        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .success();
    }

    #[test]
    fn test_list_shows_recorded_run() {
        let dir = create_temp_project();
        run_passing_project(&dir);

        crucible()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("article"))
            .stdout(predicate::str::contains("passed"))
            .stdout(predicate::str::contains("1 run(s)"));
    }

    #[test]
    fn test_status_accepts_run_id_prefix() {
        let dir = create_temp_project();
        run_passing_project(&dir);

        let run_id = sole_run_id(&dir);
        crucible()
            .current_dir(dir.path())
            .arg("status")
            .arg(&run_id[..8])
            .assert()
            .success()
            .stdout(predicate::str::contains(&run_id));
    }

    #[test]
    fn test_status_unknown_run_fails() {
        let dir = create_temp_project();
        run_passing_project(&dir);

        crucible()
            .current_dir(dir.path())
            .arg("status")
            .arg("ffffffff")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No recorded run matches"));
    }

    #[test]
    fn test_cancel_finished_run_reports_state() {
        let dir = create_temp_project();
        run_passing_project(&dir);

        let run_id = sole_run_id(&dir);
        crucible()
            .current_dir(dir.path())
            .arg("cancel")
            .arg(&run_id)
            .assert()
            .success()
            .stdout(predicate::str::contains("already finished"));

        // No marker was written for a finished run.
        assert!(
            !dir.path()
                .join(".crucible/runs")
                .join(&run_id)
                .join("cancel")
                .exists()
        );
    }

    #[test]
    fn test_cancel_unknown_run_fails() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("cancel")
            .arg("deadbeef")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No recorded run"));
    }

    #[test]
    fn test_reset_force_removes_runs() {
        let dir = create_temp_project();
        run_passing_project(&dir);

        crucible()
            .current_dir(dir.path())
            .arg("reset")
            .arg("--force")
            .assert()
            .success()
            .stdout(predicate::str::contains("Reset complete"));

        crucible()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No recorded runs"));
    }

    #[test]
    fn test_reset_nothing_recorded() {
        let dir = create_temp_project();

        crucible()
            .current_dir(dir.path())
            .arg("reset")
            .arg("--force")
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to reset"));
    }
}

// =============================================================================
// Global CLI Flag Tests
// =============================================================================

mod global_flags {
    use super::*;

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();
        let other_dir = create_temp_project();

        crucible()
            .current_dir(other_dir.path())
            .arg("--project-dir")
            .arg(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No recorded runs"));
    }

    #[test]
    fn test_run_option_overrides_change_gate() {
        let dir = create_temp_project();
        // Pipeline wants 95; the scorer lands 92; the flag lowers the bar.
        let pipeline = SINGLE_PHASE_PIPELINE.replace("threshold: 80", "threshold: 95");
        write_project(
            &dir,
            &pipeline,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", PASSING_WRITER), ("prose.sh", PASSING_SCORER)],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("brief=brief.md")
            .arg("--quality-threshold")
            .arg("90")
            .arg("--ui")
            .arg("minimal")
            .assert()
            .success()
            .stdout(predicate::str::contains("gate 01 iter 1: 92.0/90.0 pass"));
    }

    #[test]
    fn test_invalid_input_argument_fails_fast() {
        let dir = create_temp_project();
        write_project(
            &dir,
            SINGLE_PHASE_PIPELINE,
            SINGLE_PHASE_CONFIG,
            &[("writer.sh", PASSING_WRITER), ("prose.sh", PASSING_SCORER)],
        );

        crucible()
            .current_dir(dir.path())
            .arg("run")
            .arg("--input")
            .arg("no-separator")
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected kind=path"));
    }
}
