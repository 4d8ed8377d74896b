//! Project initialization and pipeline validation commands.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::super::Cli;

/// The name of the crucible configuration directory.
const CRUCIBLE_DIR: &str = ".crucible";

const SAMPLE_PIPELINE: &str = r#"# Crucible pipeline definition.
#
# Each phase runs its steps in order, then scores the declared outputs
# against the quality gate. A failing gate retries from the step mapped
# to the weakest criterion, up to max_iterations attempts per phase.

name: article
inputs:
  - brief

phases:
  - id: "01"
    name: Research
    steps:
      - id: gather
        executor: researcher
        inputs: [brief]
        outputs: [notes]
    gate:
      scorer: coverage
      threshold: 80
      max_iterations: 3
      criteria:
        - name: completeness
          step: gather

  - id: "02"
    name: Draft
    steps:
      - id: compose
        executor: writer
        inputs: [brief, notes]
        outputs: [draft]
      - id: polish
        executor: writer
        inputs: [draft]
        outputs: [article]
    gate:
      scorer: prose
      threshold: 85
      max_iterations: 3
      criteria:
        - name: structure
          step: compose
        - name: clarity
          step: polish
"#;

const SAMPLE_CONFIG: &str = r#"# Crucible configuration.
#
# Executors and scorers are external commands speaking JSON on
# stdin/stdout. Relative working_dir paths resolve against the
# project directory.

[project]
name = "article"

[defaults]
# quality_threshold = 85.0   # override every gate's threshold
# max_iterations = 3         # override every gate's budget
transient_retries = 2
step_timeout_secs = 300

[executors.researcher]
command = "./bin/researcher"

[executors.writer]
command = "./bin/writer"

[scorers.coverage]
command = "./bin/score-coverage"

[scorers.prose]
command = "./bin/score-prose"
"#;

/// Result of scaffolding a crucible project.
#[derive(Debug)]
struct InitOutcome {
    crucible_dir: PathBuf,
    created: bool,
}

/// Create the `.crucible/` structure with a sample pipeline and config.
/// Existing files are never overwritten.
fn scaffold_project(project_dir: &Path) -> Result<InitOutcome> {
    let crucible_dir = project_dir.join(CRUCIBLE_DIR);
    let created = !crucible_dir.exists();

    let runs_dir = crucible_dir.join("runs");
    std::fs::create_dir_all(&runs_dir)
        .with_context(|| format!("Failed to create runs directory: {}", runs_dir.display()))?;

    let pipeline_file = crucible_dir.join("pipeline.yaml");
    if !pipeline_file.exists() {
        std::fs::write(&pipeline_file, SAMPLE_PIPELINE).with_context(|| {
            format!("Failed to create pipeline.yaml: {}", pipeline_file.display())
        })?;
    }

    let config_file = crucible_dir.join("crucible.toml");
    if !config_file.exists() {
        std::fs::write(&config_file, SAMPLE_CONFIG).with_context(|| {
            format!("Failed to create crucible.toml: {}", config_file.display())
        })?;
    }

    Ok(InitOutcome {
        crucible_dir,
        created,
    })
}

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let result = scaffold_project(project_dir)?;

    if result.created {
        println!(
            "Initialized crucible project at {}",
            result.crucible_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .crucible/");
        println!("  ├── pipeline.yaml   # Sample pipeline definition");
        println!("  ├── crucible.toml   # Executors, scorers, run defaults");
        println!("  └── runs/           # Per-run journals");
        println!();
        println!("Next steps:");
        println!("  1. Edit .crucible/pipeline.yaml to describe your phases");
        println!("  2. Point crucible.toml at your executor and scorer commands");
        println!("  3. Run `crucible run --input brief=path/to/brief.md`");
    } else {
        println!(
            "Crucible project already initialized at {}",
            result.crucible_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}

pub fn cmd_validate(cli: &Cli, project_dir: &Path) -> Result<()> {
    use crucible::config::Config;
    use crucible::crucible_config::CrucibleToml;
    use crucible::pipeline::PipelineDefinition;
    use std::collections::HashSet;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose, cli.pipeline.clone())?;
    let path = config.pipeline_file()?;
    let pipeline = PipelineDefinition::load(path)?;

    // Structure is sound; now check the dataflow assuming the declared
    // workflow inputs get seeded at run time.
    pipeline.validate_dataflow(&pipeline.inputs, &HashSet::new())?;

    println!();
    println!("Pipeline: {} ({})", pipeline.name, path.display());
    println!("Digest:   {}", &pipeline.digest[..12]);
    println!();

    let mut step_count = 0;
    for phase in &pipeline.phases {
        println!("  Phase {}: {}", phase.id, phase.name);
        for step in &phase.steps {
            step_count += 1;
            println!(
                "    {}: {}  [{}] -> [{}]",
                step.id,
                step.executor,
                step.inputs.join(", "),
                step.outputs.join(", ")
            );
        }
        println!(
            "    gate: {}, threshold {:.1}, budget {}, {} criteri{}",
            phase.gate.scorer,
            phase.gate.threshold,
            phase.gate.max_iterations,
            phase.gate.criteria.len(),
            if phase.gate.criteria.len() == 1 { "on" } else { "a" }
        );
        println!();
    }

    // Point out names the unified config cannot resolve yet.
    let toml = CrucibleToml::load_or_default(&config.crucible_dir)?;
    let mut warned = false;
    for phase in &pipeline.phases {
        for step in &phase.steps {
            if !toml.executors.contains_key(&step.executor) {
                println!(
                    "{} executor '{}' (step {}) is not configured in crucible.toml",
                    console::style("warning:").yellow().bold(),
                    step.executor,
                    step.id
                );
                warned = true;
            }
        }
        if !toml.scorers.contains_key(&phase.gate.scorer) {
            println!(
                "{} scorer '{}' (phase {}) is not configured in crucible.toml",
                console::style("warning:").yellow().bold(),
                phase.gate.scorer,
                phase.id
            );
            warned = true;
        }
    }
    if warned {
        println!();
    }

    println!(
        "Pipeline {} is valid ({} phases, {} steps)",
        pipeline.name,
        pipeline.phases.len(),
        step_count
    );
    Ok(())
}
