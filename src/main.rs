use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Quality-gated workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to the pipeline file. If not provided, searches .crucible/
    /// and then *.pipeline.{yaml,yml,json} in the project directory
    #[arg(long, global = true)]
    pub pipeline: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a crucible project with a sample pipeline
    Init,
    /// Check the pipeline definition without running it
    Validate,
    Run {
        /// Seed artifact as KIND=PATH (repeatable)
        #[arg(short, long = "input", value_name = "KIND=PATH")]
        input: Vec<String>,

        /// Override the gate pass threshold for every phase
        #[arg(long)]
        quality_threshold: Option<f64>,

        /// Override the feedback iteration budget for every phase
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Skip a step by id (repeatable)
        #[arg(long = "skip-step", value_name = "STEP_ID")]
        skip_step: Vec<String>,

        /// Resume an interrupted run from its journal
        #[arg(long, value_name = "RUN_ID")]
        resume: Option<String>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    Status {
        /// Run id or unique prefix (defaults to the most recent run)
        run_id: Option<String>,
    },
    List,
    Cancel {
        /// Run id or unique prefix
        run_id: String,
    },
    Reset {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("CRUCIBLE_LOG")
                .unwrap_or_else(|_| format!("crucible={}", log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => {
            cmd::cmd_init(&project_dir)?;
        }
        Commands::Validate => {
            cmd::cmd_validate(&cli, &project_dir)?;
        }
        Commands::Run {
            input,
            quality_threshold,
            max_iterations,
            skip_step,
            resume,
            ui,
        } => {
            cmd::cmd_run(
                &cli,
                project_dir,
                input,
                *quality_threshold,
                *max_iterations,
                skip_step,
                resume.as_deref(),
                ui,
            )
            .await?;
        }
        Commands::Status { run_id } => cmd::cmd_status(&project_dir, run_id.as_deref())?,
        Commands::List => cmd::cmd_list(&project_dir)?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&project_dir, run_id)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, &cli, *force)?,
    }

    Ok(())
}
