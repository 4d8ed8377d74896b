//! Unified configuration: reads from `.crucible/crucible.toml`.
//!
//! Layering is file → environment → CLI: the file supplies project
//! defaults, a couple of environment variables can override it, and
//! CLI flags (applied in the run command) win over both.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "my-pipeline"
//!
//! [defaults]
//! # quality_threshold = 85.0   # override every gate's threshold
//! # max_iterations = 3         # override every gate's budget
//! transient_retries = 2
//! step_timeout_secs = 300
//!
//! [executors.researcher]
//! command = "python3"
//! args = ["agents/research.py"]
//! version = "1.2.0"
//!
//! [executors.writer]
//! command = "./bin/writer"
//!
//! [scorers.prose]
//! command = "python3"
//! args = ["scorers/prose.py"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::executor::{CommandExecutor, ExecutorRegistry};
use crate::gate::{CommandScorer, ScorerRegistry};
use crate::orchestrator::RunOptions;

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Default run settings, overridable per run from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Replace every gate's threshold; absent means each phase keeps
    /// its own
    #[serde(default)]
    pub quality_threshold: Option<f64>,
    /// Replace every gate's iteration budget
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Extra attempts for retryable step failures
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,
    /// Per-step deadline in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_transient_retries() -> u32 {
    2
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            quality_threshold: None,
            max_iterations: None,
            transient_retries: default_transient_retries(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// How to launch an external executor or scorer command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, resolved against the project directory when
    /// relative
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Version string reported in execution metadata
    #[serde(default)]
    pub version: Option<String>,
}

/// The complete crucible.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrucibleToml {
    /// Project-level settings
    #[serde(default)]
    pub project: ProjectSection,
    /// Default run settings
    #[serde(default)]
    pub defaults: DefaultsSection,
    /// Named executor commands, `[executors.<name>]`
    #[serde(default)]
    pub executors: HashMap<String, CommandSpec>,
    /// Named scorer commands, `[scorers.<name>]`
    #[serde(default)]
    pub scorers: HashMap<String, CommandSpec>,
}

impl CrucibleToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crucible.toml")
    }

    /// Load configuration from the default location
    /// (`.crucible/crucible.toml`). Returns default configuration if
    /// the file doesn't exist.
    pub fn load_or_default(crucible_dir: &Path) -> Result<Self> {
        let config_path = crucible_dir.join("crucible.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize crucible.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Step timeout, with environment override.
    pub fn step_timeout_secs(&self) -> u64 {
        if let Ok(value) = std::env::var("CRUCIBLE_STEP_TIMEOUT")
            && let Ok(secs) = value.parse()
        {
            return secs;
        }
        self.defaults.step_timeout_secs
    }

    /// Transient retry count, with environment override.
    pub fn transient_retries(&self) -> u32 {
        if let Ok(value) = std::env::var("CRUCIBLE_TRANSIENT_RETRIES")
            && let Ok(count) = value.parse()
        {
            return count;
        }
        self.defaults.transient_retries
    }

    /// Run options seeded from the file and environment. CLI flags are
    /// applied on top by the caller.
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::default()
            .with_transient_retries(self.transient_retries());
        options.step_timeout_secs = self.step_timeout_secs();
        options.quality_threshold = self.defaults.quality_threshold;
        options.max_iterations = self.defaults.max_iterations;
        options
    }

    /// Build the executor registry from the `[executors.*]` tables.
    pub fn build_executors(&self, project_dir: &Path) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        for (name, spec) in &self.executors {
            let dir = resolve_dir(project_dir, spec.working_dir.as_deref());
            let mut executor =
                CommandExecutor::new(&spec.command, spec.args.clone()).with_working_dir(&dir);
            if let Some(ref version) = spec.version {
                executor = executor.with_version(version);
            }
            registry.register(name, std::sync::Arc::new(executor));
        }
        registry
    }

    /// Build the scorer registry from the `[scorers.*]` tables.
    pub fn build_scorers(&self, project_dir: &Path) -> ScorerRegistry {
        let mut registry = ScorerRegistry::new();
        for (name, spec) in &self.scorers {
            let dir = resolve_dir(project_dir, spec.working_dir.as_deref());
            let scorer =
                CommandScorer::new(&spec.command, spec.args.clone()).with_working_dir(&dir);
            registry.register(name, std::sync::Arc::new(scorer));
        }
        registry
    }
}

fn resolve_dir(project_dir: &Path, working_dir: Option<&Path>) -> PathBuf {
    match working_dir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => project_dir.join(dir),
        None => project_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// `std::env::set_var` is unsafe in multi-threaded contexts, so
    /// tests touching the environment serialize through this.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[project]
name = "article-pipeline"

[defaults]
quality_threshold = 85.0
max_iterations = 5
transient_retries = 1
step_timeout_secs = 120

[executors.researcher]
command = "python3"
args = ["agents/research.py"]
version = "1.2.0"

[executors.writer]
command = "./bin/writer"

[scorers.prose]
command = "python3"
args = ["scorers/prose.py"]
working_dir = "scoring"
"#;
        let config = CrucibleToml::parse(toml).unwrap();
        assert_eq!(config.project.name.as_deref(), Some("article-pipeline"));
        assert_eq!(config.defaults.quality_threshold, Some(85.0));
        assert_eq!(config.defaults.max_iterations, Some(5));
        assert_eq!(config.defaults.transient_retries, 1);
        assert_eq!(config.executors.len(), 2);
        assert_eq!(config.executors["researcher"].args, vec!["agents/research.py"]);
        assert_eq!(
            config.scorers["prose"].working_dir.as_deref(),
            Some(Path::new("scoring"))
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CrucibleToml::parse("").unwrap();
        assert!(config.project.name.is_none());
        assert!(config.defaults.quality_threshold.is_none());
        assert_eq!(config.defaults.transient_retries, 2);
        assert_eq!(config.defaults.step_timeout_secs, 300);
        assert!(config.executors.is_empty());
        assert!(config.scorers.is_empty());
    }

    #[test]
    fn test_missing_file_loads_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CrucibleToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.defaults.step_timeout_secs, 300);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("crucible.toml");

        let mut config = CrucibleToml::default();
        config.project.name = Some("demo".to_string());
        config.executors.insert(
            "writer".to_string(),
            CommandSpec {
                command: "writer".to_string(),
                args: vec!["--fast".to_string()],
                working_dir: None,
                version: None,
            },
        );
        config.save(&path).unwrap();

        let reloaded = CrucibleToml::load(&path).unwrap();
        assert_eq!(reloaded.project.name.as_deref(), Some("demo"));
        assert_eq!(reloaded.executors["writer"].args, vec!["--fast"]);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = CrucibleToml::parse("[defaults]\nstep_timeout_secs = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("crucible.toml"));
    }

    #[test]
    fn test_registries_built_from_tables() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let toml = r#"
[executors.writer]
command = "writer-bin"

[scorers.prose]
command = "prose-bin"
"#;
        let config = CrucibleToml::parse(toml).unwrap();
        let executors = config.build_executors(Path::new("/project"));
        let scorers = config.build_scorers(Path::new("/project"));
        assert!(executors.contains("writer"));
        assert_eq!(executors.len(), 1);
        assert!(scorers.contains("prose"));
    }

    #[test]
    fn test_env_overrides_file_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = CrucibleToml::parse("[defaults]\nstep_timeout_secs = 60").unwrap();
        assert_eq!(config.step_timeout_secs(), 60);

        unsafe { std::env::set_var("CRUCIBLE_STEP_TIMEOUT", "15") };
        assert_eq!(config.step_timeout_secs(), 15);
        assert_eq!(config.run_options().step_timeout_secs, 15);
        unsafe { std::env::remove_var("CRUCIBLE_STEP_TIMEOUT") };

        assert_eq!(config.run_options().step_timeout_secs, 60);
    }

    #[test]
    fn test_run_options_carry_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let toml = r#"
[defaults]
quality_threshold = 90.0
max_iterations = 4
transient_retries = 0
"#;
        let options = CrucibleToml::parse(toml).unwrap().run_options();
        assert_eq!(options.quality_threshold, Some(90.0));
        assert_eq!(options.max_iterations, Some(4));
        assert_eq!(options.transient_retries, 0);
        assert_eq!(options.step_timeout_secs, 300);
    }
}
