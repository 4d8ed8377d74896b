//! Task executor contract and registry.
//!
//! Executors are opaque capabilities the sequencer drives: they receive
//! input artifacts (plus feedback on a retry) and return artifact
//! drafts. All retry policy, scoring and sequencing lives outside them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod command;

pub use command::CommandExecutor;

use crate::artifact::{Artifact, ArtifactDraft};
use crate::errors::ExecutorError;
use crate::feedback::FeedbackRecord;

/// One executor invocation: a task name, resolved input artifacts, and
/// on quality retries the feedback record from the failed gate.
#[derive(Debug)]
pub struct InvocationRequest<'a> {
    /// Task name, as declared by the step
    pub task: &'a str,
    /// Input artifacts in resolution order
    pub inputs: &'a [Artifact],
    /// Present only when re-executing after a failed gate
    pub feedback: Option<&'a FeedbackRecord>,
    /// Hard deadline for the invocation
    pub deadline: Duration,
}

/// Execution details reported alongside the produced drafts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    /// Wall-clock duration of the invocation in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    /// Executor-reported version string, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_version: Option<String>,
}

/// What a successful invocation returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationOutput {
    /// Artifact drafts, completed and stored by the runner
    pub artifacts: Vec<ArtifactDraft>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

/// Abstraction over task execution.
/// Real implementation: `CommandExecutor`. Tests use closures via
/// `FnExecutor`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<InvocationOutput, ExecutorError>;
}

/// Named executor capabilities, supplied once at startup. Steps select
/// executors by name; nothing is looked up from global state.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under a name. Re-registering a name
    /// replaces the previous executor.
    pub fn register(&mut self, name: &str, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(name.to_string(), executor);
    }

    /// Resolve a capability by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered capability names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Closure-backed executor for tests and embedding.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(InvocationRequest<'_>) -> Result<InvocationOutput, ExecutorError> + Send + Sync,
{
    async fn invoke(&self, request: InvocationRequest<'_>) -> Result<InvocationOutput, ExecutorError> {
        (self.0)(request)
    }
}
