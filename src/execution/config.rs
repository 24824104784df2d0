//! Engine configuration

use crate::core::PipelineDefinition;
use std::path::PathBuf;
use std::time::Duration;

/// Worker pool size when neither the caller nor the document sets one
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Step timeout when neither the caller nor the document sets one
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Configuration for the execution engine.
///
/// Explicit values here win over the pipeline document, which wins over
/// the built-in defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of job instances running at once
    pub concurrency: Option<usize>,

    /// Timeout for steps that do not declare one
    pub default_timeout: Option<Duration>,

    /// Checkout the pipeline runs against; build specs resolve relative to it
    pub source_dir: PathBuf,

    /// Parent of the per-instance workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,

    /// Where the bundled publisher stores artifacts and coverage reports
    pub artifact_dir: PathBuf,

    /// Shell used for run-command steps, as program plus leading arguments
    pub shell: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            default_timeout: None,
            source_dir: PathBuf::from("."),
            workspace_root: None,
            artifact_dir: PathBuf::from("./ci-artifacts"),
            shell: vec!["sh".to_string(), "-c".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(dir.into());
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }

    /// Parse a shell line such as `bash -eo pipefail -c`
    pub fn with_shell(mut self, shell: &str) -> Self {
        let words: Vec<String> = shell.split_whitespace().map(str::to_string).collect();
        if !words.is_empty() {
            self.shell = words;
        }
        self
    }

    pub fn effective_concurrency(&self, definition: &PipelineDefinition) -> usize {
        self.concurrency
            .or(definition.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY)
            .max(1)
    }

    pub fn effective_timeout(&self, definition: &PipelineDefinition) -> Duration {
        self.default_timeout
            .or(definition.default_timeout)
            .unwrap_or(DEFAULT_STEP_TIMEOUT)
    }
}
