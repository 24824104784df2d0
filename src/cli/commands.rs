//! CLI command definitions

use crate::core::TriggerEvent;
use crate::execution::EngineConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Trigger event kind
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Trigger event metadata (key=value), e.g. branch=master
    #[arg(long, value_parser = parse_key_value)]
    pub meta: Vec<(String, String)>,

    /// Maximum number of job instances running at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Default step timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory the pipeline runs against
    #[arg(long, default_value = ".")]
    pub source_dir: PathBuf,

    /// Where artifacts and coverage reports are published
    #[arg(long, default_value = "./ci-artifacts")]
    pub artifact_dir: PathBuf,

    /// Parent directory of the per-instance workspaces
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Shell used for run-command steps
    #[arg(long, default_value = "sh -c")]
    pub shell: String,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunCommand {
    /// Trigger event described by `--event` and `--meta`
    pub fn trigger_event(&self) -> TriggerEvent {
        self.meta
            .iter()
            .fold(TriggerEvent::new(&self.event), |event, (key, value)| {
                event.with_metadata(key, value)
            })
    }

    /// Engine settings; flags left unset defer to the pipeline document
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new()
            .with_source_dir(&self.source_dir)
            .with_artifact_dir(&self.artifact_dir)
            .with_shell(&self.shell);
        if let Some(concurrency) = self.concurrency {
            config = config.with_concurrency(concurrency);
        }
        if let Some(secs) = self.timeout {
            config = config.with_default_timeout(Duration::from_secs(secs));
        }
        if let Some(root) = &self.workspace_root {
            config = config.with_workspace_root(root);
        }
        config
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines found in history
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific run
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Delete the run given by --execution-id
    #[arg(long, requires = "execution_id")]
    pub delete: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
