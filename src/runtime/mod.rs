//! Executor collaborators: command execution, containers, tools and publishing

pub mod container;
pub mod publish;
pub mod shell;
pub mod tool;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use container::DockerCli;
pub use publish::{ArtifactPublisher, CoverageReporter, DirectoryPublisher};
pub use shell::ShellRunner;

/// Error types for collaborator operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container error: {0}")]
    Container(String),

    #[error("tool '{0}' not found on PATH")]
    ToolNotFound(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

impl RunnerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::Timeout(_))
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one shell command in a working directory
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// On timeout or when `cancel` fires, every process the command
    /// started is terminated and reaped before `Timeout` or `Cancelled`
    /// is returned.
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Build specification (Dockerfile) path
    pub file: PathBuf,
    pub context: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
}

/// Result of an image build; a failed build has a non-zero exit code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub image: String,
    pub output: CommandOutput,
}

/// Container run request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,

    /// Unique container name, used for forced removal
    pub name: String,

    /// Arguments after the image (command override)
    pub args: Vec<String>,

    pub env: HashMap<String, String>,

    /// Host directory mounted as the container working directory
    pub workspace: Option<PathBuf>,
}

/// Directory the instance workspace is mounted at inside containers
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Container runtime interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build(
        &self,
        spec: &BuildSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<BuiltImage, RunnerError>;

    /// Run a container to completion; its exit status is the outcome.
    ///
    /// On timeout or when `cancel` fires the container is removed before
    /// `Timeout` or `Cancelled` is returned.
    async fn run(
        &self,
        spec: &RunSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError>;
}
