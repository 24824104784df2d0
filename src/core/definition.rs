//! In-memory pipeline definition model
//!
//! Built once by [`crate::core::load`] and read-only afterwards. Job templates
//! are shared with their expanded instances through `Arc`.

use crate::core::{condition::Condition, context, trigger::Triggers};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A fully validated pipeline
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,

    /// Which events start a run
    pub triggers: Triggers,

    /// Pipeline-wide environment
    pub env: HashMap<String, String>,

    /// Default worker pool size declared by the document
    pub concurrency: Option<usize>,

    /// Default step timeout declared by the document
    pub default_timeout: Option<Duration>,

    /// Job templates in declaration order
    pub jobs: Vec<Arc<JobTemplate>>,
}

impl PipelineDefinition {
    pub fn job(&self, name: &str) -> Option<&JobTemplate> {
        self.jobs.iter().find(|j| j.name == name).map(|j| j.as_ref())
    }

    pub fn job_index(&self, name: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.name == name)
    }
}

/// Where a job's commands execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeTarget {
    /// Directly on the host, in the instance workspace
    Native,
    /// Inside the given image, with the workspace mounted
    Container { image: String },
}

/// How a dependent reacts to the outcome of a job it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPolicy {
    /// Skip when a required instance failed or was skipped upstream
    #[default]
    Success,
    /// Skip when any instance failed, required or not
    Strict,
    /// Run once the dependency is terminal, whatever its outcome
    Always,
}

/// One `needs` edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub job: String,
    pub policy: DependencyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// Matrix axes in declared order plus partial bindings to exclude
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixSpec {
    pub axes: Vec<MatrixAxis>,
    pub exclude: Vec<Vec<(String, String)>>,
}

impl MatrixSpec {
    pub fn axis_names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.name.clone()).collect()
    }
}

/// Declarative description of a job before matrix expansion
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,
    pub steps: Vec<StepTemplate>,
    pub matrix: Option<MatrixSpec>,
    pub needs: Vec<Dependency>,
    pub runs_on: RuntimeTarget,

    /// Job-level condition evaluated per instance
    pub condition: Option<Condition>,

    /// Failed instances of a non-required job do not fail the pipeline
    pub continue_on_error: bool,

    /// Skip not-yet-started siblings once a required instance fails
    pub fail_fast: bool,

    pub env: HashMap<String, String>,
}

impl JobTemplate {
    pub fn axis_names(&self) -> Vec<String> {
        self.matrix
            .as_ref()
            .map(MatrixSpec::axis_names)
            .unwrap_or_default()
    }

    pub fn is_required(&self) -> bool {
        !self.continue_on_error
    }
}

/// Step-level flags consulted by the executor on failure and cancellation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepPolicy {
    /// Run even after an earlier failure or a cancellation (cleanup, logout)
    pub always: bool,

    /// Record a failure without aborting the instance
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageSpec {
    pub report: String,
    pub fail_on_error: bool,
}

#[derive(Debug, Clone)]
pub struct StepTemplate {
    pub name: String,
    pub action: StepAction,
    pub condition: Option<Condition>,
    pub policy: StepPolicy,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    pub artifacts: Vec<String>,
    pub coverage: Option<CoverageSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    RunCommand,
    SetUpTool,
    BuildContainer,
    RunContainer,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RunCommand => "run-command",
            ActionKind::SetUpTool => "set-up-tool",
            ActionKind::BuildContainer => "build-container",
            ActionKind::RunContainer => "run-container",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "run-command" => Some(ActionKind::RunCommand),
            "set-up-tool" => Some(ActionKind::SetUpTool),
            "build-container" => Some(ActionKind::BuildContainer),
            "run-container" => Some(ActionKind::RunContainer),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step does, with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    RunCommand {
        command: String,
    },
    SetUpTool {
        tool: String,
        version: Option<String>,
    },
    BuildContainer {
        file: String,
        context: String,
        tag: Option<String>,
        build_args: BTreeMap<String, String>,
    },
    RunContainer {
        /// `None` runs the image most recently built in the same instance
        image: Option<String>,
        args: Vec<String>,
    },
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            StepAction::RunCommand { .. } => ActionKind::RunCommand,
            StepAction::SetUpTool { .. } => ActionKind::SetUpTool,
            StepAction::BuildContainer { .. } => ActionKind::BuildContainer,
            StepAction::RunContainer { .. } => ActionKind::RunContainer,
        }
    }

    /// Every string parameter that may carry matrix placeholders
    pub fn templates(&self) -> Vec<&str> {
        match self {
            StepAction::RunCommand { command } => vec![command.as_str()],
            StepAction::SetUpTool { tool, version } => {
                let mut out = vec![tool.as_str()];
                out.extend(version.as_deref());
                out
            }
            StepAction::BuildContainer {
                file,
                context,
                tag,
                build_args,
            } => {
                let mut out = vec![file.as_str(), context.as_str()];
                out.extend(tag.as_deref());
                out.extend(build_args.values().map(String::as_str));
                out
            }
            StepAction::RunContainer { image, args } => {
                let mut out: Vec<&str> = image.as_deref().into_iter().collect();
                out.extend(args.iter().map(String::as_str));
                out
            }
        }
    }

    /// Render matrix placeholders for one instance
    pub fn render(&self, bindings: &context::Bindings) -> StepAction {
        let r = |s: &str| context::render(s, bindings);
        match self {
            StepAction::RunCommand { command } => StepAction::RunCommand { command: r(command) },
            StepAction::SetUpTool { tool, version } => StepAction::SetUpTool {
                tool: r(tool),
                version: version.as_deref().map(r),
            },
            StepAction::BuildContainer {
                file,
                context,
                tag,
                build_args,
            } => StepAction::BuildContainer {
                file: r(file),
                context: r(context),
                tag: tag.as_deref().map(r),
                build_args: build_args.iter().map(|(k, v)| (k.clone(), r(v))).collect(),
            },
            StepAction::RunContainer { image, args } => StepAction::RunContainer {
                image: image.as_deref().map(r),
                args: args.iter().map(|a| r(a)).collect(),
            },
        }
    }
}
