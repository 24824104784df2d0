//! Instance executor - runs a job instance's steps in order

use crate::{
    core::{
        context, FailureKind, InstanceState, JobInstance, ResolvedStep, RuntimeTarget, StepAction,
        StepStatus,
    },
    execution::{
        events::{EventSink, ExecutionEvent},
        result::{ArtifactRef, ExecutionResult, StepRecord},
    },
    runtime::{
        tool, ArtifactPublisher, BuildSpec, CommandOutput, CommandRunner, ContainerRuntime,
        CoverageReporter, RunSpec, RunnerError, CONTAINER_WORKSPACE,
    },
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators the executor drives
#[derive(Clone)]
pub struct Collaborators {
    pub commands: Arc<dyn CommandRunner>,
    pub containers: Arc<dyn ContainerRuntime>,
    pub artifacts: Arc<dyn ArtifactPublisher>,
    pub coverage: Arc<dyn CoverageReporter>,
}

/// Run-wide settings shared by every instance
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: Uuid,
    pub pipeline_env: HashMap<String, String>,
    pub default_timeout: Duration,
    pub source_dir: PathBuf,
    pub workspace_root: Option<PathBuf>,
}

/// Mutable per-instance scope; never shared between instances
struct InstanceScope {
    env: HashMap<String, String>,
    workspace: PathBuf,
    last_image: Option<String>,
}

/// Executes one job instance
pub struct InstanceExecutor {
    collaborators: Collaborators,
}

impl InstanceExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Run every step of the instance and produce its terminal result.
    ///
    /// After the first failure only `always` steps run. `always` steps
    /// also run after cancellation, without the cancellation signal.
    pub async fn execute(
        &self,
        instance: &JobInstance,
        run: &RunContext,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let label = instance.label();
        info!("Starting instance {}", label);

        let workspace = match create_workspace(instance, run) {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to create workspace for {}: {}", label, e);
                return ExecutionResult::errored(
                    instance,
                    FailureKind::StepExecution,
                    format!("failed to create workspace: {}", e),
                    started_at,
                );
            }
        };

        let mut scope = InstanceScope {
            env: instance_env(instance, run, workspace.path()),
            workspace: workspace.path().to_path_buf(),
            last_image: None,
        };

        let mut records = Vec::with_capacity(instance.steps.len());
        let mut artifacts = Vec::new();
        let mut failure: Option<FailureKind> = None;
        let mut interrupted = false;

        for step in &instance.steps {
            if !step.enabled {
                records.push(StepRecord::skipped(
                    &step.name,
                    step.action.kind(),
                    "condition is false",
                ));
                continue;
            }

            let cancelled = cancel.is_cancelled();
            if (failure.is_some() || cancelled) && !step.policy.always {
                let message = if cancelled {
                    interrupted = true;
                    "run cancelled"
                } else {
                    "skipped after an earlier failure"
                };
                records.push(StepRecord::skipped(&step.name, step.action.kind(), message));
                continue;
            }

            events.emit(ExecutionEvent::StepStarted {
                id: instance.id,
                label: label.clone(),
                step: step.name.clone(),
            });

            let uncancellable = CancellationToken::new();
            let token = if step.policy.always { &uncancellable } else { cancel };
            let (record, published) = self.run_step(instance, step, &mut scope, run, token).await;

            events.emit(ExecutionEvent::StepFinished {
                id: instance.id,
                label: label.clone(),
                step: step.name.clone(),
                status: record.status,
            });

            if record.status == StepStatus::Cancelled {
                interrupted = true;
            } else if record.status.is_failure() {
                if step.policy.continue_on_error {
                    info!("Step '{}' of {} failed but may continue", step.name, label);
                } else if failure.is_none() {
                    failure = record.status.failure_kind();
                }
            }
            artifacts.extend(published);
            records.push(record);
        }

        let status = match (failure, interrupted) {
            (Some(kind), _) => InstanceState::Failed { kind },
            (None, true) => InstanceState::Failed {
                kind: FailureKind::Cancelled,
            },
            (None, false) => InstanceState::Succeeded,
        };
        info!("Instance {} finished: {}", label, status.label());

        // Workspace removed here, on every path out of the step loop
        drop(workspace);

        ExecutionResult::completed(instance, status, records, artifacts, started_at)
    }

    async fn run_step(
        &self,
        instance: &JobInstance,
        step: &ResolvedStep,
        scope: &mut InstanceScope,
        run: &RunContext,
        cancel: &CancellationToken,
    ) -> (StepRecord, Vec<ArtifactRef>) {
        let limit = step.timeout.unwrap_or(run.default_timeout);
        let started = Instant::now();
        debug!("Running step '{}' of {}", step.name, instance.label());

        let mut env = scope.env.clone();
        env.extend(step.env.clone());

        // Collaborators release their processes and containers before
        // returning `Cancelled` or `Timeout`
        let performed = self
            .perform(instance, step, scope, &env, run, limit, cancel)
            .await;

        let mut record = StepRecord {
            name: step.name.clone(),
            action: step.action.kind(),
            status: StepStatus::Succeeded,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: None,
            duration_ms: 0,
        };
        let mut published = Vec::new();

        match performed {
            Err(RunnerError::Cancelled) => {
                warn!("Step '{}' of {} cancelled", step.name, instance.label());
                record.status = StepStatus::Cancelled;
                record.message = Some("cancelled".to_string());
            }
            Err(e) => {
                warn!("Step '{}' of {} failed: {}", step.name, instance.label(), e);
                record.status = if e.is_timeout() {
                    StepStatus::TimedOut
                } else {
                    StepStatus::Failed
                };
                record.message = Some(e.to_string());
            }
            Ok(output) => {
                record.exit_code = output.exit_code;
                record.stdout = output.stdout;
                record.stderr = output.stderr;
                if output.exit_code != Some(0) {
                    record.status = StepStatus::Failed;
                    record.message = Some(match output.exit_code {
                        Some(code) => format!("exited with code {}", code),
                        None => "terminated by signal".to_string(),
                    });
                } else if let Err(message) =
                    self.publish(instance, step, scope, &mut published).await
                {
                    record.status = StepStatus::Failed;
                    record.message = Some(message);
                } else if let Some(note) = self.report_coverage(instance, step, scope).await {
                    if step.coverage.as_ref().is_some_and(|c| c.fail_on_error) {
                        record.status = StepStatus::Failed;
                    }
                    record.message = Some(note);
                }
            }
        }

        record.duration_ms = started.elapsed().as_millis() as u64;
        if record.status.is_failure() {
            published.clear();
        }
        (record, published)
    }

    #[allow(clippy::too_many_arguments)]
    async fn perform(
        &self,
        instance: &JobInstance,
        step: &ResolvedStep,
        scope: &mut InstanceScope,
        env: &HashMap<String, String>,
        run: &RunContext,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        match &step.action {
            StepAction::RunCommand { command } => match &instance.runs_on {
                RuntimeTarget::Native => {
                    self.collaborators
                        .commands
                        .run(command, env, &scope.workspace, limit, cancel)
                        .await
                }
                RuntimeTarget::Container { image } => {
                    let spec = RunSpec {
                        image: image.clone(),
                        name: container_name(),
                        args: vec!["sh".to_string(), "-c".to_string(), command.clone()],
                        env: container_env(env),
                        workspace: Some(scope.workspace.clone()),
                    };
                    self.collaborators.containers.run(&spec, limit, cancel).await
                }
            },
            StepAction::SetUpTool { tool: name, version } => {
                set_up_tool(name, version.as_deref(), &instance.runs_on, scope)
            }
            StepAction::BuildContainer {
                file,
                context,
                tag,
                build_args,
            } => {
                let spec = BuildSpec {
                    file: run.source_dir.join(file),
                    context: run.source_dir.join(context),
                    tag: tag.clone().unwrap_or_else(|| default_tag(instance, run)),
                    build_args: build_args.clone(),
                };
                let built = self.collaborators
                    .containers
                    .build(&spec, limit, cancel)
                    .await?;
                if built.output.success() {
                    scope.last_image = Some(built.image);
                }
                Ok(built.output)
            }
            StepAction::RunContainer { image, args } => {
                let image = image
                    .clone()
                    .or_else(|| scope.last_image.clone())
                    .ok_or_else(|| {
                        RunnerError::Container("no image was built in this instance".to_string())
                    })?;
                let spec = RunSpec {
                    image,
                    name: container_name(),
                    args: args.clone(),
                    env: container_env(env),
                    workspace: Some(scope.workspace.clone()),
                };
                self.collaborators.containers.run(&spec, limit, cancel).await
            }
        }
    }

    /// Publish the step's artifacts; an error message fails the step
    async fn publish(
        &self,
        instance: &JobInstance,
        step: &ResolvedStep,
        scope: &InstanceScope,
        published: &mut Vec<ArtifactRef>,
    ) -> Result<(), String> {
        for path in &step.artifacts {
            let bytes = tokio::fs::read(scope.workspace.join(path))
                .await
                .map_err(|e| format!("failed to read artifact '{}': {}", path, e))?;
            let name = publish_name(instance, path);
            let url = self
                .collaborators
                .artifacts
                .publish(bytes, &name)
                .await
                .map_err(|e| format!("failed to publish artifact '{}': {}", path, e))?;
            published.push(ArtifactRef {
                name,
                url,
                step: step.name.clone(),
            });
        }
        Ok(())
    }

    /// Upload the coverage report; returns a note when the upload failed
    async fn report_coverage(
        &self,
        instance: &JobInstance,
        step: &ResolvedStep,
        scope: &InstanceScope,
    ) -> Option<String> {
        let coverage = step.coverage.as_ref()?;
        let uploaded = match tokio::fs::read(scope.workspace.join(&coverage.report)).await {
            Ok(report) => self
                .collaborators
                .coverage
                .upload(report, &publish_name(instance, &coverage.report))
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("failed to read '{}': {}", coverage.report, e)),
        };

        match uploaded {
            Ok(()) => None,
            Err(e) => {
                warn!("Coverage upload for {} failed: {}", instance.label(), e);
                Some(format!("coverage upload failed: {}", e))
            }
        }
    }
}

fn create_workspace(instance: &JobInstance, run: &RunContext) -> std::io::Result<tempfile::TempDir> {
    let prefix = format!("cirun-{}-{}-", slug(instance.job_name()), instance.id.index);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    match &run.workspace_root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
}

/// pipeline env < job env < CI variables < matrix bindings
fn instance_env(instance: &JobInstance, run: &RunContext, workspace: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_string(), path);
    }
    env.extend(run.pipeline_env.clone());
    env.extend(instance.env.clone());
    env.insert("CI".to_string(), "true".to_string());
    env.insert("CI_JOB".to_string(), instance.job_name().to_string());
    env.insert("CI_INSTANCE".to_string(), instance.label());
    env.insert(
        "CI_WORKSPACE".to_string(),
        workspace.to_string_lossy().into_owned(),
    );
    let source = std::path::absolute(&run.source_dir).unwrap_or_else(|_| run.source_dir.clone());
    env.insert(
        "CI_SOURCE_DIR".to_string(),
        source.to_string_lossy().into_owned(),
    );
    env.extend(instance.bindings.to_env());
    env
}

/// Host `PATH` and workspace paths do not apply inside the container
fn container_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = env
        .iter()
        .filter(|(key, _)| key.as_str() != "PATH")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.insert("CI_WORKSPACE".to_string(), CONTAINER_WORKSPACE.to_string());
    env
}

fn set_up_tool(
    name: &str,
    version: Option<&str>,
    runs_on: &RuntimeTarget,
    scope: &mut InstanceScope,
) -> Result<CommandOutput, RunnerError> {
    let version_key = format!("{}_VERSION", context::env_key(name));

    // Container images bring their own tools
    if let RuntimeTarget::Container { image } = runs_on {
        if let Some(version) = version {
            scope.env.insert(version_key, version.to_string());
        }
        return Ok(CommandOutput {
            exit_code: Some(0),
            stdout: format!("{} provided by image {}\n", name, image),
            stderr: String::new(),
        });
    }

    let search_path = scope.env.get("PATH").cloned().unwrap_or_default();
    let found = tool::resolve(name, version, &search_path, &scope.workspace)?;
    if let Some(dir) = found.parent() {
        scope
            .env
            .insert("PATH".to_string(), tool::prepend_path(dir, &search_path));
    }
    scope.env.insert(
        version_key,
        version.unwrap_or("system").to_string(),
    );

    Ok(CommandOutput {
        exit_code: Some(0),
        stdout: format!("Using {} at {}\n", name, found.display()),
        stderr: String::new(),
    })
}

fn container_name() -> String {
    format!("cirun-{}", Uuid::new_v4().simple())
}

fn default_tag(instance: &JobInstance, run: &RunContext) -> String {
    format!(
        "cirun/{}-{}:{}",
        slug(instance.job_name()),
        instance.id.index,
        &run.execution_id.simple().to_string()[..12]
    )
}

fn publish_name(instance: &JobInstance, path: &str) -> String {
    format!(
        "{}/{}/{}",
        slug(instance.job_name()),
        instance.id.index,
        path.trim_start_matches("./")
    )
}

/// Lower-case name safe for paths, container names and tags
fn slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
