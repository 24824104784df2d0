//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{
        expand_all, DefinitionError, DependencyGraph, FailureKind, InstanceState, JobInstance,
        PipelineDefinition, RunState, SkipReason, TriggerEvent,
    },
    execution::{
        config::EngineConfig,
        events::{EventHandler, EventSink, ExecutionEvent},
        executor::{Collaborators, InstanceExecutor, RunContext},
        result::ExecutionResult,
        scheduler::Scheduler,
    },
    report::{aggregate, PipelineOutcome, RunInfo},
    runtime::{
        ArtifactPublisher, CommandRunner, ContainerRuntime, CoverageReporter, DirectoryPublisher,
        DockerCli, ShellRunner,
    },
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that prevent a run from producing an outcome
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// No instance is running yet some are not terminal
    #[error("scheduler stalled with {0} unfinished instances")]
    Stalled(usize),
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    cancel: CancellationToken,
    event_handlers: Vec<EventHandler>,
}

impl ExecutionEngine {
    /// Engine with the bundled collaborators: the configured shell, the
    /// docker CLI and a directory publisher under `config.artifact_dir`
    pub fn new(config: EngineConfig) -> Self {
        let publisher = Arc::new(DirectoryPublisher::new(config.artifact_dir.clone()));
        let shell = match config.shell.split_first() {
            Some((program, args)) => ShellRunner::with_shell(program.clone(), args.to_vec()),
            None => ShellRunner::new(),
        };
        let collaborators = Collaborators {
            commands: Arc::new(shell),
            containers: Arc::new(DockerCli::new()),
            artifacts: publisher.clone(),
            coverage: publisher,
        };
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            cancel: CancellationToken::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.collaborators.commands = runner;
        self
    }

    pub fn with_container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.collaborators.containers = runtime;
        self
    }

    pub fn with_artifact_publisher(mut self, publisher: Arc<dyn ArtifactPublisher>) -> Self {
        self.collaborators.artifacts = publisher;
        self
    }

    pub fn with_coverage_reporter(mut self, reporter: Arc<dyn CoverageReporter>) -> Self {
        self.collaborators.coverage = reporter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine-wide token. Cancelling it stops the current run and every
    /// later run of this engine; use [`Self::run_pipeline_with_token`] to
    /// cancel a single run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    /// Execute a pipeline for one trigger event.
    ///
    /// Structural errors surface before anything runs; execution failures
    /// are contained in the returned outcome.
    pub async fn run_pipeline(
        &self,
        definition: &PipelineDefinition,
        event: &TriggerEvent,
    ) -> Result<PipelineOutcome, EngineError> {
        self.run_pipeline_with_token(definition, event, self.cancel.child_token())
            .await
    }

    /// Execute a pipeline that stops when `cancel` is triggered.
    ///
    /// `cancel` should be a child of [`Self::cancellation_token`] for the
    /// engine-wide token to reach the run.
    pub async fn run_pipeline_with_token(
        &self,
        definition: &PipelineDefinition,
        event: &TriggerEvent,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, EngineError> {
        let graph = DependencyGraph::build(&definition.jobs)?;
        let instances: Vec<Arc<JobInstance>> =
            expand_all(definition).into_iter().map(Arc::new).collect();

        let events = EventSink::new(self.event_handlers.clone());
        let mut state = RunState::new();
        state.start(instances.len());
        let execution_id = state.execution_id;
        let started_at = Utc::now();

        info!(
            "Starting pipeline {} ({}) with {} instances",
            definition.name,
            execution_id,
            instances.len()
        );
        events.emit(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name: definition.name.clone(),
            total_instances: instances.len(),
        });

        let concurrency = self.config.effective_concurrency(definition);
        let context = Arc::new(RunContext {
            execution_id,
            pipeline_env: definition.env.clone(),
            default_timeout: self.config.effective_timeout(definition),
            source_dir: self.config.source_dir.clone(),
            workspace_root: self.config.workspace_root.clone(),
        });
        let executor = Arc::new(InstanceExecutor::new(self.collaborators.clone()));

        let mut scheduler = Scheduler::new(graph, &instances);
        let mut results: Vec<Option<ExecutionResult>> = vec![None; instances.len()];
        let record_skips = |slots: Vec<usize>,
                            scheduler: &Scheduler,
                            results: &mut Vec<Option<ExecutionResult>>,
                            state: &mut RunState| {
            for slot in slots {
                let instance = &instances[slot];
                let status = scheduler.state(slot).clone();
                if let InstanceState::Skipped { reason } = &status {
                    debug!("Instance {} skipped: {}", instance.label(), reason);
                    results[slot] = Some(ExecutionResult::skipped(instance, reason.clone()));
                }
                state.record(&status);
                events.emit(ExecutionEvent::InstanceFinished {
                    id: instance.id,
                    label: instance.label(),
                    state: status,
                });
            }
        };

        if !definition.triggers.matches(event) {
            info!(
                "Event '{}' does not match the triggers of {}, skipping every job",
                event.kind, definition.name
            );
            let skipped = scheduler.skip_waiting(SkipReason::Trigger);
            record_skips(skipped, &scheduler, &mut results, &mut state);
        }

        let mut workers: JoinSet<(usize, ExecutionResult)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                warn!("Pipeline {} cancelled", definition.name);
                let skipped = scheduler.cancel_pending();
                record_skips(skipped, &scheduler, &mut results, &mut state);
            }

            let skipped = scheduler.promote();
            record_skips(skipped, &scheduler, &mut results, &mut state);

            while workers.len() < concurrency {
                let Some(slot) = scheduler.next_runnable() else {
                    break;
                };
                scheduler.mark_running(slot);
                state.record_started();

                let instance = Arc::clone(&instances[slot]);
                info!("Admitting {} ({} running)", instance.label(), workers.len() + 1);
                events.emit(ExecutionEvent::InstanceStarted {
                    id: instance.id,
                    label: instance.label(),
                });

                let executor = Arc::clone(&executor);
                let context = Arc::clone(&context);
                let token = cancel.clone();
                let sink = events.clone();
                workers.spawn(async move {
                    // A panicking executor fails its own instance instead of the run
                    let task_instance = Arc::clone(&instance);
                    let handle = tokio::spawn(async move {
                        executor
                            .execute(&task_instance, &context, &token, &sink)
                            .await
                    });
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => ExecutionResult::errored(
                            &instance,
                            FailureKind::StepExecution,
                            format!("executor crashed: {}", e),
                            Utc::now(),
                        ),
                    };
                    (slot, result)
                });
            }

            if scheduler.is_finished() {
                break;
            }
            if workers.is_empty() {
                let unfinished = scheduler.len()
                    - results.iter().filter(|r| r.is_some()).count();
                error!("No instances running and {} unfinished", unfinished);
                return Err(EngineError::Stalled(unfinished));
            }

            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok((slot, result))) => {
                        let status = result.status.clone();
                        let instance = &instances[slot];
                        match &status {
                            InstanceState::Failed { kind } => {
                                warn!("Instance {} failed: {}", instance.label(), kind)
                            }
                            _ => info!("Instance {} {}", instance.label(), status.label()),
                        }
                        state.record(&status);
                        events.emit(ExecutionEvent::InstanceFinished {
                            id: instance.id,
                            label: instance.label(),
                            state: status.clone(),
                        });
                        results[slot] = Some(result);

                        let skipped = scheduler.complete(slot, status);
                        record_skips(skipped, &scheduler, &mut results, &mut state);
                    }
                    Some(Err(e)) => {
                        // The wrapper task only awaits the inner one; it cannot panic
                        error!("Worker task failed: {}", e);
                    }
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!("Cancelling pipeline {}", definition.name);
                    let skipped = scheduler.cancel_pending();
                    record_skips(skipped, &scheduler, &mut results, &mut state);
                }
            }
        }

        let results: Vec<ExecutionResult> = results
            .into_iter()
            .zip(instances.iter())
            .map(|(result, instance)| {
                result.unwrap_or_else(|| ExecutionResult::skipped(instance, SkipReason::Cancelled))
            })
            .collect();

        let outcome = aggregate(
            RunInfo {
                execution_id,
                pipeline: definition.name.clone(),
                event: event.clone(),
                cancelled: cancelled || cancel.is_cancelled(),
                started_at,
                finished_at: Utc::now(),
            },
            results,
        );
        state.finish(outcome.status);

        info!(
            "Pipeline {} finished: {} ({} succeeded, {} failed, {} skipped)",
            definition.name,
            outcome.status,
            state.succeeded_instances,
            state.failed_instances,
            state.skipped_instances
        );
        events.emit(ExecutionEvent::PipelineFinished {
            execution_id,
            status: outcome.status,
            cancelled: outcome.cancelled,
        });

        Ok(outcome)
    }
}
