//! Test utilities for cirun scenarios

use async_trait::async_trait;
use cirun::core::{load, Bindings, InstanceState, SkipReason, StepStatus, TriggerEvent};
use cirun::execution::{Collaborators, EngineConfig, ExecutionEngine, ExecutionEvent, ExecutionResult};
use cirun::report::PipelineOutcome;
use cirun::runtime::{
    ArtifactPublisher, BuildSpec, BuiltImage, CommandOutput, CommandRunner, ContainerRuntime,
    CoverageReporter, RunSpec, RunnerError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the mock runner answers a command
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub exit_code: i32,
    pub delay: Duration,
    pub stdout: String,
}

/// One command the mock runner received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: String,
    pub env: HashMap<String, String>,
    pub workdir: PathBuf,
}

/// Command runner that answers from rules and tracks concurrency
#[derive(Default)]
pub struct MockRunner {
    default: Behavior,
    rules: Vec<(String, Behavior)>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command takes `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default.delay = delay;
        self
    }

    /// Commands containing `pattern` exit with `code`
    pub fn fail_on(self, pattern: &str, code: i32) -> Self {
        let delay = self.default.delay;
        self.rule(
            pattern,
            Behavior {
                exit_code: code,
                delay,
                ..Default::default()
            },
        )
    }

    /// Commands containing `pattern` take `delay` and succeed
    pub fn delay_on(self, pattern: &str, delay: Duration) -> Self {
        self.rule(
            pattern,
            Behavior {
                delay,
                ..Default::default()
            },
        )
    }

    /// Later rules win over earlier ones
    pub fn rule(mut self, pattern: &str, behavior: Behavior) -> Self {
        self.rules.push((pattern.to_string(), behavior));
        self
    }

    fn behavior_for(&self, command: &str) -> Behavior {
        self.rules
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Number of commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Highest number of commands running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even when the call is dropped mid-way
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        let behavior = self.behavior_for(command);
        self.calls.lock().unwrap().push(RecordedCall {
            command: command.to_string(),
            env: env.clone(),
            workdir: workdir.to_path_buf(),
        });
        let _guard = InFlight::enter(&self.in_flight, &self.peak);

        tokio::select! {
            _ = tokio::time::sleep(behavior.delay.min(timeout)) => {}
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
        }
        if behavior.delay > timeout {
            return Err(RunnerError::Timeout(timeout));
        }

        Ok(CommandOutput {
            exit_code: Some(behavior.exit_code),
            stdout: behavior.stdout,
            stderr: String::new(),
        })
    }
}

/// Container runtime that records requests instead of talking to docker
#[derive(Default)]
pub struct MockContainers {
    builds: Mutex<Vec<BuildSpec>>,
    runs: Mutex<Vec<RunSpec>>,
    removed: Mutex<Vec<String>>,
    failing_images: Vec<String>,
    run_delay: Duration,
    timeline: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockContainers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs of `image` exit with code 1
    pub fn fail_image(mut self, image: &str) -> Self {
        self.failing_images.push(image.to_string());
        self
    }

    /// Every container runs for `delay`
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    /// Append "removed <name>" to `timeline` once a container is removed
    pub fn with_timeline(mut self, timeline: Arc<Mutex<Vec<String>>>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn builds(&self) -> Vec<BuildSpec> {
        self.builds.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.runs.lock().unwrap().clone()
    }

    /// Names of containers force-removed after a timeout or cancellation
    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// Stands in for `docker rm -f`, which takes a moment
    async fn remove(&self, name: &str) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.removed.lock().unwrap().push(name.to_string());
        if let Some(timeline) = &self.timeline {
            timeline.lock().unwrap().push(format!("removed {}", name));
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockContainers {
    async fn build(
        &self,
        spec: &BuildSpec,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<BuiltImage, RunnerError> {
        self.builds.lock().unwrap().push(spec.clone());
        Ok(BuiltImage {
            image: spec.tag.clone(),
            output: CommandOutput {
                exit_code: Some(0),
                stdout: format!("Successfully tagged {}\n", spec.tag),
                stderr: String::new(),
            },
        })
    }

    async fn run(
        &self,
        spec: &RunSpec,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, RunnerError> {
        self.runs.lock().unwrap().push(spec.clone());

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.run_delay.min(timeout)) => {
                (self.run_delay > timeout).then_some(RunnerError::Timeout(timeout))
            }
            _ = cancel.cancelled() => Some(RunnerError::Cancelled),
        };
        if let Some(e) = interrupted {
            self.remove(&spec.name).await;
            return Err(e);
        }

        let exit_code = if self.failing_images.contains(&spec.image) {
            1
        } else {
            0
        };
        Ok(CommandOutput {
            exit_code: Some(exit_code),
            ..Default::default()
        })
    }
}

/// Publisher keeping artifact and coverage names in memory
#[derive(Default)]
pub struct RecordingPublisher {
    artifacts: Mutex<Vec<String>>,
    coverage: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn artifacts(&self) -> Vec<String> {
        self.artifacts.lock().unwrap().clone()
    }

    pub fn coverage(&self) -> Vec<String> {
        self.coverage.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn publish(&self, _bytes: Vec<u8>, name: &str) -> Result<String, RunnerError> {
        self.artifacts.lock().unwrap().push(name.to_string());
        Ok(format!("mem://{}", name))
    }
}

#[async_trait]
impl CoverageReporter for RecordingPublisher {
    async fn upload(&self, _report: Vec<u8>, name: &str) -> Result<(), RunnerError> {
        self.coverage.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Mock collaborators plus the events of the last run
pub struct Harness {
    pub runner: Arc<MockRunner>,
    pub containers: Arc<MockContainers>,
    pub publisher: Arc<RecordingPublisher>,
    pub events: Arc<Mutex<Vec<ExecutionEvent>>>,
}

impl Harness {
    pub fn new(runner: MockRunner) -> Self {
        Self::with_containers(runner, MockContainers::new())
    }

    pub fn with_containers(runner: MockRunner, containers: MockContainers) -> Self {
        Self {
            runner: Arc::new(runner),
            containers: Arc::new(containers),
            publisher: Arc::new(RecordingPublisher::default()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Engine wired to the mocks, recording every event
    pub fn engine(&self, config: EngineConfig) -> ExecutionEngine {
        let collaborators = Collaborators {
            commands: self.runner.clone(),
            containers: self.containers.clone(),
            artifacts: self.publisher.clone(),
            coverage: self.publisher.clone(),
        };
        let mut engine = ExecutionEngine::with_collaborators(config, collaborators);
        let events = Arc::clone(&self.events);
        engine.add_event_handler(move |event| events.lock().unwrap().push(event));
        engine
    }

    /// Load `yaml` and run it for a push event with default settings
    pub async fn run(&self, yaml: &str) -> PipelineOutcome {
        self.run_with(yaml, EngineConfig::new(), push()).await
    }

    pub async fn run_with(
        &self,
        yaml: &str,
        config: EngineConfig,
        event: TriggerEvent,
    ) -> PipelineOutcome {
        let definition = load(yaml).unwrap();
        self.engine(config)
            .run_pipeline(&definition, &event)
            .await
            .unwrap()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Labels of instances in admission order
    pub fn started_order(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ExecutionEvent::InstanceStarted { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }
}

pub fn push() -> TriggerEvent {
    TriggerEvent::new("push").with_metadata("branch", "master")
}

pub fn bindings(pairs: &[(&str, &str)]) -> Bindings {
    Bindings::from_pairs(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// The instance of `job` bound to `pairs`
pub fn instance<'a>(
    outcome: &'a PipelineOutcome,
    job: &str,
    pairs: &[(&str, &str)],
) -> &'a ExecutionResult {
    outcome
        .result(job, &bindings(pairs))
        .unwrap_or_else(|| panic!("no instance of {} with {:?}", job, pairs))
}

pub fn assert_succeeded(result: &ExecutionResult) {
    assert_eq!(
        result.status,
        InstanceState::Succeeded,
        "{} should have succeeded: {:?}",
        result.label,
        result
    );
}

pub fn assert_failed(result: &ExecutionResult) {
    assert!(
        result.is_failed(),
        "{} should have failed, got {:?}",
        result.label,
        result.status
    );
}

pub fn assert_skipped(result: &ExecutionResult, reason: SkipReason) {
    assert_eq!(
        result.status,
        InstanceState::Skipped { reason },
        "{} has the wrong status",
        result.label
    );
}

pub fn assert_step(result: &ExecutionResult, step: &str, status: StepStatus) {
    let record = result
        .step(step)
        .unwrap_or_else(|| panic!("{} has no step '{}'", result.label, step));
    assert_eq!(
        record.status, status,
        "step '{}' of {}: {:?}",
        step, result.label, record.message
    );
}
