//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Overall pipeline outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "succeeded" => Some(PipelineStatus::Succeeded),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step or instance failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-zero exit, failed container, unavailable tool or publisher error
    StepExecution,
    /// A step exceeded its timeout
    Timeout,
    /// The run was cancelled while the step was active
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::StepExecution => "step execution error",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
        })
    }
}

/// Why an instance never ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "kebab-case")]
pub enum SkipReason {
    /// Job-level condition evaluated false for the bindings
    Condition,
    /// The named dependency did not satisfy its policy
    DependencyFailed(String),
    /// The run was cancelled before the instance started
    Cancelled,
    /// The trigger event did not match the pipeline's predicate
    Trigger,
    /// A required sibling failed in a fail-fast job
    FailFast,
}

impl SkipReason {
    /// True for skips caused by a failure or cancellation upstream
    pub fn is_failure_induced(&self) -> bool {
        matches!(
            self,
            SkipReason::DependencyFailed(_) | SkipReason::Cancelled | SkipReason::FailFast
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Condition => write!(f, "condition is false"),
            SkipReason::DependencyFailed(job) => write!(f, "dependency '{}' failed", job),
            SkipReason::Cancelled => write!(f, "run cancelled"),
            SkipReason::Trigger => write!(f, "event does not match triggers"),
            SkipReason::FailFast => write!(f, "fail-fast"),
        }
    }
}

/// Lifecycle of a single job instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum InstanceState {
    /// Created by expansion, not yet examined by the scheduler
    Pending,
    /// Waiting for dependency templates to finish
    Blocked,
    /// Queued for a free worker
    Runnable,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded,
    Failed {
        kind: FailureKind,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl InstanceState {
    /// Check if the instance is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Succeeded | InstanceState::Failed { .. } | InstanceState::Skipped { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Blocked => "blocked",
            InstanceState::Runnable => "runnable",
            InstanceState::Running { .. } => "running",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed { .. } => "failed",
            InstanceState::Skipped { .. } => "skipped",
        }
    }
}

/// Outcome of a single step within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    /// Not executed: condition false or aborted by an earlier failure
    Skipped,
}

impl StepStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::TimedOut | StepStatus::Cancelled
        )
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            StepStatus::Failed => Some(FailureKind::StepExecution),
            StepStatus::TimedOut => Some(FailureKind::Timeout),
            StepStatus::Cancelled => Some(FailureKind::Cancelled),
            StepStatus::Succeeded | StepStatus::Skipped => None,
        }
    }
}

/// Live counters for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Final status once the run is complete
    pub status: Option<PipelineStatus>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of instances
    pub total_instances: usize,

    pub succeeded_instances: usize,

    pub failed_instances: usize,

    pub skipped_instances: usize,

    pub running_instances: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: None,
            started_at: None,
            completed_at: None,
            total_instances: 0,
            succeeded_instances: 0,
            failed_instances: 0,
            skipped_instances: 0,
            running_instances: 0,
        }
    }

    /// Mark the run as started
    pub fn start(&mut self, total_instances: usize) {
        self.started_at = Some(Utc::now());
        self.total_instances = total_instances;
    }

    pub fn record_started(&mut self) {
        self.running_instances += 1;
    }

    /// Count a terminal transition
    pub fn record(&mut self, state: &InstanceState) {
        match state {
            InstanceState::Succeeded => self.succeeded_instances += 1,
            InstanceState::Failed { .. } => self.failed_instances += 1,
            InstanceState::Skipped { .. } => self.skipped_instances += 1,
            _ => return,
        }
        if !matches!(state, InstanceState::Skipped { .. }) {
            self.running_instances = self.running_instances.saturating_sub(1);
        }
    }

    pub fn finish(&mut self, status: PipelineStatus) {
        self.status = Some(status);
        self.completed_at = Some(Utc::now());
    }

    /// Fraction of instances in a terminal state (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_instances == 0 {
            return 0.0;
        }
        (self.succeeded_instances + self.failed_instances + self.skipped_instances) as f64
            / self.total_instances as f64
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
