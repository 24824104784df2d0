//! Per-instance execution results

use crate::core::{
    ActionKind, Bindings, FailureKind, InstanceId, InstanceState, JobInstance, SkipReason,
    StepStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one step, in execution order
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub action: ActionKind,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,

    /// Why the step failed or was skipped, plus non-fatal notes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub duration_ms: u64,
}

impl StepRecord {
    pub fn skipped(name: &str, action: ActionKind, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            action,
            status: StepStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: Some(message.into()),
            duration_ms: 0,
        }
    }
}

/// Published artifact reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    pub url: String,
    pub step: String,
}

/// Terminal result of one job instance; outlives the instance itself
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub id: InstanceId,
    pub job: String,
    pub label: String,
    pub bindings: Bindings,

    /// False for instances of `continue_on_error` jobs
    pub required: bool,

    pub status: InstanceState,
    pub steps: Vec<StepRecord>,
    pub artifacts: Vec<ArtifactRef>,

    /// Failure outside any step (workspace setup, crashed worker)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    fn base(instance: &JobInstance, status: InstanceState) -> Self {
        Self {
            id: instance.id,
            job: instance.job_name().to_string(),
            label: instance.label(),
            bindings: instance.bindings.clone(),
            required: instance.is_required(),
            status,
            steps: Vec::new(),
            artifacts: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Result for an instance that never ran
    pub fn skipped(instance: &JobInstance, reason: SkipReason) -> Self {
        let mut result = Self::base(instance, InstanceState::Skipped { reason });
        result.finished_at = Some(Utc::now());
        result
    }

    /// Result for an instance that failed before or outside its steps
    pub fn errored(
        instance: &JobInstance,
        kind: FailureKind,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::base(instance, InstanceState::Failed { kind });
        result.error = Some(error.into());
        result.started_at = Some(started_at);
        result.finished_at = Some(Utc::now());
        result
    }

    pub fn completed(
        instance: &JobInstance,
        status: InstanceState,
        steps: Vec<StepRecord>,
        artifacts: Vec<ArtifactRef>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut result = Self::base(instance, status);
        result.steps = steps;
        result.artifacts = artifacts;
        result.started_at = Some(started_at);
        result.finished_at = Some(Utc::now());
        result
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, InstanceState::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, InstanceState::Skipped { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.status {
            InstanceState::Failed { kind } => Some(kind),
            _ => None,
        }
    }

    /// The first step that failed, with its captured output
    pub fn first_failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status.is_failure())
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }
}
