//! Result aggregation into the pipeline outcome

use crate::core::{Bindings, PipelineStatus, TriggerEvent};
use crate::execution::result::ExecutionResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Run metadata carried into the outcome
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub event: TriggerEvent,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Instance counts for one job template
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateSummary {
    pub job: String,
    pub required: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// One entry of the artifact index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    pub instance: String,
    pub step: String,
    pub name: String,
    pub url: String,
}

/// Structured report of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub event: TriggerEvent,
    pub status: PipelineStatus,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Per-template summaries in declaration order
    pub summaries: Vec<TemplateSummary>,

    /// Every instance, ordered by (template index, binding index)
    pub results: Vec<ExecutionResult>,

    pub artifacts: Vec<ArtifactEntry>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }

    /// Process exit code for the invoker
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn summary(&self, job: &str) -> Option<&TemplateSummary> {
        self.summaries.iter().find(|s| s.job == job)
    }

    /// All instance results of one job
    pub fn results_for<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a ExecutionResult> {
        self.results.iter().filter(move |r| r.job == job)
    }

    /// The instance of `job` bound to exactly `bindings`
    pub fn result(&self, job: &str, bindings: &Bindings) -> Option<&ExecutionResult> {
        self.results
            .iter()
            .find(|r| r.job == job && &r.bindings == bindings)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.is_failed())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Collect instance results into the pipeline outcome.
///
/// The run fails when any required instance failed, or when it was
/// cancelled.
pub fn aggregate(run: RunInfo, mut results: Vec<ExecutionResult>) -> PipelineOutcome {
    results.sort_by_key(|r| r.id);

    let mut summaries: Vec<TemplateSummary> = Vec::new();
    let mut last_template = None;
    for result in &results {
        if last_template != Some(result.id.template) {
            last_template = Some(result.id.template);
            summaries.push(TemplateSummary {
                job: result.job.clone(),
                required: result.required,
                total: 0,
                succeeded: 0,
                failed: 0,
                skipped: 0,
            });
        }
        if let Some(summary) = summaries.last_mut() {
            summary.total += 1;
            if result.is_failed() {
                summary.failed += 1;
            } else if result.is_skipped() {
                summary.skipped += 1;
            } else {
                summary.succeeded += 1;
            }
        }
    }

    let artifacts = results
        .iter()
        .flat_map(|r| {
            r.artifacts.iter().map(move |a| ArtifactEntry {
                instance: r.label.clone(),
                step: a.step.clone(),
                name: a.name.clone(),
                url: a.url.clone(),
            })
        })
        .collect();

    let required_failure = results.iter().any(|r| r.required && r.is_failed());
    let status = if required_failure || run.cancelled {
        PipelineStatus::Failed
    } else {
        PipelineStatus::Succeeded
    };

    PipelineOutcome {
        execution_id: run.execution_id,
        pipeline: run.pipeline,
        event: run.event,
        status,
        cancelled: run.cancelled,
        started_at: run.started_at,
        finished_at: run.finished_at,
        summaries,
        results,
        artifacts,
    }
}
