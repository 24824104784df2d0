//! Matrix expansion: one job template into concrete job instances

use crate::core::{
    context::{self, Bindings},
    definition::{
        CoverageSpec, JobTemplate, MatrixSpec, PipelineDefinition, RuntimeTarget, StepAction,
        StepPolicy,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Arena key of a job instance: (template index, binding index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub template: usize,
    pub index: usize,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.template, self.index)
    }
}

/// A step with placeholders rendered and its condition decided
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub name: String,
    pub action: StepAction,

    /// False when the step's condition evaluated false for the bindings
    pub enabled: bool,

    pub policy: StepPolicy,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
    pub artifacts: Vec<String>,
    pub coverage: Option<CoverageSpec>,
}

/// One concrete, fully-bound execution unit.
///
/// The step list is fixed here and never changes during execution.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: InstanceId,
    pub template: Arc<JobTemplate>,
    pub bindings: Bindings,

    /// False when the job-level condition evaluated false
    pub enabled: bool,

    pub runs_on: RuntimeTarget,
    pub env: HashMap<String, String>,
    pub steps: Vec<ResolvedStep>,
}

impl JobInstance {
    pub fn job_name(&self) -> &str {
        &self.template.name
    }

    /// `unittest (python-version=3.8)`, or just the job name without a matrix
    pub fn label(&self) -> String {
        if self.bindings.is_empty() {
            self.template.name.clone()
        } else {
            format!("{} ({})", self.template.name, self.bindings)
        }
    }

    pub fn is_required(&self) -> bool {
        self.template.is_required()
    }
}

/// Binding tuples for a matrix, in odometer order.
///
/// The first declared axis varies slowest and values keep their declared
/// order. Combinations matching an `exclude` entry are dropped. No matrix
/// yields a single empty binding.
pub fn expand_bindings(spec: Option<&MatrixSpec>) -> Vec<Bindings> {
    let spec = match spec {
        Some(spec) if !spec.axes.is_empty() => spec,
        _ => return vec![Bindings::default()],
    };

    let mut combos: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for axis in &spec.axes {
        let mut next = Vec::with_capacity(combos.len() * axis.values.len());
        for combo in &combos {
            for value in &axis.values {
                let mut extended = combo.clone();
                extended.push((axis.name.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }

    combos
        .into_iter()
        .map(Bindings::from_pairs)
        .filter(|b| !spec.exclude.iter().any(|partial| b.matches_partial(partial)))
        .collect()
}

/// Expand one template into its instances
pub fn expand(template: &Arc<JobTemplate>, template_index: usize) -> Vec<JobInstance> {
    expand_bindings(template.matrix.as_ref())
        .into_iter()
        .enumerate()
        .map(|(index, bindings)| {
            instantiate(
                template,
                InstanceId {
                    template: template_index,
                    index,
                },
                bindings,
            )
        })
        .collect()
}

/// Expand every template in declaration order
pub fn expand_all(definition: &PipelineDefinition) -> Vec<JobInstance> {
    definition
        .jobs
        .iter()
        .enumerate()
        .flat_map(|(index, template)| expand(template, index))
        .collect()
}

fn instantiate(template: &Arc<JobTemplate>, id: InstanceId, bindings: Bindings) -> JobInstance {
    let enabled = template
        .condition
        .as_ref()
        .map_or(true, |c| c.evaluate(&bindings));

    let runs_on = match &template.runs_on {
        RuntimeTarget::Native => RuntimeTarget::Native,
        RuntimeTarget::Container { image } => RuntimeTarget::Container {
            image: context::render(image, &bindings),
        },
    };

    let render_env = |env: &HashMap<String, String>| -> HashMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), context::render(v, &bindings)))
            .collect()
    };

    let steps = template
        .steps
        .iter()
        .map(|step| ResolvedStep {
            name: context::render(&step.name, &bindings),
            action: step.action.render(&bindings),
            enabled: step
                .condition
                .as_ref()
                .map_or(true, |c| c.evaluate(&bindings)),
            policy: step.policy,
            timeout: step.timeout,
            env: render_env(&step.env),
            artifacts: step
                .artifacts
                .iter()
                .map(|a| context::render(a, &bindings))
                .collect(),
            coverage: step.coverage.as_ref().map(|c| CoverageSpec {
                report: context::render(&c.report, &bindings),
                fail_on_error: c.fail_on_error,
            }),
        })
        .collect();

    JobInstance {
        id,
        template: Arc::clone(template),
        env: render_env(&template.env),
        bindings,
        enabled,
        runs_on,
        steps,
    }
}
