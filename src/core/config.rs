//! Pipeline configuration from YAML

use crate::core::{
    condition::Condition,
    context::{placeholders, split_words},
    definition::{
        ActionKind, CoverageSpec, Dependency, DependencyPolicy, JobTemplate, MatrixAxis,
        MatrixSpec, PipelineDefinition, RuntimeTarget, StepAction, StepPolicy, StepTemplate,
    },
    error::DefinitionError,
    graph::DependencyGraph,
    matrix,
    trigger::{TriggerRule, Triggers},
};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type Result<T> = std::result::Result<T, DefinitionError>;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Trigger predicate: an event name, a list of names, or a map of
    /// event name to `{ branches: [...] }`
    #[serde(default, rename = "on")]
    pub triggers: Option<Value>,

    /// Default worker pool size
    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline-wide environment
    #[serde(default)]
    pub env: HashMap<String, Value>,

    /// Jobs in declaration order
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default step timeout (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job name
    pub name: String,

    /// `native` (default) or `container`
    #[serde(default)]
    pub runs_on: Option<String>,

    /// Image for `runs_on: container`
    #[serde(default)]
    pub container: Option<String>,

    /// Jobs that must reach a terminal state first
    #[serde(default)]
    pub needs: Option<NeedsConfig>,

    /// Job-level condition
    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub env: HashMap<String, Value>,

    /// Axis name to values, plus an optional `exclude` list
    #[serde(default)]
    pub matrix: Option<Mapping>,

    pub steps: Vec<StepConfig>,
}

/// `needs: lint` or `needs: [lint, { job: docs, policy: always }]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeedsConfig {
    One(String),
    Many(Vec<NeedConfig>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeedConfig {
    Name(String),
    Detailed {
        job: String,
        #[serde(default)]
        policy: DependencyPolicy,
    },
}

impl NeedConfig {
    fn to_dependency(&self) -> Dependency {
        match self {
            NeedConfig::Name(job) => Dependency {
                job: job.clone(),
                policy: DependencyPolicy::default(),
            },
            NeedConfig::Detailed { job, policy } => Dependency {
                job: job.clone(),
                policy: *policy,
            },
        }
    }
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    /// Shorthand for `uses: run-command` with a `command` parameter
    #[serde(default)]
    pub run: Option<String>,

    /// Action kind
    #[serde(default)]
    pub uses: Option<String>,

    /// Action parameters
    #[serde(default, rename = "with")]
    pub params: Mapping,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    /// Run even after a failure or cancellation
    #[serde(default)]
    pub always: bool,

    #[serde(default)]
    pub continue_on_error: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub env: HashMap<String, Value>,

    /// Files (relative to the instance workspace) published on success
    #[serde(default)]
    pub artifacts: Vec<String>,

    #[serde(default)]
    pub coverage: Option<CoverageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageConfig {
    pub report: String,

    /// Fail the step when the upload fails
    #[serde(default)]
    pub fail_on_error: bool,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate and convert into the immutable definition model
    pub fn to_definition(&self) -> Result<PipelineDefinition> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::parse("pipeline name must not be empty"));
        }
        if self.concurrency == Some(0) {
            return Err(DefinitionError::parse("concurrency must be at least 1"));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(DefinitionError::parse("job name must not be empty"));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(DefinitionError::parse(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
        }

        let jobs = self
            .jobs
            .iter()
            .map(|job| job.to_template().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        // Unknown dependencies and cycles are load-time errors
        DependencyGraph::build(&jobs)?;

        Ok(PipelineDefinition {
            name: self.name.clone(),
            triggers: parse_triggers(self.triggers.as_ref())?,
            env: string_map(&self.env, "pipeline env")?,
            concurrency: self.concurrency,
            default_timeout: self.defaults.timeout_secs.map(Duration::from_secs),
            jobs,
        })
    }
}

/// Parse and validate a pipeline definition from YAML source
pub fn load(source: &str) -> Result<PipelineDefinition> {
    PipelineConfig::from_yaml(source)?.to_definition()
}

/// Read, parse and validate a pipeline definition file
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<PipelineDefinition> {
    PipelineConfig::from_file(path)?.to_definition()
}

impl JobConfig {
    fn to_template(&self) -> Result<JobTemplate> {
        let location = format!("job '{}'", self.name);

        if self.steps.is_empty() {
            return Err(DefinitionError::parse(format!("{} has no steps", location)));
        }

        let matrix = self
            .matrix
            .as_ref()
            .map(|m| parse_matrix(m, &location))
            .transpose()?;
        let axes = matrix.as_ref().map(MatrixSpec::axis_names).unwrap_or_default();

        let needs: Vec<Dependency> = match &self.needs {
            None => Vec::new(),
            Some(NeedsConfig::One(name)) => vec![NeedConfig::Name(name.clone()).to_dependency()],
            Some(NeedsConfig::Many(list)) => list.iter().map(NeedConfig::to_dependency).collect(),
        };
        if needs.iter().any(|d| d.job == self.name) {
            return Err(DefinitionError::parse(format!(
                "{} has a self-referential dependency",
                location
            )));
        }

        let runs_on = match (self.runs_on.as_deref(), &self.container) {
            (None | Some("native"), None) => RuntimeTarget::Native,
            (None | Some("container"), Some(image)) => RuntimeTarget::Container {
                image: image.clone(),
            },
            (Some("container"), None) => {
                return Err(DefinitionError::parse(format!(
                    "{} runs in a container but declares no 'container' image",
                    location
                )))
            }
            (Some("native"), Some(_)) => {
                return Err(DefinitionError::parse(format!(
                    "{} declares a container image but runs_on is 'native'",
                    location
                )))
            }
            (Some(other), _) => {
                return Err(DefinitionError::parse(format!(
                    "{} has unknown runtime target '{}'",
                    location, other
                )))
            }
        };
        if let RuntimeTarget::Container { image } = &runs_on {
            check_placeholders(image, &axes, &location)?;
        }

        let condition = self
            .condition
            .as_deref()
            .map(|src| parse_condition(src, &axes, &location))
            .transpose()?;

        let env = string_map(&self.env, &location)?;
        for value in env.values() {
            check_placeholders(value, &axes, &location)?;
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut built_image = false;
        for (index, step) in self.steps.iter().enumerate() {
            let template = step.to_template(index, &axes, &location)?;
            match &template.action {
                StepAction::BuildContainer { .. } => built_image = true,
                StepAction::RunContainer { image: None, .. } if !built_image => {
                    return Err(DefinitionError::parse(format!(
                        "{} step '{}' runs a container without an image and no earlier build-container step",
                        location, template.name
                    )));
                }
                _ => {}
            }
            steps.push(template);
        }

        Ok(JobTemplate {
            name: self.name.clone(),
            steps,
            matrix,
            needs,
            runs_on,
            condition,
            continue_on_error: self.continue_on_error,
            fail_fast: self.fail_fast,
            env,
        })
    }
}

impl StepConfig {
    fn to_template(&self, index: usize, axes: &[String], job_location: &str) -> Result<StepTemplate> {
        let name = self
            .name
            .clone()
            .or_else(|| {
                self.run
                    .as_deref()
                    .and_then(|r| r.lines().next())
                    .map(|line| line.trim().to_string())
            })
            .or_else(|| self.uses.clone())
            .unwrap_or_else(|| format!("step {}", index + 1));
        let location = format!("{} step '{}'", job_location, name);

        let action = self.parse_action(&location)?;
        for template in action.templates() {
            check_placeholders(template, axes, &location)?;
        }

        let condition = self
            .condition
            .as_deref()
            .map(|src| parse_condition(src, axes, &location))
            .transpose()?;

        let env = string_map(&self.env, &location)?;
        for value in env.values() {
            check_placeholders(value, axes, &location)?;
        }
        for artifact in &self.artifacts {
            check_placeholders(artifact, axes, &location)?;
        }

        let coverage = self.coverage.as_ref().map(|c| CoverageSpec {
            report: c.report.clone(),
            fail_on_error: c.fail_on_error,
        });
        if let Some(coverage) = &coverage {
            check_placeholders(&coverage.report, axes, &location)?;
        }

        if self.timeout_secs == Some(0) {
            return Err(DefinitionError::parse(format!(
                "{} has a zero timeout",
                location
            )));
        }

        Ok(StepTemplate {
            name,
            action,
            condition,
            policy: StepPolicy {
                always: self.always,
                continue_on_error: self.continue_on_error,
            },
            timeout: self.timeout_secs.map(Duration::from_secs),
            env,
            artifacts: self.artifacts.clone(),
            coverage,
        })
    }

    fn parse_action(&self, location: &str) -> Result<StepAction> {
        let kind = match self.uses.as_deref() {
            Some(uses) => ActionKind::from_name(uses).ok_or_else(|| {
                DefinitionError::parse(format!("{} uses unknown action kind '{}'", location, uses))
            })?,
            None if self.run.is_some() => ActionKind::RunCommand,
            None => {
                return Err(DefinitionError::parse(format!(
                    "{} has neither 'run' nor 'uses'",
                    location
                )))
            }
        };

        if self.run.is_some() && kind != ActionKind::RunCommand {
            return Err(DefinitionError::parse(format!(
                "{} combines 'run' with action '{}'",
                location, kind
            )));
        }

        let param = |key: &str| -> Result<Option<String>> {
            match self.params.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => scalar_to_string(value).map(Some).ok_or_else(|| {
                    DefinitionError::parse(format!(
                        "{} parameter '{}' must be a scalar",
                        location, key
                    ))
                }),
            }
        };
        let required = |key: &str| -> Result<String> {
            param(key)?.ok_or_else(|| {
                DefinitionError::parse(format!(
                    "{} ({}) is missing required parameter '{}'",
                    location, kind, key
                ))
            })
        };

        let action = match kind {
            ActionKind::RunCommand => {
                let command = match &self.run {
                    Some(run) => run.clone(),
                    None => required("command")?,
                };
                if command.trim().is_empty() {
                    return Err(DefinitionError::parse(format!(
                        "{} has an empty command",
                        location
                    )));
                }
                StepAction::RunCommand { command }
            }
            ActionKind::SetUpTool => StepAction::SetUpTool {
                tool: required("tool")?,
                version: param("version")?,
            },
            ActionKind::BuildContainer => {
                let build_args = match self.params.get("build_args") {
                    None | Some(Value::Null) => BTreeMap::new(),
                    Some(Value::Mapping(map)) => map
                        .iter()
                        .map(|(k, v)| match (k.as_str(), scalar_to_string(v)) {
                            (Some(k), Some(v)) => Ok((k.to_string(), v)),
                            _ => Err(DefinitionError::parse(format!(
                                "{} build_args must map names to scalars",
                                location
                            ))),
                        })
                        .collect::<Result<BTreeMap<_, _>>>()?,
                    Some(_) => {
                        return Err(DefinitionError::parse(format!(
                            "{} build_args must be a mapping",
                            location
                        )))
                    }
                };
                StepAction::BuildContainer {
                    file: required("file")?,
                    context: param("context")?.unwrap_or_else(|| ".".to_string()),
                    tag: param("tag")?,
                    build_args,
                }
            }
            ActionKind::RunContainer => {
                let args = match self.params.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Sequence(seq)) => seq
                        .iter()
                        .map(|v| {
                            scalar_to_string(v).ok_or_else(|| {
                                DefinitionError::parse(format!(
                                    "{} args must be scalars",
                                    location
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Some(value) => scalar_to_string(value)
                        .map(|s| split_words(&s))
                        .ok_or_else(|| {
                            DefinitionError::parse(format!(
                                "{} args must be a string or a list",
                                location
                            ))
                        })?,
                };
                StepAction::RunContainer {
                    image: param("image")?,
                    args,
                }
            }
        };

        Ok(action)
    }
}

fn parse_condition(source: &str, axes: &[String], location: &str) -> Result<Condition> {
    let condition =
        Condition::parse(source).map_err(|message| DefinitionError::condition(location, message))?;
    if let Some(unbound) = condition.first_unbound(axes) {
        return Err(DefinitionError::condition(
            location,
            format!("reference to unbound matrix variable '{}'", unbound),
        ));
    }
    Ok(condition)
}

fn check_placeholders(template: &str, axes: &[String], location: &str) -> Result<()> {
    match placeholders(template)
        .into_iter()
        .find(|axis| !axes.contains(axis))
    {
        Some(unbound) => Err(DefinitionError::condition(
            location,
            format!("reference to unbound matrix variable '{}'", unbound),
        )),
        None => Ok(()),
    }
}

fn parse_matrix(mapping: &Mapping, location: &str) -> Result<MatrixSpec> {
    let mut spec = MatrixSpec::default();
    let mut exclude_value = None;

    for (key, value) in mapping {
        let name = key.as_str().ok_or_else(|| {
            DefinitionError::parse(format!("{} matrix axis names must be strings", location))
        })?;

        if name == "exclude" {
            exclude_value = Some(value);
            continue;
        }

        let seq = value.as_sequence().ok_or_else(|| {
            DefinitionError::parse(format!(
                "{} matrix axis '{}' must be a list of values",
                location, name
            ))
        })?;
        if seq.is_empty() {
            return Err(DefinitionError::parse(format!(
                "{} matrix axis '{}' has no values",
                location, name
            )));
        }

        let mut values = Vec::with_capacity(seq.len());
        for item in seq {
            let value = scalar_to_string(item).ok_or_else(|| {
                DefinitionError::parse(format!(
                    "{} matrix axis '{}' values must be scalars",
                    location, name
                ))
            })?;
            if values.contains(&value) {
                return Err(DefinitionError::parse(format!(
                    "{} matrix axis '{}' repeats value '{}'",
                    location, name, value
                )));
            }
            values.push(value);
        }

        spec.axes.push(MatrixAxis {
            name: name.to_string(),
            values,
        });
    }

    if spec.axes.is_empty() {
        return Err(DefinitionError::parse(format!(
            "{} declares a matrix without axes",
            location
        )));
    }

    if let Some(exclude) = exclude_value {
        let entries = exclude.as_sequence().ok_or_else(|| {
            DefinitionError::parse(format!("{} matrix exclude must be a list", location))
        })?;
        for entry in entries {
            let map = entry.as_mapping().ok_or_else(|| {
                DefinitionError::parse(format!(
                    "{} matrix exclude entries must be mappings",
                    location
                ))
            })?;
            let mut partial = Vec::with_capacity(map.len());
            for (k, v) in map {
                let (axis, value) = match (k.as_str(), scalar_to_string(v)) {
                    (Some(axis), Some(value)) => (axis.to_string(), value),
                    _ => {
                        return Err(DefinitionError::parse(format!(
                            "{} matrix exclude entries must map axes to scalars",
                            location
                        )))
                    }
                };
                if !spec.axes.iter().any(|a| a.name == axis) {
                    return Err(DefinitionError::parse(format!(
                        "{} matrix exclude references unknown axis '{}'",
                        location, axis
                    )));
                }
                partial.push((axis, value));
            }
            spec.exclude.push(partial);
        }
    }

    if matrix::expand_bindings(Some(&spec)).is_empty() {
        return Err(DefinitionError::parse(format!(
            "{} matrix exclusions remove every combination",
            location
        )));
    }

    Ok(spec)
}

fn parse_triggers(value: Option<&Value>) -> Result<Triggers> {
    let rule = |event: &str| TriggerRule {
        event: event.to_string(),
        branches: Vec::new(),
    };

    let rules = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(event)) => vec![rule(event)],
        Some(Value::Sequence(events)) => events
            .iter()
            .map(|e| {
                e.as_str()
                    .map(rule)
                    .ok_or_else(|| DefinitionError::parse("trigger event names must be strings"))
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Mapping(map)) => {
            let mut rules = Vec::with_capacity(map.len());
            for (event, filter) in map {
                let event = event
                    .as_str()
                    .ok_or_else(|| DefinitionError::parse("trigger event names must be strings"))?;
                let branches = match filter.get("branches") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Sequence(seq)) => seq
                        .iter()
                        .map(|b| {
                            scalar_to_string(b).ok_or_else(|| {
                                DefinitionError::parse(format!(
                                    "trigger '{}' branches must be strings",
                                    event
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Some(_) => {
                        return Err(DefinitionError::parse(format!(
                            "trigger '{}' branches must be a list",
                            event
                        )))
                    }
                };
                rules.push(TriggerRule {
                    event: event.to_string(),
                    branches,
                });
            }
            rules
        }
        Some(_) => return Err(DefinitionError::parse("unsupported 'on' trigger format")),
    };

    Ok(Triggers { rules })
}

fn string_map(values: &HashMap<String, Value>, location: &str) -> Result<HashMap<String, String>> {
    values
        .iter()
        .map(|(key, value)| {
            scalar_to_string(value)
                .map(|v| (key.clone(), v))
                .ok_or_else(|| {
                    DefinitionError::parse(format!(
                        "{} env '{}' must be a scalar",
                        location, key
                    ))
                })
        })
        .collect()
}

/// Render a YAML scalar as written; `None` for mappings, sequences and null
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
