//! Structural errors raised while loading a pipeline definition

use thiserror::Error;

/// Errors that abort a run before any job is scheduled
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// Malformed structure: unknown action kind, missing parameter, bad matrix...
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read pipeline definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    /// Malformed condition or a reference to an undeclared matrix axis
    #[error("condition error in {location}: {message}")]
    Condition { location: String, message: String },
}

impl DefinitionError {
    pub fn parse(message: impl Into<String>) -> Self {
        DefinitionError::Parse(message.into())
    }

    pub fn condition(location: impl Into<String>, message: impl Into<String>) -> Self {
        DefinitionError::Condition {
            location: location.into(),
            message: message.into(),
        }
    }

    /// True for the graph-build errors (cycle / unknown dependency)
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            DefinitionError::Cycle { .. } | DefinitionError::UnknownDependency { .. }
        )
    }
}
