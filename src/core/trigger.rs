//! Trigger predicate: which external events start a run

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// External event descriptor handed to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Event kind, e.g. `push` or `pull_request`
    pub kind: String,

    /// Free-form metadata (`branch`, `sha`, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TriggerEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One `on:` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub event: String,

    /// Branch patterns; empty matches every branch
    pub branches: Vec<String>,
}

impl TriggerRule {
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if self.event != event.kind {
            return false;
        }
        if self.branches.is_empty() {
            return true;
        }
        match event.metadata.get("branch") {
            Some(branch) => self.branches.iter().any(|p| branch_matches(p, branch)),
            None => false,
        }
    }
}

fn branch_matches(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => pattern == branch,
    }
}

/// The pipeline's global trigger predicate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triggers {
    pub rules: Vec<TriggerRule>,
}

impl Triggers {
    /// No rules means every event starts a run
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|rule| rule.matches(event))
    }
}
