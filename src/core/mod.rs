//! Core domain models for cirun
//!
//! This module defines the pipeline definition model and the pure
//! operations over it: loading, matrix expansion, condition evaluation
//! and dependency graph construction.

pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod graph;
pub mod matrix;
pub mod state;
pub mod trigger;

pub use condition::Condition;
pub use config::{load, load_file, PipelineConfig};
pub use context::Bindings;
pub use definition::*;
pub use error::DefinitionError;
pub use graph::DependencyGraph;
pub use matrix::{expand, expand_all, InstanceId, JobInstance, ResolvedStep};
pub use state::*;
pub use trigger::{TriggerEvent, TriggerRule, Triggers};
