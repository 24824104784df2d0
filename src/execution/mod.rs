//! Pipeline execution engine

pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod result;
pub mod scheduler;

pub use config::EngineConfig;
pub use engine::{EngineError, ExecutionEngine};
pub use events::{EventHandler, ExecutionEvent};
pub use executor::{Collaborators, InstanceExecutor, RunContext};
pub use result::{ArtifactRef, ExecutionResult, StepRecord};
pub use scheduler::Scheduler;
