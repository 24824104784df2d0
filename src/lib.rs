//! cirun - a declarative CI pipeline runner with matrix expansion and
//! bounded parallel execution

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod report;
pub mod runtime;

// Re-export commonly used types
pub use core::{
    load, load_file, DefinitionError, InstanceState, JobInstance, PipelineDefinition,
    PipelineStatus, TriggerEvent,
};
pub use execution::{EngineConfig, EngineError, ExecutionEngine, ExecutionEvent, ExecutionResult};
pub use report::PipelineOutcome;
pub use runtime::{ArtifactPublisher, CommandRunner, ContainerRuntime, CoverageReporter};
