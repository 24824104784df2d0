//! Execution events delivered to registered handlers

use crate::core::{InstanceId, InstanceState, PipelineStatus, StepStatus};
use std::sync::Arc;
use uuid::Uuid;

/// Events that can occur during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        total_instances: usize,
    },
    InstanceStarted {
        id: InstanceId,
        label: String,
    },
    StepStarted {
        id: InstanceId,
        label: String,
        step: String,
    },
    StepFinished {
        id: InstanceId,
        label: String,
        step: String,
        status: StepStatus,
    },
    InstanceFinished {
        id: InstanceId,
        label: String,
        state: InstanceState,
    },
    PipelineFinished {
        execution_id: Uuid,
        status: PipelineStatus,
        cancelled: bool,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Cheap-to-clone fan-out over the registered handlers
#[derive(Clone, Default)]
pub struct EventSink {
    handlers: Arc<Vec<EventHandler>>,
}

impl EventSink {
    pub fn new(handlers: Vec<EventHandler>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        for handler in self.handlers.iter() {
            handler(event.clone());
        }
    }
}
