//! Workflow graphs and their outcomes.

pub mod graph;
pub mod result;

pub use graph::{
    Workflow, WorkflowBuilder, WorkflowDefinition, WorkflowError, WorkflowStep, DEFAULT_SESSION,
};
pub use result::{
    AttemptRecord, CallOutcome, FailureReason, StepFailure, StepPhase, StepResult, StepStatus,
    WorkflowResult, WorkflowStatus,
};
