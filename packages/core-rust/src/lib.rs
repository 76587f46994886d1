//! `PortalFed` Core: data model and pure algorithms for the orchestration
//! engine: instances, operations, workflow graphs, and result correlation.

pub mod clock;
pub mod correlate;
pub mod instance;
pub mod operation;
pub mod templates;
pub mod traits;
pub mod workflow;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use correlate::{
    CorrelatedResult, CorrelationConfig, Correlator, FieldConflict, OverriddenValue,
    ResolutionRule, SourceRef,
};
pub use instance::{
    AuthDescriptor, EndpointSpec, HealthState, HttpMethod, InstanceSpec, ServiceProviderInstance,
};
pub use operation::{Backoff, Operation, RetryPolicy};
pub use templates::{TemplateError, TemplateKind, TemplateOptions};
pub use traits::{InsightProvider, InsightRequest, IntentParser, ParsedIntent};
pub use workflow::{
    AttemptRecord, CallOutcome, FailureReason, StepFailure, StepPhase, StepResult, StepStatus,
    Workflow, WorkflowBuilder, WorkflowDefinition, WorkflowError, WorkflowResult, WorkflowStatus,
    WorkflowStep, DEFAULT_SESSION,
};
