//! The orchestration engine.
//!
//! Leaf-first:
//!
//! 1. **Registry** (`registry`): instance metadata and health fields
//! 2. **Health** (`health`): background probing
//! 3. **Breakers** (`breaker`): per-instance call gating
//! 4. **Routing** (`router`): candidate ranking and the failover chain,
//!    every call passing through the tower stack in `middleware`
//! 5. **Execution** (`executor`): DAG scheduling, retries, confirmation
//! 6. **Ledger** (`ledger`): per-session record of terminal step results
//! 7. **Facade** (`orchestrator`): submissions, control, lifecycle

pub mod breaker;
pub mod config;
pub mod executor;
pub mod health;
pub mod ledger;
pub mod lifecycle;
pub mod middleware;
pub mod orchestrator;
pub mod registry;
pub mod router;

pub use breaker::{BreakerBoard, BreakerPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use config::{
    BreakerConfig, ConfigError, ExecutorConfig, HealthConfig, OrchestratorConfig, RetryConfig,
    RoutingConfig, RoutingPolicy,
};
pub use executor::{
    AlreadyRunning, ControlError, ExecutionControl, ExecutionStatus, StepView, WorkflowExecutor,
};
pub use health::{HealthMonitor, HealthProbeWorker, ProbeTask};
pub use ledger::{Ledger, LedgerEntry, Session};
pub use lifecycle::{LifecycleController, Phase, SubmissionGuard};
pub use orchestrator::{InstanceView, Orchestrator, OrchestratorBuilder, SubmitError};
pub use registry::{RegistryError, RegistrySummary, SpRegistry};
pub use router::{Dispatched, RouteError, SpRouter};
