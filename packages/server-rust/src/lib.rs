//! portalfed server: federates service provider instances behind one
//! orchestration engine with health monitoring, circuit breaking, routing,
//! DAG workflow execution, result correlation and a per-session ledger.

pub mod network;
pub mod service;
pub mod traits;
pub mod transport;

pub use service::{
    ControlError, ExecutionStatus, Orchestrator, OrchestratorBuilder, OrchestratorConfig,
    SubmitError,
};
pub use traits::{AuthProvider, SpTransport};
pub use transport::{HttpTransport, ScriptedTransport, SpRequest, SpResponse};
