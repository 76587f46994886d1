//! The engine facade.
//!
//! [`Orchestrator`] wires the registry, breakers, router, executor, ledger
//! and correlator together and is the only type an outer layer (HTTP, CLI,
//! embedding application) needs to hold.

use std::sync::Arc;
use std::time::Duration;

use portalfed_core::templates::{self, TemplateKind, TemplateOptions};
use portalfed_core::{
    ClockSource, Correlator, HealthState, InsightProvider, InsightRequest, InstanceSpec,
    IntentParser, Operation, ParsedIntent, StepResult, SystemClock, TemplateError, Workflow,
    WorkflowDefinition, WorkflowError, WorkflowResult,
};
use serde::Serialize;
use tracing::{info, warn};

use super::breaker::{BreakerBoard, CircuitState};
use super::config::{ConfigError, OrchestratorConfig};
use super::executor::{ControlError, ExecutionStatus, WorkflowExecutor};
use super::health::HealthMonitor;
use super::ledger::{Ledger, Session};
use super::lifecycle::{LifecycleController, Phase};
use super::registry::{RegistryError, RegistrySummary, SpRegistry};
use super::router::SpRouter;
use crate::traits::{AuthProvider, SpTransport};
use crate::transport::{DescriptorAuthProvider, HttpTransport};

// ---------------------------------------------------------------------------
// Errors and views
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("workflow {0} is already running")]
    DuplicateWorkflow(String),
    #[error("engine is {} and not accepting submissions", .0.as_str())]
    Draining(Phase),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("could not interpret request: {0}")]
    Unparsed(String),
}

/// Public view of one instance. Credentials are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub base_url: String,
    pub capabilities: Vec<String>,
    pub weight: u32,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    pub circuit: CircuitState,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    transport: Option<Arc<dyn SpTransport>>,
    auth: Option<Arc<dyn AuthProvider>>,
    clock: Option<Arc<dyn ClockSource>>,
    insight: Option<Arc<dyn InsightProvider>>,
}

impl OrchestratorBuilder {
    /// Defaults to reqwest transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn SpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to headers derived from each instance's auth descriptor.
    #[must_use]
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn insight(mut self, insight: Arc<dyn InsightProvider>) -> Self {
        self.insight = Some(insight);
        self
    }

    /// Validates the configuration and assembles the engine in the Ready
    /// phase.
    ///
    /// # Errors
    ///
    /// Any [`OrchestratorConfig::validate`] failure.
    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(
            SpRegistry::from_specs(config.instances.iter().cloned()).map_err(|e| match e {
                RegistryError::DuplicateInstance(id) => ConfigError::DuplicateInstance(id),
                RegistryError::NoCapabilities(id) => ConfigError::NoCapabilities(id),
            })?,
        );
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::default()));
        let auth = self
            .auth
            .unwrap_or_else(|| Arc::new(DescriptorAuthProvider::new(Arc::clone(&registry))));

        let breakers = Arc::new(BreakerBoard::new(config.breaker, Arc::clone(&clock)));
        let router = Arc::new(SpRouter::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&transport),
            Arc::clone(&auth),
            config.routing.clone(),
            config.retry.clone(),
        ));
        let ledger = Arc::new(Ledger::new());
        let executor = Arc::new(WorkflowExecutor::new(
            router,
            Arc::clone(&ledger),
            Arc::clone(&clock),
            config.executor,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            transport,
            auth,
            Arc::clone(&clock),
            config.health,
        ));

        let lifecycle = LifecycleController::new();
        lifecycle.set_ready();
        info!(instances = registry.len(), "orchestrator ready");

        Ok(Orchestrator {
            correlator: Correlator::new(config.correlation.clone()),
            config,
            registry,
            breakers,
            executor,
            ledger,
            health,
            lifecycle,
            insight: self.insight,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<SpRegistry>,
    breakers: Arc<BreakerBoard>,
    executor: Arc<WorkflowExecutor>,
    ledger: Arc<Ledger>,
    correlator: Correlator,
    health: Arc<HealthMonitor>,
    lifecycle: LifecycleController,
    insight: Option<Arc<dyn InsightProvider>>,
}

impl Orchestrator {
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transport: None,
            auth: None,
            clock: None,
            insight: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    // -- submissions --------------------------------------------------------

    /// Runs one operation as a single-step workflow.
    ///
    /// Routing failures come back as a Failed `StepResult`, never as an
    /// error.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has started.
    pub async fn submit_operation(
        &self,
        session_id: &str,
        operation: Operation,
    ) -> Result<StepResult, SubmitError> {
        let workflow = Workflow::single(session_id, operation);
        let result = self.submit_workflow(workflow).await?;
        result
            .steps
            .into_iter()
            .next()
            .ok_or(SubmitError::InvalidWorkflow(WorkflowError::Empty))
    }

    /// Runs a workflow to completion, then correlates its step outputs and
    /// asks the insight collaborator for advice.
    ///
    /// # Errors
    ///
    /// `Draining` once shutdown has started; `DuplicateWorkflow` when a
    /// workflow with the same id is in flight.
    pub async fn submit_workflow(&self, workflow: Workflow) -> Result<WorkflowResult, SubmitError> {
        let Some(_guard) = self.lifecycle.admit() else {
            return Err(SubmitError::Draining(self.lifecycle.phase()));
        };

        let mut result = self
            .executor
            .execute(workflow)
            .await
            .map_err(|e| SubmitError::DuplicateWorkflow(e.workflow_id))?;

        result.correlated = self.correlator.correlate_by_config(&result.steps);
        result.advisory = self.advise(&result).await;
        Ok(result)
    }

    /// Validates and runs a workflow description.
    ///
    /// # Errors
    ///
    /// `InvalidWorkflow` for construction errors, otherwise as
    /// [`Orchestrator::submit_workflow`].
    pub async fn submit_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowResult, SubmitError> {
        let workflow = Workflow::try_from(definition)?;
        self.submit_workflow(workflow).await
    }

    /// Instantiates a built-in template and runs it.
    ///
    /// # Errors
    ///
    /// `Template` when the template cannot be built, otherwise as
    /// [`Orchestrator::submit_workflow`].
    pub async fn submit_template(
        &self,
        kind: TemplateKind,
        session_id: &str,
        targets: &[String],
        options: &TemplateOptions,
    ) -> Result<WorkflowResult, SubmitError> {
        let workflow = templates::instantiate(kind, session_id, targets, options)?;
        self.submit_workflow(workflow).await
    }

    /// Hands free-form text to `parser` and runs whatever it produced. A
    /// single operation runs as a one-step workflow.
    ///
    /// # Errors
    ///
    /// `Unparsed` when the parser fails, otherwise as
    /// [`Orchestrator::submit_workflow`].
    pub async fn submit_text(
        &self,
        parser: &dyn IntentParser,
        session_id: &str,
        text: &str,
    ) -> Result<WorkflowResult, SubmitError> {
        let intent = parser
            .parse(session_id, text)
            .await
            .map_err(|e| SubmitError::Unparsed(format!("{e:#}")))?;
        let workflow = match intent {
            ParsedIntent::Operation(op) => Workflow::single(session_id, op),
            ParsedIntent::Workflow(workflow) => workflow,
        };
        self.submit_workflow(workflow).await
    }

    async fn advise(&self, result: &WorkflowResult) -> Option<String> {
        let insight = self.insight.as_ref()?;
        let request = InsightRequest {
            workflow_id: &result.workflow_id,
            session_id: &result.session_id,
            correlated: &result.correlated,
            steps: &result.steps,
        };
        let timeout = Duration::from_millis(self.config.insight_timeout_ms);
        match tokio::time::timeout(timeout, insight.advise(request)).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!(workflow_id = %result.workflow_id, error = %e, "insight provider failed");
                None
            }
            Err(_) => {
                warn!(workflow_id = %result.workflow_id, timeout_ms = self.config.insight_timeout_ms, "insight provider timed out");
                None
            }
        }
    }

    // -- control ------------------------------------------------------------

    /// # Errors
    ///
    /// See [`ControlError`].
    pub fn confirm_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        approved: bool,
    ) -> Result<(), ControlError> {
        self.executor.confirm(workflow_id, step_id, approved)
    }

    /// # Errors
    ///
    /// `UnknownWorkflow` when nothing with that id is running.
    pub fn cancel_workflow(&self, workflow_id: &str) -> Result<(), ControlError> {
        self.executor.cancel(workflow_id)
    }

    /// # Errors
    ///
    /// `UnknownWorkflow` when nothing with that id is running.
    pub fn execution_status(&self, workflow_id: &str) -> Result<ExecutionStatus, ControlError> {
        self.executor.status(workflow_id)
    }

    // -- registry -----------------------------------------------------------

    /// Adds an instance at runtime. Routing decisions made afterwards can
    /// pick it.
    ///
    /// # Errors
    ///
    /// See [`RegistryError`].
    pub fn register_instance(&self, spec: InstanceSpec) -> Result<(), RegistryError> {
        self.registry.register(spec)
    }

    /// Removes an instance and forgets its breaker.
    pub fn deregister_instance(&self, instance_id: &str) -> Option<InstanceSpec> {
        let removed = self.registry.deregister(instance_id);
        if removed.is_some() {
            self.breakers.remove(instance_id);
        }
        removed
    }

    #[must_use]
    pub fn instances(&self) -> Vec<InstanceView> {
        self.registry
            .instances()
            .into_iter()
            .map(|instance| InstanceView {
                circuit: self.breakers.state(instance.id()),
                id: instance.spec.id.clone(),
                name: instance.spec.display_name().to_string(),
                kind: instance.spec.kind.clone(),
                base_url: instance.spec.base_url.clone(),
                capabilities: instance.spec.capabilities.iter().cloned().collect(),
                weight: instance.spec.weight,
                health: instance.health,
                last_probe_ms: instance.last_probe_ms,
                last_latency_ms: instance.last_latency_ms,
            })
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        self.registry.summary()
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.ledger.session(session_id)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stops accepting submissions, waits up to `drain_timeout_ms` for the
    /// in-flight ones, then cancels whatever is still running.
    pub async fn shutdown(&self) {
        self.lifecycle.begin_drain();
        let timeout = Duration::from_millis(self.config.drain_timeout_ms);
        if self.lifecycle.wait_for_drain(timeout).await {
            info!("all submissions drained");
            return;
        }
        warn!(
            in_flight = self.lifecycle.in_flight(),
            "drain timeout elapsed, cancelling running workflows"
        );
        self.executor.cancel_all();
        self.lifecycle.wait_for_drain(timeout).await;
        self.lifecycle.mark_stopped();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use portalfed_core::{
        CorrelationConfig, FailureReason, ManualClock, StepStatus, WorkflowStatus, WorkflowStep,
    };
    use serde_json::json;

    use super::*;
    use crate::transport::{ScriptedTransport, SpResponse};

    struct NoAuth;

    #[async_trait]
    impl AuthProvider for NoAuth {
        async fn headers(&self, _instance_id: &str) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
    }

    struct Advisor;

    #[async_trait]
    impl InsightProvider for Advisor {
        async fn advise(&self, request: InsightRequest<'_>) -> anyhow::Result<String> {
            Ok(format!("{} entities reviewed", request.correlated.len()))
        }
    }

    struct BrokenAdvisor;

    #[async_trait]
    impl InsightProvider for BrokenAdvisor {
        async fn advise(&self, _request: InsightRequest<'_>) -> anyhow::Result<String> {
            anyhow::bail!("model unavailable")
        }
    }

    struct KeywordParser;

    #[async_trait]
    impl IntentParser for KeywordParser {
        async fn parse(&self, _session_id: &str, text: &str) -> anyhow::Result<ParsedIntent> {
            if text.contains("performance") {
                Ok(ParsedIntent::Operation(Operation::new(
                    "get_performance",
                    "performance",
                )))
            } else {
                anyhow::bail!("no idea what {text:?} means")
            }
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            instances: vec![
                InstanceSpec::new("core", "http://core", ["performance"]),
                InstanceSpec::new("analytics", "http://analytics", ["analytics"]),
            ],
            correlation: CorrelationConfig::default()
                .with_priority("performance", 10)
                .with_priority("analytics", 5),
            ..OrchestratorConfig::default()
        }
    }

    fn build(insight: Option<Arc<dyn InsightProvider>>) -> (Orchestrator, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let mut builder = Orchestrator::builder(config())
            .transport(transport.clone())
            .auth(Arc::new(NoAuth))
            .clock(Arc::new(ManualClock::new(10_000)));
        if let Some(insight) = insight {
            builder = builder.insight(insight);
        }
        (builder.build().unwrap(), transport)
    }

    #[tokio::test]
    async fn operation_without_capable_instance_fails_cleanly() {
        let (orch, transport) = build(None);
        let result = orch
            .submit_operation("s1", Operation::new("backup", "storage"))
            .await
            .unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.reason(), Some(FailureReason::CapabilityUnavailable));
        assert!(transport.requests().is_empty());
        assert_eq!(orch.session("s1").unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn workflow_results_are_correlated_and_advised() {
        let (orch, transport) = build(Some(Arc::new(Advisor)));
        transport.always(
            "core",
            SpResponse::success(json!({"database": "orders", "cpu_usage": 80})),
        );
        transport.always(
            "analytics",
            SpResponse::success(json!({"database": "orders", "cpu_usage": 75, "trend": "up"})),
        );

        let workflow = Workflow::builder()
            .id("review")
            .session("s1")
            .step(WorkflowStep::new(
                "perf",
                Operation::new("get_performance", "performance"),
            ))
            .step(WorkflowStep::new(
                "trend",
                Operation::new("get_trends", "analytics"),
            ))
            .build()
            .unwrap();
        let result = orch.submit_workflow(workflow).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.correlated.len(), 1);
        let orders = &result.correlated[0];
        assert_eq!(orders.fields["cpu_usage"], json!(80));
        assert_eq!(orders.fields["trend"], json!("up"));
        assert_eq!(orders.conflicts.len(), 1);
        assert_eq!(result.advisory.as_deref(), Some("1 entities reviewed"));
    }

    #[tokio::test]
    async fn failing_insight_provider_is_ignored() {
        let (orch, transport) = build(Some(Arc::new(BrokenAdvisor)));
        transport.always("core", SpResponse::success(json!({})));
        let result = orch
            .submit_operation("s1", Operation::new("get_performance", "performance"))
            .await
            .unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn text_goes_through_the_intent_parser() {
        let (orch, transport) = build(None);
        transport.always("core", SpResponse::success(json!({"cpu": 3})));

        let result = orch
            .submit_text(&KeywordParser, "s1", "how is performance today?")
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.steps[0].served_by.as_deref(), Some("core"));

        let err = orch
            .submit_text(&KeywordParser, "s1", "make coffee")
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Unparsed(msg) if msg.contains("coffee")));
        assert_eq!(transport.calls_to("analytics"), 0);
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected() {
        let (orch, _transport) = build(None);
        let definition = WorkflowDefinition {
            id: None,
            session_id: "s1".into(),
            steps: vec![
                WorkflowStep::new("a", Operation::new("x", "performance")).after(["b"]),
                WorkflowStep::new("b", Operation::new("y", "performance")).after(["a"]),
            ],
        };
        assert!(matches!(
            orch.submit_definition(definition).await,
            Err(SubmitError::InvalidWorkflow(WorkflowError::Cycle { .. }))
        ));
    }

    #[tokio::test]
    async fn runtime_registration_feeds_routing() {
        let (orch, transport) = build(None);
        transport.always("store-1", SpResponse::success(json!({"ok": true})));

        orch.register_instance(InstanceSpec::new("store-1", "http://store", ["storage"]))
            .unwrap();
        let result = orch
            .submit_operation("s1", Operation::new("backup", "storage"))
            .await
            .unwrap();
        assert_eq!(result.served_by.as_deref(), Some("store-1"));
        assert_eq!(orch.summary().total, 3);

        assert!(orch.deregister_instance("store-1").is_some());
        assert!(orch.instances().iter().all(|i| i.id != "store-1"));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let (orch, _transport) = build(None);
        orch.shutdown().await;
        assert_eq!(orch.lifecycle().phase(), Phase::Stopped);
        assert!(matches!(
            orch.submit_operation("s1", Operation::new("get_performance", "performance"))
                .await,
            Err(SubmitError::Draining(Phase::Stopped))
        ));
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let mut bad = config();
        bad.instances
            .push(InstanceSpec::new("core", "http://dup", ["performance"]));
        assert!(matches!(
            Orchestrator::builder(bad).build(),
            Err(ConfigError::DuplicateInstance(id)) if id == "core"
        ));
    }
}
