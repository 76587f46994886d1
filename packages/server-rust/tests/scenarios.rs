//! End-to-end behaviour of the engine through the `Orchestrator` facade,
//! with a scripted transport standing in for service providers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use portalfed_core::{
    Backoff, CallOutcome, CorrelationConfig, FailureReason, HealthState, InstanceSpec, ManualClock,
    Operation, RetryPolicy, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
};
use portalfed_server::service::{
    BreakerConfig, CircuitState, ExecutorConfig, Orchestrator, OrchestratorConfig, RetryConfig,
};
use portalfed_server::{AuthProvider, ScriptedTransport, SpResponse};
use serde_json::json;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    async fn headers(&self, _instance_id: &str) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

struct Engine {
    orchestrator: Orchestrator,
    transport: Arc<ScriptedTransport>,
    clock: Arc<ManualClock>,
}

fn base_config(instances: Vec<InstanceSpec>) -> OrchestratorConfig {
    OrchestratorConfig {
        instances,
        retry: RetryConfig {
            default: RetryPolicy::new(3, Backoff::none()),
            ..RetryConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

fn engine(config: OrchestratorConfig) -> Engine {
    let transport = Arc::new(ScriptedTransport::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let orchestrator = Orchestrator::builder(config)
        .transport(transport.clone())
        .auth(Arc::new(NoAuth))
        .clock(clock.clone())
        .build()
        .unwrap();
    Engine {
        orchestrator,
        transport,
        clock,
    }
}

fn circuit(orch: &Orchestrator, instance_id: &str) -> CircuitState {
    orch.instances()
        .into_iter()
        .find(|i| i.id == instance_id)
        .map(|i| i.circuit)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_capability_never_contacts_a_provider() {
    let e = engine(base_config(vec![InstanceSpec::new(
        "i1",
        "http://i1",
        ["compute"],
    )]));

    let result = e
        .orchestrator
        .submit_operation(
            "s1",
            Operation::new("take_snapshot", "storage").idempotent(true),
        )
        .await
        .unwrap();

    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.reason(), Some(FailureReason::CapabilityUnavailable));
    assert_eq!(result.attempts, 0);
    assert!(e.transport.requests().is_empty());
}

#[tokio::test]
async fn consecutive_failures_open_the_circuit_until_the_cooldown() {
    let mut config = base_config(vec![InstanceSpec::new("i1", "http://i1", ["get_metrics"])]);
    config.breaker = BreakerConfig {
        failure_threshold: 3,
        failure_window_ms: 60_000,
        base_cooldown_ms: 10_000,
        max_cooldown_ms: 60_000,
    };
    let e = engine(config);
    e.transport
        .push("i1", vec![SpResponse::from_status(503, json!(null)); 3]);
    e.transport
        .always("i1", SpResponse::success(json!({"cpu": 1})));
    let op = || Operation::new("read_metrics", "get_metrics");

    for expected in [
        CircuitState::Closed,
        CircuitState::Closed,
        CircuitState::Open,
    ] {
        let result = e.orchestrator.submit_operation("s1", op()).await.unwrap();
        assert_eq!(result.reason(), Some(FailureReason::AllCandidatesExhausted));
        assert_eq!(circuit(&e.orchestrator, "i1"), expected);
    }

    let blocked = e.orchestrator.submit_operation("s1", op()).await.unwrap();
    assert_eq!(blocked.status, StepStatus::Failed);
    let attempts = &blocked.failure.as_ref().unwrap().attempts;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, CallOutcome::CircuitOpen);
    assert_eq!(e.transport.calls_to("i1"), 3);

    // Once the cool-down elapses a single trial call goes through and its
    // success closes the circuit.
    e.clock.advance(10_000);
    let recovered = e.orchestrator.submit_operation("s1", op()).await.unwrap();
    assert!(recovered.is_success());
    assert_eq!(circuit(&e.orchestrator, "i1"), CircuitState::Closed);
    assert_eq!(e.transport.calls_to("i1"), 4);
}

#[tokio::test]
async fn failed_step_skips_every_descendant_but_not_siblings() {
    let e = engine(base_config(vec![
        InstanceSpec::new("db", "http://db", ["database"]),
        InstanceSpec::new("mon", "http://mon", ["monitoring"]),
    ]));
    e.transport
        .always("db", SpResponse::from_status(500, json!({"error": "boom"})));
    e.transport
        .always("mon", SpResponse::success(json!({"ok": true})));

    let workflow = Workflow::builder()
        .session("s1")
        .step(WorkflowStep::new("a", Operation::new("dump", "database")))
        .step(WorkflowStep::new("b", Operation::new("check", "monitoring")).after(["a"]))
        .step(WorkflowStep::new("c", Operation::new("report", "monitoring")).after(["b"]))
        .step(WorkflowStep::new(
            "d",
            Operation::new("status", "monitoring"),
        ))
        .build()
        .unwrap();
    let result = e.orchestrator.submit_workflow(workflow).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::PartiallyFailed);
    assert_eq!(result.step("a").unwrap().status, StepStatus::Failed);
    for id in ["b", "c"] {
        let step = result.step(id).unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert_eq!(step.reason(), Some(FailureReason::DependencyFailed));
    }
    assert_eq!(result.step("d").unwrap().status, StepStatus::Succeeded);
    assert_eq!(e.transport.calls_to("mon"), 1);
}

#[tokio::test]
async fn idempotent_operations_retry_in_place_before_failover() {
    let e = engine(base_config(vec![
        InstanceSpec::new("i1", "http://i1", ["compute"]),
        InstanceSpec::new("i2", "http://i2", ["compute"]),
    ]));
    e.transport
        .always("i1", SpResponse::from_status(502, json!(null)));
    e.transport
        .always("i2", SpResponse::success(json!({"vms": []})));

    let result = e
        .orchestrator
        .submit_operation("s1", Operation::new("list_vms", "compute").idempotent(true))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.served_by.as_deref(), Some("i2"));
    assert_eq!(e.transport.calls_to("i1"), 3);
    assert_eq!(e.transport.calls_to("i2"), 1);
    assert_eq!(result.attempts, 4);
}

#[tokio::test]
async fn non_idempotent_operations_fail_over_after_one_attempt() {
    let e = engine(base_config(vec![
        InstanceSpec::new("i1", "http://i1", ["compute"]),
        InstanceSpec::new("i2", "http://i2", ["compute"]),
    ]));
    e.transport.always("i1", SpResponse::timeout("no answer"));
    e.transport
        .always("i2", SpResponse::success(json!({"vm": "web-3"})));

    let result = e
        .orchestrator
        .submit_operation("s1", Operation::new("create_vm", "compute"))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(e.transport.calls_to("i1"), 1);
    assert_eq!(e.transport.calls_to("i2"), 1);
}

#[tokio::test]
async fn correlation_is_deterministic_across_runs() {
    let instances = vec![
        InstanceSpec::new("ops", "http://ops", ["performance"]),
        InstanceSpec::new("bi", "http://bi", ["analytics"]),
    ];
    let mut config = base_config(instances);
    config.correlation = CorrelationConfig::default()
        .with_priority("performance", 10)
        .with_priority("analytics", 5);

    let run = || async {
        let e = engine(config.clone());
        e.transport.always(
            "ops",
            SpResponse::success(json!({"database": "orders", "cpu_usage": 80, "qps": 120})),
        );
        e.transport.always(
            "bi",
            SpResponse::success(json!({"database": "orders", "cpu_usage": 75, "trend": "up"})),
        );
        let workflow = Workflow::builder()
            .id("review")
            .session("s1")
            .step(WorkflowStep::new(
                "bi",
                Operation::new("get_trends", "analytics"),
            ))
            .step(WorkflowStep::new(
                "ops",
                Operation::new("get_performance", "performance"),
            ))
            .build()
            .unwrap();
        e.orchestrator
            .submit_workflow(workflow)
            .await
            .unwrap()
            .correlated
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
    assert_eq!(first[0].fields["qps"], json!(120));
    assert_eq!(first[0].fields["trend"], json!("up"));
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependent_step_runs_after_its_dependency() {
    let e = engine(base_config(vec![InstanceSpec::new(
        "i1",
        "http://i1",
        ["compute"],
    )]));
    e.transport
        .always("i1", SpResponse::success(json!({"ok": true})));

    let workflow = Workflow::builder()
        .id("provision")
        .session("s1")
        .step(WorkflowStep::new(
            "A",
            Operation::new("list_vms", "compute").idempotent(true),
        ))
        .step(WorkflowStep::new("B", Operation::new("create_vm", "compute")).after(["A"]))
        .build()
        .unwrap();
    let result = e.orchestrator.submit_workflow(workflow).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(result.step("A").unwrap().served_by.as_deref(), Some("i1"));
    let a_done = result.step("A").unwrap().completed_at_ms;
    assert!(result.step("B").unwrap().completed_at_ms >= a_done);

    let ledger = e.orchestrator.session("s1").unwrap();
    assert_eq!(ledger.entries.len(), 2);
    assert!(ledger
        .entries
        .iter()
        .all(|entry| entry.workflow_id == "provision"));
}

#[tokio::test]
async fn open_circuit_routes_straight_to_the_healthy_instance() {
    let mut config = base_config(vec![
        InstanceSpec::new("i1", "http://i1", ["get_metrics"]),
        InstanceSpec::new("i2", "http://i2", ["get_metrics"]),
    ]);
    config.breaker.failure_threshold = 1;
    let e = engine(config);
    e.transport
        .push("i1", [SpResponse::from_status(500, json!(null))]);
    e.transport
        .always("i2", SpResponse::success(json!({"cpu": 4})));

    // Trip i1.
    let first = e
        .orchestrator
        .submit_operation("s1", Operation::new("read", "get_metrics"))
        .await
        .unwrap();
    assert_eq!(first.served_by.as_deref(), Some("i2"));
    assert_eq!(circuit(&e.orchestrator, "i1"), CircuitState::Open);
    let before = e.transport.requests().len();

    let result = e
        .orchestrator
        .submit_operation("s1", Operation::new("read", "get_metrics"))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.served_by.as_deref(), Some("i2"));
    assert_eq!(result.attempts, 1);
    let sent: Vec<String> = e.transport.requests()[before..]
        .iter()
        .map(|r| r.instance_id.clone())
        .collect();
    assert_eq!(sent, vec!["i2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_step_times_out_and_skips_its_dependents() {
    let mut config = base_config(vec![InstanceSpec::new("i1", "http://i1", ["compute"])]);
    config.executor = ExecutorConfig {
        confirmation_timeout_ms: 5_000,
        ..ExecutorConfig::default()
    };
    let e = engine(config);
    e.transport
        .always("i1", SpResponse::success(json!({"ok": true})));

    let workflow = Workflow::builder()
        .session("s1")
        .step(WorkflowStep::new(
            "prepare",
            Operation::new("list_vms", "compute"),
        ))
        .step(
            WorkflowStep::new("C", Operation::new("delete_vm", "compute"))
                .after(["prepare"])
                .requires_confirmation(true),
        )
        .step(WorkflowStep::new("D", Operation::new("audit", "compute")).after(["C"]))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let result = e.orchestrator.submit_workflow(workflow).await.unwrap();
    assert!(started.elapsed() >= std::time::Duration::from_secs(5));

    let c = result.step("C").unwrap();
    assert_eq!(c.status, StepStatus::Skipped);
    assert_eq!(c.reason(), Some(FailureReason::ConfirmationTimeout));
    let d = result.step("D").unwrap();
    assert_eq!(d.status, StepStatus::Skipped);
    assert_eq!(d.reason(), Some(FailureReason::DependencyFailed));
    assert_eq!(e.transport.calls_to("i1"), 1);
}

#[tokio::test]
async fn conflicting_cpu_usage_prefers_the_higher_priority_source() {
    let mut config = base_config(vec![
        InstanceSpec::new("ops", "http://ops", ["performance"]),
        InstanceSpec::new("bi", "http://bi", ["analytics"]),
    ]);
    config.correlation = CorrelationConfig::default()
        .with_priority("performance", 10)
        .with_priority("analytics", 5);
    let e = engine(config);
    e.transport.always(
        "ops",
        SpResponse::success(json!({"database": "orders", "cpu_usage": 80})),
    );
    e.transport.always(
        "bi",
        SpResponse::success(json!({"database": "orders", "cpu_usage": 75})),
    );

    let workflow = Workflow::builder()
        .session("s1")
        .step(WorkflowStep::new(
            "perf",
            Operation::new("get_performance", "performance"),
        ))
        .step(WorkflowStep::new(
            "usage",
            Operation::new("get_resource_usage", "analytics"),
        ))
        .build()
        .unwrap();
    let result = e.orchestrator.submit_workflow(workflow).await.unwrap();

    assert_eq!(result.correlated.len(), 1);
    let orders = &result.correlated[0];
    assert_eq!(orders.entity_key, "orders");
    assert_eq!(orders.fields["cpu_usage"], json!(80));
    assert_eq!(orders.conflicts.len(), 1);
    let conflict = &orders.conflicts[0];
    assert_eq!(conflict.field, "cpu_usage");
    assert_eq!(conflict.winner.capability, "performance");
    assert_eq!(conflict.overridden[0].value, json!(75));
    assert_eq!(conflict.overridden[0].source.capability, "analytics");
}

// ---------------------------------------------------------------------------
// Health and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn probes_walk_the_health_ladder() {
    let e = engine(base_config(vec![InstanceSpec::new(
        "i1",
        "http://i1",
        ["compute"],
    )]));
    let monitor = e.orchestrator.health_monitor();

    e.transport
        .probe_response("i1", SpResponse::from_status(503, json!(null)));
    assert_eq!(monitor.probe("i1").await, Some(HealthState::Degraded));
    assert_eq!(monitor.probe("i1").await, Some(HealthState::Unreachable));

    e.transport
        .probe_response("i1", SpResponse::success(json!(null)));
    assert_eq!(monitor.probe("i1").await, Some(HealthState::Healthy));
    assert_eq!(monitor.probe("ghost").await, None);
    // Probes never count against the breaker.
    assert_eq!(circuit(&e.orchestrator, "i1"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_workflow_skips_unfinished_steps() {
    let e = Arc::new(engine(base_config(vec![InstanceSpec::new(
        "i1",
        "http://i1",
        ["compute"],
    )])));
    e.transport
        .always("i1", SpResponse::success(json!({"ok": true})));
    e.transport.delay("i1", std::time::Duration::from_secs(60));

    let workflow = Workflow::builder()
        .id("slow")
        .session("s1")
        .step(WorkflowStep::new("a", Operation::new("migrate", "compute")))
        .step(WorkflowStep::new("b", Operation::new("verify", "compute")).after(["a"]))
        .build()
        .unwrap();
    let running = {
        let e = Arc::clone(&e);
        tokio::spawn(async move { e.orchestrator.submit_workflow(workflow).await })
    };

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    e.orchestrator.cancel_workflow("slow").unwrap();
    let result = running.await.unwrap().unwrap();

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    for step in &result.steps {
        assert_eq!(step.status, StepStatus::Skipped);
        assert_eq!(step.reason(), Some(FailureReason::WorkflowCancelled));
    }
    assert_eq!(e.orchestrator.session("s1").unwrap().entries.len(), 2);
}
