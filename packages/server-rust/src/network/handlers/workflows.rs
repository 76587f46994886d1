//! Workflow submission and control endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use portalfed_core::{
    TemplateKind, TemplateOptions, WorkflowDefinition, WorkflowResult, DEFAULT_SESSION,
};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::service::{ExecutionStatus, SubmitError};

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct TemplateBody {
    #[serde(default = "default_session")]
    pub session_id: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: TemplateOptions,
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

/// `POST /workflows`
///
/// Blocks until the workflow reaches a terminal status.
pub async fn submit_workflow_handler(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowResult>, ApiError> {
    let result = state.orchestrator.submit_definition(definition).await?;
    Ok(Json(result))
}

/// `POST /templates/{template}`
pub async fn submit_template_handler(
    State(state): State<AppState>,
    Path(template): Path<String>,
    Json(body): Json<TemplateBody>,
) -> Result<Json<WorkflowResult>, ApiError> {
    let kind: TemplateKind = template.parse().map_err(SubmitError::from)?;
    let result = state
        .orchestrator
        .submit_template(kind, &body.session_id, &body.targets, &body.options)
        .await?;
    Ok(Json(result))
}

/// `GET /workflows/{workflow_id}`, for in-flight workflows only.
pub async fn workflow_status_handler(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ExecutionStatus>, ApiError> {
    Ok(Json(state.orchestrator.execution_status(&workflow_id)?))
}

/// `POST /workflows/{workflow_id}/steps/{step_id}/confirm`
pub async fn confirm_step_handler(
    State(state): State<AppState>,
    Path((workflow_id, step_id)): Path<(String, String)>,
    Json(body): Json<ConfirmBody>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .confirm_step(&workflow_id, &step_id, body.approved)?;
    Ok(StatusCode::ACCEPTED)
}

/// `POST /workflows/{workflow_id}/cancel`
pub async fn cancel_workflow_handler(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.cancel_workflow(&workflow_id)?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use portalfed_core::{StepStatus, WorkflowResult, WorkflowStatus, DEFAULT_SESSION};
    use serde_json::{json, Value};

    use super::super::test_support::{app, send};
    use crate::transport::SpResponse;

    fn gated_workflow() -> Value {
        json!({
            "id": "wf-gated",
            "session_id": "s1",
            "steps": [
                {"id": "measure", "operation": {"name": "get_performance", "capability": "performance"}},
                {
                    "id": "backup",
                    "operation": {"name": "create_backup", "capability": "backup"},
                    "depends_on": ["measure"],
                    "requires_confirmation": true
                }
            ]
        })
    }

    #[tokio::test]
    async fn workflow_runs_to_completion() {
        let (router, _orch, transport) = app();
        transport.always("core", SpResponse::success(json!({"ok": true})));
        let body = json!({
            "session_id": "s1",
            "steps": [
                {"id": "a", "operation": {"name": "get_performance", "capability": "performance"}},
                {"id": "b", "operation": {"name": "create_backup", "capability": "backup"}, "depends_on": ["a"]}
            ]
        });

        let (status, body) = send(&router, "POST", "/workflows", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        let result: WorkflowResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.count(StepStatus::Succeeded), 2);
    }

    #[tokio::test]
    async fn cyclic_workflow_is_unprocessable() {
        let (router, _orch, _transport) = app();
        let body = json!({
            "steps": [
                {"id": "a", "operation": {"name": "x", "capability": "performance"}, "depends_on": ["b"]},
                {"id": "b", "operation": {"name": "y", "capability": "performance"}, "depends_on": ["a"]}
            ]
        });
        let (status, _) = send(&router, "POST", "/workflows", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_workflow_status_is_not_found() {
        let (router, _orch, _transport) = app();
        let (status, _) = send(&router, "GET", "/workflows/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, "POST", "/workflows/nope/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gated_step_waits_for_confirmation_over_http() {
        let (router, _orch, transport) = app();
        transport.always("core", SpResponse::success(json!({"ok": true})));

        let submit = {
            let router = router.clone();
            tokio::spawn(async move {
                send(&router, "POST", "/workflows", Some(gated_workflow())).await
            })
        };

        let mut awaiting = false;
        for _ in 0..200 {
            let (status, body) = send(&router, "GET", "/workflows/wf-gated", None).await;
            if status == StatusCode::OK && body["steps"][1]["awaiting_confirmation"] == json!(true)
            {
                awaiting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(awaiting);

        let (status, _) = send(
            &router,
            "POST",
            "/workflows/wf-gated/steps/measure/confirm",
            Some(json!({"approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &router,
            "POST",
            "/workflows/wf-gated/steps/backup/confirm",
            Some(json!({"approved": true})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = submit.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let result: WorkflowResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.step("backup").unwrap().status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn templates_resolve_by_name() {
        let (router, _orch, transport) = app();
        transport.always("core", SpResponse::success(json!({"ok": true})));

        let (status, _) = send(
            &router,
            "POST",
            "/templates/teleport",
            Some(json!({"targets": ["orders"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &router,
            "POST",
            "/templates/backup_and_restore",
            Some(json!({"targets": []})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        // No instance offers "validation", so the first step fails and the
        // rest are skipped.
        let (status, body) = send(
            &router,
            "POST",
            "/templates/backup_and_restore",
            Some(json!({"session_id": "ops", "targets": ["orders"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result: WorkflowResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.session_id, "ops");
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.count(StepStatus::Skipped), 2);
        assert_eq!(transport.calls_to("core"), 0);
    }

    #[tokio::test]
    async fn template_without_a_session_uses_the_default_one() {
        let (router, _orch, _transport) = app();
        let (status, body) = send(
            &router,
            "POST",
            "/templates/compliance_audit",
            Some(json!({"targets": ["orders"], "options": {"frameworks": ["gdpr"]}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let result: WorkflowResult = serde_json::from_value(body).unwrap();
        assert_eq!(result.session_id, DEFAULT_SESSION);
        // No instance offers "compliance": setup fails, everything after it is skipped.
        assert_eq!(result.count(StepStatus::Skipped), 4);

        let (status, _) = send(
            &router,
            "POST",
            "/templates/multi_environment_sync",
            Some(
                json!({"targets": ["orders"], "options": {"source_env": "qa", "target_env": "qa"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
