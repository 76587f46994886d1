//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::service::Phase;

/// Engine phase, registry summary, and per-instance health and circuit
/// state.
///
/// Always 200; the `state` field says whether the engine accepts work.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    let lifecycle = orchestrator.lifecycle();

    Json(json!({
        "state": lifecycle.phase().as_str(),
        "in_flight": lifecycle.in_flight(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "summary": orchestrator.summary(),
        "instances": orchestrator.instances(),
    }))
}

/// Always 200 while the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 while submissions are admitted, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.orchestrator.lifecycle().phase() == Phase::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::super::test_support::{app, send};

    #[tokio::test]
    async fn health_reports_instances_and_circuits() {
        let (router, _orch, _transport) = app();
        let (status, body) = send(&router, "GET", "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "ready");
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["instances"][0]["id"], "core");
        assert_eq!(body["instances"][0]["circuit"], "closed");
        assert_eq!(body["instances"][0]["health"], "unknown");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (router, _orch, _transport) = app();
        let (status, _) = send(&router, "GET", "/health/live", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_the_lifecycle() {
        let (router, orch, _transport) = app();
        assert_eq!(
            send(&router, "GET", "/health/ready", None).await.0,
            StatusCode::OK
        );

        orch.lifecycle().begin_drain();
        assert_eq!(
            send(&router, "GET", "/health/ready", None).await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
