//! Runtime instance registration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use portalfed_core::InstanceSpec;

use super::{ApiError, AppState};
use crate::service::InstanceView;

/// `GET /instances`
pub async fn list_instances_handler(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(state.orchestrator.instances())
}

/// `POST /instances`
pub async fn register_instance_handler(
    State(state): State<AppState>,
    Json(spec): Json<InstanceSpec>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.register_instance(spec)?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /instances/{instance_id}`
pub async fn deregister_instance_handler(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .deregister_instance(&instance_id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError::not_found(format!("instance {instance_id} is not registered")))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::super::test_support::{app, send};

    #[tokio::test]
    async fn register_list_and_remove() {
        let (router, _orch, _transport) = app();
        let spec = json!({
            "id": "vault",
            "kind": "storage",
            "base_url": "http://vault",
            "capabilities": ["restore"],
            "auth": {"type": "bearer_token", "token": "secret"}
        });

        assert_eq!(
            send(&router, "POST", "/instances", Some(spec.clone()))
                .await
                .0,
            StatusCode::CREATED
        );
        assert_eq!(
            send(&router, "POST", "/instances", Some(spec)).await.0,
            StatusCode::CONFLICT
        );

        let (status, body) = send(&router, "GET", "/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 3);
        assert!(!body.to_string().contains("secret"));

        assert_eq!(
            send(&router, "DELETE", "/instances/vault", None).await.0,
            StatusCode::NO_CONTENT
        );
        assert_eq!(
            send(&router, "DELETE", "/instances/vault", None).await.0,
            StatusCode::NOT_FOUND
        );
    }
}
