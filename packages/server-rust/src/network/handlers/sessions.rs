//! Per-session endpoints: single operations and the ledger.

use axum::extract::{Path, State};
use axum::Json;
use portalfed_core::{Operation, StepResult};

use super::{ApiError, AppState};
use crate::service::Session;

/// `POST /sessions/{session_id}/operations`
///
/// Routing failures are a Failed `StepResult` with status 200; only
/// admission problems are HTTP errors.
pub async fn submit_operation_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(operation): Json<Operation>,
) -> Result<Json<StepResult>, ApiError> {
    let result = state
        .orchestrator
        .submit_operation(&session_id, operation)
        .await?;
    Ok(Json(result))
}

/// `GET /sessions/{session_id}/ledger`
pub async fn ledger_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .orchestrator
        .session(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} has no entries")))
}
