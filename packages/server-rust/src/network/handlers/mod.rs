//! HTTP handlers for the orchestrator surface.
//!
//! Defines `AppState` (the shared state carried through axum extractors),
//! the error-to-status mapping, and re-exports every handler for the router.

pub mod health;
pub mod instances;
pub mod sessions;
pub mod workflows;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use instances::{
    deregister_instance_handler, list_instances_handler, register_instance_handler,
};
pub use sessions::{ledger_handler, submit_operation_handler};
pub use workflows::{
    cancel_workflow_handler, confirm_step_handler, submit_template_handler,
    submit_workflow_handler, workflow_status_handler,
};

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use portalfed_core::TemplateError;
use serde_json::json;

use crate::service::{ControlError, Orchestrator, RegistryError, SubmitError};

/// Shared application state passed to all axum handlers via `State`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Process start time, used for uptime.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Any handler failure, rendered as `{ "error": "..." }` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let status = match &err {
            SubmitError::DuplicateWorkflow(_) => StatusCode::CONFLICT,
            SubmitError::Draining(_) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Template(TemplateError::UnknownTemplate(_)) => StatusCode::NOT_FOUND,
            SubmitError::InvalidWorkflow(_)
            | SubmitError::Template(_)
            | SubmitError::Unparsed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::UnknownWorkflow(_) | ControlError::UnknownStep { .. } => {
                StatusCode::NOT_FOUND
            }
            ControlError::NotGated(_) => StatusCode::BAD_REQUEST,
            ControlError::AlreadyConfirmed(_) | ControlError::StepSettled(_) => {
                StatusCode::CONFLICT
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::DuplicateInstance(_) => StatusCode::CONFLICT,
            RegistryError::NoCapabilities(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
