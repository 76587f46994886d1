//! Collaborator seams.
//!
//! Intent parsing and insight generation live outside the engine. Both are
//! consumed through the narrow traits below, and the engine stays correct
//! when an implementation is absent, slow, or wrong.

use async_trait::async_trait;

use crate::correlate::CorrelatedResult;
use crate::operation::Operation;
use crate::workflow::{StepResult, Workflow};

/// What an upstream parser made of free-form input.
#[derive(Debug, Clone)]
pub enum ParsedIntent {
    Operation(Operation),
    Workflow(Workflow),
}

/// Turns natural-language input into something the engine can run.
#[async_trait]
pub trait IntentParser: Send + Sync {
    async fn parse(&self, session_id: &str, text: &str) -> anyhow::Result<ParsedIntent>;
}

/// Input handed to an [`InsightProvider`].
#[derive(Debug, Clone, Copy)]
pub struct InsightRequest<'a> {
    pub workflow_id: &'a str,
    pub session_id: &'a str,
    pub correlated: &'a [CorrelatedResult],
    pub steps: &'a [StepResult],
}

/// Produces advisory text for a finished workflow.
///
/// Best effort: errors and timeouts are logged by the caller and dropped.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn advise(&self, request: InsightRequest<'_>) -> anyhow::Result<String>;
}
