//! Per-step and per-workflow outcomes.
//!
//! A [`StepResult`] is produced exactly once per step per execution and is
//! what the ledger records. Failures carry a [`StepFailure`] listing every
//! attempted instance, so callers can see why a step gave up without digging
//! through logs.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlate::CorrelatedResult;
use crate::operation::Operation;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Position of a step in the executor's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    #[default]
    Pending,
    /// Dependencies satisfied; waiting for a permit or a confirmation.
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl From<StepStatus> for StepPhase {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Succeeded => Self::Succeeded,
            StepStatus::Failed => Self::Failed,
            StepStatus::Skipped => Self::Skipped,
        }
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// Classification of a single attempt against one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// The SP rejected the request. Not retried on the same instance.
    ClientError,
    ServerError,
    /// The per-call timeout elapsed before the SP answered.
    Timeout,
    /// The breaker denied the attempt; the SP was not contacted.
    CircuitOpen,
    /// The request could not be built (auth or path rendering failed).
    NotSent,
}

impl CallOutcome {
    /// Whether the same instance may be tried again for an idempotent call.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ServerError | Self::Timeout)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::NotSent => "not_sent",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of the failover chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub instance_id: String,
    /// 1-based attempt number against this instance within one routing round.
    pub attempt: u32,
    pub outcome: CallOutcome,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub latency_ms: u64,
}

impl AttemptRecord {
    /// Record for an instance the breaker refused.
    #[must_use]
    pub fn circuit_open(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            attempt: 0,
            outcome: CallOutcome::CircuitOpen,
            status_code: None,
            detail: "circuit open".to_string(),
            latency_ms: 0,
        }
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}: {}", self.instance_id, self.attempt, self.outcome)?;
        if let Some(code) = self.status_code {
            write!(f, " ({code})")?;
        }
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Structured reason a step did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No registered instance advertises the capability.
    CapabilityUnavailable,
    /// Every ranked candidate failed or was circuit-open.
    AllCandidatesExhausted,
    ConfirmationTimeout,
    ConfirmationDeclined,
    /// A dependency ended Failed or Skipped.
    DependencyFailed,
    WorkflowCancelled,
    /// The step task panicked.
    Internal,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CapabilityUnavailable => "capability unavailable",
            Self::AllCandidatesExhausted => "all candidates exhausted",
            Self::ConfirmationTimeout => "confirmation timeout",
            Self::ConfirmationDeclined => "confirmation declined",
            Self::DependencyFailed => "dependency failed",
            Self::WorkflowCancelled => "workflow cancelled",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub reason: FailureReason,
    pub message: String,
    /// Every attempted instance across all rounds, in order.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl StepFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            attempts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Terminal outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub operation: String,
    pub capability: String,
    pub status: StepStatus,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<StepFailure>,
    /// Instance that produced the payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub served_by: Option<String>,
    /// Wall time from the step starting to run until it became terminal.
    #[serde(default)]
    pub latency_ms: u64,
    /// SP calls actually sent, across every round and candidate.
    #[serde(default)]
    pub attempts: u32,
    pub completed_at_ms: u64,
}

impl StepResult {
    fn base(step_id: &str, operation: &Operation, status: StepStatus, completed_at_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            operation: operation.name().to_string(),
            capability: operation.capability().to_string(),
            status,
            payload: Value::Null,
            failure: None,
            served_by: None,
            latency_ms: 0,
            attempts: 0,
            completed_at_ms,
        }
    }

    #[must_use]
    pub fn succeeded(
        step_id: &str,
        operation: &Operation,
        served_by: impl Into<String>,
        payload: Value,
        completed_at_ms: u64,
    ) -> Self {
        let mut result = Self::base(step_id, operation, StepStatus::Succeeded, completed_at_ms);
        result.served_by = Some(served_by.into());
        result.payload = payload;
        result
    }

    #[must_use]
    pub fn failed(
        step_id: &str,
        operation: &Operation,
        failure: StepFailure,
        completed_at_ms: u64,
    ) -> Self {
        let mut result = Self::base(step_id, operation, StepStatus::Failed, completed_at_ms);
        result.failure = Some(failure);
        result
    }

    #[must_use]
    pub fn skipped(
        step_id: &str,
        operation: &Operation,
        reason: FailureReason,
        message: impl Into<String>,
        completed_at_ms: u64,
    ) -> Self {
        let mut result = Self::base(step_id, operation, StepStatus::Skipped, completed_at_ms);
        result.failure = Some(StepFailure::new(reason, message));
        result
    }

    #[must_use]
    pub fn with_timing(mut self, latency_ms: u64, attempts: u32) -> Self {
        self.latency_ms = latency_ms;
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    #[must_use]
    pub fn reason(&self) -> Option<FailureReason> {
        self.failure.as_ref().map(|f| f.reason)
    }
}

// ---------------------------------------------------------------------------
// WorkflowResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// No step failed. Skipped steps do not count as failures.
    Succeeded,
    PartiallyFailed,
    Failed,
    /// A cancellation signal was received before every step finished.
    Cancelled,
}

impl WorkflowStatus {
    /// Aggregates terminal step results.
    #[must_use]
    pub fn aggregate(steps: &[StepResult], cancelled: bool) -> Self {
        if cancelled {
            return Self::Cancelled;
        }
        let failed = steps.iter().any(|s| s.status == StepStatus::Failed);
        let succeeded = steps.iter().any(StepResult::is_success);
        match (failed, succeeded) {
            (false, _) => Self::Succeeded,
            (true, true) => Self::PartiallyFailed,
            (true, false) => Self::Failed,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything a caller gets back from a workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub session_id: String,
    pub status: WorkflowStatus,
    /// One entry per step, in declaration order.
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub correlated: Vec<CorrelatedResult>,
    /// Best-effort commentary from the insight collaborator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub advisory: Option<String>,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl WorkflowResult {
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}
