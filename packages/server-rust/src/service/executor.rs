//! Dependency-aware workflow execution.
//!
//! One coordinator per workflow owns the step state machine
//! (`Pending -> Ready -> Running -> terminal`). Ready steps run as
//! independent tasks in a `JoinSet`, bounded by a global semaphore and an
//! optional per-session one. The coordinator is the only writer of terminal
//! results, so each step reaches the ledger exactly once.
//!
//! A step that ends Failed or Skipped takes all of its descendants with it
//! (Skipped, `DependencyFailed`); sibling branches carry on. Gated steps hold
//! at Ready until [`WorkflowExecutor::confirm`] answers or the confirmation
//! timeout fires. Cancelling a workflow aborts its running tasks, which drops
//! their in-flight SP calls, and marks everything unfinished Skipped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use portalfed_core::{
    ClockSource, FailureReason, StepFailure, StepPhase, StepResult, StepStatus, Workflow,
    WorkflowResult, WorkflowStatus, WorkflowStep,
};
use serde::Serialize;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::config::ExecutorConfig;
use super::ledger::{Ledger, LedgerEntry};
use super::router::{sent_count, RouteError, SpRouter};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("workflow {workflow_id} is already running")]
pub struct AlreadyRunning {
    pub workflow_id: String,
}

/// Rejected control signal for an in-flight workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("workflow {0} is not running")]
    UnknownWorkflow(String),
    #[error("workflow {workflow_id} has no step {step_id}")]
    UnknownStep {
        workflow_id: String,
        step_id: String,
    },
    #[error("step {0} does not require confirmation")]
    NotGated(String),
    #[error("step {0} was already confirmed or declined")]
    AlreadyConfirmed(String),
    #[error("step {0} has already finished")]
    StepSettled(String),
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub step_id: String,
    pub phase: StepPhase,
    pub requires_confirmation: bool,
    pub awaiting_confirmation: bool,
}

/// Snapshot of an in-flight workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStatus {
    pub workflow_id: String,
    pub session_id: String,
    pub started_at_ms: u64,
    pub cancelled: bool,
    pub steps: Vec<StepView>,
}

// ---------------------------------------------------------------------------
// ExecutionControl
// ---------------------------------------------------------------------------

struct ControlState {
    phases: Vec<StepPhase>,
    gates: HashMap<usize, oneshot::Sender<bool>>,
    answered: Vec<bool>,
}

/// Signals into one running workflow: confirmations, cancellation, and the
/// per-step phase view.
pub struct ExecutionControl {
    workflow_id: String,
    session_id: String,
    started_at_ms: u64,
    step_ids: Vec<String>,
    gated: Vec<bool>,
    cancel: CancellationToken,
    state: Mutex<ControlState>,
}

type GateReceivers = HashMap<usize, oneshot::Receiver<bool>>;

impl ExecutionControl {
    fn new(
        workflow: &Workflow,
        cancel: CancellationToken,
        started_at_ms: u64,
    ) -> (Self, GateReceivers) {
        let gated: Vec<bool> = workflow
            .steps()
            .iter()
            .map(|s| s.requires_confirmation)
            .collect();
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for (idx, _) in gated.iter().enumerate().filter(|(_, g)| **g) {
            let (tx, rx) = oneshot::channel();
            senders.insert(idx, tx);
            receivers.insert(idx, rx);
        }
        let control = Self {
            workflow_id: workflow.id().to_string(),
            session_id: workflow.session_id().to_string(),
            started_at_ms,
            step_ids: workflow.steps().iter().map(|s| s.id.clone()).collect(),
            state: Mutex::new(ControlState {
                phases: vec![StepPhase::Pending; workflow.len()],
                gates: senders,
                answered: vec![false; workflow.len()],
            }),
            gated,
            cancel,
        };
        (control, receivers)
    }

    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Answers a gated step. A confirmation may arrive before the step is
    /// Ready; the step then starts as soon as its dependencies succeed.
    ///
    /// # Errors
    ///
    /// See [`ControlError`].
    pub fn confirm(&self, step_id: &str, approved: bool) -> Result<(), ControlError> {
        let idx = self
            .step_ids
            .iter()
            .position(|s| s == step_id)
            .ok_or_else(|| ControlError::UnknownStep {
                workflow_id: self.workflow_id.clone(),
                step_id: step_id.to_string(),
            })?;
        if !self.gated[idx] {
            return Err(ControlError::NotGated(step_id.to_string()));
        }

        let tx = {
            let mut state = self.state.lock();
            if state.phases[idx].is_terminal() {
                return Err(ControlError::StepSettled(step_id.to_string()));
            }
            let tx = state
                .gates
                .remove(&idx)
                .ok_or_else(|| ControlError::AlreadyConfirmed(step_id.to_string()))?;
            state.answered[idx] = true;
            tx
        };
        tx.send(approved)
            .map_err(|_| ControlError::StepSettled(step_id.to_string()))?;
        info!(workflow_id = %self.workflow_id, step_id, approved, "confirmation received");
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        let state = self.state.lock();
        let steps = self
            .step_ids
            .iter()
            .enumerate()
            .map(|(idx, step_id)| StepView {
                step_id: step_id.clone(),
                phase: state.phases[idx],
                requires_confirmation: self.gated[idx],
                awaiting_confirmation: self.gated[idx]
                    && state.phases[idx] == StepPhase::Ready
                    && !state.answered[idx],
            })
            .collect();
        ExecutionStatus {
            workflow_id: self.workflow_id.clone(),
            session_id: self.session_id.clone(),
            started_at_ms: self.started_at_ms,
            cancelled: self.is_cancelled(),
            steps,
        }
    }

    fn set_phase(&self, idx: usize, phase: StepPhase) {
        self.state.lock().phases[idx] = phase;
    }
}

/// Removes a workflow from the running table however its execution ends.
struct RunningEntry<'a> {
    running: &'a DashMap<String, Arc<ExecutionControl>>,
    workflow_id: String,
}

impl Drop for RunningEntry<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.workflow_id);
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    router: Arc<SpRouter>,
    ledger: Arc<Ledger>,
    clock: Arc<dyn ClockSource>,
    config: ExecutorConfig,
    global: Arc<Semaphore>,
    per_session: DashMap<String, Arc<Semaphore>>,
    running: DashMap<String, Arc<ExecutionControl>>,
    shutdown: CancellationToken,
}

impl WorkflowExecutor {
    #[must_use]
    pub fn new(
        router: Arc<SpRouter>,
        ledger: Arc<Ledger>,
        clock: Arc<dyn ClockSource>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            router,
            ledger,
            clock,
            global: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            config,
            per_session: DashMap::new(),
            running: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[must_use]
    pub fn control(&self, workflow_id: &str) -> Option<Arc<ExecutionControl>> {
        self.running.get(workflow_id).map(|c| Arc::clone(c.value()))
    }

    /// Ids of the workflows currently executing.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }

    /// # Errors
    ///
    /// See [`ExecutionControl::confirm`].
    pub fn confirm(
        &self,
        workflow_id: &str,
        step_id: &str,
        approved: bool,
    ) -> Result<(), ControlError> {
        self.lookup(workflow_id)?.confirm(step_id, approved)
    }

    /// # Errors
    ///
    /// `UnknownWorkflow` when nothing with that id is running.
    pub fn cancel(&self, workflow_id: &str) -> Result<(), ControlError> {
        let control = self.lookup(workflow_id)?;
        info!(workflow_id, "cancellation requested");
        control.cancel();
        Ok(())
    }

    /// # Errors
    ///
    /// `UnknownWorkflow` when nothing with that id is running.
    pub fn status(&self, workflow_id: &str) -> Result<ExecutionStatus, ControlError> {
        Ok(self.lookup(workflow_id)?.status())
    }

    /// Cancels every running workflow.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    fn lookup(&self, workflow_id: &str) -> Result<Arc<ExecutionControl>, ControlError> {
        self.control(workflow_id)
            .ok_or_else(|| ControlError::UnknownWorkflow(workflow_id.to_string()))
    }

    fn session_semaphore(&self, session_id: &str) -> Option<Arc<Semaphore>> {
        let limit = self.config.max_concurrent_steps_per_session?;
        let semaphore = self
            .per_session
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)));
        Some(Arc::clone(semaphore.value()))
    }

    /// Drops the session's semaphore once no other execution holds it.
    fn release_session(&self, session_id: &str, semaphore: Option<Arc<Semaphore>>) {
        if semaphore.is_some() {
            drop(semaphore);
            self.per_session
                .remove_if(session_id, |_, s| Arc::strong_count(s) == 1);
        }
    }

    /// Sessions currently holding a concurrency limiter.
    #[must_use]
    pub fn limited_sessions(&self) -> usize {
        self.per_session.len()
    }

    /// Runs `workflow` to completion. Always produces a result with one entry
    /// per step.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when a workflow with the same id is in flight.
    pub async fn execute(&self, workflow: Workflow) -> Result<WorkflowResult, AlreadyRunning> {
        let workflow = Arc::new(workflow);
        let (control, gates) =
            ExecutionControl::new(&workflow, self.shutdown.child_token(), self.clock.now());
        let control = Arc::new(control);

        let _entry = match self.running.entry(workflow.id().to_string()) {
            Entry::Occupied(_) => {
                return Err(AlreadyRunning {
                    workflow_id: workflow.id().to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&control));
                RunningEntry {
                    running: &self.running,
                    workflow_id: workflow.id().to_string(),
                }
            }
        };

        let span = info_span!(
            "workflow",
            workflow_id = workflow.id(),
            session_id = workflow.session_id(),
            steps = workflow.len()
        );
        Ok(self
            .drive(&workflow, &control, gates)
            .instrument(span)
            .await)
    }

    async fn drive(
        &self,
        workflow: &Arc<Workflow>,
        control: &Arc<ExecutionControl>,
        mut gates: GateReceivers,
    ) -> WorkflowResult {
        let mut run = Run {
            workflow,
            control,
            results: vec![None; workflow.len()],
            waiting: (0..workflow.len())
                .map(|idx| workflow.dependencies(idx).len())
                .collect(),
        };
        let session = self.session_semaphore(workflow.session_id());
        let mut tasks: JoinSet<(usize, StepResult)> = JoinSet::new();

        let roots: Vec<usize> = workflow.roots().collect();
        for idx in roots {
            self.spawn_step(&mut tasks, &run, idx, gates.remove(&idx), session.clone());
        }

        let cancel = control.cancel.clone();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, result))) => {
                        for next in self.settle(&mut run, idx, result) {
                            self.spawn_step(&mut tasks, &run, next, gates.remove(&next), session.clone());
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "step task ended without a result"),
                },
            }
        }

        if cancelled {
            tasks.abort_all();
            // Keep answers that landed before the abort.
            while let Some(joined) = tasks.join_next().await {
                if let Ok((idx, result)) = joined {
                    if run.results[idx].is_none() {
                        self.record(&mut run, idx, result);
                    }
                }
            }
        }

        drop(tasks);
        self.release_session(workflow.session_id(), session);

        let (reason, message) = if cancelled {
            (FailureReason::WorkflowCancelled, "workflow cancelled")
        } else {
            (FailureReason::Internal, "step never completed")
        };
        for idx in 0..workflow.len() {
            if run.results[idx].is_none() {
                let step = &workflow.steps()[idx];
                let skipped = StepResult::skipped(
                    &step.id,
                    &step.operation,
                    reason,
                    message,
                    self.clock.now(),
                );
                self.record(&mut run, idx, skipped);
            }
        }

        let steps: Vec<StepResult> = run.results.into_iter().flatten().collect();
        let status = WorkflowStatus::aggregate(&steps, cancelled);
        metrics::counter!("portalfed_workflows_total", "status" => status.as_str()).increment(1);
        info!(
            status = status.as_str(),
            succeeded = steps
                .iter()
                .filter(|s| s.status == StepStatus::Succeeded)
                .count(),
            failed = steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count(),
            skipped = steps
                .iter()
                .filter(|s| s.status == StepStatus::Skipped)
                .count(),
            "workflow finished"
        );

        WorkflowResult {
            workflow_id: workflow.id().to_string(),
            session_id: workflow.session_id().to_string(),
            status,
            steps,
            correlated: Vec::new(),
            advisory: None,
            started_at_ms: control.started_at_ms,
            finished_at_ms: self.clock.now(),
        }
    }

    /// Records a terminal result and returns the steps it unblocked.
    fn settle(&self, run: &mut Run<'_>, idx: usize, result: StepResult) -> Vec<usize> {
        let succeeded = result.is_success();
        self.record(run, idx, result);

        let workflow = run.workflow;
        if succeeded {
            let mut ready = Vec::new();
            for &dependent in workflow.dependents(idx) {
                run.waiting[dependent] = run.waiting[dependent].saturating_sub(1);
                if run.waiting[dependent] == 0 && run.results[dependent].is_none() {
                    ready.push(dependent);
                }
            }
            return ready;
        }

        let upstream = &workflow.steps()[idx].id;
        for descendant in workflow.descendants(idx) {
            if run.results[descendant].is_none() {
                let step = &workflow.steps()[descendant];
                let skipped = StepResult::skipped(
                    &step.id,
                    &step.operation,
                    FailureReason::DependencyFailed,
                    format!("upstream step '{upstream}' did not succeed"),
                    self.clock.now(),
                );
                self.record(run, descendant, skipped);
            }
        }
        Vec::new()
    }

    fn record(&self, run: &mut Run<'_>, idx: usize, result: StepResult) {
        let step = &run.workflow.steps()[idx];
        run.control.set_phase(idx, result.status.into());
        match result.status {
            StepStatus::Succeeded => debug!(
                step_id = %step.id,
                served_by = result.served_by.as_deref().unwrap_or_default(),
                latency_ms = result.latency_ms,
                attempts = result.attempts,
                "step succeeded"
            ),
            StepStatus::Failed | StepStatus::Skipped => warn!(
                step_id = %step.id,
                status = ?result.status,
                reason = result.reason().map_or("", FailureReason::as_str),
                "step did not succeed"
            ),
        }
        self.ledger.append(LedgerEntry {
            session_id: run.workflow.session_id().to_string(),
            workflow_id: run.workflow.id().to_string(),
            operation: step.operation.clone(),
            result: result.clone(),
            recorded_at_ms: self.clock.now(),
        });
        run.results[idx] = Some(result);
    }

    fn spawn_step(
        &self,
        tasks: &mut JoinSet<(usize, StepResult)>,
        run: &Run<'_>,
        idx: usize,
        gate: Option<oneshot::Receiver<bool>>,
        session: Option<Arc<Semaphore>>,
    ) {
        run.control.set_phase(idx, StepPhase::Ready);
        let step = run.workflow.steps()[idx].clone();
        let call_timeout = Duration::from_millis(
            step.timeout_ms
                .unwrap_or(self.config.default_call_timeout_ms),
        );
        let span = info_span!(
            "step",
            step_id = %step.id,
            operation = step.operation.name(),
            capability = step.operation.capability()
        );
        let clock = Arc::clone(&self.clock);
        let attempt = StepAttempt {
            router: Arc::clone(&self.router),
            clock: Arc::clone(&self.clock),
            control: Arc::clone(run.control),
            global: Arc::clone(&self.global),
            session,
            gate,
            confirmation_timeout: self.config.confirmation_timeout(),
            call_timeout,
            idx,
            step: step.clone(),
        };

        tasks.spawn(
            async move {
                let result = match AssertUnwindSafe(attempt.run()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => StepResult::failed(
                        &step.id,
                        &step.operation,
                        StepFailure::new(FailureReason::Internal, "step task panicked"),
                        clock.now(),
                    ),
                };
                (idx, result)
            }
            .instrument(span),
        );
    }
}

/// Coordinator-owned bookkeeping for one execution.
struct Run<'a> {
    workflow: &'a Arc<Workflow>,
    control: &'a Arc<ExecutionControl>,
    results: Vec<Option<StepResult>>,
    /// Dependencies not yet succeeded, per step.
    waiting: Vec<usize>,
}

// ---------------------------------------------------------------------------
// StepAttempt
// ---------------------------------------------------------------------------

/// Everything one step task needs, detached from the coordinator.
struct StepAttempt {
    router: Arc<SpRouter>,
    clock: Arc<dyn ClockSource>,
    control: Arc<ExecutionControl>,
    global: Arc<Semaphore>,
    session: Option<Arc<Semaphore>>,
    gate: Option<oneshot::Receiver<bool>>,
    confirmation_timeout: Duration,
    call_timeout: Duration,
    idx: usize,
    step: WorkflowStep,
}

impl StepAttempt {
    async fn run(mut self) -> StepResult {
        if let Some(gate) = self.gate.take() {
            if let Some(skipped) = self.await_confirmation(gate).await {
                return skipped;
            }
        }

        let _permits = match self.acquire().await {
            Ok(permits) => permits,
            Err(failure) => return self.failed(failure),
        };
        self.control.set_phase(self.idx, StepPhase::Running);

        let op = &self.step.operation;
        let policy = self.step.retry_policy();
        let started = Instant::now();
        let mut tried = Vec::new();

        for round in 1..=policy.attempts() {
            match self.router.dispatch(op, self.call_timeout).await {
                Ok(done) => {
                    tried.extend(done.attempts);
                    return StepResult::succeeded(
                        &self.step.id,
                        op,
                        done.instance_id,
                        done.payload,
                        self.clock.now(),
                    )
                    .with_timing(elapsed_ms(started), sent_count(&tried));
                }
                Err(e @ RouteError::CapabilityUnavailable { .. }) => {
                    return self.failed(e.into_failure());
                }
                Err(RouteError::AllCandidatesExhausted { attempts, .. }) => {
                    tried.extend(attempts);
                    if round < policy.attempts() {
                        let delay = policy.backoff.delay(round);
                        debug!(round, ?delay, "step round failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let sent = sent_count(&tried);
        let failure = RouteError::AllCandidatesExhausted {
            operation: op.name().to_string(),
            attempts: tried,
        }
        .into_failure();
        self.failed(failure).with_timing(elapsed_ms(started), sent)
    }

    /// `None` once approved; otherwise the Skipped result.
    async fn await_confirmation(&self, gate: oneshot::Receiver<bool>) -> Option<StepResult> {
        debug!("awaiting confirmation");
        let (reason, message) = match tokio::time::timeout(self.confirmation_timeout, gate).await {
            Ok(Ok(true)) => return None,
            Ok(Ok(false) | Err(_)) => (
                FailureReason::ConfirmationDeclined,
                "confirmation declined".to_string(),
            ),
            Err(_) => (
                FailureReason::ConfirmationTimeout,
                format!(
                    "no confirmation within {}ms",
                    self.confirmation_timeout.as_millis()
                ),
            ),
        };
        Some(StepResult::skipped(
            &self.step.id,
            &self.step.operation,
            reason,
            message,
            self.clock.now(),
        ))
    }

    /// Session permit first, so a session at its cap does not sit on global
    /// capacity.
    async fn acquire(
        &self,
    ) -> Result<(Option<OwnedSemaphorePermit>, OwnedSemaphorePermit), StepFailure> {
        let closed = |_| StepFailure::new(FailureReason::Internal, "concurrency limiter closed");
        let session = match &self.session {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(closed)?,
            ),
            None => None,
        };
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(closed)?;
        Ok((session, global))
    }

    fn failed(&self, failure: StepFailure) -> StepResult {
        StepResult::failed(
            &self.step.id,
            &self.step.operation,
            failure,
            self.clock.now(),
        )
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
