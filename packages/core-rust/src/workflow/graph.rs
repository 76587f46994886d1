//! Workflow graphs: steps bound to operations, wired by dependency edges.
//!
//! A [`Workflow`] is validated once, at construction, and never changes
//! afterwards. Validation rejects duplicate step ids, references to unknown
//! steps, and cycles, so the executor never has to guard against a graph
//! that could deadlock.
//!
//! # Ordering
//!
//! [`Workflow::topological_order`] is Kahn's algorithm with ties broken by
//! declaration order, so two steps with no dependency between them keep the
//! order in which they were declared.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::operation::{Operation, RetryPolicy};

/// Session used when a caller does not name one.
pub const DEFAULT_SESSION: &str = "default";

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,
    pub operation: Operation,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Hold the step at `Ready` until an external confirmation arrives.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Step-level retries: each retry re-runs routing and failover from
    /// scratch. `None` means a single round.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-call timeout override for this step's SP calls.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
            depends_on: Vec::new(),
            requires_confirmation: false,
            retry: None,
            timeout_ms: None,
        }
    }

    #[must_use]
    pub fn after<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(dependencies.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn requires_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Step-level retry policy, defaulting to a single round.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons a set of steps cannot form a workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow has no steps")]
    Empty,
    #[error("duplicate step id: {step}")]
    DuplicateStep { step: String },
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle among steps: {}", steps.join(", "))]
    Cycle { steps: Vec<String> },
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Serializable description of a workflow, as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_session")]
    pub session_id: String,
    pub steps: Vec<WorkflowStep>,
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

/// A validated, immutable DAG of steps.
#[derive(Debug, Clone)]
pub struct Workflow {
    id: String,
    session_id: String,
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Workflow {
    #[must_use]
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::default()
    }

    /// Validates `steps` and freezes them into a workflow.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowError`] for empty input, duplicate ids, unknown
    /// dependencies, or a cycle.
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Result<Self, WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
        }

        let mut dependencies = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &step.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                // Repeated edges collapse to one.
                if seen.insert(d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let order = topological_sort(&steps, &dependencies, &dependents)?;

        Ok(Self {
            id: id.into(),
            session_id: session_id.into(),
            steps,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    /// A graph of one node wrapping a single operation.
    #[must_use]
    pub fn single(session_id: impl Into<String>, operation: Operation) -> Self {
        let step_id = operation.name().to_string();
        let step = WorkflowStep::new(step_id.clone(), operation);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            steps: vec![step],
            index: HashMap::from([(step_id, 0)]),
            dependencies: vec![Vec::new()],
            dependents: vec![Vec::new()],
            order: vec![0],
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always `false`: construction rejects empty workflows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices of the steps that `idx` waits on.
    #[must_use]
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Indices of the steps that wait on `idx`.
    #[must_use]
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Every step reachable from `idx` along dependent edges, in
    /// breadth-first order, excluding `idx` itself.
    #[must_use]
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = vec![false; self.steps.len()];
        let mut queue: VecDeque<usize> = self.dependents[idx].iter().copied().collect();
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if std::mem::replace(&mut seen[next], true) {
                continue;
            }
            out.push(next);
            queue.extend(self.dependents[next].iter().copied());
        }
        out
    }

    /// Steps in a dependency-respecting order.
    pub fn topological_order(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Steps with no dependencies, in declaration order.
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.steps.len()).filter(|&i| self.dependencies[i].is_empty())
    }
}

impl TryFrom<WorkflowDefinition> for Workflow {
    type Error = WorkflowError;

    fn try_from(def: WorkflowDefinition) -> Result<Self, Self::Error> {
        let id = def
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::new(id, def.session_id, def.steps)
    }
}

/// Kahn's algorithm. The ready set is a min-heap on declaration index, so
/// the output is stable.
fn topological_sort(
    steps: &[WorkflowStep],
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, WorkflowError> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &next in &dependents[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == steps.len() {
        Ok(order)
    } else {
        let steps = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| steps[i].id.clone())
            .collect();
        Err(WorkflowError::Cycle { steps })
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Incremental construction of a [`Workflow`].
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    id: Option<String>,
    session_id: Option<String>,
    steps: Vec<WorkflowStep>,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// # Errors
    ///
    /// See [`Workflow::new`].
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        Workflow::try_from(WorkflowDefinition {
            id: self.id,
            session_id: self.session_id.unwrap_or_else(default_session),
            steps: self.steps,
        })
    }
}
