//! Candidate selection and the failover chain.
//!
//! [`SpRouter::route`] turns an operation into an ordered candidate list:
//! instances advertising the capability whose circuit is not open, ranked by
//! the capability's [`RoutingPolicy`]. [`SpRouter::execute`] walks that list.
//! Idempotent operations get same-instance retries before moving on;
//! everything else fails over on the first error.
//!
//! Transport problems never leave this module as errors. A caller sees
//! either a [`Dispatched`] answer or one of the two [`RouteError`]s.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use portalfed_core::{
    AttemptRecord, CallOutcome, FailureReason, HealthState, Operation, RetryPolicy,
    ServiceProviderInstance, StepFailure,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, warn};

use super::breaker::BreakerBoard;
use super::config::{RetryConfig, RoutingConfig, RoutingPolicy};
use super::middleware::call_sp;
use super::registry::SpRegistry;
use crate::traits::{AuthProvider, SpTransport};
use crate::transport::{ResponseClass, SpRequest};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("no registered instance serves capability '{capability}'")]
    CapabilityUnavailable { capability: String },
    #[error("all candidates for '{operation}' failed ({} attempts)", attempts.len())]
    AllCandidatesExhausted {
        operation: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl RouteError {
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::CapabilityUnavailable { .. } => FailureReason::CapabilityUnavailable,
            Self::AllCandidatesExhausted { .. } => FailureReason::AllCandidatesExhausted,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::CapabilityUnavailable { .. } => &[],
            Self::AllCandidatesExhausted { attempts, .. } => attempts,
        }
    }

    /// Step failure carrying the reason, a summary message and every attempt.
    #[must_use]
    pub fn into_failure(self) -> StepFailure {
        let reason = self.reason();
        let message = match &self {
            Self::CapabilityUnavailable { .. } => self.to_string(),
            Self::AllCandidatesExhausted { attempts, .. } => {
                let tried: Vec<String> = attempts.iter().map(ToString::to_string).collect();
                format!("{self}: {}", tried.join("; "))
            }
        };
        let attempts = match self {
            Self::CapabilityUnavailable { .. } => Vec::new(),
            Self::AllCandidatesExhausted { attempts, .. } => attempts,
        };
        StepFailure::new(reason, message).with_attempts(attempts)
    }
}

/// A successful call and everything tried on the way to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub instance_id: String,
    pub payload: Value,
    pub latency_ms: u64,
    /// Failed attempts followed by the successful one.
    pub attempts: Vec<AttemptRecord>,
}

impl Dispatched {
    /// Requests that actually went out (circuit-open skips excluded).
    #[must_use]
    pub fn sent(&self) -> u32 {
        sent_count(&self.attempts)
    }
}

/// Number of attempt records that correspond to a request on the wire.
#[must_use]
pub fn sent_count(attempts: &[AttemptRecord]) -> u32 {
    let sent = attempts
        .iter()
        .filter(|a| !matches!(a.outcome, CallOutcome::CircuitOpen | CallOutcome::NotSent))
        .count();
    u32::try_from(sent).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// SpRouter
// ---------------------------------------------------------------------------

pub struct SpRouter {
    registry: Arc<SpRegistry>,
    breakers: Arc<BreakerBoard>,
    transport: Arc<dyn SpTransport>,
    auth: Arc<dyn AuthProvider>,
    routing: RoutingConfig,
    retry: RetryConfig,
    rng: Mutex<StdRng>,
    cursors: DashMap<String, AtomicUsize>,
}

impl SpRouter {
    #[must_use]
    pub fn new(
        registry: Arc<SpRegistry>,
        breakers: Arc<BreakerBoard>,
        transport: Arc<dyn SpTransport>,
        auth: Arc<dyn AuthProvider>,
        routing: RoutingConfig,
        retry: RetryConfig,
    ) -> Self {
        let rng = match routing.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            registry,
            breakers,
            transport,
            auth,
            routing,
            retry,
            rng: Mutex::new(rng),
            cursors: DashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SpRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerBoard> {
        &self.breakers
    }

    /// Ordered candidates for `op`.
    ///
    /// # Errors
    ///
    /// `CapabilityUnavailable` when no instance advertises the capability;
    /// `AllCandidatesExhausted` (with one circuit-open record per instance)
    /// when every capable instance has an open circuit.
    pub fn route(&self, op: &Operation) -> Result<Vec<ServiceProviderInstance>, RouteError> {
        let capable = self.registry.capable(op.capability());
        if capable.is_empty() {
            return Err(RouteError::CapabilityUnavailable {
                capability: op.capability().to_string(),
            });
        }

        let (open, closed): (Vec<_>, Vec<_>) = capable
            .into_iter()
            .partition(|instance| self.breakers.is_open(instance.id()));
        if closed.is_empty() {
            return Err(RouteError::AllCandidatesExhausted {
                operation: op.name().to_string(),
                attempts: open
                    .iter()
                    .map(|i| AttemptRecord::circuit_open(i.id()))
                    .collect(),
            });
        }

        // Unreachable instances only stay in the list when nothing else is left.
        let candidates = if closed.iter().any(|i| i.health.is_reachable()) {
            closed
                .into_iter()
                .filter(|i| i.health.is_reachable())
                .collect()
        } else {
            closed
        };

        let policy = self.routing.policy_for(op.capability());
        let ranked = match policy {
            RoutingPolicy::HealthBased => Self::rank_by_health(candidates),
            RoutingPolicy::RoundRobin => self.rotate(op.capability(), candidates),
            RoutingPolicy::Weighted => self.shuffle_weighted(candidates),
        };
        debug!(
            operation = op.name(),
            capability = op.capability(),
            ?policy,
            candidates = ?ranked.iter().map(ServiceProviderInstance::id).collect::<Vec<_>>(),
            "routed"
        );
        Ok(ranked)
    }

    fn rank_by_health(
        mut candidates: Vec<ServiceProviderInstance>,
    ) -> Vec<ServiceProviderInstance> {
        // Stable: registration order breaks ties.
        candidates.sort_by_key(|i| i.health.rank());
        candidates
    }

    fn rotate(
        &self,
        capability: &str,
        mut candidates: Vec<ServiceProviderInstance>,
    ) -> Vec<ServiceProviderInstance> {
        let start = self
            .cursors
            .entry(capability.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);
        let len = candidates.len();
        candidates.rotate_left(start % len);
        candidates
    }

    /// Weighted random order without replacement: each instance draws
    /// `u^(1/w)` and the list is sorted by descending key. Zero-weight
    /// instances go last in registration order.
    fn shuffle_weighted(
        &self,
        candidates: Vec<ServiceProviderInstance>,
    ) -> Vec<ServiceProviderInstance> {
        let mut keyed: Vec<(f64, usize, ServiceProviderInstance)> = {
            let mut rng = self.rng.lock();
            candidates
                .into_iter()
                .enumerate()
                .map(|(ordinal, instance)| {
                    let mut weight = f64::from(instance.spec.weight);
                    if instance.health == HealthState::Degraded {
                        weight *= self.routing.degraded_weight_factor;
                    }
                    let key = if weight > 0.0 {
                        rng.random::<f64>().powf(1.0 / weight)
                    } else {
                        -1.0
                    };
                    (key, ordinal, instance)
                })
                .collect()
        };
        keyed.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        keyed.into_iter().map(|(_, _, instance)| instance).collect()
    }

    /// Walks `candidates` in order until one call succeeds.
    ///
    /// # Errors
    ///
    /// `AllCandidatesExhausted` listing every attempt when no candidate
    /// produced a successful answer.
    pub async fn execute(
        &self,
        op: &Operation,
        candidates: &[ServiceProviderInstance],
        timeout: Duration,
    ) -> Result<Dispatched, RouteError> {
        let policy = if op.is_idempotent() {
            self.retry.policy_for(op.capability())
        } else {
            RetryPolicy::once()
        };
        let mut attempts = Vec::new();

        for candidate in candidates {
            let instance_id = candidate.id();
            let breaker = self.breakers.get(instance_id);

            for attempt in 1..=policy.attempts() {
                let Some(permit) = breaker.try_acquire() else {
                    attempts.push(AttemptRecord::circuit_open(instance_id));
                    break;
                };

                let request = match self.auth.headers(instance_id).await {
                    Ok(headers) => SpRequest::for_operation(&candidate.spec, op, headers, timeout)
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(format!("credentials unavailable: {e}")),
                };
                let request = match request {
                    Ok(request) => request,
                    Err(detail) => {
                        warn!(instance_id, operation = op.name(), %detail, "request not sent");
                        drop(permit);
                        attempts.push(AttemptRecord {
                            instance_id: instance_id.to_string(),
                            attempt,
                            outcome: CallOutcome::NotSent,
                            status_code: None,
                            detail,
                            latency_ms: 0,
                        });
                        break;
                    }
                };

                let started = Instant::now();
                let response = call_sp(&self.transport, request).await;
                #[allow(clippy::cast_possible_truncation)]
                let latency_ms = started.elapsed().as_millis() as u64;

                attempts.push(AttemptRecord {
                    instance_id: instance_id.to_string(),
                    attempt,
                    outcome: response.class.into(),
                    status_code: response.status_code,
                    detail: response.detail.clone(),
                    latency_ms,
                });

                match response.class {
                    ResponseClass::Success => {
                        permit.success();
                        return Ok(Dispatched {
                            instance_id: instance_id.to_string(),
                            payload: response.payload,
                            latency_ms,
                            attempts,
                        });
                    }
                    ResponseClass::ClientError => {
                        // The request itself is at fault: no same-instance retry.
                        permit.failure();
                        self.report_failure(instance_id);
                        debug!(instance_id, operation = op.name(), detail = %response.detail, "client error, failing over");
                        break;
                    }
                    ResponseClass::ServerError | ResponseClass::Timeout => {
                        permit.failure();
                        self.report_failure(instance_id);
                        if attempt < policy.attempts() {
                            tokio::time::sleep(policy.backoff.delay(attempt)).await;
                        }
                    }
                }
            }
        }

        warn!(
            operation = op.name(),
            capability = op.capability(),
            attempts = attempts.len(),
            "all candidates exhausted"
        );
        Err(RouteError::AllCandidatesExhausted {
            operation: op.name().to_string(),
            attempts,
        })
    }

    fn report_failure(&self, instance_id: &str) {
        if let Some((from, to)) = self.registry.downgrade(instance_id) {
            if from != to {
                warn!(instance_id, %from, %to, "instance health downgraded after failed call");
            }
        }
    }

    /// `route` followed by `execute`.
    ///
    /// # Errors
    ///
    /// See [`SpRouter::route`] and [`SpRouter::execute`].
    pub async fn dispatch(
        &self,
        op: &Operation,
        timeout: Duration,
    ) -> Result<Dispatched, RouteError> {
        let candidates = self.route(op)?;
        self.execute(op, &candidates, timeout).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
