//! Engine configuration.
//!
//! The whole configuration is one immutable snapshot, loaded once at startup.
//! Every section has defaults, so a file only needs to list what it changes.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use portalfed_core::{Backoff, CorrelationConfig, InstanceSpec, RetryPolicy};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("instance {0} is configured twice")]
    DuplicateInstance(String),
    #[error("instance {0} declares no capabilities")]
    NoCapabilities(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("degraded_weight_factor must be within [0, 1], got {0}")]
    WeightFactor(f64),
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Random order, probability proportional to weight.
    Weighted,
    /// Healthy, then Unknown, then Degraded.
    #[default]
    HealthBased,
    /// Rotating start position per capability.
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_policy: RoutingPolicy,
    pub per_capability: BTreeMap<String, RoutingPolicy>,
    /// Weight multiplier applied to Degraded instances by the weighted policy.
    pub degraded_weight_factor: f64,
    /// Seed for the weighted policy's RNG. Random when absent.
    pub seed: Option<u64>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_policy: RoutingPolicy::default(),
            per_capability: BTreeMap::new(),
            degraded_weight_factor: 0.5,
            seed: None,
        }
    }
}

impl RoutingConfig {
    #[must_use]
    pub fn policy_for(&self, capability: &str) -> RoutingPolicy {
        self.per_capability
            .get(capability)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// A failure streak older than this starts over.
    pub failure_window_ms: u64,
    /// Cool-down after the first trip; doubles on each further trip.
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            base_cooldown_ms: 10_000,
            max_cooldown_ms: 300_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

/// Same-instance retry policy for idempotent operations, per capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryPolicy,
    pub per_capability: BTreeMap<String, RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicy::new(3, Backoff::default()),
            per_capability: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy_for(&self, capability: &str) -> RetryPolicy {
        self.per_capability
            .get(capability)
            .copied()
            .unwrap_or(self.default)
    }
}

// ---------------------------------------------------------------------------
// Executor and health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Running steps across all workflows.
    pub max_concurrent_steps: usize,
    /// Running steps per session, when set.
    pub max_concurrent_steps_per_session: Option<usize>,
    pub confirmation_timeout_ms: u64,
    /// Per-call timeout for steps that do not set their own.
    pub default_call_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 16,
            max_concurrent_steps_per_session: None,
            confirmation_timeout_ms: 300_000,
            default_call_timeout_ms: 30_000,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

/// Static configuration snapshot for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub instances: Vec<InstanceSpec>,
    pub routing: RoutingConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
    pub correlation: CorrelationConfig,
    /// Upper bound on waiting for advisory text.
    pub insight_timeout_ms: u64,
    /// How long shutdown waits for in-flight workflows before cancelling them.
    pub drain_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            routing: RoutingConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            health: HealthConfig::default(),
            correlation: CorrelationConfig::default(),
            insight_timeout_ms: 10_000,
            drain_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the
    /// [`OrchestratorConfig::validate`] errors otherwise.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// See [`OrchestratorConfig::from_json_str`]; also fails when the file
    /// cannot be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// # Errors
    ///
    /// Rejects duplicate instance ids, instances without capabilities, zero
    /// thresholds or concurrency limits, and a weight factor outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.instances {
            if !seen.insert(spec.id.as_str()) {
                return Err(ConfigError::DuplicateInstance(spec.id.clone()));
            }
            if spec.capabilities.is_empty() {
                return Err(ConfigError::NoCapabilities(spec.id.clone()));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("breaker.failure_threshold"));
        }
        if self.breaker.failure_window_ms == 0 {
            return Err(ConfigError::Zero("breaker.failure_window_ms"));
        }
        if self.executor.max_concurrent_steps == 0 {
            return Err(ConfigError::Zero("executor.max_concurrent_steps"));
        }
        if self.executor.max_concurrent_steps_per_session == Some(0) {
            return Err(ConfigError::Zero(
                "executor.max_concurrent_steps_per_session",
            ));
        }
        if self.health.probe_interval_ms == 0 {
            return Err(ConfigError::Zero("health.probe_interval_ms"));
        }
        let factor = self.routing.degraded_weight_factor;
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::WeightFactor(factor));
        }
        Ok(())
    }
}
