//! Logical operations and retry policies.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A logical request against some SP capability, e.g. `get_performance`.
///
/// Fields are private: once built, an operation is never mutated. The
/// `with_*` methods consume and return `self` so construction reads as a
/// chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    name: String,
    capability: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
    /// Safe to re-send to the same instance after an error.
    #[serde(default)]
    idempotent: bool,
}

impl Operation {
    /// Creates a non-idempotent operation with no parameters.
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            params: BTreeMap::new(),
            idempotent: false,
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    #[must_use]
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

fn default_initial_ms() -> u64 {
    200
}

fn default_multiplier() -> u32 {
    2
}

fn default_max_ms() -> u64 {
    5_000
}

/// Exponential backoff: `initial_ms * multiplier^(n-1)`, capped at `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

impl Backoff {
    /// No waiting between attempts.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial_ms: 0,
            multiplier: 1,
            max_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based: the wait after the first
    /// failed attempt is `delay(1)`).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
    }
}

fn default_max_attempts() -> u32 {
    1
}

/// How many times something is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::none(),
        }
    }

    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// `max_attempts`, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_builder_is_immutable_after_construction() {
        let op = Operation::new("get_performance", "performance")
            .with_param("database", "orders")
            .idempotent(true);

        assert_eq!(op.name(), "get_performance");
        assert_eq!(op.capability(), "performance");
        assert_eq!(op.param("database"), Some(&Value::from("orders")));
        assert!(op.is_idempotent());
    }

    #[test]
    fn operation_deserializes_with_defaults() {
        let op: Operation =
            serde_json::from_str(r#"{"name":"list_vms","capability":"compute"}"#).unwrap();
        assert!(!op.is_idempotent());
        assert!(op.params().is_empty());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let backoff = Backoff {
            initial_ms: 100,
            multiplier: 2,
            max_ms: 500,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn retry_policy_never_reports_zero_attempts() {
        let policy = RetryPolicy::new(0, Backoff::none());
        assert_eq!(policy.attempts(), 1);
        assert_eq!(RetryPolicy::once().attempts(), 1);
    }
}
