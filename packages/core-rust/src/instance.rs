//! Service-provider instance descriptors and health states.
//!
//! An [`InstanceSpec`] is the static, configuration-time description of one
//! SP instance. The registry wraps it with mutable health data; a
//! [`ServiceProviderInstance`] is the read-only snapshot of both.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::Operation;

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

/// Liveness classification maintained by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No probe has completed yet.
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthState {
    /// One step down the ladder `Healthy -> Degraded -> Unreachable`.
    ///
    /// `Unknown` is treated like `Healthy`: the first failed probe lands on
    /// `Degraded`.
    #[must_use]
    pub fn downgrade(self) -> Self {
        match self {
            Self::Unknown | Self::Healthy => Self::Degraded,
            Self::Degraded | Self::Unreachable => Self::Unreachable,
        }
    }

    /// Sort rank for health-based routing. Lower is preferred.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Unreachable => 3,
        }
    }

    #[must_use]
    pub fn is_reachable(self) -> bool {
        self != Self::Unreachable
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// How requests to an instance are authenticated.
///
/// Secrets are carried as opaque strings; resolving them into headers is the
/// job of an `AuthProvider` on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthDescriptor {
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    BearerToken {
        token: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    /// Arbitrary static header set.
    Custom {
        headers: BTreeMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Method plus path template (`/databases/{database}/metrics`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(default)]
    pub method: HttpMethod,
    pub path: String,
}

impl EndpointSpec {
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// InstanceSpec
// ---------------------------------------------------------------------------

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_weight() -> u32 {
    1
}

/// Static description of one SP instance, loaded once at startup or
/// registered dynamically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Stable identity, unique across the registry.
    pub id: String,
    /// Human-readable name. Defaults to `id` when empty.
    #[serde(default)]
    pub name: String,
    /// Portal family, e.g. `"core"`, `"analytics"`, `"security"`.
    #[serde(default)]
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: Option<AuthDescriptor>,
    pub capabilities: BTreeSet<String>,
    /// Operation name (or capability name) to endpoint.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointSpec>,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// Relative share for weighted routing.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InstanceSpec {
    /// Minimal spec with defaults for everything except identity, URL and
    /// capabilities.
    pub fn new<I, S>(id: impl Into<String>, base_url: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: String::new(),
            base_url: base_url.into(),
            auth: None,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            endpoints: BTreeMap::new(),
            health_check_path: default_health_check_path(),
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthDescriptor) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, key: impl Into<String>, endpoint: EndpointSpec) -> Self {
        self.endpoints.insert(key.into(), endpoint);
        self
    }

    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Endpoint serving `op`: an entry keyed by the operation name, then one
    /// keyed by its capability, then `POST /{operation name}`.
    #[must_use]
    pub fn endpoint_for(&self, op: &Operation) -> EndpointSpec {
        self.endpoints
            .get(op.name())
            .or_else(|| self.endpoints.get(op.capability()))
            .cloned()
            .unwrap_or_else(|| EndpointSpec::new(HttpMethod::Post, format!("/{}", op.name())))
    }

    /// Display name, falling back to the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceProviderInstance
// ---------------------------------------------------------------------------

/// Read-only snapshot of a registered instance and its current health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProviderInstance {
    pub spec: InstanceSpec,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_probe_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_latency_ms: Option<u64>,
}

impl ServiceProviderInstance {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_walks_the_ladder() {
        assert_eq!(HealthState::Healthy.downgrade(), HealthState::Degraded);
        assert_eq!(HealthState::Unknown.downgrade(), HealthState::Degraded);
        assert_eq!(HealthState::Degraded.downgrade(), HealthState::Unreachable);
        assert_eq!(HealthState::Unreachable.downgrade(), HealthState::Unreachable);
    }

    #[test]
    fn rank_orders_healthy_first() {
        let mut states = vec![
            HealthState::Unreachable,
            HealthState::Degraded,
            HealthState::Unknown,
            HealthState::Healthy,
        ];
        states.sort_by_key(|s| s.rank());
        assert_eq!(
            states,
            vec![
                HealthState::Healthy,
                HealthState::Unknown,
                HealthState::Degraded,
                HealthState::Unreachable,
            ]
        );
    }

    #[test]
    fn endpoint_resolution_prefers_operation_then_capability() {
        let spec = InstanceSpec::new("core-1", "http://core", ["performance"])
            .with_endpoint(
                "performance",
                EndpointSpec::new(HttpMethod::Get, "/perf"),
            )
            .with_endpoint(
                "get_performance",
                EndpointSpec::new(HttpMethod::Get, "/databases/{database}/performance"),
            );

        let by_name = Operation::new("get_performance", "performance");
        assert_eq!(
            spec.endpoint_for(&by_name).path,
            "/databases/{database}/performance"
        );

        let by_capability = Operation::new("get_trends", "performance");
        assert_eq!(spec.endpoint_for(&by_capability).path, "/perf");

        let fallback = Operation::new("list_vms", "compute");
        let endpoint = spec.endpoint_for(&fallback);
        assert_eq!(endpoint.method, HttpMethod::Post);
        assert_eq!(endpoint.path, "/list_vms");
    }

    #[test]
    fn auth_descriptor_deserializes_tagged_variants() {
        let api_key: AuthDescriptor =
            serde_json::from_str(r#"{"type":"api_key","key":"secret"}"#).unwrap();
        assert_eq!(
            api_key,
            AuthDescriptor::ApiKey {
                header: "X-API-Key".to_string(),
                key: "secret".to_string(),
            }
        );

        let bearer: AuthDescriptor =
            serde_json::from_str(r#"{"type":"bearer_token","token":"t"}"#).unwrap();
        assert!(matches!(bearer, AuthDescriptor::BearerToken { .. }));
    }

    #[test]
    fn instance_spec_defaults_from_json() {
        let spec: InstanceSpec = serde_json::from_str(
            r#"{"id":"a1","base_url":"http://a","capabilities":["get_metrics"]}"#,
        )
        .unwrap();
        assert_eq!(spec.health_check_path, "/health");
        assert_eq!(spec.weight, 1);
        assert!(spec.auth.is_none());
        assert_eq!(spec.display_name(), "a1");
        assert!(spec.supports("get_metrics"));
    }
}
