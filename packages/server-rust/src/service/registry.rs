//! Registry of service-provider instances.
//!
//! Each instance lives behind its own lock: health updates on one instance
//! never contend with reads or updates on another. The static part of an
//! entry ([`InstanceSpec`]) is immutable once registered; only the health
//! record changes afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use portalfed_core::{HealthState, InstanceSpec, ServiceProviderInstance};
use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("instance {0} is already registered")]
    DuplicateInstance(String),
    #[error("instance {0} declares no capabilities")]
    NoCapabilities(String),
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct HealthRecord {
    state: HealthState,
    last_probe_ms: Option<u64>,
    last_latency_ms: Option<u64>,
}

#[derive(Debug)]
struct InstanceEntry {
    spec: InstanceSpec,
    health: RwLock<HealthRecord>,
}

impl InstanceEntry {
    fn snapshot(&self) -> ServiceProviderInstance {
        let health = *self.health.read();
        ServiceProviderInstance {
            spec: self.spec.clone(),
            health: health.state,
            last_probe_ms: health.last_probe_ms,
            last_latency_ms: health.last_latency_ms,
        }
    }
}

/// Counts over the registered instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
    pub by_capability: BTreeMap<String, usize>,
}

// ---------------------------------------------------------------------------
// SpRegistry
// ---------------------------------------------------------------------------

/// Registered SP instances, looked up by id or by capability.
///
/// Lookups return snapshots in registration order.
#[derive(Debug, Default)]
pub struct SpRegistry {
    by_id: DashMap<String, Arc<InstanceEntry>>,
    order: RwLock<Vec<String>>,
}

impl SpRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a startup snapshot.
    ///
    /// # Errors
    ///
    /// Fails on the first spec that [`SpRegistry::register`] rejects.
    pub fn from_specs(
        specs: impl IntoIterator<Item = InstanceSpec>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Adds an instance with health `Unknown`.
    ///
    /// # Errors
    ///
    /// Rejects duplicate ids and specs without capabilities.
    pub fn register(&self, spec: InstanceSpec) -> Result<(), RegistryError> {
        if spec.capabilities.is_empty() {
            return Err(RegistryError::NoCapabilities(spec.id));
        }
        match self.by_id.entry(spec.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateInstance(spec.id)),
            Entry::Vacant(slot) => {
                let id = spec.id.clone();
                info!(
                    instance_id = %id,
                    capabilities = spec.capabilities.len(),
                    "instance registered"
                );
                slot.insert(Arc::new(InstanceEntry {
                    spec,
                    health: RwLock::new(HealthRecord::default()),
                }));
                self.order.write().push(id);
                Ok(())
            }
        }
    }

    /// Removes an instance. Returns its spec if it was registered.
    pub fn deregister(&self, id: &str) -> Option<InstanceSpec> {
        let (_, entry) = self.by_id.remove(id)?;
        self.order.write().retain(|existing| existing != id);
        info!(instance_id = %id, "instance deregistered");
        Some(entry.spec.clone())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[must_use]
    pub fn spec(&self, id: &str) -> Option<InstanceSpec> {
        self.by_id.get(id).map(|entry| entry.spec.clone())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceProviderInstance> {
        self.by_id.get(id).map(|entry| entry.snapshot())
    }

    #[must_use]
    pub fn health(&self, id: &str) -> Option<HealthState> {
        self.by_id.get(id).map(|entry| entry.health.read().state)
    }

    /// Ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Every instance, in registration order.
    #[must_use]
    pub fn instances(&self) -> Vec<ServiceProviderInstance> {
        self.collect(|_| true)
    }

    /// Instances advertising `capability`, in registration order.
    #[must_use]
    pub fn capable(&self, capability: &str) -> Vec<ServiceProviderInstance> {
        self.collect(|spec| spec.supports(capability))
    }

    fn collect(&self, keep: impl Fn(&InstanceSpec) -> bool) -> Vec<ServiceProviderInstance> {
        let order = self.order.read().clone();
        order
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|entry| Arc::clone(entry.value())))
            .filter(|entry| keep(&entry.spec))
            .map(|entry| entry.snapshot())
            .collect()
    }

    /// Stores a probe outcome. Returns the previous state.
    pub fn record_probe(
        &self,
        id: &str,
        state: HealthState,
        probed_at_ms: u64,
        latency_ms: u64,
    ) -> Option<HealthState> {
        let entry = self.by_id.get(id).map(|e| Arc::clone(e.value()))?;
        let mut health = entry.health.write();
        let previous = health.state;
        health.state = state;
        health.last_probe_ms = Some(probed_at_ms);
        health.last_latency_ms = Some(latency_ms);
        Some(previous)
    }

    /// Applies a probe result to the current state under the entry's lock: a
    /// passing probe resets to Healthy, a failing one moves a step down from
    /// wherever concurrent call failures have already left the instance.
    /// Returns `(previous, current)`.
    pub fn record_probe_outcome(
        &self,
        id: &str,
        healthy: bool,
        probed_at_ms: u64,
        latency_ms: u64,
    ) -> Option<(HealthState, HealthState)> {
        let entry = self.by_id.get(id).map(|e| Arc::clone(e.value()))?;
        let mut health = entry.health.write();
        let previous = health.state;
        health.state = if healthy {
            HealthState::Healthy
        } else {
            previous.downgrade()
        };
        health.last_probe_ms = Some(probed_at_ms);
        health.last_latency_ms = Some(latency_ms);
        Some((previous, health.state))
    }

    /// Moves the instance one step down the health ladder after a failed
    /// call. Returns `(previous, current)`.
    pub fn downgrade(&self, id: &str) -> Option<(HealthState, HealthState)> {
        let entry = self.by_id.get(id).map(|e| Arc::clone(e.value()))?;
        let mut health = entry.health.write();
        let previous = health.state;
        health.state = previous.downgrade();
        Some((previous, health.state))
    }

    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary::default();
        for instance in self.instances() {
            summary.total += 1;
            let kind = if instance.spec.kind.is_empty() {
                "unspecified".to_string()
            } else {
                instance.spec.kind.clone()
            };
            *summary.by_kind.entry(kind).or_default() += 1;
            *summary
                .by_health
                .entry(instance.health.as_str().to_string())
                .or_default() += 1;
            for capability in &instance.spec.capabilities {
                *summary.by_capability.entry(capability.clone()).or_default() += 1;
            }
        }
        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, caps: &[&str]) -> InstanceSpec {
        InstanceSpec::new(id, format!("http://{id}"), caps.iter().copied())
    }

    #[test]
    fn capability_lookup_keeps_registration_order() {
        let registry = SpRegistry::new();
        registry.register(spec("b", &["get_metrics"])).unwrap();
        registry
            .register(spec("a", &["get_metrics", "list_vms"]))
            .unwrap();
        registry.register(spec("c", &["list_vms"])).unwrap();

        let ids: Vec<String> = registry
            .capable("get_metrics")
            .into_iter()
            .map(|i| i.spec.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(registry.capable("unknown").is_empty());
    }

    #[test]
    fn duplicate_and_empty_specs_are_rejected() {
        let registry = SpRegistry::new();
        registry.register(spec("a", &["x"])).unwrap();
        assert_eq!(
            registry.register(spec("a", &["y"])),
            Err(RegistryError::DuplicateInstance("a".into()))
        );
        assert_eq!(
            registry.register(spec("b", &[])),
            Err(RegistryError::NoCapabilities("b".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_removes_from_lookups() {
        let registry = SpRegistry::from_specs([spec("a", &["x"]), spec("b", &["x"])]).unwrap();
        assert!(registry.deregister("a").is_some());
        assert!(registry.deregister("a").is_none());
        assert_eq!(registry.ids(), vec!["b"]);
        assert!(!registry.contains("a"));
    }

    #[test]
    fn health_updates_are_per_instance() {
        let registry = SpRegistry::from_specs([spec("a", &["x"]), spec("b", &["x"])]).unwrap();
        assert_eq!(registry.health("a"), Some(HealthState::Unknown));

        registry.record_probe("a", HealthState::Healthy, 1_000, 12);
        assert_eq!(
            registry.downgrade("a"),
            Some((HealthState::Healthy, HealthState::Degraded))
        );
        assert_eq!(registry.health("b"), Some(HealthState::Unknown));

        let a = registry.get("a").unwrap();
        assert_eq!(a.last_probe_ms, Some(1_000));
        assert_eq!(a.last_latency_ms, Some(12));
        assert!(registry.downgrade("missing").is_none());
    }

    #[test]
    fn failed_probe_builds_on_a_concurrent_call_downgrade() {
        let registry = SpRegistry::from_specs([spec("a", &["x"])]).unwrap();
        registry.record_probe("a", HealthState::Healthy, 1, 1);
        registry.downgrade("a");

        assert_eq!(
            registry.record_probe_outcome("a", false, 2, 5),
            Some((HealthState::Degraded, HealthState::Unreachable))
        );
        assert_eq!(
            registry.record_probe_outcome("a", true, 3, 5),
            Some((HealthState::Unreachable, HealthState::Healthy))
        );
        assert_eq!(registry.get("a").unwrap().last_probe_ms, Some(3));
        assert!(registry
            .record_probe_outcome("missing", true, 3, 5)
            .is_none());
    }

    #[test]
    fn interleaved_failures_are_never_lost() {
        for _ in 0..50 {
            let registry = Arc::new(SpRegistry::from_specs([spec("a", &["x"])]).unwrap());
            registry.record_probe("a", HealthState::Healthy, 1, 1);
            let prober = {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.record_probe_outcome("a", false, 2, 1))
            };
            let caller = {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.downgrade("a"))
            };
            prober.join().unwrap();
            caller.join().unwrap();
            assert_eq!(registry.health("a"), Some(HealthState::Unreachable));
        }
    }

    #[test]
    fn summary_counts_kinds_health_and_capabilities() {
        let registry = SpRegistry::from_specs([
            spec("ops-1", &["list_vms", "get_metrics"]).with_kind("core"),
            spec("ana-1", &["get_metrics"]).with_kind("analytics"),
        ])
        .unwrap();
        registry.record_probe("ops-1", HealthState::Healthy, 1, 1);

        let summary = registry.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_kind["core"], 1);
        assert_eq!(summary.by_health["healthy"], 1);
        assert_eq!(summary.by_health["unknown"], 1);
        assert_eq!(summary.by_capability["get_metrics"], 2);
    }
}
