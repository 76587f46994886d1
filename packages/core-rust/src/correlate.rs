//! Cross-source result correlation.
//!
//! Several steps of one workflow often describe the same logical entity: the
//! operations portal and the analytics portal both report on database
//! `orders`, each with its own view of `cpu_usage`. The [`Correlator`] groups
//! the payload records of successful steps by entity key and folds each group
//! into one [`CorrelatedResult`].
//!
//! # Conflict resolution
//!
//! Contributions to a group are ranked by:
//!
//! 1. source priority, highest first (configured per capability);
//! 2. completion time, most recent first;
//! 3. step id, then instance id, then position in the payload.
//!
//! The last rule only exists to make the order total, so the output never
//! depends on the order in which results were supplied. For each field the
//! highest-ranked contribution that carries it wins; every disagreeing value
//! from a lower-ranked contribution is kept in [`FieldConflict::overridden`]
//! together with the rule that decided against it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::workflow::StepResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_entity_key_fields() -> Vec<String> {
    ["database", "resource_id", "name"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Entity key extraction and source ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Payload fields probed, in order, for an entity key.
    #[serde(default = "default_entity_key_fields")]
    pub entity_key_fields: Vec<String>,
    /// Capability to priority. Unlisted capabilities rank 0.
    #[serde(default)]
    pub source_priority: BTreeMap<String, i32>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            entity_key_fields: default_entity_key_fields(),
            source_priority: BTreeMap::new(),
        }
    }
}

impl CorrelationConfig {
    #[must_use]
    pub fn priority(&self, capability: &str) -> i32 {
        self.source_priority.get(capability).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn with_priority(mut self, capability: impl Into<String>, priority: i32) -> Self {
        self.source_priority.insert(capability.into(), priority);
        self
    }

    /// First configured key field present as a string or number.
    #[must_use]
    pub fn entity_key(&self, record: &Map<String, Value>) -> Option<String> {
        self.entity_key_fields
            .iter()
            .find_map(|field| match record.get(field)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// The step result a value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub step_id: String,
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance_id: Option<String>,
    pub priority: i32,
    pub observed_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// The winner's source outranks the loser's.
    SourcePriority,
    /// Equal priority; the winner completed later.
    Recency,
    /// Equal priority and time; decided by step id ordering.
    StableOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverriddenValue {
    pub source: SourceRef,
    pub value: Value,
    pub rule: ResolutionRule,
}

/// A field on which sources disagreed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub chosen: Value,
    pub winner: SourceRef,
    pub overridden: Vec<OverriddenValue>,
}

/// One merged entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedResult {
    pub entity_key: String,
    pub fields: BTreeMap<String, Value>,
    /// Field name to the source whose value was kept.
    pub provenance: BTreeMap<String, SourceRef>,
    #[serde(default)]
    pub conflicts: Vec<FieldConflict>,
    /// Contributing sources, best-ranked first.
    pub sources: Vec<SourceRef>,
    /// Only one source described this entity; nothing was merged.
    pub single_source: bool,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

struct Contribution<'a> {
    source: SourceRef,
    ordinal: usize,
    record: &'a Map<String, Value>,
}

impl Contribution<'_> {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .source
            .priority
            .cmp(&self.source.priority)
            .then_with(|| other.source.observed_at_ms.cmp(&self.source.observed_at_ms))
            .then_with(|| self.source.step_id.cmp(&other.source.step_id))
            .then_with(|| self.source.instance_id.cmp(&other.source.instance_id))
            .then_with(|| self.ordinal.cmp(&other.ordinal))
    }
}

fn rule_between(winner: &SourceRef, loser: &SourceRef) -> ResolutionRule {
    if winner.priority != loser.priority {
        ResolutionRule::SourcePriority
    } else if winner.observed_at_ms != loser.observed_at_ms {
        ResolutionRule::Recency
    } else {
        ResolutionRule::StableOrder
    }
}

/// Records inside a payload: the object itself, or the objects of an array.
fn records(payload: &Value) -> Vec<&Map<String, Value>> {
    match payload {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

/// Merges successful step results that describe the same entities.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    config: CorrelationConfig,
}

impl Correlator {
    #[must_use]
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Correlates using the configured entity key fields.
    #[must_use]
    pub fn correlate_by_config(&self, results: &[StepResult]) -> Vec<CorrelatedResult> {
        self.correlate(results, |record| self.config.entity_key(record))
    }

    /// Groups payload records by `key_fn` and merges each group.
    ///
    /// Non-successful results and records without a key are ignored. Output
    /// is ordered by entity key. Never fails: empty input yields an empty
    /// vector.
    pub fn correlate<F>(&self, results: &[StepResult], key_fn: F) -> Vec<CorrelatedResult>
    where
        F: Fn(&Map<String, Value>) -> Option<String>,
    {
        let mut groups: BTreeMap<String, Vec<Contribution<'_>>> = BTreeMap::new();

        for result in results.iter().filter(|r| r.is_success()) {
            let source = SourceRef {
                step_id: result.step_id.clone(),
                capability: result.capability.clone(),
                instance_id: result.served_by.clone(),
                priority: self.config.priority(&result.capability),
                observed_at_ms: result.completed_at_ms,
            };
            for (ordinal, record) in records(&result.payload).into_iter().enumerate() {
                let Some(key) = key_fn(record) else {
                    continue;
                };
                groups.entry(key).or_default().push(Contribution {
                    source: source.clone(),
                    ordinal,
                    record,
                });
            }
        }

        let merged: Vec<CorrelatedResult> = groups
            .into_iter()
            .map(|(key, mut contributions)| {
                contributions.sort_by(Contribution::rank);
                merge(key, &contributions)
            })
            .collect();

        let conflicts: usize = merged.iter().map(|m| m.conflicts.len()).sum();
        if conflicts > 0 {
            debug!(entities = merged.len(), conflicts, "field conflicts resolved");
        }
        merged
    }
}

fn merge(entity_key: String, contributions: &[Contribution<'_>]) -> CorrelatedResult {
    let mut fields = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    let mut conflicts: BTreeMap<String, FieldConflict> = BTreeMap::new();

    for contribution in contributions {
        for (field, value) in contribution.record {
            let Some(chosen) = fields.get(field) else {
                fields.insert(field.clone(), value.clone());
                provenance.insert(field.clone(), contribution.source.clone());
                continue;
            };
            if chosen == value {
                continue;
            }
            let winner: &SourceRef = &provenance[field];
            let overridden = OverriddenValue {
                source: contribution.source.clone(),
                value: value.clone(),
                rule: rule_between(winner, &contribution.source),
            };
            conflicts
                .entry(field.clone())
                .or_insert_with(|| FieldConflict {
                    field: field.clone(),
                    chosen: chosen.clone(),
                    winner: winner.clone(),
                    overridden: Vec::new(),
                })
                .overridden
                .push(overridden);
        }
    }

    let mut sources: Vec<SourceRef> = Vec::new();
    for contribution in contributions {
        if !sources.contains(&contribution.source) {
            sources.push(contribution.source.clone());
        }
    }

    CorrelatedResult {
        entity_key,
        fields,
        provenance,
        conflicts: conflicts.into_values().collect(),
        single_source: sources.len() == 1,
        sources,
    }
}
