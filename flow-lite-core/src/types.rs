use crate::rules::RuleSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Context payload ──────────────────────────────────────────

/// Open key→value payload carried by an instance. The core never interprets
/// it beyond rule evaluation and history snapshotting; arbitrary business
/// data must round-trip unchanged.
pub type ContextMap = serde_json::Map<String, serde_json::Value>;

/// Shallow merge, last write wins per key.
pub fn merge_context(base: &mut ContextMap, updates: &ContextMap) {
    for (key, value) in updates {
        base.insert(key.clone(), value.clone());
    }
}

// ─── Principal ────────────────────────────────────────────────

/// Verified caller identity supplied by the upstream auth service.
/// Used only for bookkeeping (created_by / triggered_by / organization
/// scoping); the core performs no authorization decisions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub roles: Vec<String>,
}

// ─── Definition ───────────────────────────────────────────────

/// One named state in a workflow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default)]
    pub is_final: bool,
    pub display_title: Option<String>,
}

/// One declared `(from_state, to_state, action)` edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from_state: String,
    pub to_state: String,
    pub action: String,
    pub title: Option<String>,
}

/// A reusable workflow template. Immutable once an instance references it;
/// new behavior requires a new version. Soft-deactivated, never hard-deleted
/// while instances reference it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Definition {
    pub definition_id: Uuid,
    pub name: String,
    pub version: u32,
    pub category: Option<String>,
    /// None = global template, visible to every organization.
    pub organization_id: Option<String>,
    pub initial_state: String,
    pub states: Vec<StateDef>,
    pub transitions: Vec<TransitionDef>,
    /// Keyed by `"{from_state}_{to_state}"`, evaluated in addition to the
    /// transition-table check.
    #[serde(default)]
    pub business_rules: BTreeMap<String, RuleSet>,
    pub is_active: bool,
    /// Incremented each time an instance is created from this definition.
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

impl Definition {
    /// Key into `business_rules` for one edge.
    pub fn rule_key(from_state: &str, to_state: &str) -> String {
        format!("{from_state}_{to_state}")
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.iter().find(|s| s.name == name)
    }

    /// True iff some declared transition matches all three fields exactly.
    /// Pure function over the transition list, no persistence side effects.
    pub fn validate_transition(&self, from_state: &str, to_state: &str, action: &str) -> bool {
        self.transitions.iter().any(|t| {
            t.from_state == from_state && t.to_state == to_state && t.action == action
        })
    }

    /// All transitions leaving `state`, in declaration order.
    pub fn transitions_from(&self, state: &str) -> Vec<&TransitionDef> {
        self.transitions
            .iter()
            .filter(|t| t.from_state == state)
            .collect()
    }

    /// Content digest over the executable shape of the template
    /// (initial state, states, transitions). Instances record the digest
    /// they were instantiated from so definition skew is detectable.
    pub fn fingerprint(&self) -> [u8; 32] {
        let canonical = serde_json::to_vec(&(&self.initial_state, &self.states, &self.transitions))
            .expect("definition fingerprint serialization");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hasher.finalize().into()
    }
}

// ─── Instance ─────────────────────────────────────────────────

/// Top-level lifecycle status of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Cancelled,
    Error,
}

impl InstanceStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Active)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One live execution of a definition, bound to an external business entity.
/// Mutated only by the engine inside a transition commit; never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: Uuid,
    pub definition_id: Uuid,
    /// Digest of the definition at instantiation time (skew detection).
    pub definition_fingerprint: [u8; 32],
    /// The external business object this workflow governs. Opaque to the core.
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub title: Option<String>,
    pub current_state: String,
    /// State immediately prior to the last successful transition.
    pub previous_state: Option<String>,
    pub context: ContextMap,
    pub status: InstanceStatus,
    pub assigned_to: Option<String>,
    pub organization_id: Option<String>,
    pub created_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    /// Derived from the definition's state ordering, clamped to [0, 100].
    pub progress_percentage: f64,
    /// Failed transition attempts. Never reset automatically.
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Row version for optimistic concurrency. Incremented on every commit.
    pub version: u64,
}

impl Instance {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == InstanceStatus::Active
            && self.due_date.is_some_and(|due| now > due)
    }
}

// ─── Listing filter ───────────────────────────────────────────

/// Filter for per-user instance listings. Results are ordered newest
/// started first and paginated.
#[derive(Clone, Debug, Default)]
pub struct InstanceFilter {
    pub assigned_to: Option<String>,
    pub organization_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub limit: usize,
    pub offset: usize,
}
