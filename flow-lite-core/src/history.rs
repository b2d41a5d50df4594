use crate::types::ContextMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a transition attempt was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    System,
}

/// One row in the append-only audit ledger: a transition **attempt**,
/// successful or failed. Entries are never updated or deleted; ordered by
/// append sequence they reconstruct the instance's full state path,
/// rejected attempts included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: Uuid,
    pub instance_id: Uuid,
    /// None only for the creation entry.
    pub from_state: Option<String>,
    /// Target state of the attempt. For rejected attempts that never
    /// resolved to a transition this is the state the instance stayed in.
    pub to_state: String,
    pub action: String,
    pub triggered_by: String,
    pub trigger_type: TriggerType,
    pub comment: Option<String>,
    pub action_metadata: Option<ContextMap>,
    /// Copy of the instance context after mutation, or at failure time.
    pub context_snapshot: ContextMap,
    pub duration_ms: u64,
    pub was_successful: bool,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Successful-state path implied by a ledger slice ordered oldest first:
/// the creation entry's target followed by every committed transition's
/// target. Failed attempts do not contribute.
pub fn state_path(entries: &[HistoryEntry]) -> Vec<&str> {
    entries
        .iter()
        .filter(|e| e.was_successful)
        .map(|e| e.to_state.as_str())
        .collect()
}
