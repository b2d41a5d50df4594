use crate::history::HistoryEntry;
use crate::types::{Definition, Instance, InstanceFilter};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Storage-layer errors. The engine maps these into the public taxonomy:
/// `Transient` is retried with backoff, `Conflict` triggers re-evaluation
/// against the freshly loaded instance, the rest surface as storage
/// failures. Messages never leak storage internals to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("write conflict on instance {0}")]
    Conflict(Uuid),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Persistence trait for all workflow state.
///
/// The engine operates exclusively through this trait, enabling pluggable
/// backends (`MemoryStore` for tests and POC use, a relational backend in
/// production). The composite methods are the transactional contract: each
/// one is a single atomic unit on the backend, and `commit_transition`
/// carries the optimistic version check that serializes writers per
/// instance.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ── Definitions ──

    /// Persist a definition. Backends must refuse to overwrite a
    /// definition that instances already reference; new behavior ships as
    /// a new version.
    async fn save_definition(&self, definition: &Definition) -> Result<(), StoreError>;

    async fn load_definition(&self, definition_id: Uuid) -> Result<Option<Definition>, StoreError>;

    async fn list_definitions(
        &self,
        organization_id: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<Definition>, StoreError>;

    /// Soft-deactivate: running instances continue, new ones cannot spawn.
    async fn deactivate_definition(&self, definition_id: Uuid) -> Result<(), StoreError>;

    // ── Instances ──

    /// Insert a new instance, append its creation history entry, and
    /// increment the definition's usage count in one atomic unit. Partial
    /// application must never be observable.
    async fn insert_instance(
        &self,
        instance: &Instance,
        creation: &HistoryEntry,
    ) -> Result<(), StoreError>;

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<Instance>, StoreError>;

    /// Conditional write: persist `instance` exactly as given and append
    /// the successful history entry, iff the stored row version still
    /// equals `expected_version`. A mismatch yields `StoreError::Conflict`
    /// and writes nothing. The caller pre-increments `instance.version`.
    async fn commit_transition(
        &self,
        instance: &Instance,
        expected_version: u64,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError>;

    /// Append a failed-attempt entry. If the instance is still active,
    /// also bump its error counter and overwrite `last_error`; terminal
    /// instances gain only the ledger row. Returns the entry's sequence
    /// number within the instance ledger.
    async fn record_failed_attempt(
        &self,
        instance_id: Uuid,
        entry: &HistoryEntry,
    ) -> Result<u64, StoreError>;

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError>;

    // ── History ledger (append-only) ──

    /// Page of entries for one instance, newest first.
    async fn load_history(
        &self,
        instance_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}
