//! flow-lite-core: dynamic workflow orchestration core.
//!
//! A finite-state-machine engine whose states and transitions are loaded
//! from data-defined templates rather than fixed at build time:
//! - Definition types and the pure transition-table queries
//! - Per-request compilation of a definition into an executable machine
//! - Instances bound to external business entities, with open context data
//! - An append-only history ledger recording every transition attempt,
//!   rejected attempts included
//! - The engine owning validation, rule evaluation, and the transaction
//!   boundary, with optimistic per-instance write serialization
//!
//! Transport, authentication, and the production storage backend live in
//! the surrounding service; the core consumes a verified `Principal` and a
//! `WorkflowStore` handle.

pub mod engine;
pub mod error;
pub mod history;
pub mod machine;
pub mod rules;
pub mod store;
pub mod store_memory;
pub mod types;

pub use engine::{
    ActionDescriptor, AdvanceRequest, EngineConfig, InstanceStatusView, NewInstance,
    WorkflowEngine,
};
pub use error::WorkflowError;
pub use history::{state_path, HistoryEntry, TriggerType};
pub use machine::{BoundMachine, CompiledWorkflow};
pub use rules::{CompareOp, Condition, RuleSet};
pub use store::{StoreError, WorkflowStore};
pub use store_memory::MemoryStore;
pub use types::{
    merge_context, ContextMap, Definition, Instance, InstanceFilter, InstanceStatus, Principal,
    StateDef, TransitionDef,
};
