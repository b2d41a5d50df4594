use crate::store::StoreError;
use crate::types::InstanceStatus;
use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the workflow core.
///
/// Structural errors (`DefinitionNotFound`, `InstanceNotFound`,
/// `InvalidDefinition`, `StateDrift`) abort with no history write.
/// Validation errors (`InstanceNotActive`, `ActionNotAvailable`,
/// `RuleViolation`) are surfaced to the caller and recorded as a failed
/// history entry. `Storage` wraps the persistence layer after retries
/// are exhausted.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow definition {0} not found or inactive")]
    DefinitionNotFound(Uuid),

    #[error("workflow instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("invalid workflow definition {definition_id}: {reason}")]
    InvalidDefinition { definition_id: Uuid, reason: String },

    #[error(
        "instance {instance_id} is in state '{state}' which is not declared by definition {definition_id}"
    )]
    StateDrift {
        instance_id: Uuid,
        definition_id: Uuid,
        state: String,
    },

    #[error("instance {instance_id} is {status}, no further transitions are accepted")]
    InstanceNotActive {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("action '{action}' is not available from state '{state}' on instance {instance_id}")]
    ActionNotAvailable {
        instance_id: Uuid,
        action: String,
        state: String,
    },

    #[error(
        "business rule rejected '{action}' ({from_state} -> {to_state}) on instance {instance_id}: {reason}"
    )]
    RuleViolation {
        instance_id: Uuid,
        action: String,
        from_state: String,
        to_state: String,
        reason: String,
    },

    #[error("storage failure")]
    Storage(#[from] StoreError),
}

impl WorkflowError {
    /// True for errors the caller may retry as-is (transient storage trouble).
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkflowError::Storage(e) if e.is_transient())
    }

    /// True for validation rejections that leave the instance intact and
    /// are recorded in the history ledger.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            WorkflowError::InstanceNotActive { .. }
                | WorkflowError::ActionNotAvailable { .. }
                | WorkflowError::RuleViolation { .. }
        )
    }
}
