//! Workflow engine: the public operations and the transaction boundary.
//!
//! One engine is constructed per worker with an injected storage handle;
//! it holds no mutable state of its own. Writer serialization per instance
//! relies on the store's optimistic row-version check: a conflicted commit
//! reloads the instance and re-validates the action against the fresh
//! state, so the second of two racing callers observes the updated state.

use crate::error::WorkflowError;
use crate::history::{HistoryEntry, TriggerType};
use crate::machine::CompiledWorkflow;
use crate::store::{StoreError, WorkflowStore};
use crate::types::{
    merge_context, ContextMap, Instance, InstanceFilter, InstanceStatus, Principal,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Engine tuning knobs, injected at construction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Retries for `StoreError::Transient` before surfacing it.
    pub max_transient_retries: u32,
    /// Base backoff delay, doubled per transient retry.
    pub transient_backoff: Duration,
    /// Re-evaluation rounds after an optimistic write conflict.
    pub max_conflict_retries: u32,
    /// History entries included in a status projection.
    pub status_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            transient_backoff: Duration::from_millis(50),
            max_conflict_retries: 3,
            status_history_limit: 10,
        }
    }
}

/// Parameters for `create_instance`.
#[derive(Clone, Debug)]
pub struct NewInstance {
    pub definition_id: Uuid,
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub title: Option<String>,
    pub context: Option<ContextMap>,
    pub assigned_to: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

/// Parameters for `advance`.
#[derive(Clone, Debug)]
pub struct AdvanceRequest {
    pub action: String,
    pub comment: Option<String>,
    pub metadata: Option<ContextMap>,
    pub context_updates: Option<ContextMap>,
    pub trigger_type: TriggerType,
}

impl AdvanceRequest {
    /// A manual attempt at `action` with no extras.
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            comment: None,
            metadata: None,
            context_updates: None,
            trigger_type: TriggerType::Manual,
        }
    }
}

/// One currently-available action on an instance.
#[derive(Clone, Debug, Serialize)]
pub struct ActionDescriptor {
    pub action: String,
    pub to_state: String,
    pub title: Option<String>,
}

/// Read-only status projection.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceStatusView {
    pub instance_id: Uuid,
    pub current_state: String,
    pub previous_state: Option<String>,
    pub status: InstanceStatus,
    pub progress_percentage: f64,
    pub due_date: Option<DateTime<Utc>>,
    pub is_overdue: bool,
    /// Empty once the instance is terminal.
    pub available_actions: Vec<ActionDescriptor>,
    /// Most recent entries, newest first.
    pub recent_history: Vec<HistoryEntry>,
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Create an instance from an **active** definition. The instance row,
    /// its creation ledger entry, and the definition usage-count bump are
    /// one atomic unit in the store.
    pub async fn create_instance(
        &self,
        request: NewInstance,
        principal: &Principal,
    ) -> Result<Instance, WorkflowError> {
        let definition = self
            .retry_transient(|| self.store.load_definition(request.definition_id))
            .await?
            .filter(|d| d.is_active)
            .ok_or(WorkflowError::DefinitionNotFound(request.definition_id))?;
        let machine = CompiledWorkflow::compile(&definition)?;

        let now = Utc::now();
        let instance = Instance {
            instance_id: Uuid::now_v7(),
            definition_id: definition.definition_id,
            definition_fingerprint: definition.fingerprint(),
            entity_id: request.entity_id,
            entity_type: request.entity_type,
            title: request.title,
            current_state: definition.initial_state.clone(),
            previous_state: None,
            context: request.context.unwrap_or_default(),
            status: InstanceStatus::Active,
            assigned_to: request.assigned_to,
            organization_id: principal.organization_id.clone(),
            created_by: principal.user_id.clone(),
            started_at: now,
            completed_at: None,
            due_date: request.due_date,
            progress_percentage: machine.progress_of(&definition.initial_state),
            error_count: 0,
            last_error: None,
            version: 0,
        };
        let creation = HistoryEntry {
            entry_id: Uuid::now_v7(),
            instance_id: instance.instance_id,
            from_state: None,
            to_state: instance.current_state.clone(),
            action: "create".to_string(),
            triggered_by: principal.user_id.clone(),
            trigger_type: TriggerType::Manual,
            comment: None,
            action_metadata: None,
            context_snapshot: instance.context.clone(),
            duration_ms: 0,
            was_successful: true,
            error_message: None,
            recorded_at: now,
        };

        self.retry_transient(|| self.store.insert_instance(&instance, &creation))
            .await?;
        tracing::info!(
            instance_id = %instance.instance_id,
            definition = %definition.name,
            entity_id = %instance.entity_id,
            "workflow instance created"
        );
        Ok(instance)
    }

    /// Advance an instance by an externally-triggered action.
    ///
    /// Validation rejections (`InstanceNotActive`, `ActionNotAvailable`,
    /// `RuleViolation`) leave the current state untouched and are recorded
    /// as failed ledger entries; exactly one entry is appended per call,
    /// successful or not.
    pub async fn advance(
        &self,
        instance_id: Uuid,
        request: AdvanceRequest,
        principal: &Principal,
    ) -> Result<Instance, WorkflowError> {
        let started = Instant::now();
        let mut conflict_rounds = 0u32;
        loop {
            let instance = self.load_instance_or_fail(instance_id).await?;
            let definition = self
                .retry_transient(|| self.store.load_definition(instance.definition_id))
                .await?
                .ok_or(WorkflowError::DefinitionNotFound(instance.definition_id))?;
            let bound = CompiledWorkflow::compile(&definition)?.bind(&instance)?;

            if instance.status.is_terminal() {
                let error = WorkflowError::InstanceNotActive {
                    instance_id,
                    status: instance.status,
                };
                self.record_rejection(&instance, &request, principal, None, started, &error)
                    .await?;
                return Err(error);
            }

            let Some(transition) = bound.resolve_action(&request.action) else {
                let error = WorkflowError::ActionNotAvailable {
                    instance_id,
                    action: request.action.clone(),
                    state: instance.current_state.clone(),
                };
                self.record_rejection(&instance, &request, principal, None, started, &error)
                    .await?;
                return Err(error);
            };

            // Updates merge into a candidate before rule evaluation, so a
            // caller can satisfy a required field in the same call. The
            // candidate is discarded on rejection.
            let mut candidate = instance.context.clone();
            if let Some(updates) = &request.context_updates {
                merge_context(&mut candidate, updates);
            }
            if let Some(rules) = bound.rule_for(transition) {
                if let Err(reason) = rules.evaluate(&candidate) {
                    let error = WorkflowError::RuleViolation {
                        instance_id,
                        action: request.action.clone(),
                        from_state: transition.from_state.clone(),
                        to_state: transition.to_state.clone(),
                        reason,
                    };
                    self.record_rejection(
                        &instance,
                        &request,
                        principal,
                        Some(&transition.to_state),
                        started,
                        &error,
                    )
                    .await?;
                    return Err(error);
                }
            }

            let now = Utc::now();
            let mut updated = instance.clone();
            updated.context = candidate;
            updated.previous_state = Some(instance.current_state.clone());
            updated.current_state = transition.to_state.clone();
            updated.progress_percentage = bound.progress_of(&transition.to_state);
            if bound.is_final(&transition.to_state) {
                updated.status = InstanceStatus::Completed;
                updated.completed_at = Some(now);
                // Reaching any terminal state completes the workflow in
                // full, wherever the state sits in declaration order.
                updated.progress_percentage = 100.0;
            }
            updated.version = instance.version + 1;

            let entry = HistoryEntry {
                entry_id: Uuid::now_v7(),
                instance_id,
                from_state: Some(instance.current_state.clone()),
                to_state: updated.current_state.clone(),
                action: request.action.clone(),
                triggered_by: principal.user_id.clone(),
                trigger_type: request.trigger_type,
                comment: request.comment.clone(),
                action_metadata: request.metadata.clone(),
                context_snapshot: updated.context.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                was_successful: true,
                error_message: None,
                recorded_at: now,
            };

            match self
                .retry_transient(|| {
                    self.store
                        .commit_transition(&updated, instance.version, &entry)
                })
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        instance_id = %instance_id,
                        action = %request.action,
                        from = %instance.current_state,
                        to = %updated.current_state,
                        status = %updated.status,
                        "transition committed"
                    );
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_))
                    if conflict_rounds < self.config.max_conflict_retries =>
                {
                    conflict_rounds += 1;
                    tracing::debug!(
                        instance_id = %instance_id,
                        round = conflict_rounds,
                        "write conflict, re-evaluating against fresh state"
                    );
                    continue;
                }
                Err(e) => {
                    // The mutation aborted; the attempt must still leave a
                    // durable trace.
                    self.record_aborted_commit(&instance, &request, principal, started, &e)
                        .await;
                    return Err(WorkflowError::Storage(e));
                }
            }
        }
    }

    /// Administrative cancellation: `active -> cancelled`, audited.
    pub async fn cancel_instance(
        &self,
        instance_id: Uuid,
        reason: Option<String>,
        principal: &Principal,
    ) -> Result<Instance, WorkflowError> {
        self.administrative_transition(
            instance_id,
            principal,
            "cancel",
            TriggerType::Manual,
            reason,
            None,
            |instance, now| {
                instance.status = InstanceStatus::Cancelled;
                instance.completed_at = Some(now);
            },
        )
        .await
    }

    /// Mark an instance as unrecoverably failed: `active -> error`.
    /// Reserved for catastrophic failures, not ordinary rule rejections.
    pub async fn fail_instance(
        &self,
        instance_id: Uuid,
        reason: String,
        principal: &Principal,
    ) -> Result<Instance, WorkflowError> {
        self.administrative_transition(
            instance_id,
            principal,
            "fail",
            TriggerType::System,
            Some(reason.clone()),
            Some(reason.clone()),
            move |instance, _now| {
                instance.status = InstanceStatus::Error;
                instance.last_error = Some(reason.clone());
            },
        )
        .await
    }

    /// Read-only projection of one instance.
    pub async fn status(&self, instance_id: Uuid) -> Result<InstanceStatusView, WorkflowError> {
        let instance = self.load_instance_or_fail(instance_id).await?;
        let definition = self
            .retry_transient(|| self.store.load_definition(instance.definition_id))
            .await?
            .ok_or(WorkflowError::DefinitionNotFound(instance.definition_id))?;
        let bound = CompiledWorkflow::compile(&definition)?.bind(&instance)?;

        let available_actions = if instance.status.is_terminal() {
            Vec::new()
        } else {
            bound
                .available()
                .into_iter()
                .map(|t| ActionDescriptor {
                    action: t.action.clone(),
                    to_state: t.to_state.clone(),
                    title: t.title.clone(),
                })
                .collect()
        };
        let recent_history = self
            .retry_transient(|| {
                self.store
                    .load_history(instance_id, self.config.status_history_limit, 0)
            })
            .await?;

        Ok(InstanceStatusView {
            instance_id,
            current_state: instance.current_state.clone(),
            previous_state: instance.previous_state.clone(),
            status: instance.status,
            progress_percentage: instance.progress_percentage,
            due_date: instance.due_date,
            is_overdue: instance.is_overdue(Utc::now()),
            available_actions,
            recent_history,
        })
    }

    /// Full ledger page for one instance, newest first.
    pub async fn history(
        &self,
        instance_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>, WorkflowError> {
        self.load_instance_or_fail(instance_id).await?;
        Ok(self
            .retry_transient(|| self.store.load_history(instance_id, limit, offset))
            .await?)
    }

    /// Instances assigned to a user, newest started first, paginated.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        status: Option<InstanceStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Instance>, WorkflowError> {
        let filter = InstanceFilter {
            assigned_to: Some(user_id.to_string()),
            organization_id: organization_id.map(str::to_string),
            status,
            limit,
            offset,
        };
        Ok(self
            .retry_transient(|| self.store.list_instances(&filter))
            .await?)
    }

    // ── Internals ──

    async fn load_instance_or_fail(&self, instance_id: Uuid) -> Result<Instance, WorkflowError> {
        self.retry_transient(|| self.store.load_instance(instance_id))
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn administrative_transition(
        &self,
        instance_id: Uuid,
        principal: &Principal,
        action: &str,
        trigger_type: TriggerType,
        comment: Option<String>,
        error_message: Option<String>,
        apply: impl Fn(&mut Instance, DateTime<Utc>) + Send + Sync,
    ) -> Result<Instance, WorkflowError> {
        let started = Instant::now();
        let mut conflict_rounds = 0u32;
        loop {
            let instance = self.load_instance_or_fail(instance_id).await?;
            if instance.status.is_terminal() {
                let error = WorkflowError::InstanceNotActive {
                    instance_id,
                    status: instance.status,
                };
                let request = AdvanceRequest {
                    action: action.to_string(),
                    comment: comment.clone(),
                    metadata: None,
                    context_updates: None,
                    trigger_type,
                };
                self.record_rejection(&instance, &request, principal, None, started, &error)
                    .await?;
                return Err(error);
            }

            let now = Utc::now();
            let mut updated = instance.clone();
            apply(&mut updated, now);
            updated.version = instance.version + 1;

            let entry = HistoryEntry {
                entry_id: Uuid::now_v7(),
                instance_id,
                from_state: Some(instance.current_state.clone()),
                to_state: instance.current_state.clone(),
                action: action.to_string(),
                triggered_by: principal.user_id.clone(),
                trigger_type,
                comment: comment.clone(),
                action_metadata: None,
                context_snapshot: updated.context.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                was_successful: true,
                error_message: error_message.clone(),
                recorded_at: now,
            };

            match self
                .retry_transient(|| {
                    self.store
                        .commit_transition(&updated, instance.version, &entry)
                })
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        instance_id = %instance_id,
                        action,
                        status = %updated.status,
                        "administrative transition committed"
                    );
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_))
                    if conflict_rounds < self.config.max_conflict_retries =>
                {
                    conflict_rounds += 1;
                    continue;
                }
                Err(e) => return Err(WorkflowError::Storage(e)),
            }
        }
    }

    /// Append the failed ledger entry for a validation rejection. The
    /// rejection itself is the caller's error; a storage failure here is
    /// surfaced instead because the audit trail could not be written.
    async fn record_rejection(
        &self,
        instance: &Instance,
        request: &AdvanceRequest,
        principal: &Principal,
        to_state: Option<&str>,
        started: Instant,
        error: &WorkflowError,
    ) -> Result<(), WorkflowError> {
        let entry = failed_entry(instance, request, principal, to_state, started, error.to_string());
        self.retry_transient(|| self.store.record_failed_attempt(instance.instance_id, &entry))
            .await?;
        tracing::warn!(
            instance_id = %instance.instance_id,
            action = %request.action,
            state = %instance.current_state,
            %error,
            "transition attempt rejected"
        );
        Ok(())
    }

    /// Best-effort trace of an attempt whose commit aborted in storage.
    async fn record_aborted_commit(
        &self,
        instance: &Instance,
        request: &AdvanceRequest,
        principal: &Principal,
        started: Instant,
        cause: &StoreError,
    ) {
        let entry = failed_entry(
            instance,
            request,
            principal,
            None,
            started,
            format!("transition aborted: {cause}"),
        );
        if let Err(e) = self
            .retry_transient(|| self.store.record_failed_attempt(instance.instance_id, &entry))
            .await
        {
            tracing::warn!(
                instance_id = %instance.instance_id,
                action = %request.action,
                error = %e,
                "failed to record aborted transition attempt"
            );
        }
    }

    async fn retry_transient<T, F, Fut>(&self, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = self.config.transient_backoff;
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Err(e) if e.is_transient() && attempt < self.config.max_transient_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient storage failure, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }
}

fn failed_entry(
    instance: &Instance,
    request: &AdvanceRequest,
    principal: &Principal,
    to_state: Option<&str>,
    started: Instant,
    error_message: String,
) -> HistoryEntry {
    HistoryEntry {
        entry_id: Uuid::now_v7(),
        instance_id: instance.instance_id,
        from_state: Some(instance.current_state.clone()),
        // An unresolved action has no target; the instance stayed put.
        to_state: to_state.unwrap_or(&instance.current_state).to_string(),
        action: request.action.clone(),
        triggered_by: principal.user_id.clone(),
        trigger_type: request.trigger_type,
        comment: request.comment.clone(),
        action_metadata: request.metadata.clone(),
        context_snapshot: instance.context.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        was_successful: false,
        error_message: Some(error_message),
        recorded_at: Utc::now(),
    }
}
