use crate::history::HistoryEntry;
use crate::store::{StoreError, WorkflowStore};
use crate::types::{Definition, Instance, InstanceFilter};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// In-memory `WorkflowStore` for tests and POC use.
///
/// Composite operations take the involved locks in a fixed order
/// (definitions, instances, history) so they behave as single atomic
/// units the way a relational backend's transactions would.
pub struct MemoryStore {
    definitions: RwLock<HashMap<Uuid, Definition>>,
    instances: RwLock<HashMap<Uuid, Instance>>,
    history: RwLock<HashMap<Uuid, Vec<HistoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|e| StoreError::Internal(anyhow!("lock poisoned: {e}")))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|e| StoreError::Internal(anyhow!("lock poisoned: {e}")))
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_definition(&self, definition: &Definition) -> Result<(), StoreError> {
        let mut definitions = write(&self.definitions)?;
        if let Some(existing) = definitions.get(&definition.definition_id) {
            if existing.usage_count > 0 {
                return Err(StoreError::Integrity(format!(
                    "definition {}:v{} is referenced by instances; publish a new version",
                    existing.name, existing.version
                )));
            }
        }
        definitions.insert(definition.definition_id, definition.clone());
        Ok(())
    }

    async fn load_definition(&self, definition_id: Uuid) -> Result<Option<Definition>, StoreError> {
        Ok(read(&self.definitions)?.get(&definition_id).cloned())
    }

    async fn list_definitions(
        &self,
        organization_id: Option<&str>,
        active_only: bool,
    ) -> Result<Vec<Definition>, StoreError> {
        let definitions = read(&self.definitions)?;
        let mut out: Vec<Definition> = definitions
            .values()
            .filter(|d| !active_only || d.is_active)
            .filter(|d| match (organization_id, d.organization_id.as_deref()) {
                // Global templates are visible to every organization.
                (Some(org), Some(def_org)) => org == def_org,
                (Some(_), None) => true,
                (None, _) => true,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
        Ok(out)
    }

    async fn deactivate_definition(&self, definition_id: Uuid) -> Result<(), StoreError> {
        let mut definitions = write(&self.definitions)?;
        let definition = definitions
            .get_mut(&definition_id)
            .ok_or_else(|| StoreError::Integrity(format!("unknown definition {definition_id}")))?;
        definition.is_active = false;
        Ok(())
    }

    async fn insert_instance(
        &self,
        instance: &Instance,
        creation: &HistoryEntry,
    ) -> Result<(), StoreError> {
        let mut definitions = write(&self.definitions)?;
        let mut instances = write(&self.instances)?;
        let mut history = write(&self.history)?;

        let definition = definitions
            .get_mut(&instance.definition_id)
            .ok_or_else(|| {
                StoreError::Integrity(format!("unknown definition {}", instance.definition_id))
            })?;
        if instances.contains_key(&instance.instance_id) {
            return Err(StoreError::Integrity(format!(
                "instance {} already exists",
                instance.instance_id
            )));
        }

        definition.usage_count += 1;
        instances.insert(instance.instance_id, instance.clone());
        history
            .entry(instance.instance_id)
            .or_default()
            .push(creation.clone());
        Ok(())
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<Option<Instance>, StoreError> {
        Ok(read(&self.instances)?.get(&instance_id).cloned())
    }

    async fn commit_transition(
        &self,
        instance: &Instance,
        expected_version: u64,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        let mut instances = write(&self.instances)?;
        let mut history = write(&self.history)?;

        let stored = instances.get_mut(&instance.instance_id).ok_or_else(|| {
            StoreError::Integrity(format!("unknown instance {}", instance.instance_id))
        })?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict(instance.instance_id));
        }

        *stored = instance.clone();
        history
            .entry(instance.instance_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        instance_id: Uuid,
        entry: &HistoryEntry,
    ) -> Result<u64, StoreError> {
        let mut instances = write(&self.instances)?;
        let mut history = write(&self.history)?;

        if let Some(stored) = instances.get_mut(&instance_id) {
            if !stored.status.is_terminal() {
                stored.error_count += 1;
                stored.last_error = entry.error_message.clone();
                stored.version += 1;
            }
        }

        let ledger = history.entry(instance_id).or_default();
        ledger.push(entry.clone());
        Ok((ledger.len() - 1) as u64)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let instances = read(&self.instances)?;
        let mut out: Vec<Instance> = instances
            .values()
            .filter(|i| {
                filter
                    .assigned_to
                    .as_deref()
                    .is_none_or(|user| i.assigned_to.as_deref() == Some(user))
            })
            .filter(|i| {
                filter
                    .organization_id
                    .as_deref()
                    .is_none_or(|org| i.organization_id.as_deref() == Some(org))
            })
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        // Newest started first; uuid v7 ids break timestamp ties.
        out.sort_by(|a, b| {
            (b.started_at, b.instance_id).cmp(&(a.started_at, a.instance_id))
        });
        let limit = if filter.limit == 0 {
            out.len()
        } else {
            filter.limit
        };
        Ok(out.into_iter().skip(filter.offset).take(limit).collect())
    }

    async fn load_history(
        &self,
        instance_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let history = read(&self.history)?;
        let ledger = history.get(&instance_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(ledger
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TriggerType;
    use crate::types::{ContextMap, InstanceStatus, StateDef, TransitionDef};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_definition() -> Definition {
        Definition {
            definition_id: Uuid::now_v7(),
            name: "expense".to_string(),
            version: 1,
            category: Some("finance".to_string()),
            organization_id: None,
            initial_state: "submitted".to_string(),
            states: vec![
                StateDef {
                    name: "submitted".to_string(),
                    is_initial: true,
                    is_final: false,
                    display_title: None,
                },
                StateDef {
                    name: "paid".to_string(),
                    is_initial: false,
                    is_final: true,
                    display_title: None,
                },
            ],
            transitions: vec![TransitionDef {
                from_state: "submitted".to_string(),
                to_state: "paid".to_string(),
                action: "pay".to_string(),
                title: None,
            }],
            business_rules: BTreeMap::new(),
            is_active: true,
            usage_count: 0,
            created_at: Utc::now(),
        }
    }

    fn sample_instance(def: &Definition) -> Instance {
        Instance {
            instance_id: Uuid::now_v7(),
            definition_id: def.definition_id,
            definition_fingerprint: def.fingerprint(),
            entity_id: "exp-1".to_string(),
            entity_type: Some("expense".to_string()),
            title: None,
            current_state: def.initial_state.clone(),
            previous_state: None,
            context: ContextMap::new(),
            status: InstanceStatus::Active,
            assigned_to: Some("ana".to_string()),
            organization_id: Some("org-1".to_string()),
            created_by: "ana".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            due_date: None,
            progress_percentage: 0.0,
            error_count: 0,
            last_error: None,
            version: 0,
        }
    }

    fn entry_for(instance: &Instance, action: &str, ok: bool) -> HistoryEntry {
        HistoryEntry {
            entry_id: Uuid::now_v7(),
            instance_id: instance.instance_id,
            from_state: ok.then(|| instance.current_state.clone()),
            to_state: instance.current_state.clone(),
            action: action.to_string(),
            triggered_by: "ana".to_string(),
            trigger_type: TriggerType::Manual,
            comment: None,
            action_metadata: None,
            context_snapshot: instance.context.clone(),
            duration_ms: 1,
            was_successful: ok,
            error_message: (!ok).then(|| "rejected".to_string()),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn referenced_definition_cannot_be_overwritten() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();
        // Draft-stage overwrite is fine while nothing references it.
        store.save_definition(&def).await.unwrap();

        let instance = sample_instance(&def);
        store
            .insert_instance(&instance, &entry_for(&instance, "create", true))
            .await
            .unwrap();

        let err = store.save_definition(&def).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn definition_listing_scopes_by_organization_and_activity() {
        let store = MemoryStore::new();
        let global = sample_definition();
        let mut scoped = sample_definition();
        scoped.definition_id = Uuid::now_v7();
        scoped.name = "org_expense".to_string();
        scoped.organization_id = Some("org-1".to_string());
        let mut foreign = sample_definition();
        foreign.definition_id = Uuid::now_v7();
        foreign.name = "other_expense".to_string();
        foreign.organization_id = Some("org-2".to_string());
        let mut retired = sample_definition();
        retired.definition_id = Uuid::now_v7();
        retired.name = "retired_expense".to_string();
        retired.is_active = false;
        for def in [&global, &scoped, &foreign, &retired] {
            store.save_definition(def).await.unwrap();
        }

        let listed = store.list_definitions(Some("org-1"), true).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|d| d.name.as_str()).collect();
        // Global templates are visible alongside the organization's own.
        assert_eq!(names, vec!["expense", "org_expense"]);

        let everything = store.list_definitions(None, false).await.unwrap();
        assert_eq!(everything.len(), 4);
    }

    #[tokio::test]
    async fn insert_instance_is_one_atomic_unit() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();

        let instance = sample_instance(&def);
        store
            .insert_instance(&instance, &entry_for(&instance, "create", true))
            .await
            .unwrap();

        let stored_def = store
            .load_definition(def.definition_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_def.usage_count, 1);
        let ledger = store
            .load_history(instance.instance_id, 10, 0)
            .await
            .unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].was_successful);

        // Unknown definition: nothing is written.
        let mut orphan = sample_instance(&def);
        orphan.definition_id = Uuid::now_v7();
        let err = store
            .insert_instance(&orphan, &entry_for(&orphan, "create", true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(store
            .load_instance(orphan.instance_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn commit_transition_checks_row_version() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        store
            .insert_instance(&instance, &entry_for(&instance, "create", true))
            .await
            .unwrap();

        let mut updated = instance.clone();
        updated.current_state = "paid".to_string();
        updated.version = 1;
        store
            .commit_transition(&updated, 0, &entry_for(&updated, "pay", true))
            .await
            .unwrap();

        // Stale writer loses.
        let err = store
            .commit_transition(&updated, 0, &entry_for(&updated, "pay", true))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let stored = store
            .load_instance(instance.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.current_state, "paid");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn failed_attempts_bump_counters_only_while_active() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        store
            .insert_instance(&instance, &entry_for(&instance, "create", true))
            .await
            .unwrap();

        store
            .record_failed_attempt(instance.instance_id, &entry_for(&instance, "pay", false))
            .await
            .unwrap();
        let stored = store
            .load_instance(instance.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("rejected"));

        // Terminal instances gain only the ledger row.
        let mut done = stored.clone();
        done.status = InstanceStatus::Completed;
        done.version += 1;
        store
            .commit_transition(&done, stored.version, &entry_for(&done, "pay", true))
            .await
            .unwrap();
        store
            .record_failed_attempt(instance.instance_id, &entry_for(&done, "pay", false))
            .await
            .unwrap();
        let after = store
            .load_instance(instance.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.error_count, 1);
        assert_eq!(
            store
                .load_history(instance.instance_id, 10, 0)
                .await
                .unwrap()
                .len(),
            4
        );
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();
        let instance = sample_instance(&def);
        store
            .insert_instance(&instance, &entry_for(&instance, "create", true))
            .await
            .unwrap();
        for action in ["first", "second", "third"] {
            store
                .record_failed_attempt(instance.instance_id, &entry_for(&instance, action, false))
                .await
                .unwrap();
        }

        let page = store
            .load_history(instance.instance_id, 2, 0)
            .await
            .unwrap();
        assert_eq!(page[0].action, "third");
        assert_eq!(page[1].action, "second");
        let next = store
            .load_history(instance.instance_id, 2, 2)
            .await
            .unwrap();
        assert_eq!(next[0].action, "first");
        assert_eq!(next[1].action, "create");
    }

    #[tokio::test]
    async fn listing_filters_and_orders_newest_first() {
        let store = MemoryStore::new();
        let def = sample_definition();
        store.save_definition(&def).await.unwrap();

        let mut older = sample_instance(&def);
        older.started_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = sample_instance(&def);
        let mut other_user = sample_instance(&def);
        other_user.assigned_to = Some("bo".to_string());
        for i in [&older, &newer, &other_user] {
            store
                .insert_instance(i, &entry_for(i, "create", true))
                .await
                .unwrap();
        }

        let filter = InstanceFilter {
            assigned_to: Some("ana".to_string()),
            organization_id: Some("org-1".to_string()),
            status: Some(InstanceStatus::Active),
            limit: 10,
            offset: 0,
        };
        let listed = store.list_instances(&filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].instance_id, newer.instance_id);
        assert_eq!(listed[1].instance_id, older.instance_id);
    }
}
