//! Dynamic state machine builder.
//!
//! Definitions arrive as data, so the executable machine is compiled at
//! request time: the declared transition list becomes a
//! `(from_state, action) -> transition` lookup table plus a state index,
//! and one generic apply path in the engine replaces per-action dispatch.
//! The builder is stateless and rebuilt per request; all durable state
//! lives in the instance and history records, so concurrent construction
//! from multiple requests is safe.

use crate::error::WorkflowError;
use crate::rules::RuleSet;
use crate::types::{Definition, Instance, TransitionDef};
use std::collections::HashMap;

/// A definition compiled into an executable lookup structure.
#[derive(Debug)]
pub struct CompiledWorkflow<'d> {
    definition: &'d Definition,
    by_action: HashMap<(&'d str, &'d str), &'d TransitionDef>,
    state_index: HashMap<&'d str, usize>,
}

impl<'d> CompiledWorkflow<'d> {
    /// Validate the template and build the lookup tables.
    ///
    /// Fails with `InvalidDefinition` on an empty state list, duplicate
    /// state names, an initial-state declaration that does not line up,
    /// transitions referencing undeclared states, or two transitions
    /// sharing `(from_state, action)` (the action would be ambiguous).
    pub fn compile(definition: &'d Definition) -> Result<Self, WorkflowError> {
        let invalid = |reason: String| WorkflowError::InvalidDefinition {
            definition_id: definition.definition_id,
            reason,
        };

        if definition.states.is_empty() {
            return Err(invalid("definition declares no states".to_string()));
        }

        let mut state_index: HashMap<&str, usize> = HashMap::new();
        for (idx, state) in definition.states.iter().enumerate() {
            if state_index.insert(state.name.as_str(), idx).is_some() {
                return Err(invalid(format!("duplicate state name '{}'", state.name)));
            }
        }

        if !state_index.contains_key(definition.initial_state.as_str()) {
            return Err(invalid(format!(
                "initial state '{}' is not a declared state",
                definition.initial_state
            )));
        }
        let initial_flags: Vec<&str> = definition
            .states
            .iter()
            .filter(|s| s.is_initial)
            .map(|s| s.name.as_str())
            .collect();
        if initial_flags.len() != 1 || initial_flags[0] != definition.initial_state {
            return Err(invalid(format!(
                "exactly one state must be flagged initial and match '{}', found {:?}",
                definition.initial_state, initial_flags
            )));
        }

        let mut by_action: HashMap<(&str, &str), &TransitionDef> = HashMap::new();
        for transition in &definition.transitions {
            for endpoint in [&transition.from_state, &transition.to_state] {
                if !state_index.contains_key(endpoint.as_str()) {
                    return Err(invalid(format!(
                        "transition '{}' references undeclared state '{}'",
                        transition.action, endpoint
                    )));
                }
            }
            let key = (transition.from_state.as_str(), transition.action.as_str());
            if by_action.insert(key, transition).is_some() {
                return Err(invalid(format!(
                    "action '{}' from state '{}' is declared twice",
                    transition.action, transition.from_state
                )));
            }
        }

        Ok(Self {
            definition,
            by_action,
            state_index,
        })
    }

    /// Bind to one instance, checking for definition skew. An instance
    /// sitting in a state the current definition no longer declares is a
    /// drift error, never a silent default.
    pub fn bind(self, instance: &'d Instance) -> Result<BoundMachine<'d>, WorkflowError> {
        if instance.definition_fingerprint != self.definition.fingerprint() {
            tracing::debug!(
                instance_id = %instance.instance_id,
                definition_id = %self.definition.definition_id,
                "definition content changed since instantiation"
            );
        }
        if !self.state_index.contains_key(instance.current_state.as_str()) {
            return Err(WorkflowError::StateDrift {
                instance_id: instance.instance_id,
                definition_id: self.definition.definition_id,
                state: instance.current_state.clone(),
            });
        }
        Ok(BoundMachine {
            machine: self,
            instance,
        })
    }

    /// Resolve an action name against the transition table.
    pub fn resolve(&self, from_state: &str, action: &str) -> Option<&'d TransitionDef> {
        self.by_action.get(&(from_state, action)).copied()
    }

    pub fn transitions_from(&self, state: &str) -> Vec<&'d TransitionDef> {
        self.definition.transitions_from(state)
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.definition.state(state).is_some_and(|s| s.is_final)
    }

    /// Position of `state` in the declared ordering as a percentage,
    /// clamped to [0, 100]. A single-state definition is always complete.
    pub fn progress_of(&self, state: &str) -> f64 {
        let len = self.definition.states.len();
        if len <= 1 {
            return 100.0;
        }
        let Some(&idx) = self.state_index.get(state) else {
            return 0.0;
        };
        (idx as f64 / (len - 1) as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// A compiled machine bound to one instance.
#[derive(Debug)]
pub struct BoundMachine<'d> {
    machine: CompiledWorkflow<'d>,
    instance: &'d Instance,
}

impl<'d> BoundMachine<'d> {
    /// Resolve an action from the instance's current state.
    pub fn resolve_action(&self, action: &str) -> Option<&'d TransitionDef> {
        self.machine.resolve(&self.instance.current_state, action)
    }

    /// Transitions currently available to the instance.
    pub fn available(&self) -> Vec<&'d TransitionDef> {
        self.machine.transitions_from(&self.instance.current_state)
    }

    /// Business rule attached to a transition's edge, if any.
    pub fn rule_for(&self, transition: &TransitionDef) -> Option<&'d RuleSet> {
        self.machine
            .definition
            .business_rules
            .get(&Definition::rule_key(
                &transition.from_state,
                &transition.to_state,
            ))
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.machine.is_final(state)
    }

    pub fn progress_of(&self, state: &str) -> f64 {
        self.machine.progress_of(state)
    }
}
