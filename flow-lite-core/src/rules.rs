//! Business rule evaluation.
//!
//! Rules are attached to definition edges and evaluated after the
//! transition-table check. The rule language is a small explicit AST
//! (field presence plus comparisons over context values) rather than a
//! stringly-typed expression parser; specs arrive as data alongside the
//! definition and evaluate deterministically over the instance context.

use crate::types::ContextMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for `Condition::Compare`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One boolean condition over the instance context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Field must exist (any value, including null).
    Present { field: String },
    /// Field must not exist.
    Absent { field: String },
    /// Field must compare against a literal.
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
}

/// Rule set for one `"{from_state}_{to_state}"` edge. Empty sets pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RuleSet {
    /// Evaluate against a context snapshot. Returns the first violation as
    /// a human-readable reason; `Ok(())` when every check passes.
    pub fn evaluate(&self, context: &ContextMap) -> Result<(), String> {
        for field in &self.required_fields {
            if !context.contains_key(field) {
                return Err(format!("required context field '{field}' is missing"));
            }
        }
        for condition in &self.conditions {
            check_condition(condition, context)?;
        }
        Ok(())
    }
}

fn check_condition(condition: &Condition, context: &ContextMap) -> Result<(), String> {
    match condition {
        Condition::Present { field } => {
            if context.contains_key(field) {
                Ok(())
            } else {
                Err(format!("context field '{field}' must be present"))
            }
        }
        Condition::Absent { field } => {
            if context.contains_key(field) {
                Err(format!("context field '{field}' must be absent"))
            } else {
                Ok(())
            }
        }
        Condition::Compare { field, op, value } => {
            let actual = context
                .get(field)
                .ok_or_else(|| format!("context field '{field}' is missing"))?;
            match compare(*op, actual, value) {
                Some(true) => Ok(()),
                Some(false) => Err(format!(
                    "context field '{field}' failed {op:?} check against {value}"
                )),
                None => Err(format!(
                    "context field '{field}' is not comparable to {value}"
                )),
            }
        }
    }
}

/// Equality works across any value shapes; ordering is defined for numbers
/// (compared as f64) and for strings (lexicographic). Anything else is
/// incomparable and fails the condition.
fn compare(op: CompareOp, actual: &Value, expected: &Value) -> Option<bool> {
    match op {
        CompareOp::Eq => Some(actual == expected),
        CompareOp::Ne => Some(actual != expected),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let ordering = if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
                a.partial_cmp(&b)?
            } else if let (Some(a), Some(b)) = (actual.as_str(), expected.as_str()) {
                a.cmp(b)
            } else {
                return None;
            };
            Some(match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Gte => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Lte => ordering.is_le(),
                CompareOp::Eq | CompareOp::Ne => unreachable!(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(pairs: &[(&str, Value)]) -> ContextMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_rule_set_passes() {
        assert!(RuleSet::default().evaluate(&ContextMap::new()).is_ok());
    }

    #[test]
    fn required_field_missing_is_reported_by_name() {
        let rules = RuleSet {
            required_fields: vec!["reviewer".to_string()],
            conditions: vec![],
        };
        let err = rules.evaluate(&ContextMap::new()).unwrap_err();
        assert!(err.contains("reviewer"));
        assert!(rules
            .evaluate(&context(&[("reviewer", json!("ana"))]))
            .is_ok());
    }

    #[test]
    fn numeric_comparisons() {
        let rules = RuleSet {
            required_fields: vec![],
            conditions: vec![Condition::Compare {
                field: "amount".to_string(),
                op: CompareOp::Gte,
                value: json!(100),
            }],
        };
        assert!(rules.evaluate(&context(&[("amount", json!(150))])).is_ok());
        assert!(rules
            .evaluate(&context(&[("amount", json!(99.5))]))
            .is_err());
    }

    #[test]
    fn incomparable_types_fail_closed() {
        let rules = RuleSet {
            required_fields: vec![],
            conditions: vec![Condition::Compare {
                field: "amount".to_string(),
                op: CompareOp::Gt,
                value: json!(100),
            }],
        };
        let err = rules
            .evaluate(&context(&[("amount", json!("lots"))]))
            .unwrap_err();
        assert!(err.contains("not comparable"));
    }

    #[test]
    fn absent_condition() {
        let rules = RuleSet {
            required_fields: vec![],
            conditions: vec![Condition::Absent {
                field: "legal_hold".to_string(),
            }],
        };
        assert!(rules.evaluate(&ContextMap::new()).is_ok());
        assert!(rules
            .evaluate(&context(&[("legal_hold", json!(true))]))
            .is_err());
    }

    #[test]
    fn rule_spec_wire_shape() {
        let spec = json!({
            "required_fields": ["reviewer"],
            "conditions": [
                {"kind": "compare", "field": "amount", "op": "lte", "value": 5000},
                {"kind": "absent", "field": "legal_hold"}
            ]
        });
        let rules: RuleSet = serde_json::from_value(spec).unwrap();
        assert_eq!(rules.required_fields, vec!["reviewer"]);
        assert_eq!(rules.conditions.len(), 2);
    }
}
