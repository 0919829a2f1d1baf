// Condition Evaluator - Nested boolean condition trees over event payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node in a condition tree: either a composite AND/OR group or a leaf
/// field comparison. Untagged so stored JSON stays in the shape the rest of
/// the platform writes: `{"logic": "AND", "conditions": [...]}` for groups,
/// `{"field": ..., "operator": ..., "value": ...}` for leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    Group(ConditionGroup),
    Leaf(Condition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// "AND" or "OR" (case-insensitive)
    pub logic: String,
    pub conditions: Vec<ConditionNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Field path into the payload, dot notation for nested fields
    pub field: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Alternate list form accepted for `in`/`not_in` compatibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

/// What a broken condition tree evaluates to.
///
/// The trigger-matching path fails open (a malformed rule still fires) while
/// the legacy action runner fails closed (a malformed rule never acts). Both
/// behaviors are load-bearing for existing tenants, so the policy is an
/// explicit parameter rather than a single unified default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Open,
    Closed,
}

impl FailurePolicy {
    fn default_result(self) -> bool {
        matches!(self, FailurePolicy::Open)
    }
}

#[derive(Debug)]
enum EvalError {
    UnknownOperator(String),
    UnknownLogic(String),
}

/// Evaluate a condition tree against a payload. Never panics; any internal
/// failure resolves to the policy's default.
pub fn evaluate(node: &ConditionNode, payload: &Value, policy: FailurePolicy) -> bool {
    match eval_node(node, payload) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("Condition evaluation failed ({:?}), using policy default", e);
            policy.default_result()
        }
    }
}

fn eval_node(node: &ConditionNode, payload: &Value) -> Result<bool, EvalError> {
    match node {
        ConditionNode::Group(group) => eval_group(group, payload),
        ConditionNode::Leaf(condition) => eval_leaf(condition, payload),
    }
}

fn eval_group(group: &ConditionGroup, payload: &Value) -> Result<bool, EvalError> {
    match group.logic.to_ascii_uppercase().as_str() {
        "AND" => {
            for child in &group.conditions {
                if !eval_node(child, payload)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "OR" => {
            for child in &group.conditions {
                if eval_node(child, payload)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(EvalError::UnknownLogic(other.to_string())),
    }
}

fn eval_leaf(condition: &Condition, payload: &Value) -> Result<bool, EvalError> {
    let field_value = resolve_path(payload, &condition.field);

    // Only exists / not_exists treat an absent field specially; every other
    // operator compares against absent as false.
    match condition.operator.as_str() {
        "exists" | "is_not_null" => return Ok(is_present(field_value)),
        "not_exists" | "is_null" => return Ok(!is_present(field_value)),
        _ => {}
    }

    let Some(actual) = field_value else {
        return known_operator(&condition.operator).map(|_| false);
    };
    if actual.is_null() {
        return known_operator(&condition.operator).map(|_| false);
    }

    let expected = condition.value.as_ref().unwrap_or(&Value::Null);

    let result = match condition.operator.as_str() {
        "equals" | "eq" => actual == expected,
        "not_equals" | "ne" => actual != expected,
        "contains" => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(pattern)) => s.to_lowercase().contains(&pattern.to_lowercase()),
            _ => false,
        },
        "not_contains" => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(pattern)) => !s.to_lowercase().contains(&pattern.to_lowercase()),
            _ => false,
        },
        "starts_with" => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(pattern)) => s.to_lowercase().starts_with(&pattern.to_lowercase()),
            _ => false,
        },
        "ends_with" => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(pattern)) => s.to_lowercase().ends_with(&pattern.to_lowercase()),
            _ => false,
        },
        "greater_than" | "gt" => match (to_number(actual), to_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        "greater_than_or_equals" | "gte" => match (to_number(actual), to_number(expected)) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        },
        "less_than" | "lt" => match (to_number(actual), to_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        "less_than_or_equals" | "lte" => match (to_number(actual), to_number(expected)) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        },
        "in" => list_operand(condition).map(|list| list.contains(actual)).unwrap_or(false),
        "not_in" => list_operand(condition).map(|list| !list.contains(actual)).unwrap_or(false),
        "regex" => {
            let Some(pattern) = expected.as_str() else {
                return Ok(false);
            };
            let subject = stringify(actual);
            // A pattern that fails to compile matches nothing
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&subject),
                Err(_) => false,
            }
        }
        other => return Err(EvalError::UnknownOperator(other.to_string())),
    };

    Ok(result)
}

fn known_operator(op: &str) -> Result<(), EvalError> {
    const KNOWN: &[&str] = &[
        "equals", "eq", "not_equals", "ne", "contains", "not_contains", "starts_with", "ends_with",
        "greater_than", "gt", "greater_than_or_equals", "gte", "less_than", "lt",
        "less_than_or_equals", "lte", "in", "not_in", "regex",
    ];
    if KNOWN.contains(&op) {
        Ok(())
    } else {
        Err(EvalError::UnknownOperator(op.to_string()))
    }
}

/// `in`/`not_in` accept either a `value` array or a `values` array
fn list_operand(condition: &Condition) -> Option<&Vec<Value>> {
    if let Some(values) = &condition.values {
        return Some(values);
    }
    condition.value.as_ref().and_then(|v| v.as_array())
}

/// Walk a dot path through the payload. Missing intermediate keys resolve
/// to absent.
pub fn resolve_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn is_present(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

/// Numeric coercion: numbers pass through, numeric strings parse, booleans
/// become 0/1. Anything else has no numeric value and comparisons against it
/// are false.
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
