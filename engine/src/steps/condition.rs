// Condition and switch node executors

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{StepContext, StepError, StepExecutor, StepKind, StepOutcome};
use crate::automation::conditions::{evaluate, ConditionNode, FailurePolicy};
use crate::flows::model::FlowNode;

/// Pure branching steps. A `condition` node routes through its `true`/`false`
/// port from the evaluation result; a `switch` node routes through the port
/// named by the stringified selector value.
pub struct ConditionSteps;

impl ConditionSteps {
    fn evaluation_payload(ctx: &StepContext) -> Value {
        // Steps upstream hand data forward via variables; merge them over the
        // run input so conditions can see both.
        let mut payload = ctx.input.clone();
        if let Value::Object(map) = &mut payload {
            for (name, value) in &ctx.variables {
                map.insert(name.clone(), value.clone());
            }
        }
        payload
    }
}

#[async_trait]
impl StepExecutor for ConditionSteps {
    fn can_handle(&self, kind: &StepKind) -> bool {
        matches!(kind, StepKind::Condition | StepKind::Switch)
    }

    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let payload = Self::evaluation_payload(ctx);

        match node.kind {
            StepKind::Condition => {
                let tree: ConditionNode = serde_json::from_value(node.config["conditions"].clone())
                    .map_err(|_| StepError::MissingField("conditions".to_string()))?;
                // A broken tree must not silently take the true branch
                let result = evaluate(&tree, &payload, FailurePolicy::Closed);
                let path = if result { "true" } else { "false" };
                Ok(StepOutcome::routed(json!({ "result": result }), path))
            }

            StepKind::Switch => {
                let field = node.config["field"]
                    .as_str()
                    .ok_or_else(|| StepError::MissingField("field".to_string()))?;
                let selected = ctx.lookup(field).unwrap_or(Value::Null);
                let path = match &selected {
                    Value::String(s) => s.clone(),
                    Value::Null => "default".to_string(),
                    other => other.to_string(),
                };
                Ok(StepOutcome::routed(json!({ "field": field, "value": selected }), &path))
            }

            _ => Err(StepError::NoExecutor(node.kind.as_str().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(input: Value) -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), input)
    }

    #[tokio::test]
    async fn test_condition_routes_true_and_false() {
        let node = FlowNode::new(
            "check",
            StepKind::Condition,
            json!({"conditions": {"field": "priority", "operator": "equals", "value": "high"}}),
        );

        let mut hit = ctx(json!({"priority": "high"}));
        let outcome = ConditionSteps.execute(&node, &mut hit).await.unwrap();
        assert_eq!(outcome.path(), Some("true"));

        let mut miss = ctx(json!({"priority": "low"}));
        let outcome = ConditionSteps.execute(&node, &mut miss).await.unwrap();
        assert_eq!(outcome.path(), Some("false"));
    }

    #[tokio::test]
    async fn test_condition_sees_variables() {
        let node = FlowNode::new(
            "check",
            StepKind::Condition,
            json!({"conditions": {"field": "aiConfidence", "operator": "greater_than", "value": 0.7}}),
        );
        let mut ctx = ctx(json!({}));
        ctx.set_var("aiConfidence", json!(0.9));
        let outcome = ConditionSteps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("true"));
    }

    #[tokio::test]
    async fn test_condition_prefix_suffix_operators() {
        let node = FlowNode::new(
            "check",
            StepKind::Condition,
            json!({"conditions": {"logic": "AND", "conditions": [
                {"field": "subject", "operator": "starts_with", "value": "re:"},
                {"field": "from", "operator": "ends_with", "value": "@example.com"}
            ]}}),
        );
        let mut ctx = ctx(json!({"subject": "Re: outage", "from": "ada@example.com"}));
        let outcome = ConditionSteps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("true"));
    }

    #[tokio::test]
    async fn test_condition_missing_tree_is_fatal() {
        let node = FlowNode::new("check", StepKind::Condition, json!({}));
        let err = ConditionSteps.execute(&node, &mut ctx(json!({}))).await.unwrap_err();
        assert!(matches!(err, StepError::MissingField(f) if f == "conditions"));
    }

    #[tokio::test]
    async fn test_switch_routes_by_string_cast() {
        let node = FlowNode::new("route", StepKind::Switch, json!({"field": "tier"}));

        let mut gold = ctx(json!({"tier": "gold"}));
        let outcome = ConditionSteps.execute(&node, &mut gold).await.unwrap();
        assert_eq!(outcome.path(), Some("gold"));

        let mut numeric = ctx(json!({"tier": 2}));
        let outcome = ConditionSteps.execute(&node, &mut numeric).await.unwrap();
        assert_eq!(outcome.path(), Some("2"));

        let mut absent = ctx(json!({}));
        let outcome = ConditionSteps.execute(&node, &mut absent).await.unwrap();
        assert_eq!(outcome.path(), Some("default"));
    }
}
