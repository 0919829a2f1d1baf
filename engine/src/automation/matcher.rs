// Trigger Matcher - matches inbound domain events against rules and flows

use beacon_shared::DomainEvent;
use futures::future::{join_all, BoxFuture};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::conditions::{evaluate, ConditionNode, FailurePolicy};
use super::runner::RuleRunner;
use super::store::{ExecutionStore, RuleStore};
use crate::events::EventBus;
use crate::flows::{FlowEngine, FlowStore, FlowVersion};

/// Match is exact string equality, or the configured type ends with `.*`
/// and the event type shares that prefix.
pub fn event_type_matches(configured: &str, actual: &str) -> bool {
    if configured.ends_with(".*") {
        // Keep the dot so "ticket.*" matches "ticket.created" but not "tickets"
        let prefix = &configured[..configured.len() - 1];
        return actual.starts_with(prefix);
    }
    configured == actual
}

/// What one inbound event started
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub executions: Vec<Uuid>,
    pub flows_matched: usize,
}

pub struct TriggerMatcher {
    rules: RuleStore,
    executions: ExecutionStore,
    flows: FlowStore,
    runner: Arc<RuleRunner>,
    engine: Arc<FlowEngine>,
}

impl TriggerMatcher {
    pub fn new(
        rules: RuleStore,
        executions: ExecutionStore,
        flows: FlowStore,
        runner: Arc<RuleRunner>,
        engine: Arc<FlowEngine>,
    ) -> Self {
        Self { rules, executions, flows, runner, engine }
    }

    /// Match an event against every active rule and published flow for its
    /// tenant. Every match executes independently; matches are neither
    /// deduplicated nor ordered relative to each other.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<MatchOutcome, sqlx::Error> {
        let mut outcome = MatchOutcome::default();
        let mut tasks: Vec<BoxFuture<'_, ()>> = Vec::new();

        // Flat rules
        let rules = self.rules.active_for_tenant(event.tenant_id).await?;
        for rule in rules {
            let matched = rule.event_triggers().any(|trigger| {
                trigger
                    .config
                    .event_type
                    .as_deref()
                    .map(|configured| event_type_matches(configured, &event.event_type))
                    .unwrap_or(false)
            });
            if !matched {
                continue;
            }

            // Trigger matching fails open: a rule with a broken condition
            // tree still fires
            if let Some(conditions) = &rule.conditions {
                if !evaluate(conditions, &event.data, FailurePolicy::Open) {
                    continue;
                }
            }

            let execution_id = self
                .executions
                .create(
                    rule.id,
                    rule.tenant_id,
                    "event",
                    &event.data,
                    Some("event"),
                    Some(&json!({ "event_type": event.event_type })),
                    None,
                )
                .await?;
            outcome.executions.push(execution_id);
            info!("Event '{}' matched rule '{}'", event.event_type, rule.name);

            let runner = self.runner.clone();
            let payload = event.data.clone();
            tasks.push(Box::pin(async move {
                if let Err(e) = runner.run(&rule, execution_id, &payload).await {
                    error!("Rule execution {} failed to persist: {}", execution_id, e);
                }
            }));
        }

        // Flow graphs
        let flows = self.flows.active_published_for_tenant(event.tenant_id).await?;
        for (flow, version) in flows {
            if !flow_trigger_matches(&version, event) {
                continue;
            }
            outcome.flows_matched += 1;
            info!("Event '{}' matched flow '{}'", event.event_type, flow.name);

            let engine = self.engine.clone();
            let input = event.data.clone();
            let flow_name = flow.name.clone();
            tasks.push(Box::pin(async move {
                if let Err(e) = engine.start_run(&flow, input).await {
                    error!("Flow '{}' failed to start: {}", flow_name, e);
                }
            }));
        }

        // All matches proceed independently and may complete in any order
        join_all(tasks).await;

        Ok(outcome)
    }

    /// Subscribe to the bus and feed every event through the matcher
    pub fn spawn(matcher: Arc<Self>, bus: EventBus) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let matcher = matcher.clone();
                        tokio::spawn(async move {
                            if let Err(e) = matcher.handle_event(&event).await {
                                error!("Failed to process event '{}': {}", event.event_type, e);
                            }
                        });
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Trigger matcher lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// A flow is event-triggered through its entry node's configuration:
/// an `event_type` (exact or wildcard) plus an optional condition tree.
fn flow_trigger_matches(version: &FlowVersion, event: &DomainEvent) -> bool {
    let Some(entry) = version.entry_node() else {
        return false;
    };
    let Some(configured) = entry.config["event_type"].as_str() else {
        return false;
    };
    if !event_type_matches(configured, &event.event_type) {
        return false;
    }

    if let Ok(tree) = serde_json::from_value::<ConditionNode>(entry.config["conditions"].clone()) {
        return evaluate(&tree, &event.data, FailurePolicy::Open);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::FlowNode;
    use crate::steps::StepKind;
    use chrono::Utc;

    #[test]
    fn test_exact_event_type_match() {
        assert!(event_type_matches("ticket.created", "ticket.created"));
        assert!(!event_type_matches("ticket.created", "ticket.updated"));
    }

    #[test]
    fn test_wildcard_prefix_match() {
        assert!(event_type_matches("ticket.*", "ticket.created"));
        assert!(event_type_matches("ticket.*", "ticket.status.changed"));
        assert!(!event_type_matches("ticket.*", "order.created"));
        assert!(!event_type_matches("otherprefix.*", "prefix.anything"));
    }

    #[test]
    fn test_wildcard_does_not_match_bare_prefix() {
        // "ticket.*" requires something after the dot
        assert!(!event_type_matches("ticket.*", "ticket"));
    }

    fn version_with_entry(config: serde_json::Value) -> FlowVersion {
        FlowVersion {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            version: 1,
            is_published: true,
            nodes: vec![FlowNode::new("in", StepKind::ChannelIn, config)],
            edges: vec![],
            created_at: Utc::now(),
        }
    }

    fn event(event_type: &str, data: serde_json::Value) -> DomainEvent {
        DomainEvent::new(event_type, Uuid::new_v4(), data)
    }

    #[test]
    fn test_flow_trigger_requires_event_type() {
        let version = version_with_entry(json!({}));
        assert!(!flow_trigger_matches(&version, &event("ticket.created", json!({}))));
    }

    #[test]
    fn test_flow_trigger_matches_wildcard_and_conditions() {
        let version = version_with_entry(json!({
            "event_type": "ticket.*",
            "conditions": {"field": "priority", "operator": "equals", "value": "high"}
        }));

        assert!(flow_trigger_matches(&version, &event("ticket.created", json!({"priority": "high"}))));
        assert!(!flow_trigger_matches(&version, &event("ticket.created", json!({"priority": "low"}))));
        assert!(!flow_trigger_matches(&version, &event("order.created", json!({"priority": "high"}))));
    }
}
