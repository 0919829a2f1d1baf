// Workflow synchronization with the external orchestrator
//
// Maps internal {nodes, edges} graphs onto the orchestrator's
// {nodes, connections} schema and keeps both sides linked.

use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::orchestrator::{
    ExternalConnection, ExternalConnections, ExternalNode, ExternalWorkflow, OrchestratorClient,
    OrchestratorError,
};
use crate::automation::rules::{Action, ActionKind, Rule, Trigger};
use crate::automation::store::RuleStore;
use crate::flows::model::{Flow, FlowEdge, FlowNode, FlowVersion};
use crate::flows::store::FlowStore;
use crate::steps::StepKind;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Fixed node-type lookup table. Kinds without an orchestrator equivalent
/// fall back to the external no-op type; that direction is lossy and
/// re-imports as an `end` node, which is the accepted non-round-trippable
/// case.
pub fn external_type(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Start => "base.trigger",
        StepKind::ChannelIn => "base.webhook",
        StepKind::Wait => "base.wait",
        StepKind::SetVariable => "base.set",
        StepKind::HttpRequest => "base.httpRequest",
        StepKind::Notification => "base.emailSend",
        StepKind::Condition => "base.if",
        StepKind::Switch => "base.switch",
        _ => "base.noOp",
    }
}

pub fn internal_kind(node_type: &str) -> StepKind {
    match node_type {
        "base.trigger" => StepKind::Start,
        "base.webhook" => StepKind::ChannelIn,
        "base.wait" => StepKind::Wait,
        "base.set" => StepKind::SetVariable,
        "base.httpRequest" => StepKind::HttpRequest,
        "base.emailSend" => StepKind::Notification,
        "base.if" => StepKind::Condition,
        "base.switch" => StepKind::Switch,
        _ => StepKind::End,
    }
}

/// Map an internal graph to the external schema. Connections are addressed
/// by node name externally but by node key internally, so edges go through a
/// key-to-name remap. An empty graph is padded with a minimal trigger→no-op
/// pair so the orchestrator accepts it.
pub fn map_graph_to_external(
    name: &str,
    nodes: &[FlowNode],
    edges: &[FlowEdge],
    active: bool,
) -> ExternalWorkflow {
    let (nodes, edges): (Vec<FlowNode>, Vec<FlowEdge>) = if nodes.is_empty() {
        (
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("end", StepKind::End, json!({})),
            ],
            vec![FlowEdge::new("start", "end")],
        )
    } else {
        (nodes.to_vec(), edges.to_vec())
    };

    // External nodes are addressed by name; the internal key is the name
    let name_by_key: HashMap<&str, &str> =
        nodes.iter().map(|n| (n.key.as_str(), n.key.as_str())).collect();

    let external_nodes = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| ExternalNode {
            name: node.key.clone(),
            node_type: external_type(node.kind).to_string(),
            parameters: node.config.clone(),
            position: node
                .position
                .map(|p| [p.x, p.y])
                .unwrap_or([(index as f64) * 200.0, 0.0]),
        })
        .collect();

    let mut connections: HashMap<String, ExternalConnections> = HashMap::new();
    for edge in &edges {
        let (Some(source), Some(target)) = (
            name_by_key.get(edge.source.as_str()),
            name_by_key.get(edge.target.as_str()),
        ) else {
            warn!("Dropping edge {} -> {}: unknown node key", edge.source, edge.target);
            continue;
        };

        let entry = connections.entry(source.to_string()).or_default();
        if entry.main.is_empty() {
            entry.main.push(Vec::new());
        }
        entry.main[0].push(ExternalConnection {
            node: target.to_string(),
            kind: "main".to_string(),
            index: 0,
        });
    }

    ExternalWorkflow {
        id: None,
        name: name.to_string(),
        active,
        nodes: external_nodes,
        connections,
        settings: None,
    }
}

/// Inverse-map an external workflow back into internal graph shapes
pub fn map_external_to_graph(workflow: &ExternalWorkflow) -> (Vec<FlowNode>, Vec<FlowEdge>) {
    let nodes = workflow
        .nodes
        .iter()
        .map(|n| FlowNode::new(&n.name, internal_kind(&n.node_type), n.parameters.clone()))
        .collect();

    let mut edges = Vec::new();
    for (source, connections) in &workflow.connections {
        for group in &connections.main {
            for connection in group {
                edges.push(FlowEdge::new(source, &connection.node));
            }
        }
    }

    (nodes, edges)
}

/// Inverse-map an external workflow into a flat imported rule: trigger nodes
/// become event triggers, actionable nodes become actions, everything else
/// is dropped.
pub fn map_external_to_rule(tenant_id: Uuid, workflow: &ExternalWorkflow) -> Rule {
    let mut triggers = Vec::new();
    let mut actions = Vec::new();

    for node in &workflow.nodes {
        match internal_kind(&node.node_type) {
            StepKind::Start | StepKind::ChannelIn => {
                let event_type = node.parameters["event_type"]
                    .as_str()
                    .unwrap_or("external.imported");
                triggers.push(Trigger::event(event_type));
            }
            StepKind::HttpRequest => {
                actions.push(Action::new(&node.name, ActionKind::CallApi, node.parameters.clone()));
            }
            StepKind::Notification => {
                actions.push(Action::new(&node.name, ActionKind::SendEmail, node.parameters.clone()));
            }
            StepKind::SetVariable => {
                actions.push(Action::new(&node.name, ActionKind::UpdateField, node.parameters.clone()));
            }
            _ => {}
        }
    }

    Rule {
        id: Uuid::new_v4(),
        tenant_id,
        name: workflow.name.clone(),
        description: Some("Imported from external orchestrator".to_string()),
        priority: 100,
        is_active: false,
        conditions: None,
        triggers,
        actions,
        tags: vec!["imported".to_string()],
        external_workflow_id: workflow.id.clone(),
        imported: true,
        execution_count: 0,
        last_executed_at: None,
        created_at: chrono::Utc::now(),
        updated_at: None,
    }
}

/// Build the linear graph equivalent of a flat rule so it can live in the
/// orchestrator: trigger node first, then one node per enabled action.
pub fn rule_to_graph(rule: &Rule) -> (Vec<FlowNode>, Vec<FlowEdge>) {
    let event_type = rule
        .event_triggers()
        .find_map(|t| t.config.event_type.clone())
        .unwrap_or_else(|| "manual".to_string());

    let mut nodes = vec![FlowNode::new(
        "trigger",
        StepKind::Start,
        json!({ "event_type": event_type }),
    )];
    let mut edges = Vec::new();
    let mut previous = "trigger".to_string();

    for (index, action) in rule.actions.iter().filter(|a| a.enabled).enumerate() {
        let key = format!("action_{}", index);
        let kind = match action.kind {
            ActionKind::AssignTicket => StepKind::AssignTicket,
            ActionKind::SendEmail | ActionKind::SendTemplate => StepKind::Notification,
            ActionKind::UpdateField | ActionKind::AddNote => StepKind::UpdateTicket,
            ActionKind::EscalateTicket => StepKind::AssignTicket,
            ActionKind::CreateTicket => StepKind::CreateTicket,
            ActionKind::CloseTicket => StepKind::CloseTicket,
            ActionKind::SendMessage => StepKind::SendMessage,
            ActionKind::CallApi => StepKind::HttpRequest,
        };
        nodes.push(FlowNode::new(&key, kind, action.config.clone()));
        edges.push(FlowEdge::new(&previous, &key));
        previous = key;
    }

    (nodes, edges)
}

pub struct WorkflowSyncService {
    client: OrchestratorClient,
    flows: FlowStore,
    rules: RuleStore,
}

impl WorkflowSyncService {
    pub fn new(client: OrchestratorClient, flows: FlowStore, rules: RuleStore) -> Self {
        Self { client, flows, rules }
    }

    /// Create or update the external workflow for a flow version. An update
    /// failure falls back to creating a fresh external workflow and the
    /// stored link is overwritten.
    pub async fn sync_flow(&self, flow: &Flow, version: &FlowVersion) -> Result<String, SyncError> {
        let workflow =
            map_graph_to_external(&flow.name, &version.nodes, &version.edges, flow.is_active);

        let external_id = self
            .create_or_update(flow.external_workflow_id.as_deref(), &workflow)
            .await?;
        self.flows.set_external_link(flow.id, Some(&external_id)).await?;
        info!("Flow '{}' synced to external workflow {}", flow.name, external_id);
        Ok(external_id)
    }

    /// Sync a flat rule as a linear trigger→actions graph
    pub async fn sync_rule(&self, rule: &Rule) -> Result<String, SyncError> {
        let (nodes, edges) = rule_to_graph(rule);
        let workflow = map_graph_to_external(&rule.name, &nodes, &edges, rule.is_active);

        let external_id = self
            .create_or_update(rule.external_workflow_id.as_deref(), &workflow)
            .await?;
        self.rules.set_external_link(rule.id, Some(&external_id)).await?;
        info!("Rule '{}' synced to external workflow {}", rule.name, external_id);
        Ok(external_id)
    }

    async fn create_or_update(
        &self,
        existing: Option<&str>,
        workflow: &ExternalWorkflow,
    ) -> Result<String, SyncError> {
        if let Some(id) = existing {
            match self.client.update_workflow(id, workflow).await {
                Ok(()) => return Ok(id.to_string()),
                Err(e) => {
                    warn!("Update of external workflow {} failed ({}), recreating", id, e);
                }
            }
        }

        let created = self.client.create_workflow(workflow).await?;
        created.id.ok_or(SyncError::Orchestrator(OrchestratorError::Api {
            status: 200,
            body: "created workflow has no id".to_string(),
        }))
    }

    /// Best-effort: the internal record is already gone, so failures are
    /// logged, not propagated.
    pub async fn delete_external(&self, external_id: &str) {
        if let Err(e) = self.client.delete_workflow(external_id).await {
            warn!("Failed to delete external workflow {}: {}", external_id, e);
        }
    }

    /// Mirror the internal active flag; failures are logged only.
    pub async fn mirror_active(&self, external_id: &str, active: bool) {
        if let Err(e) = self.client.set_active(external_id, active).await {
            warn!(
                "Failed to {} external workflow {}: {}",
                if active { "activate" } else { "deactivate" },
                external_id,
                e
            );
        }
    }

    /// Reverse sync: every external workflow without an internal link becomes
    /// an inactive imported rule.
    pub async fn import_workflows(&self, tenant_id: Uuid) -> Result<Vec<Uuid>, SyncError> {
        let mut linked: Vec<String> = self.rules.linked_external_ids().await?;
        linked.extend(self.flows.linked_external_ids().await?);

        let mut imported = Vec::new();
        for workflow in self.client.list_workflows().await? {
            let Some(external_id) = &workflow.id else {
                continue;
            };
            if linked.iter().any(|id| id == external_id) {
                continue;
            }

            let rule = map_external_to_rule(tenant_id, &workflow);
            self.rules.create(&rule).await?;
            info!("Imported external workflow {} as rule '{}'", external_id, rule.name);
            imported.push(rule.id);
        }

        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> (Vec<FlowNode>, Vec<FlowEdge>) {
        (
            vec![
                FlowNode::new("in", StepKind::ChannelIn, json!({"event_type": "ticket.created"})),
                FlowNode::new("check", StepKind::Condition, json!({"conditions": {}})),
                FlowNode::new("notify", StepKind::Notification, json!({"to": "ops@example.com"})),
                FlowNode::new("done", StepKind::End, json!({})),
            ],
            vec![
                FlowEdge::new("in", "check"),
                FlowEdge::new("check", "notify").from_port("true"),
                FlowEdge::new("notify", "done"),
            ],
        )
    }

    #[test]
    fn test_type_table_round_trip_for_known_kinds() {
        for kind in [
            StepKind::Start,
            StepKind::ChannelIn,
            StepKind::Wait,
            StepKind::SetVariable,
            StepKind::HttpRequest,
            StepKind::Notification,
            StepKind::Condition,
            StepKind::Switch,
        ] {
            assert_eq!(internal_kind(external_type(kind)), kind);
        }
    }

    #[test]
    fn test_unknown_internal_kind_is_lossy_noop() {
        // Engine-specific kinds map to the no-op type and re-import as `end`
        assert_eq!(external_type(StepKind::AiDecision), "base.noOp");
        assert_eq!(internal_kind("base.noOp"), StepKind::End);
        assert_eq!(internal_kind("vendor.somethingNew"), StepKind::End);
    }

    #[test]
    fn test_graph_round_trip_preserves_keys_kinds_and_edges() {
        let (nodes, edges) = graph();
        let external = map_graph_to_external("Escalation", &nodes, &edges, true);
        let (back_nodes, back_edges) = map_external_to_graph(&external);

        assert_eq!(back_nodes.len(), nodes.len());
        for original in &nodes {
            let round_tripped = back_nodes.iter().find(|n| n.key == original.key).unwrap();
            assert_eq!(round_tripped.kind, internal_kind(external_type(original.kind)));
        }

        let mut expected: Vec<(String, String)> = edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        let mut actual: Vec<(String, String)> = back_edges
            .iter()
            .map(|e| (e.source.clone(), e.target.clone()))
            .collect();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_empty_graph_is_padded() {
        let external = map_graph_to_external("Empty", &[], &[], false);
        assert_eq!(external.nodes.len(), 2);
        assert_eq!(external.nodes[0].node_type, "base.trigger");
        assert_eq!(external.nodes[1].node_type, "base.noOp");
        assert_eq!(external.connections.len(), 1);
    }

    #[test]
    fn test_edges_with_unknown_keys_are_dropped() {
        let nodes = vec![FlowNode::new("a", StepKind::Start, json!({}))];
        let edges = vec![FlowEdge::new("a", "ghost")];
        let external = map_graph_to_external("Partial", &nodes, &edges, false);
        assert!(external.connections.is_empty());
    }

    #[test]
    fn test_rule_to_graph_is_linear() {
        let mut rule = map_external_to_rule(
            Uuid::new_v4(),
            &ExternalWorkflow {
                id: Some("wf-7".to_string()),
                name: "Imported".to_string(),
                active: true,
                nodes: vec![],
                connections: HashMap::new(),
                settings: None,
            },
        );
        rule.triggers = vec![Trigger::event("ticket.created")];
        rule.actions = vec![
            Action::send_email("ops@example.com", "hi", "body"),
            Action::close_ticket(),
        ];

        let (nodes, edges) = rule_to_graph(&rule);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].config["event_type"], "ticket.created");
        assert_eq!(nodes[1].kind, StepKind::Notification);
        assert_eq!(nodes[2].kind, StepKind::CloseTicket);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].source, "trigger");
    }

    #[test]
    fn test_import_mapping_builds_inactive_tagged_rule() {
        let workflow = ExternalWorkflow {
            id: Some("wf-3".to_string()),
            name: "External escalation".to_string(),
            active: true,
            nodes: vec![
                ExternalNode {
                    name: "trigger".to_string(),
                    node_type: "base.trigger".to_string(),
                    parameters: json!({"event_type": "order.updated"}),
                    position: [0.0, 0.0],
                },
                ExternalNode {
                    name: "call".to_string(),
                    node_type: "base.httpRequest".to_string(),
                    parameters: json!({"url": "https://api.example.com"}),
                    position: [200.0, 0.0],
                },
            ],
            connections: HashMap::new(),
            settings: None,
        };

        let rule = map_external_to_rule(Uuid::new_v4(), &workflow);
        assert!(rule.imported);
        assert!(!rule.is_active);
        assert_eq!(rule.tags, vec!["imported".to_string()]);
        assert_eq!(rule.external_workflow_id.as_deref(), Some("wf-3"));
        assert_eq!(rule.triggers.len(), 1);
        assert_eq!(rule.actions.len(), 1);
        assert_eq!(rule.actions[0].kind, ActionKind::CallApi);
    }
}
