// Step Executor Registry - pluggable handlers for flow graph nodes

pub mod ai;
pub mod basic;
pub mod condition;
pub mod insights;
pub mod message;
pub mod ticket;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::automation::conditions::resolve_path;
use crate::flows::model::FlowNode;
use crate::services::{
    AiService, AnalyticsService, ChurnService, ConversationService, EmailService, JourneyService,
    SegmentService, TicketService,
};

/// Every node kind the engine can execute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    // Basic
    Start,
    ChannelIn,
    End,
    Wait,
    SetVariable,
    HttpRequest,
    Notification,
    // Branching
    Condition,
    Switch,
    // Ticket lifecycle
    CreateTicket,
    UpdateTicket,
    AssignTicket,
    CloseTicket,
    // Messaging
    SendMessage,
    // AI-assisted decisioning
    AiDecision,
    AiRoute,
    AiAgent,
    AiGuardrail,
    AiToolCall,
    // Segmentation & analytics
    SegmentCheck,
    ChurnRisk,
    JourneyTracker,
    AnalyticsTracker,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ChannelIn => "channel_in",
            Self::End => "end",
            Self::Wait => "wait",
            Self::SetVariable => "set_variable",
            Self::HttpRequest => "http_request",
            Self::Notification => "notification",
            Self::Condition => "condition",
            Self::Switch => "switch",
            Self::CreateTicket => "create_ticket",
            Self::UpdateTicket => "update_ticket",
            Self::AssignTicket => "assign_ticket",
            Self::CloseTicket => "close_ticket",
            Self::SendMessage => "send_message",
            Self::AiDecision => "ai_decision",
            Self::AiRoute => "ai_route",
            Self::AiAgent => "ai_agent",
            Self::AiGuardrail => "ai_guardrail",
            Self::AiToolCall => "ai_tool_call",
            Self::SegmentCheck => "segment_check",
            Self::ChurnRisk => "churn_risk",
            Self::JourneyTracker => "journey_tracker",
            Self::AnalyticsTracker => "analytics_tracker",
        }
    }

    /// Kinds a graph traversal may start from
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::Start | Self::ChannelIn)
    }

    /// Kinds that route through named ports
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition | Self::Switch)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("missing required config field '{0}'")]
    MissingField(String),
    #[error("no executor registered for step kind '{0}'")]
    NoExecutor(String),
    #[error("{0}")]
    Failed(String),
}

impl From<sqlx::Error> for StepError {
    fn from(err: sqlx::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<reqwest::Error> for StepError {
    fn from(err: reqwest::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Result of executing one node
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The node finished; `path` selects the outgoing port, when any
    Complete { output: Value, path: Option<String> },
    /// The node suspended the run until `resume_at`
    Suspend { resume_at: DateTime<Utc>, payload: Value },
}

impl StepOutcome {
    pub fn output(output: Value) -> Self {
        Self::Complete { output, path: None }
    }

    pub fn routed(output: Value, path: &str) -> Self {
        Self::Complete { output, path: Some(path.to_string()) }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Complete { path, .. } => path.as_deref(),
            Self::Suspend { .. } => None,
        }
    }
}

/// Per-run execution context. The `variables` map is exclusively owned by
/// its run and carries data between steps.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub ticket_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub channel: Option<String>,
    pub input: Value,
    pub variables: HashMap<String, Value>,
}

impl StepContext {
    pub fn new(run_id: Uuid, tenant_id: Uuid, input: Value) -> Self {
        let uuid_field = |name: &str| -> Option<Uuid> {
            input.get(name).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
        };
        let channel = input.get("channel").and_then(|v| v.as_str()).map(String::from);

        Self {
            run_id,
            tenant_id,
            user_id: uuid_field("user_id"),
            ticket_id: uuid_field("ticket_id"),
            customer_id: uuid_field("customer_id"),
            conversation_id: uuid_field("conversation_id"),
            channel,
            input,
            variables: HashMap::new(),
        }
    }

    /// Resolve an interpolation name: run variables win over input payload
    /// fields (dot notation reaches into the payload).
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.variables.get(name) {
            return Some(value.clone());
        }
        resolve_path(&self.input, name).cloned()
    }

    pub fn render(&self, template: &str) -> String {
        render_template(template, &|name| self.lookup(name))
    }

    pub fn render_config(&self, config: &Value) -> Value {
        render_config(config, &|name| self.lookup(name))
    }

    pub fn set_var(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn var_str(&self, name: &str) -> Option<String> {
        self.variables.get(name).and_then(|v| v.as_str()).map(String::from)
    }

    pub fn var_f64(&self, name: &str) -> Option<f64> {
        self.variables.get(name).and_then(|v| v.as_f64())
    }

    /// Variables snapshot persisted with a suspended run
    pub fn snapshot_variables(&self) -> Value {
        serde_json::to_value(&self.variables).unwrap_or(Value::Null)
    }

    pub fn restore_variables(&mut self, snapshot: &Value) {
        if let Some(map) = snapshot.as_object() {
            self.variables = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        }
    }
}

/// Replace `{{name}}` placeholders in a template string. Unresolvable names
/// are left in place.
pub fn render_template(template: &str, lookup: &dyn Fn(&str) -> Option<Value>) -> String {
    let re = regex::Regex::new(r"\{\{([^}]+)\}\}").unwrap();
    let mut result = template.to_string();

    for cap in re.captures_iter(template) {
        let name = cap[1].trim();
        if let Some(value) = lookup(name) {
            let replacement = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            result = result.replace(&cap[0], &replacement);
        }
    }

    result
}

/// Recursively interpolate every string inside a configuration value
pub fn render_config(config: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
    match config {
        Value::String(s) => Value::String(render_template(s, lookup)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_config(v, lookup)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(arr.iter().map(|v| render_config(v, lookup)).collect()),
        _ => config.clone(),
    }
}

/// A pluggable node handler
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn can_handle(&self, kind: &StepKind) -> bool;
    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError>;
}

/// External collaborators available to the standard executor set. AI, churn
/// and journey services are optional capabilities; deployments without them
/// get each step's documented fallback path.
pub struct CollaboratorSet {
    pub tickets: TicketService,
    pub conversations: ConversationService,
    pub segments: SegmentService,
    pub analytics: AnalyticsService,
    pub email: Option<EmailService>,
    pub http: reqwest::Client,
    pub ai: Option<Arc<dyn AiService>>,
    pub churn: Option<Arc<dyn ChurnService>>,
    pub journey: Option<Arc<dyn JourneyService>>,
}

/// Registry of step executors. Built once at startup, immutable afterwards,
/// shared by every concurrent run. Dispatch is first-match in registration
/// order; a node kind nothing handles is a fatal error for that node.
pub struct StepRegistry {
    executors: Vec<Box<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self { executors: Vec::new() }
    }

    pub fn register(&mut self, executor: Box<dyn StepExecutor>) {
        self.executors.push(executor);
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// The full production executor set
    pub fn standard(collaborators: CollaboratorSet) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(basic::BasicSteps::new(
            collaborators.http,
            collaborators.email,
        )));
        registry.register(Box::new(condition::ConditionSteps));
        registry.register(Box::new(ticket::TicketSteps::new(collaborators.tickets)));
        registry.register(Box::new(message::MessageSteps::new(collaborators.conversations)));
        registry.register(Box::new(ai::AiSteps::new(collaborators.ai)));
        registry.register(Box::new(insights::InsightSteps::new(
            collaborators.segments,
            collaborators.analytics,
            collaborators.churn,
            collaborators.journey,
        )));
        registry
    }

    pub async fn execute(
        &self,
        node: &FlowNode,
        ctx: &mut StepContext,
    ) -> Result<StepOutcome, StepError> {
        for executor in &self.executors {
            if executor.can_handle(&node.kind) {
                return executor.execute(node, ctx).await;
            }
        }
        Err(StepError::NoExecutor(node.kind.as_str().to_string()))
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::model::FlowNode;
    use serde_json::json;

    struct EchoStep;

    #[async_trait]
    impl StepExecutor for EchoStep {
        fn can_handle(&self, kind: &StepKind) -> bool {
            matches!(kind, StepKind::Start)
        }

        async fn execute(&self, node: &FlowNode, _ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::output(node.config.clone()))
        }
    }

    fn ctx_with(input: Value) -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), input)
    }

    #[test]
    fn test_step_kind_serde_shape() {
        assert_eq!(serde_json::to_value(StepKind::AiToolCall).unwrap(), json!("ai_tool_call"));
        let parsed: StepKind = serde_json::from_value(json!("channel_in")).unwrap();
        assert_eq!(parsed, StepKind::ChannelIn);
        assert_eq!(parsed.as_str(), "channel_in");
    }

    #[test]
    fn test_render_template_from_variables_and_payload() {
        let mut ctx = ctx_with(json!({"customer": {"name": "Ada"}, "priority": "high"}));
        ctx.set_var("aiDraft", json!("Hello!"));

        assert_eq!(ctx.render("Hi {{customer.name}}"), "Hi Ada");
        assert_eq!(ctx.render("{{aiDraft}} ({{priority}})"), "Hello! (high)");
        // Unresolvable names survive untouched
        assert_eq!(ctx.render("{{nope}}"), "{{nope}}");
    }

    #[test]
    fn test_variables_shadow_payload() {
        let mut ctx = ctx_with(json!({"priority": "low"}));
        ctx.set_var("priority", json!("high"));
        assert_eq!(ctx.render("{{priority}}"), "high");
    }

    #[test]
    fn test_render_config_recurses() {
        let ctx = ctx_with(json!({"name": "Ada"}));
        let config = json!({
            "subject": "Ticket for {{name}}",
            "nested": {"body": ["Dear {{name}}", 42]}
        });
        let rendered = ctx.render_config(&config);
        assert_eq!(rendered["subject"], "Ticket for Ada");
        assert_eq!(rendered["nested"]["body"][0], "Dear Ada");
        assert_eq!(rendered["nested"]["body"][1], 42);
    }

    #[test]
    fn test_context_extracts_identifiers() {
        let ticket = Uuid::new_v4();
        let ctx = ctx_with(json!({"ticket_id": ticket.to_string(), "channel": "chat"}));
        assert_eq!(ctx.ticket_id, Some(ticket));
        assert_eq!(ctx.channel.as_deref(), Some("chat"));
        assert_eq!(ctx.customer_id, None);
    }

    #[tokio::test]
    async fn test_registry_dispatch_and_no_executor() {
        let mut registry = StepRegistry::new();
        registry.register(Box::new(EchoStep));

        let start = FlowNode::new("start", StepKind::Start, json!({"hello": true}));
        let mut ctx = ctx_with(json!({}));
        let outcome = registry.execute(&start, &mut ctx).await.unwrap();
        match outcome {
            StepOutcome::Complete { output, .. } => assert_eq!(output["hello"], true),
            _ => panic!("expected completion"),
        }

        let end = FlowNode::new("end", StepKind::End, json!({}));
        let err = registry.execute(&end, &mut ctx).await.unwrap_err();
        assert!(matches!(err, StepError::NoExecutor(kind) if kind == "end"));
    }

    #[test]
    fn test_variable_snapshot_roundtrip() {
        let mut ctx = ctx_with(json!({}));
        ctx.set_var("aiConfidence", json!(0.9));
        let snapshot = ctx.snapshot_variables();

        let mut restored = ctx_with(json!({}));
        restored.restore_variables(&snapshot);
        assert_eq!(restored.var_f64("aiConfidence"), Some(0.9));
    }
}
