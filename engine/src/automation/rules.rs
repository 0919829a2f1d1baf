// Automation Rules - Flat trigger/condition/action rule definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::conditions::ConditionNode;

/// What starts a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Schedule,
    Webhook,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub config: TriggerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Event-kind triggers: exact event type or a `prefix.*` wildcard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Schedule-kind triggers, evaluated by the platform scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Trigger {
    pub fn event(event_type: &str) -> Self {
        Self {
            kind: TriggerKind::Event,
            name: format!("On {}", event_type),
            enabled: true,
            config: TriggerConfig {
                event_type: Some(event_type.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn manual(name: &str) -> Self {
        Self {
            kind: TriggerKind::Manual,
            name: name.to_string(),
            enabled: true,
            config: TriggerConfig::default(),
        }
    }
}

/// Types of actions a flat rule can execute
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AssignTicket,
    SendEmail,
    SendTemplate,
    UpdateField,
    EscalateTicket,
    CreateTicket,
    CloseTicket,
    AddNote,
    SendMessage,
    CallApi,
}

/// Failure policy for a single action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum OnError {
    Continue,
    Stop,
    Retry { count: u32, delay_seconds: u64 },
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Continue
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub kind: ActionKind,
    pub enabled: bool,
    pub config: Value,
    #[serde(default)]
    pub on_error: OnError,
}

impl Action {
    pub fn new(name: &str, kind: ActionKind, config: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            enabled: true,
            config,
            on_error: OnError::Continue,
        }
    }

    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn assign_ticket(agent_id: Uuid) -> Self {
        Self::new(
            "Assign Ticket",
            ActionKind::AssignTicket,
            serde_json::json!({ "agent_id": agent_id }),
        )
    }

    pub fn send_email(to: &str, subject: &str, body: &str) -> Self {
        Self::new(
            "Send Email",
            ActionKind::SendEmail,
            serde_json::json!({ "to": to, "subject": subject, "body": body }),
        )
    }

    pub fn update_field(field: &str, value: Value) -> Self {
        Self::new(
            &format!("Set {}", field),
            ActionKind::UpdateField,
            serde_json::json!({ "field": field, "value": value }),
        )
    }

    pub fn escalate_ticket(to_agent_id: Uuid, reason: &str) -> Self {
        Self::new(
            "Escalate Ticket",
            ActionKind::EscalateTicket,
            serde_json::json!({ "to_agent_id": to_agent_id, "reason": reason }),
        )
    }

    pub fn close_ticket() -> Self {
        Self::new("Close Ticket", ActionKind::CloseTicket, serde_json::json!({}))
    }

    pub fn add_note(content: &str) -> Self {
        Self::new(
            "Add Note",
            ActionKind::AddNote,
            serde_json::json!({ "content": content }),
        )
    }

    pub fn send_message(channel: &str, content: &str) -> Self {
        Self::new(
            "Send Message",
            ActionKind::SendMessage,
            serde_json::json!({ "channel": channel, "content": content }),
        )
    }

    pub fn call_api(url: &str, method: &str, body: Option<Value>) -> Self {
        Self::new(
            "Call API",
            ActionKind::CallApi,
            serde_json::json!({ "url": url, "method": method, "body": body }),
        )
    }
}

/// A flat automation rule: triggers, an optional condition tree, and an
/// ordered action list. Rules referenced by executions are deactivated, not
/// hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub is_active: bool,
    pub conditions: Option<ConditionNode>,
    pub triggers: Vec<Trigger>,
    pub actions: Vec<Action>,
    pub tags: Vec<String>,
    /// Id of the corresponding workflow in the external orchestrator;
    /// `None` means not yet synced
    pub external_workflow_id: Option<String>,
    pub imported: bool,
    pub execution_count: i64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Enabled event-kind triggers on this rule
    pub fn event_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers
            .iter()
            .filter(|t| t.enabled && t.kind == TriggerKind::Event)
    }
}

/// Status of one rule execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout)
    }
}

/// One run of a flat rule against a specific input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub triggered_by: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
    pub trigger_kind: Option<String>,
    pub trigger_data: Option<Value>,
    /// Id of the corresponding execution in the external orchestrator
    pub external_execution_id: Option<String>,
    /// Set when this execution is a retry of an earlier one
    pub retry_of: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_builder() {
        let action = Action::assign_ticket(Uuid::new_v4()).on_error(OnError::Stop);
        assert_eq!(action.kind, ActionKind::AssignTicket);
        assert_eq!(action.on_error, OnError::Stop);
        assert!(action.enabled);
    }

    #[test]
    fn test_on_error_default_is_continue() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "Close",
            "kind": "close_ticket",
            "enabled": true,
            "config": {}
        });
        let action: Action = serde_json::from_value(raw).unwrap();
        assert_eq!(action.on_error, OnError::Continue);
    }

    #[test]
    fn test_on_error_retry_shape() {
        let raw = serde_json::json!({"action": "retry", "count": 3, "delay_seconds": 10});
        let policy: OnError = serde_json::from_value(raw).unwrap();
        assert_eq!(policy, OnError::Retry { count: 3, delay_seconds: 10 });
    }

    #[test]
    fn test_execution_status_terminality() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert_eq!(ExecutionStatus::parse("failed"), Some(ExecutionStatus::Failed));
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_event_triggers_filters_disabled_and_non_event() {
        let mut disabled = Trigger::event("ticket.created");
        disabled.enabled = false;
        let rule = Rule {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "r".to_string(),
            description: None,
            priority: 0,
            is_active: true,
            conditions: None,
            triggers: vec![Trigger::event("ticket.updated"), disabled, Trigger::manual("m")],
            actions: vec![],
            tags: vec![],
            external_workflow_id: None,
            imported: false,
            execution_count: 0,
            last_executed_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        let types: Vec<_> = rule
            .event_triggers()
            .filter_map(|t| t.config.event_type.as_deref())
            .collect();
        assert_eq!(types, vec!["ticket.updated"]);
    }
}
