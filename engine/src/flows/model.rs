// Flow graph data model - versioned node/edge automation definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::steps::StepKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Draft,
    Published,
    Archived,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "published" => Self::Published,
            "archived" => Self::Archived,
            _ => Self::Draft,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: FlowStatus,
    /// The single currently-published version, when any
    pub current_version_id: Option<Uuid>,
    pub is_active: bool,
    /// Id of the corresponding workflow in the external orchestrator
    pub external_workflow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An immutable snapshot of a flow's graph. Edits create a new version;
/// existing versions are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowVersion {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub version: i32,
    pub is_published: bool,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub created_at: DateTime<Utc>,
}

impl FlowVersion {
    pub fn node(&self, key: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.key == key)
    }

    /// The traversal entry node (kind `start` or `channel_in`)
    pub fn entry_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind.is_entry())
    }

    pub fn edges_from(&self, key: &str) -> Vec<&FlowEdge> {
        self.edges.iter().filter(|e| e.source == key).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    /// Stable key unique within the version
    pub key: String,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub config: Value,
}

impl FlowNode {
    pub fn new(key: &str, kind: StepKind, config: Value) -> Self {
        Self {
            key: key.to_string(),
            kind,
            label: None,
            position: None,
            config,
        }
    }

    pub fn labeled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl FlowEdge {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: None,
            target: target.to_string(),
            target_port: None,
            condition: None,
            label: None,
        }
    }

    pub fn from_port(mut self, port: &str) -> Self {
        self.source_port = Some(port.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One run of a flow. Always references the specific version it executed,
/// never "latest".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub version_id: Uuid,
    pub tenant_id: Uuid,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    /// Variables snapshot, persisted so suspended runs can resume
    pub context: Value,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    NodeEnter,
    NodeExit,
    Wait,
    Warning,
    Error,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeEnter => "node_enter",
            Self::NodeExit => "node_exit",
            Self::Wait => "wait",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Append-only per-run log entry; the audit trail of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_key: String,
    pub event_type: RunEventType,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// An event recorded during traversal, before persistence assigns ids
#[derive(Debug, Clone)]
pub struct RunEventRecord {
    pub node_key: String,
    pub event_type: RunEventType,
    pub message: String,
    pub data: Option<Value>,
}

impl RunEventRecord {
    pub fn new(node_key: &str, event_type: RunEventType, message: impl Into<String>) -> Self {
        Self {
            node_key: node_key.to_string(),
            event_type,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Persisted suspension point for a waiting run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowWait {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_key: String,
    pub resume_at: DateTime<Utc>,
    pub processed: bool,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_lookups() {
        let version = FlowVersion {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            version: 1,
            is_published: true,
            nodes: vec![
                FlowNode::new("in", StepKind::ChannelIn, json!({})),
                FlowNode::new("done", StepKind::End, json!({})),
            ],
            edges: vec![FlowEdge::new("in", "done")],
            created_at: Utc::now(),
        };

        assert_eq!(version.entry_node().unwrap().key, "in");
        assert_eq!(version.node("done").unwrap().kind, StepKind::End);
        assert_eq!(version.edges_from("in").len(), 1);
        assert!(version.edges_from("done").is_empty());
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert_eq!(RunStatus::parse("waiting"), Some(RunStatus::Waiting));
    }

    #[test]
    fn test_node_kind_serde_in_graph() {
        let raw = json!({
            "key": "classify",
            "kind": "ai_decision",
            "config": {"analysisTypes": ["intent"]}
        });
        let node: FlowNode = serde_json::from_value(raw).unwrap();
        assert_eq!(node.kind, StepKind::AiDecision);
    }
}
