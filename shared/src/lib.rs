use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A domain event flowing through the platform event bus.
///
/// Event types are dotted strings (`ticket.created`, `order.updated`).
/// Automation triggers match them either exactly or by `prefix.*` wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl DomainEvent {
    pub fn new(event_type: &str, tenant_id: Uuid, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            tenant_id,
            user_id: None,
            timestamp: Utc::now(),
            data,
            metadata: None,
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub subject: String,
    pub details: Option<String>,
    pub status: String,   // open, acknowledged, pending, resolved, closed
    pub priority: String, // low, normal, high, critical
    pub channel: Option<String>,
    pub assigned_to: Option<Uuid>,
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An audit entry on a ticket's history. Entries written by automation carry
/// the key of the graph node (or action) that produced them.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketTimelineEntry {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub entry_type: String, // created, status_change, assignment, note, autopilot_blocked, ...
    pub content: String,
    pub source_node: Option<String>,
    pub created_by_system: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub channel: String, // email, chat, sms, whatsapp, ...
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_type: String, // customer, agent, system
    pub content: String,
    pub channel: String,
    pub from_workflow: bool,
    pub source_node: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_event_builder() {
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let event = DomainEvent::new("ticket.created", tenant, serde_json::json!({"priority": "high"}))
            .with_user(user);

        assert_eq!(event.event_type, "ticket.created");
        assert_eq!(event.tenant_id, tenant);
        assert_eq!(event.user_id, Some(user));
        assert!(event.metadata.is_none());
    }

    #[test]
    fn test_domain_event_roundtrip() {
        let event = DomainEvent::new("order.updated", Uuid::new_v4(), serde_json::json!({"total": 42}));
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type, "order.updated");
        assert_eq!(back.data["total"], 42);
    }
}
