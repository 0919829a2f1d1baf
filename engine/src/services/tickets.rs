// Ticket store - create/update/assign/close plus timeline entries

use beacon_shared::Ticket;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

const TICKET_COLUMNS: &str = "id, tenant_id, customer_id, subject, details, status, priority, \
     channel, assigned_to, escalated, created_at, updated_at, closed_at";

/// Columns automation is allowed to write through `update_fields`
const UPDATABLE_COLUMNS: &[&str] = &["subject", "details", "status", "priority", "channel"];

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub tenant_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub subject: String,
    pub details: Option<String>,
    pub priority: String,
    pub channel: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TicketService {
    pool: PgPool,
}

impl TicketService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Ticket>, sqlx::Error> {
        sqlx::query_as::<_, Ticket>(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn create(&self, ticket: NewTicket) -> Result<Ticket, sqlx::Error> {
        let created = sqlx::query_as::<_, Ticket>(&format!(
            r#"
            INSERT INTO tickets
            (id, tenant_id, customer_id, subject, details, status, priority, channel,
             escalated, created_at)
            VALUES ($1, $2, $3, $4, $5, 'open', $6, $7, false, NOW())
            RETURNING {TICKET_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(ticket.tenant_id)
        .bind(ticket.customer_id)
        .bind(&ticket.subject)
        .bind(&ticket.details)
        .bind(&ticket.priority)
        .bind(&ticket.channel)
        .fetch_one(&self.pool)
        .await?;

        info!("Created ticket {} ({})", created.id, created.subject);
        Ok(created)
    }

    /// Update whitelisted ticket columns. Unknown fields are rejected rather
    /// than interpolated into SQL.
    pub async fn update_fields(&self, id: Uuid, fields: &[(String, Value)]) -> Result<(), sqlx::Error> {
        for (field, value) in fields {
            if !UPDATABLE_COLUMNS.contains(&field.as_str()) {
                return Err(sqlx::Error::Protocol(format!(
                    "ticket field '{}' is not updatable",
                    field
                )));
            }
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let query = format!("UPDATE tickets SET {} = $2, updated_at = NOW() WHERE id = $1", field);
            sqlx::query(&query).bind(id).bind(text).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn assign(&self, id: Uuid, agent_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tickets SET assigned_to = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn escalate(&self, id: Uuid, to_agent_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tickets SET assigned_to = $2, escalated = true, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(to_agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tickets SET status = 'closed', closed_at = NOW(), updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a timeline entry; automation entries carry the key of the node
    /// (or action) that produced them.
    pub async fn append_timeline(
        &self,
        ticket_id: Uuid,
        entry_type: &str,
        content: &str,
        source_node: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ticket_timeline
            (id, ticket_id, entry_type, content, source_node, created_by_system, created_at)
            VALUES ($1, $2, $3, $4, $5, true, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ticket_id)
        .bind(entry_type)
        .bind(content)
        .bind(source_node)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
