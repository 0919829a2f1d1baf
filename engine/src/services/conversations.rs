// Conversation/message store - find-or-create conversations, append messages

use beacon_shared::{Conversation, Message};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const CONVERSATION_COLUMNS: &str =
    "id, tenant_id, customer_id, channel, created_at, last_message_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_type, content, channel, from_workflow, source_node, created_at";

#[derive(Debug, Clone)]
pub struct ConversationService {
    pool: PgPool,
}

impl ConversationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Conversation>, sqlx::Error> {
        sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Resolve the open conversation for a customer on a channel, creating
    /// one when none exists.
    pub async fn find_or_create(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        channel: &str,
    ) -> Result<Conversation, sqlx::Error> {
        let existing = sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE tenant_id = $1 AND customer_id = $2 AND channel = $3 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        sqlx::query_as::<_, Conversation>(&format!(
            r#"
            INSERT INTO conversations (id, tenant_id, customer_id, channel, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(customer_id)
        .bind(channel)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_type: &str,
        content: &str,
        channel: &str,
        from_workflow: bool,
        source_node: Option<&str>,
    ) -> Result<Message, sqlx::Error> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages
            (id, conversation_id, sender_type, content, channel, from_workflow, source_node, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_type)
        .bind(content)
        .bind(channel)
        .bind(from_workflow)
        .bind(source_node)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET last_message_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(message)
    }

    /// Count automatic sends on a conversation since the given instant.
    /// Feeds the autopilot sliding-window rate limit.
    pub async fn automated_sends_since(
        &self,
        conversation_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages \
             WHERE conversation_id = $1 AND from_workflow = true AND created_at > $2",
        )
        .bind(conversation_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
