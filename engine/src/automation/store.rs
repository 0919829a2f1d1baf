// Rule & Execution persistence

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::conditions::ConditionNode;
use super::rules::{Action, Execution, ExecutionStatus, Rule, Trigger};

type RuleRow = (
    Uuid,                    // id
    Uuid,                    // tenant_id
    String,                  // name
    Option<String>,          // description
    i32,                     // priority
    bool,                    // is_active
    Option<Value>,           // conditions
    Value,                   // triggers
    Value,                   // actions
    Vec<String>,             // tags
    Option<String>,          // external_workflow_id
    bool,                    // imported
    i64,                     // execution_count
    Option<DateTime<Utc>>,   // last_executed_at
    DateTime<Utc>,           // created_at
    Option<DateTime<Utc>>,   // updated_at
);

const RULE_COLUMNS: &str = "id, tenant_id, name, description, priority, is_active, conditions, \
     triggers, actions, tags, external_workflow_id, imported, execution_count, \
     last_executed_at, created_at, updated_at";

fn row_to_rule(row: RuleRow) -> Option<Rule> {
    let conditions: Option<ConditionNode> = row.6.and_then(|c| serde_json::from_value(c).ok());
    let triggers: Vec<Trigger> = serde_json::from_value(row.7).ok()?;
    let actions: Vec<Action> = serde_json::from_value(row.8).ok()?;

    Some(Rule {
        id: row.0,
        tenant_id: row.1,
        name: row.2,
        description: row.3,
        priority: row.4,
        is_active: row.5,
        conditions,
        triggers,
        actions,
        tags: row.9,
        external_workflow_id: row.10,
        imported: row.11,
        execution_count: row.12,
        last_executed_at: row.13,
        created_at: row.14,
        updated_at: row.15,
    })
}

#[derive(Debug, Clone)]
pub struct RuleStore {
    pool: PgPool,
}

impl RuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active rules for a tenant in stored listing order
    pub async fn active_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Rule>, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM automation_rules \
             WHERE tenant_id = $1 AND is_active = true \
             ORDER BY priority ASC, created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_rule).collect())
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Rule>, sqlx::Error> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM automation_rules \
             WHERE tenant_id = $1 ORDER BY priority ASC, created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_rule).collect())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Rule>, sqlx::Error> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM automation_rules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(row_to_rule))
    }

    pub async fn create(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules
            (id, tenant_id, name, description, priority, is_active, conditions, triggers,
             actions, tags, external_workflow_id, imported, execution_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, NOW())
            "#,
        )
        .bind(rule.id)
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.conditions.as_ref().and_then(|c| serde_json::to_value(c).ok()))
        .bind(serde_json::to_value(&rule.triggers).unwrap_or(Value::Array(vec![])))
        .bind(serde_json::to_value(&rule.actions).unwrap_or(Value::Array(vec![])))
        .bind(&rule.tags)
        .bind(&rule.external_workflow_id)
        .bind(rule.imported)
        .execute(&self.pool)
        .await?;

        info!("Created rule '{}' for tenant {}", rule.name, rule.tenant_id);
        Ok(())
    }

    pub async fn update(&self, rule: &Rule) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE automation_rules
            SET name = $2, description = $3, priority = $4, is_active = $5,
                conditions = $6, triggers = $7, actions = $8, tags = $9, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.conditions.as_ref().and_then(|c| serde_json::to_value(c).ok()))
        .bind(serde_json::to_value(&rule.triggers).unwrap_or(Value::Array(vec![])))
        .bind(serde_json::to_value(&rule.actions).unwrap_or(Value::Array(vec![])))
        .bind(&rule.tags)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Rules referenced by executions are deactivated instead of deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let referenced: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM rule_executions WHERE rule_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

        if referenced.0 > 0 {
            sqlx::query("UPDATE automation_rules SET is_active = false, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(false)
        } else {
            sqlx::query("DELETE FROM automation_rules WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(true)
        }
    }

    pub async fn set_external_link(&self, id: Uuid, external_id: Option<&str>) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE automation_rules SET external_workflow_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All external workflow ids already linked to some rule
    pub async fn linked_external_ids(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT external_workflow_id FROM automation_rules WHERE external_workflow_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn record_execution(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE automation_rules \
             SET execution_count = execution_count + 1, last_executed_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type ExecutionRow = (
    Uuid,                    // id
    Uuid,                    // rule_id
    Uuid,                    // tenant_id
    String,                  // triggered_by
    String,                  // status
    Value,                   // input
    Option<Value>,           // output
    Option<String>,          // error_message
    Option<Value>,           // error_details
    Option<String>,          // trigger_kind
    Option<Value>,           // trigger_data
    Option<String>,          // external_execution_id
    Option<Uuid>,            // retry_of
    DateTime<Utc>,           // started_at
    Option<DateTime<Utc>>,   // completed_at
    Option<i64>,             // duration_ms
);

const EXECUTION_COLUMNS: &str = "id, rule_id, tenant_id, triggered_by, status, input, output, \
     error_message, error_details, trigger_kind, trigger_data, external_execution_id, \
     retry_of, started_at, completed_at, duration_ms";

fn row_to_execution(row: ExecutionRow) -> Execution {
    Execution {
        id: row.0,
        rule_id: row.1,
        tenant_id: row.2,
        triggered_by: row.3,
        status: ExecutionStatus::parse(&row.4).unwrap_or(ExecutionStatus::Failed),
        input: row.5,
        output: row.6,
        error_message: row.7,
        error_details: row.8,
        trigger_kind: row.9,
        trigger_data: row.10,
        external_execution_id: row.11,
        retry_of: row.12,
        started_at: row.13,
        completed_at: row.14,
        duration_ms: row.15,
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionStore {
    pool: PgPool,
}

impl ExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new pending execution and return its id
    pub async fn create(
        &self,
        rule_id: Uuid,
        tenant_id: Uuid,
        triggered_by: &str,
        input: &Value,
        trigger_kind: Option<&str>,
        trigger_data: Option<&Value>,
        retry_of: Option<Uuid>,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO rule_executions
            (id, rule_id, tenant_id, triggered_by, status, input, trigger_kind, trigger_data,
             retry_of, started_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(id)
        .bind(rule_id)
        .bind(tenant_id)
        .bind(triggered_by)
        .bind(input)
        .bind(trigger_kind)
        .bind(trigger_data)
        .bind(retry_of)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Execution>, sqlx::Error> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM rule_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_execution))
    }

    pub async fn list_for_rule(&self, rule_id: Uuid, limit: i64) -> Result<Vec<Execution>, sqlx::Error> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM rule_executions \
             WHERE rule_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(rule_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_execution).collect())
    }

    pub async fn mark_running(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE rule_executions SET status = 'running' WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_external_execution(&self, id: Uuid, external_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE rule_executions SET external_execution_id = $2 WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move an execution into a terminal state. Terminal states are final:
    /// an execution already completed/failed/cancelled/timed-out is left
    /// untouched.
    pub async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<&Value>,
        error_message: Option<&str>,
        error_details: Option<&Value>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE rule_executions
            SET status = $2, output = $3, error_message = $4, error_details = $5,
                completed_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
            WHERE id = $1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'timeout')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(output)
        .bind(error_message)
        .bind(error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
