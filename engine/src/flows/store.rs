// Flow persistence - flows, immutable versions, runs, run events and waits

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::model::{
    Flow, FlowEdge, FlowNode, FlowRun, FlowRunEvent, FlowStatus, FlowVersion, FlowWait,
    RunEventRecord, RunEventType, RunStatus,
};

type FlowRow = (
    Uuid,
    Uuid,
    String,
    Option<String>,
    String,
    Option<Uuid>,
    bool,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const FLOW_COLUMNS: &str = "id, tenant_id, name, description, status, current_version_id, \
     is_active, external_workflow_id, created_at, updated_at";

fn row_to_flow(row: FlowRow) -> Flow {
    Flow {
        id: row.0,
        tenant_id: row.1,
        name: row.2,
        description: row.3,
        status: FlowStatus::parse(&row.4),
        current_version_id: row.5,
        is_active: row.6,
        external_workflow_id: row.7,
        created_at: row.8,
        updated_at: row.9,
    }
}

type VersionRow = (Uuid, Uuid, i32, bool, Value, Value, DateTime<Utc>);

const VERSION_COLUMNS: &str = "id, flow_id, version, is_published, nodes, edges, created_at";

fn row_to_version(row: VersionRow) -> Option<FlowVersion> {
    let nodes: Vec<FlowNode> = serde_json::from_value(row.4).ok()?;
    let edges: Vec<FlowEdge> = serde_json::from_value(row.5).ok()?;
    Some(FlowVersion {
        id: row.0,
        flow_id: row.1,
        version: row.2,
        is_published: row.3,
        nodes,
        edges,
        created_at: row.6,
    })
}

type RunRow = (
    Uuid,
    Uuid,
    Uuid,
    Uuid,
    String,
    Value,
    Option<Value>,
    Value,
    Option<String>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i64>,
);

const RUN_COLUMNS: &str = "id, flow_id, version_id, tenant_id, status, input, output, context, \
     error_message, started_at, completed_at, duration_ms";

fn row_to_run(row: RunRow) -> FlowRun {
    FlowRun {
        id: row.0,
        flow_id: row.1,
        version_id: row.2,
        tenant_id: row.3,
        status: RunStatus::parse(&row.4).unwrap_or(RunStatus::Failed),
        input: row.5,
        output: row.6,
        context: row.7,
        error_message: row.8,
        started_at: row.9,
        completed_at: row.10,
        duration_ms: row.11,
    }
}

type WaitRow = (Uuid, Uuid, String, DateTime<Utc>, bool, Value, DateTime<Utc>);

const WAIT_COLUMNS: &str = "id, run_id, node_key, resume_at, processed, payload, created_at";

fn row_to_wait(row: WaitRow) -> FlowWait {
    FlowWait {
        id: row.0,
        run_id: row.1,
        node_key: row.2,
        resume_at: row.3,
        processed: row.4,
        payload: row.5,
        created_at: row.6,
    }
}

#[derive(Debug, Clone)]
pub struct FlowStore {
    pool: PgPool,
}

impl FlowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ===== Flows =====

    pub async fn create_flow(&self, flow: &Flow) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO flows
            (id, tenant_id, name, description, status, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(flow.id)
        .bind(flow.tenant_id)
        .bind(&flow.name)
        .bind(&flow.description)
        .bind(flow.status.as_str())
        .bind(flow.is_active)
        .execute(&self.pool)
        .await?;

        info!("Created flow '{}' for tenant {}", flow.name, flow.tenant_id);
        Ok(())
    }

    pub async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, sqlx::Error> {
        let row: Option<FlowRow> =
            sqlx::query_as(&format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(row_to_flow))
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<Flow>, sqlx::Error> {
        let rows: Vec<FlowRow> = sqlx::query_as(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE tenant_id = $1 ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_flow).collect())
    }

    pub async fn update_flow(&self, flow: &Flow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE flows SET name = $2, description = $3, is_active = $4, updated_at = NOW() WHERE id = $1",
        )
        .bind(flow.id)
        .bind(&flow.name)
        .bind(&flow.description)
        .bind(flow.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn archive_flow(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE flows SET status = 'archived', is_active = false, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_external_link(&self, id: Uuid, external_id: Option<&str>) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE flows SET external_workflow_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn linked_external_ids(&self) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT external_workflow_id FROM flows WHERE external_workflow_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Active flows with a published version, paired with that version
    pub async fn active_published_for_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<Vec<(Flow, FlowVersion)>, sqlx::Error> {
        let flows: Vec<FlowRow> = sqlx::query_as(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows \
             WHERE tenant_id = $1 AND is_active = true AND status = 'published' \
               AND current_version_id IS NOT NULL \
             ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::new();
        for row in flows {
            let flow = row_to_flow(row);
            if let Some(version_id) = flow.current_version_id {
                if let Some(version) = self.get_version(version_id).await? {
                    result.push((flow, version));
                }
            }
        }
        Ok(result)
    }

    // ===== Versions =====

    /// Persist a new draft version snapshot. Versions are immutable; edits
    /// always land in a fresh row with the next version number.
    pub async fn save_draft_version(
        &self,
        flow_id: Uuid,
        nodes: &[FlowNode],
        edges: &[FlowEdge],
    ) -> Result<FlowVersion, sqlx::Error> {
        let next: (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM flow_versions WHERE flow_id = $1",
        )
        .bind(flow_id)
        .fetch_one(&self.pool)
        .await?;

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO flow_versions (id, flow_id, version, is_published, nodes, edges, created_at)
            VALUES ($1, $2, $3, false, $4, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(flow_id)
        .bind(next.0)
        .bind(serde_json::to_value(nodes).unwrap_or(Value::Array(vec![])))
        .bind(serde_json::to_value(edges).unwrap_or(Value::Array(vec![])))
        .execute(&self.pool)
        .await?;

        Ok(FlowVersion {
            id,
            flow_id,
            version: next.0,
            is_published: false,
            nodes: nodes.to_vec(),
            edges: edges.to_vec(),
            created_at: Utc::now(),
        })
    }

    pub async fn get_version(&self, id: Uuid) -> Result<Option<FlowVersion>, sqlx::Error> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM flow_versions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(row_to_version))
    }

    pub async fn latest_version(&self, flow_id: Uuid) -> Result<Option<FlowVersion>, sqlx::Error> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM flow_versions \
             WHERE flow_id = $1 ORDER BY version DESC LIMIT 1"
        ))
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(row_to_version))
    }

    /// Publish a version: it becomes the flow's single current version.
    pub async fn publish_version(&self, flow_id: Uuid, version_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE flow_versions SET is_published = false WHERE flow_id = $1")
            .bind(flow_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE flow_versions SET is_published = true WHERE id = $1")
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE flows SET status = 'published', current_version_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(flow_id)
        .bind(version_id)
        .execute(&self.pool)
        .await?;

        info!("Published version {} for flow {}", version_id, flow_id);
        Ok(())
    }

    // ===== Runs =====

    pub async fn create_run(
        &self,
        flow_id: Uuid,
        version_id: Uuid,
        tenant_id: Uuid,
        input: &Value,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO flow_runs
            (id, flow_id, version_id, tenant_id, status, input, context, started_at)
            VALUES ($1, $2, $3, $4, 'running', $5, '{}'::jsonb, NOW())
            "#,
        )
        .bind(id)
        .bind(flow_id)
        .bind(version_id)
        .bind(tenant_id)
        .bind(input)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<FlowRun>, sqlx::Error> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(row_to_run))
    }

    pub async fn list_runs_for_flow(&self, flow_id: Uuid, limit: i64) -> Result<Vec<FlowRun>, sqlx::Error> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM flow_runs \
             WHERE flow_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(flow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_run).collect())
    }

    /// Move a run into a terminal state. Terminal states are never revisited.
    pub async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<&Value>,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2, output = $3, error_message = $4, completed_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(output)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_run_waiting(&self, id: Uuid, context: &Value) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE flow_runs SET status = 'waiting', context = $2 \
             WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(id)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_run_running(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE flow_runs SET status = 'running' WHERE id = $1 AND status = 'waiting'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Run events =====

    pub async fn append_run_events(
        &self,
        run_id: Uuid,
        events: &[RunEventRecord],
    ) -> Result<(), sqlx::Error> {
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO flow_run_events
                (id, run_id, node_key, event_type, message, data, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(&event.node_key)
            .bind(event.event_type.as_str())
            .bind(&event.message)
            .bind(&event.data)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_run_events(&self, run_id: Uuid) -> Result<Vec<FlowRunEvent>, sqlx::Error> {
        let rows: Vec<(Uuid, Uuid, String, String, String, Option<Value>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, run_id, node_key, event_type, message, data, created_at \
                 FROM flow_run_events WHERE run_id = $1 ORDER BY created_at ASC",
            )
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| FlowRunEvent {
                id: row.0,
                run_id: row.1,
                node_key: row.2,
                event_type: match row.3.as_str() {
                    "node_enter" => RunEventType::NodeEnter,
                    "node_exit" => RunEventType::NodeExit,
                    "wait" => RunEventType::Wait,
                    "warning" => RunEventType::Warning,
                    _ => RunEventType::Error,
                },
                message: row.4,
                data: row.5,
                created_at: row.6,
            })
            .collect())
    }

    // ===== Waits =====

    pub async fn create_wait(
        &self,
        run_id: Uuid,
        node_key: &str,
        resume_at: DateTime<Utc>,
        payload: &Value,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO flow_waits (id, run_id, node_key, resume_at, processed, payload, created_at)
            VALUES ($1, $2, $3, $4, false, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(run_id)
        .bind(node_key)
        .bind(resume_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn due_waits(&self, now: DateTime<Utc>) -> Result<Vec<FlowWait>, sqlx::Error> {
        let rows: Vec<WaitRow> = sqlx::query_as(&format!(
            "SELECT {WAIT_COLUMNS} FROM flow_waits \
             WHERE processed = false AND resume_at <= $1 \
             ORDER BY resume_at ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_wait).collect())
    }

    pub async fn mark_wait_processed(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE flow_waits SET processed = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
