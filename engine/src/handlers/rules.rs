use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::automation::{Action, ConditionNode, Execution, Rule, Trigger};
use crate::error::{ApiResult, AppError};
use crate::AppState;

pub fn rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route("/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/:id/execute", post(execute_rule))
        .route("/:id/executions", get(list_rule_executions))
        .route("/:id/sync", post(sync_rule))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_execution))
        .route("/:id/retry", post(retry_execution))
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RuleCreate {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub conditions: Option<ConditionNode>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
pub struct RuleUpdate {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub conditions: Option<ConditionNode>,
    pub triggers: Option<Vec<Trigger>>,
    pub actions: Option<Vec<Action>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Vec<Rule>>> {
    let rules = state.rules.list_for_tenant(query.tenant_id).await?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RuleCreate>,
) -> ApiResult<Json<Rule>> {
    payload.validate()?;

    let rule = Rule {
        id: Uuid::new_v4(),
        tenant_id: payload.tenant_id,
        name: payload.name,
        description: payload.description,
        priority: payload.priority,
        is_active: payload.is_active,
        conditions: payload.conditions,
        triggers: payload.triggers,
        actions: payload.actions,
        tags: payload.tags,
        external_workflow_id: None,
        imported: false,
        execution_count: 0,
        last_executed_at: None,
        created_at: Utc::now(),
        updated_at: None,
    };

    state.rules.create(&rule).await?;
    Ok(Json(rule))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Rule>> {
    let rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RuleUpdate>,
) -> ApiResult<Json<Rule>> {
    payload.validate()?;

    let mut rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;

    if let Some(name) = payload.name {
        rule.name = name;
    }
    if let Some(description) = payload.description {
        rule.description = Some(description);
    }
    if let Some(priority) = payload.priority {
        rule.priority = priority;
    }
    if let Some(is_active) = payload.is_active {
        rule.is_active = is_active;
    }
    if payload.conditions.is_some() {
        rule.conditions = payload.conditions;
    }
    if let Some(triggers) = payload.triggers {
        rule.triggers = triggers;
    }
    if let Some(actions) = payload.actions {
        rule.actions = actions;
    }
    if let Some(tags) = payload.tags {
        rule.tags = tags;
    }

    state.rules.update(&rule).await?;

    // Mirror the active flag to the external orchestrator when linked
    if let (Some(sync), Some(external_id)) = (&state.sync, &rule.external_workflow_id) {
        let sync = sync.clone();
        let external_id = external_id.clone();
        let active = rule.is_active;
        tokio::spawn(async move {
            sync.mirror_active(&external_id, active).await;
        });
    }

    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;

    let deleted = state.rules.delete(id).await?;

    // Best-effort external cleanup once the internal record is gone
    if deleted {
        if let (Some(sync), Some(external_id)) = (&state.sync, rule.external_workflow_id) {
            let sync = sync.clone();
            tokio::spawn(async move {
                sync.delete_external(&external_id).await;
            });
        }
    }

    Ok(Json(json!({ "deleted": deleted, "deactivated": !deleted })))
}

#[derive(Debug, Deserialize)]
pub struct ManualExecute {
    #[serde(default)]
    pub input: Value,
}

/// Fire a rule by hand against the given payload, bypassing trigger and
/// condition matching.
async fn execute_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ManualExecute>,
) -> ApiResult<Json<Value>> {
    let rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;

    let execution_id = state
        .executions
        .create(rule.id, rule.tenant_id, "manual", &payload.input, Some("manual"), None, None)
        .await?;

    let runner = state.runner.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.run(&rule, execution_id, &payload.input).await {
            tracing::error!("Manual execution {} failed to persist: {}", execution_id, e);
        }
    });

    Ok(Json(json!({ "execution_id": execution_id })))
}

async fn list_rule_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<Json<Vec<Execution>>> {
    let executions = state.executions.list_for_rule(id, query.limit).await?;
    Ok(Json(executions))
}

async fn sync_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let sync = state
        .sync
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("external orchestrator is not configured".to_string()))?;

    let rule = state
        .rules
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;

    let external_id = sync.sync_rule(&rule).await.map_err(|e| AppError::ExternalServiceError {
        service: "orchestrator".to_string(),
        message: e.to_string(),
    })?;

    Ok(Json(json!({ "external_workflow_id": external_id })))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .executions
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Execution".to_string()))?;
    Ok(Json(execution))
}

/// Retry re-triggers the external workflow through a brand-new execution row
/// referencing the original; the original record is never mutated.
async fn retry_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let monitor = state
        .monitor
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("external orchestrator is not configured".to_string()))?
        .clone();

    let original = state
        .executions
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Execution".to_string()))?;
    let rule = state
        .rules
        .get(original.rule_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Rule".to_string()))?;

    if !original.status.is_terminal() {
        return Err(AppError::Conflict("execution is still in progress".to_string()));
    }

    tokio::spawn(async move {
        if let Err(e) = monitor.retry(&rule, &original).await {
            tracing::error!("Retry of execution {} failed: {}", original.id, e);
        }
    });

    Ok(Json(json!({ "retry_of": id, "status": "retry_started" })))
}
