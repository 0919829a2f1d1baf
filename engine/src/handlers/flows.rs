use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::rules::TenantQuery;
use crate::error::{ApiResult, AppError};
use crate::flows::{Flow, FlowEdge, FlowNode, FlowRun, FlowRunEvent, FlowStatus, FlowVersion};
use crate::AppState;

pub fn flow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_flows).post(create_flow))
        .route("/:id", get(get_flow).put(update_flow).delete(archive_flow))
        .route("/:id/versions", post(save_version))
        .route("/:id/publish", post(publish_flow))
        .route("/:id/runs", get(list_runs).post(start_run))
        .route("/:id/sync", post(sync_flow))
}

pub fn run_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_run))
        .route("/:id/events", get(run_events))
        .route("/:id/cancel", post(cancel_run))
}

#[derive(Debug, Deserialize, Validate)]
pub struct FlowCreate {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FlowUpdate {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct VersionSave {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

#[derive(Debug, Deserialize)]
pub struct RunStart {
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct FlowDetail {
    pub flow: Flow,
    pub current_version: Option<FlowVersion>,
}

async fn list_flows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Vec<Flow>>> {
    let flows = state.flows.list_for_tenant(query.tenant_id).await?;
    Ok(Json(flows))
}

async fn create_flow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FlowCreate>,
) -> ApiResult<Json<Flow>> {
    payload.validate()?;

    let flow = Flow {
        id: Uuid::new_v4(),
        tenant_id: payload.tenant_id,
        name: payload.name,
        description: payload.description,
        status: FlowStatus::Draft,
        current_version_id: None,
        is_active: true,
        external_workflow_id: None,
        created_at: Utc::now(),
        updated_at: None,
    };

    state.flows.create_flow(&flow).await?;
    Ok(Json(flow))
}

async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FlowDetail>> {
    let flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    let current_version = match flow.current_version_id {
        Some(version_id) => state.flows.get_version(version_id).await?,
        None => None,
    };

    Ok(Json(FlowDetail { flow, current_version }))
}

async fn update_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FlowUpdate>,
) -> ApiResult<Json<Flow>> {
    payload.validate()?;

    let mut flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    if let Some(name) = payload.name {
        flow.name = name;
    }
    if let Some(description) = payload.description {
        flow.description = Some(description);
    }
    if let Some(is_active) = payload.is_active {
        flow.is_active = is_active;
    }

    state.flows.update_flow(&flow).await?;

    if let (Some(sync), Some(external_id)) = (&state.sync, &flow.external_workflow_id) {
        let sync = sync.clone();
        let external_id = external_id.clone();
        let active = flow.is_active;
        tokio::spawn(async move {
            sync.mirror_active(&external_id, active).await;
        });
    }

    Ok(Json(flow))
}

async fn archive_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    state.flows.archive_flow(id).await?;

    if let (Some(sync), Some(external_id)) = (&state.sync, flow.external_workflow_id) {
        let sync = sync.clone();
        tokio::spawn(async move {
            sync.mirror_active(&external_id, false).await;
        });
    }

    Ok(Json(json!({ "archived": true })))
}

/// Persist a new draft version. Versions are immutable snapshots; saving
/// always creates the next version number.
async fn save_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<VersionSave>,
) -> ApiResult<Json<FlowVersion>> {
    state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    let version = state.flows.save_draft_version(id, &payload.nodes, &payload.edges).await?;
    Ok(Json(version))
}

/// Publish the latest draft version, making it the flow's single current
/// version.
async fn publish_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    let version = state
        .flows
        .latest_version(id)
        .await?
        .ok_or_else(|| AppError::BadRequest("flow has no versions to publish".to_string()))?;

    state.flows.publish_version(id, version.id).await?;
    Ok(Json(json!({ "published_version_id": version.id, "version": version.version })))
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RunQuery>,
) -> ApiResult<Json<Vec<FlowRun>>> {
    let runs = state.flows.list_runs_for_flow(id, query.limit).await?;
    Ok(Json(runs))
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RunStart>,
) -> ApiResult<Json<Value>> {
    let flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;

    let run_id = state
        .engine
        .start_run(&flow, payload.input)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok(Json(json!({ "run_id": run_id })))
}

async fn sync_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let sync = state
        .sync
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("external orchestrator is not configured".to_string()))?;

    let flow = state
        .flows
        .get_flow(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow".to_string()))?;
    let version_id = flow
        .current_version_id
        .ok_or_else(|| AppError::BadRequest("flow has no published version".to_string()))?;
    let version = state
        .flows
        .get_version(version_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow version".to_string()))?;

    let external_id = sync.sync_flow(&flow, &version).await.map_err(|e| {
        AppError::ExternalServiceError {
            service: "orchestrator".to_string(),
            message: e.to_string(),
        }
    })?;

    Ok(Json(json!({ "external_workflow_id": external_id })))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FlowRun>> {
    let run = state
        .flows
        .get_run(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow run".to_string()))?;
    Ok(Json(run))
}

async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<FlowRunEvent>>> {
    let events = state.flows.list_run_events(id).await?;
    Ok(Json(events))
}

/// Best-effort cancellation: the persisted status changes, in-flight
/// external calls are not interrupted.
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state
        .flows
        .get_run(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flow run".to_string()))?;

    state
        .engine
        .cancel_run(id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(Json(json!({ "cancelled": true })))
}
