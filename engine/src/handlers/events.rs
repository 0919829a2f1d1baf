use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use beacon_shared::DomainEvent;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::rules::TenantQuery;
use crate::error::{ApiResult, AppError};
use crate::AppState;

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ingest", post(ingest_event))
}

pub fn orchestrator_routes() -> Router<Arc<AppState>> {
    Router::new().route("/import", post(import_workflows))
}

#[derive(Debug, Deserialize)]
pub struct EventIngest {
    pub event_type: String,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub data: Value,
    pub metadata: Option<Value>,
}

/// Publish a domain event onto the bus. The trigger matcher picks it up and
/// starts whatever rules and flows it matches.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EventIngest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if payload.event_type.trim().is_empty() {
        return Err(AppError::BadRequest("event_type must not be empty".to_string()));
    }

    let event = DomainEvent {
        event_type: payload.event_type,
        tenant_id: payload.tenant_id,
        user_id: payload.user_id,
        timestamp: Utc::now(),
        data: payload.data,
        metadata: payload.metadata,
    };

    let event_type = event.event_type.clone();
    state.bus.publish(event);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "event_type": event_type })),
    ))
}

/// Reverse sync: import external workflows that have no internal link yet
async fn import_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<Value>> {
    let sync = state
        .sync
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("external orchestrator is not configured".to_string()))?;

    let imported = sync.import_workflows(query.tenant_id).await.map_err(|e| {
        AppError::ExternalServiceError {
            service: "orchestrator".to_string(),
            message: e.to_string(),
        }
    })?;

    Ok(Json(json!({ "imported": imported })))
}
