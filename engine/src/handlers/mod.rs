// Admin API handlers for rules, flows, runs and event ingest

pub mod events;
pub mod flows;
pub mod rules;

use axum::response::Json;
use serde_json::{json, Value};

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "beacon-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
