// Segmentation, churn, journey and analytics collaborators

use async_trait::async_trait;
use beacon_shared::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::events::{topics, EventBus};

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator error: {0}")]
    Backend(String),
}

/// Churn risk assessment for a customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnAssessment {
    pub risk_score: f64,
    /// low | medium | high | critical
    pub risk_level: String,
    pub factors: Vec<String>,
}

#[async_trait]
pub trait ChurnService: Send + Sync {
    async fn assess_churn_risk(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<ChurnAssessment, InsightError>;

    /// Start a retention campaign for an at-risk customer; returns its id
    async fn create_retention_campaign(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        risk_level: &str,
    ) -> Result<String, InsightError>;
}

/// A customer's current journey position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneySnapshot {
    /// onboarding | active | at_risk | dormant | ...
    pub stage: String,
    pub touchpoints: Vec<Value>,
}

#[async_trait]
pub trait JourneyService: Send + Sync {
    async fn generate_customer_journey(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<JourneySnapshot, InsightError>;

    async fn generate_journey_optimization_recommendations(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<Value>, InsightError>;
}

/// Segment membership lookups against the platform's segment store
#[derive(Debug, Clone)]
pub struct SegmentService {
    pool: PgPool,
}

impl SegmentService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn is_member(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        segment_key: &str,
    ) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS( \
                 SELECT 1 FROM segment_members \
                 WHERE tenant_id = $1 AND customer_id = $2 AND segment_key = $3 \
             )",
        )
        .bind(tenant_id)
        .bind(customer_id)
        .bind(segment_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

/// Analytics event store + publisher
#[derive(Debug, Clone)]
pub struct AnalyticsService {
    pool: PgPool,
    bus: EventBus,
}

impl AnalyticsService {
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Record an analytics event and announce it on the bus
    pub async fn track(
        &self,
        tenant_id: Uuid,
        customer_id: Option<Uuid>,
        event_name: &str,
        properties: &Value,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO analytics_events
            (id, tenant_id, customer_id, event_name, properties, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(customer_id)
        .bind(event_name)
        .bind(properties)
        .execute(&self.pool)
        .await?;

        self.bus.publish(DomainEvent::new(
            topics::ANALYTICS_TRACKED,
            tenant_id,
            serde_json::json!({ "event_name": event_name, "event_id": id }),
        ));

        Ok(id)
    }
}
