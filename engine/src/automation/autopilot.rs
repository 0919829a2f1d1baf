// Autopilot Guardrails - Tenant-level policy gating automatic customer-facing sends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Tenant autopilot mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotMode {
    Off,
    Assist,
    Auto,
}

impl AutopilotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Assist => "assist",
            Self::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "assist" => Self::Assist,
            "auto" => Self::Auto,
            _ => Self::Off,
        }
    }
}

/// Per-tenant policy for automatic sends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotPolicy {
    pub tenant_id: Uuid,
    pub mode: AutopilotMode,
    /// Channels automation may send on; `None` allows every channel
    pub allowed_channels: Option<Vec<String>>,
    /// Minimum AI confidence for an automatic send
    pub min_confidence: f64,
    /// Intents automation may act on; `None` allows every intent
    pub allowed_intents: Option<Vec<String>>,
    /// Cap on automatic sends per conversation per sliding window
    pub hourly_send_limit: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AutopilotPolicy {
    /// The policy applied when a tenant has never configured autopilot
    pub fn disabled(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            mode: AutopilotMode::Off,
            allowed_channels: None,
            min_confidence: 0.0,
            allowed_intents: None,
            hourly_send_limit: 0,
            updated_at: None,
        }
    }
}

/// Inputs for one guardrail check
#[derive(Debug, Clone)]
pub struct SendCheck {
    pub channel: String,
    pub confidence: Option<f64>,
    pub intent: Option<String>,
    /// Prior automatic sends for this conversation inside the window
    pub sends_in_window: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allowed,
    Blocked { reason: &'static str },
}

impl GuardrailDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Apply tenant autopilot policy to a pending channel send.
///
/// Checks run in order: mode, channel allow-list, confidence floor, intent
/// allow-list, sliding-window rate cap. The first violation wins.
pub fn check_send(policy: &AutopilotPolicy, check: &SendCheck) -> GuardrailDecision {
    if policy.mode == AutopilotMode::Off {
        return GuardrailDecision::Blocked { reason: "autopilot_off" };
    }

    if let Some(channels) = &policy.allowed_channels {
        if !channels.iter().any(|c| c.eq_ignore_ascii_case(&check.channel)) {
            return GuardrailDecision::Blocked { reason: "channel_not_allowed" };
        }
    }

    if policy.min_confidence > 0.0 {
        match check.confidence {
            Some(confidence) if confidence >= policy.min_confidence => {}
            _ => return GuardrailDecision::Blocked { reason: "low_confidence" },
        }
    }

    if let Some(intents) = &policy.allowed_intents {
        match &check.intent {
            Some(intent) if intents.iter().any(|i| i.eq_ignore_ascii_case(intent)) => {}
            _ => return GuardrailDecision::Blocked { reason: "intent_not_allowed" },
        }
    }

    if check.sends_in_window >= policy.hourly_send_limit {
        return GuardrailDecision::Blocked { reason: "rate_limited" };
    }

    GuardrailDecision::Allowed
}

/// Loads tenant autopilot policies
#[derive(Debug, Clone)]
pub struct AutopilotStore {
    pool: PgPool,
}

impl AutopilotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the tenant policy; tenants without one get autopilot off.
    pub async fn policy_for(&self, tenant_id: Uuid) -> Result<AutopilotPolicy, sqlx::Error> {
        let row: Option<(String, Option<Vec<String>>, f64, Option<Vec<String>>, i32, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT mode, allowed_channels, min_confidence, allowed_intents,
                       hourly_send_limit, updated_at
                FROM autopilot_policies
                WHERE tenant_id = $1
                "#,
            )
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some((mode, allowed_channels, min_confidence, allowed_intents, hourly_send_limit, updated_at)) => {
                AutopilotPolicy {
                    tenant_id,
                    mode: AutopilotMode::parse(&mode),
                    allowed_channels,
                    min_confidence,
                    allowed_intents,
                    hourly_send_limit: hourly_send_limit as i64,
                    updated_at,
                }
            }
            None => AutopilotPolicy::disabled(tenant_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AutopilotPolicy {
        AutopilotPolicy {
            tenant_id: Uuid::new_v4(),
            mode: AutopilotMode::Auto,
            allowed_channels: Some(vec!["chat".to_string(), "email".to_string()]),
            min_confidence: 0.8,
            allowed_intents: Some(vec!["question".to_string()]),
            hourly_send_limit: 5,
            updated_at: None,
        }
    }

    fn check() -> SendCheck {
        SendCheck {
            channel: "chat".to_string(),
            confidence: Some(0.9),
            intent: Some("question".to_string()),
            sends_in_window: 0,
        }
    }

    #[test]
    fn test_allowed_send() {
        assert_eq!(check_send(&policy(), &check()), GuardrailDecision::Allowed);
    }

    #[test]
    fn test_mode_off_blocks_everything() {
        let mut p = policy();
        p.mode = AutopilotMode::Off;
        assert_eq!(
            check_send(&p, &check()),
            GuardrailDecision::Blocked { reason: "autopilot_off" }
        );
    }

    #[test]
    fn test_channel_allow_list() {
        let mut c = check();
        c.channel = "sms".to_string();
        assert_eq!(
            check_send(&policy(), &c),
            GuardrailDecision::Blocked { reason: "channel_not_allowed" }
        );
    }

    #[test]
    fn test_confidence_floor() {
        let mut c = check();
        c.confidence = Some(0.5);
        assert_eq!(
            check_send(&policy(), &c),
            GuardrailDecision::Blocked { reason: "low_confidence" }
        );
        // Missing confidence cannot clear a configured floor
        c.confidence = None;
        assert_eq!(
            check_send(&policy(), &c),
            GuardrailDecision::Blocked { reason: "low_confidence" }
        );
    }

    #[test]
    fn test_intent_allow_list() {
        let mut c = check();
        c.intent = Some("complaint".to_string());
        assert_eq!(
            check_send(&policy(), &c),
            GuardrailDecision::Blocked { reason: "intent_not_allowed" }
        );
    }

    #[test]
    fn test_rate_limit_window() {
        let mut c = check();
        c.sends_in_window = 5;
        assert_eq!(
            check_send(&policy(), &c),
            GuardrailDecision::Blocked { reason: "rate_limited" }
        );
        c.sends_in_window = 4;
        assert_eq!(check_send(&policy(), &c), GuardrailDecision::Allowed);
    }

    #[test]
    fn test_unconfigured_lists_allow_anything() {
        let mut p = policy();
        p.allowed_channels = None;
        p.allowed_intents = None;
        let mut c = check();
        c.channel = "carrier-pigeon".to_string();
        c.intent = None;
        assert_eq!(check_send(&p, &c), GuardrailDecision::Allowed);
    }
}
