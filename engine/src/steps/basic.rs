// Basic utility steps: start/end, waits, variables, HTTP calls, notifications

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::{StepContext, StepError, StepExecutor, StepKind, StepOutcome};
use crate::flows::model::FlowNode;
use crate::services::EmailService;

pub struct BasicSteps {
    http: reqwest::Client,
    email: Option<EmailService>,
}

impl BasicSteps {
    pub fn new(http: reqwest::Client, email: Option<EmailService>) -> Self {
        Self { http, email }
    }

    async fn execute_http_request(
        &self,
        config: &Value,
    ) -> Result<StepOutcome, StepError> {
        let url = config["url"]
            .as_str()
            .ok_or_else(|| StepError::MissingField("url".to_string()))?;
        let method = config["method"].as_str().unwrap_or("GET");
        let body = &config["body"];

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.http.get(url),
            "POST" => self.http.post(url),
            "PUT" => self.http.put(url),
            "DELETE" => self.http.delete(url),
            "PATCH" => self.http.patch(url),
            other => return Err(StepError::Failed(format!("unsupported HTTP method '{}'", other))),
        };

        if let Some(headers) = config["headers"].as_object() {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }

        if !body.is_null() {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(StepOutcome::output(json!({
            "status": status,
            "body": body
        })))
    }

    async fn execute_notification(
        &self,
        config: &Value,
    ) -> Result<StepOutcome, StepError> {
        let to = config["to"]
            .as_str()
            .ok_or_else(|| StepError::MissingField("to".to_string()))?;
        let subject = config["subject"].as_str().unwrap_or("Notification");
        let body = config["body"].as_str().unwrap_or_default();

        let email = self
            .email
            .as_ref()
            .ok_or_else(|| StepError::Failed("email transport not configured".to_string()))?;

        email
            .send_email(to, None, subject, body)
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;

        info!("Notification sent to {}", to);
        Ok(StepOutcome::output(json!({ "sent_to": to, "subject": subject })))
    }
}

#[async_trait]
impl StepExecutor for BasicSteps {
    fn can_handle(&self, kind: &StepKind) -> bool {
        matches!(
            kind,
            StepKind::Start
                | StepKind::ChannelIn
                | StepKind::End
                | StepKind::Wait
                | StepKind::SetVariable
                | StepKind::HttpRequest
                | StepKind::Notification
        )
    }

    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let config = ctx.render_config(&node.config);

        match node.kind {
            StepKind::Start | StepKind::ChannelIn => Ok(StepOutcome::output(ctx.input.clone())),

            // The run's output when traversal ends here; a configured
            // `output` wins, otherwise the engine substitutes the previous
            // node's result
            StepKind::End => Ok(StepOutcome::output(config.get("output").cloned().unwrap_or(Value::Null))),

            StepKind::Wait => {
                let resume_at = wait_resume_at(&config)?;
                Ok(StepOutcome::Suspend {
                    resume_at,
                    payload: config.clone(),
                })
            }

            StepKind::SetVariable => {
                let name = config["name"]
                    .as_str()
                    .ok_or_else(|| StepError::MissingField("name".to_string()))?;
                let value = config.get("value").cloned().unwrap_or(Value::Null);
                ctx.set_var(name, value.clone());
                Ok(StepOutcome::output(json!({ "name": name, "value": value })))
            }

            StepKind::HttpRequest => self.execute_http_request(&config).await,

            StepKind::Notification => self.execute_notification(&config).await,

            _ => Err(StepError::NoExecutor(node.kind.as_str().to_string())),
        }
    }
}

/// Resolve a wait node's resume instant: an explicit `resume_at` timestamp
/// wins over a relative `delay_seconds`.
fn wait_resume_at(config: &Value) -> Result<DateTime<Utc>, StepError> {
    if let Some(raw) = config["resume_at"].as_str() {
        return DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StepError::Failed(format!("invalid resume_at: {}", e)));
    }
    let delay = config["delay_seconds"].as_i64().unwrap_or(0).max(0);
    Ok(Utc::now() + Duration::seconds(delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn steps() -> BasicSteps {
        BasicSteps::new(reqwest::Client::new(), None)
    }

    fn ctx(input: Value) -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), input)
    }

    #[tokio::test]
    async fn test_start_echoes_input() {
        let mut ctx = ctx(json!({"priority": "high"}));
        let node = FlowNode::new("start", StepKind::Start, json!({}));
        match steps().execute(&node, &mut ctx).await.unwrap() {
            StepOutcome::Complete { output, path } => {
                assert_eq!(output["priority"], "high");
                assert!(path.is_none());
            }
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_set_variable_interpolates_and_stores() {
        let mut ctx = ctx(json!({"customer": {"name": "Ada"}}));
        let node = FlowNode::new(
            "setvar",
            StepKind::SetVariable,
            json!({"name": "greeting", "value": "Hi {{customer.name}}"}),
        );
        steps().execute(&node, &mut ctx).await.unwrap();
        assert_eq!(ctx.var_str("greeting").as_deref(), Some("Hi Ada"));
    }

    #[tokio::test]
    async fn test_set_variable_requires_name() {
        let mut ctx = ctx(json!({}));
        let node = FlowNode::new("setvar", StepKind::SetVariable, json!({"value": 1}));
        let err = steps().execute(&node, &mut ctx).await.unwrap_err();
        assert!(matches!(err, StepError::MissingField(f) if f == "name"));
    }

    #[tokio::test]
    async fn test_wait_suspends_with_delay() {
        let mut ctx = ctx(json!({}));
        let node = FlowNode::new("pause", StepKind::Wait, json!({"delay_seconds": 3600}));
        let before = Utc::now();
        match steps().execute(&node, &mut ctx).await.unwrap() {
            StepOutcome::Suspend { resume_at, .. } => {
                assert!(resume_at >= before + Duration::seconds(3599));
                assert!(resume_at <= before + Duration::seconds(3601));
            }
            _ => panic!("expected suspension"),
        }
    }

    #[tokio::test]
    async fn test_wait_explicit_resume_at_wins() {
        let mut ctx = ctx(json!({}));
        let node = FlowNode::new(
            "pause",
            StepKind::Wait,
            json!({"resume_at": "2030-01-01T00:00:00Z", "delay_seconds": 5}),
        );
        match steps().execute(&node, &mut ctx).await.unwrap() {
            StepOutcome::Suspend { resume_at, .. } => {
                assert_eq!(resume_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
            }
            _ => panic!("expected suspension"),
        }
    }

    #[tokio::test]
    async fn test_notification_without_transport_fails() {
        let mut ctx = ctx(json!({}));
        let node = FlowNode::new(
            "notify",
            StepKind::Notification,
            json!({"to": "ops@example.com", "subject": "s", "body": "b"}),
        );
        let err = steps().execute(&node, &mut ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Failed(_)));
    }
}
