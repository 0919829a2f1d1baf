// Legacy Rule-Action Runner - flat trigger/condition/action execution

use beacon_shared::DomainEvent;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::autopilot::{check_send, AutopilotStore, GuardrailDecision, SendCheck};
use super::rules::{Action, ActionKind, ExecutionStatus, OnError, Rule};
use super::store::{ExecutionStore, RuleStore};
use crate::automation::conditions::resolve_path;
use crate::events::{topics, EventBus};
use crate::services::{ConversationService, EmailService, NewTicket, TicketService};
use crate::steps::{render_config, StepError};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct RuleRunner {
    rules: RuleStore,
    executions: ExecutionStore,
    tickets: TicketService,
    conversations: ConversationService,
    email: Option<EmailService>,
    http: reqwest::Client,
    autopilot: AutopilotStore,
    bus: EventBus,
    autopilot_window_secs: i64,
}

impl RuleRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: RuleStore,
        executions: ExecutionStore,
        tickets: TicketService,
        conversations: ConversationService,
        email: Option<EmailService>,
        http: reqwest::Client,
        autopilot: AutopilotStore,
        bus: EventBus,
        autopilot_window_secs: i64,
    ) -> Self {
        Self {
            rules,
            executions,
            tickets,
            conversations,
            email,
            http,
            autopilot,
            bus,
            autopilot_window_secs,
        }
    }

    /// Run every enabled action of a rule, in list order, against the
    /// triggering payload. The default failure policy is continue-to-next;
    /// `stop` aborts the run; `retry` re-attempts with a fixed delay before
    /// giving up on the action.
    pub async fn run(&self, rule: &Rule, execution_id: Uuid, payload: &Value) -> Result<(), RunnerError> {
        self.executions.mark_running(execution_id).await?;
        info!("Executing rule '{}' ({} actions)", rule.name, rule.actions.len());

        let mut outputs: Vec<Value> = Vec::new();

        for action in rule.actions.iter().filter(|a| a.enabled) {
            match self.execute_with_policy(rule, action, payload).await {
                Ok(output) => {
                    outputs.push(json!({ "action": action.name, "output": output }));
                }
                Err(message) => {
                    warn!("Action '{}' of rule '{}' failed: {}", action.name, rule.name, message);
                    outputs.push(json!({ "action": action.name, "error": message }));

                    if action.on_error == OnError::Stop {
                        let error = format!("action '{}' failed: {}", action.name, message);
                        self.executions
                            .finish(
                                execution_id,
                                ExecutionStatus::Failed,
                                Some(&json!({ "actions": outputs })),
                                Some(&error),
                                None,
                            )
                            .await?;
                        self.rules.record_execution(rule.id).await?;
                        self.bus.publish(DomainEvent::new(
                            topics::RULE_FAILED,
                            rule.tenant_id,
                            json!({ "rule_id": rule.id, "execution_id": execution_id, "error": error }),
                        ));
                        return Ok(());
                    }
                    // Continue (and exhausted Retry) fall through to the next action
                }
            }
        }

        self.executions
            .finish(
                execution_id,
                ExecutionStatus::Completed,
                Some(&json!({ "actions": outputs })),
                None,
                None,
            )
            .await?;
        self.rules.record_execution(rule.id).await?;
        self.bus.publish(DomainEvent::new(
            topics::RULE_EXECUTED,
            rule.tenant_id,
            json!({ "rule_id": rule.id, "execution_id": execution_id }),
        ));

        Ok(())
    }

    /// Apply the action's retry policy around a single execution attempt
    async fn execute_with_policy(
        &self,
        rule: &Rule,
        action: &Action,
        payload: &Value,
    ) -> Result<Value, String> {
        let (max_retries, delay_seconds) = match &action.on_error {
            OnError::Retry { count, delay_seconds } => (*count, *delay_seconds),
            _ => (0, 0),
        };

        let mut attempt = 0;
        loop {
            match self.execute_action(rule, action, payload).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    if attempt < max_retries {
                        attempt += 1;
                        warn!(
                            "Action '{}' failed, retrying ({}/{})",
                            action.name, attempt, max_retries
                        );
                        tokio::time::sleep(Duration::from_secs(delay_seconds)).await;
                        continue;
                    }
                    return Err(e.to_string());
                }
            }
        }
    }

    async fn execute_action(
        &self,
        rule: &Rule,
        action: &Action,
        payload: &Value,
    ) -> Result<Value, StepError> {
        let config = render_config(&action.config, &|name| resolve_path(payload, name).cloned());

        match action.kind {
            ActionKind::AssignTicket => {
                let ticket_id = payload_uuid(payload, "ticket_id")
                    .ok_or_else(|| StepError::MissingField("ticket_id".to_string()))?;
                let agent_id = config_uuid(&config, &["agent_id", "agentId"])
                    .ok_or_else(|| StepError::MissingField("agent_id".to_string()))?;

                self.tickets.assign(ticket_id, agent_id).await?;
                self.tickets
                    .append_timeline(
                        ticket_id,
                        "assignment",
                        &format!("Assigned to {} by rule '{}'", agent_id, rule.name),
                        Some(&action.name),
                    )
                    .await?;
                Ok(json!({ "ticket_id": ticket_id, "assigned_to": agent_id }))
            }

            ActionKind::SendEmail => {
                let to = required_str(&config, "to")?;
                let subject = required_str(&config, "subject")?;
                let body = config["body"].as_str().unwrap_or_default();
                self.send_email(to, subject, body).await?;
                Ok(json!({ "sent_to": to, "subject": subject }))
            }

            ActionKind::SendTemplate => {
                let to = required_str(&config, "to")?;
                let template_id = required_str(&config, "template_id")?;
                let subject = config["subject"].as_str().unwrap_or(template_id);
                let body = config["body"].as_str().unwrap_or_default();
                self.send_email(to, subject, body).await?;
                Ok(json!({ "sent_to": to, "template_id": template_id }))
            }

            ActionKind::UpdateField => {
                let ticket_id = payload_uuid(payload, "ticket_id")
                    .ok_or_else(|| StepError::MissingField("ticket_id".to_string()))?;
                let field = required_str(&config, "field")?.to_string();
                let value = config.get("value").cloned().unwrap_or(Value::Null);

                self.tickets.update_fields(ticket_id, &[(field.clone(), value.clone())]).await?;
                Ok(json!({ "ticket_id": ticket_id, "field": field, "value": value }))
            }

            ActionKind::EscalateTicket => {
                let ticket_id = payload_uuid(payload, "ticket_id")
                    .ok_or_else(|| StepError::MissingField("ticket_id".to_string()))?;
                let to_agent_id = config_uuid(&config, &["to_agent_id", "toAgentId"])
                    .ok_or_else(|| StepError::MissingField("to_agent_id".to_string()))?;
                let reason = config["reason"].as_str().unwrap_or("Escalated by automation");

                self.tickets.escalate(ticket_id, to_agent_id).await?;
                self.tickets
                    .append_timeline(ticket_id, "escalation", reason, Some(&action.name))
                    .await?;
                Ok(json!({ "ticket_id": ticket_id, "escalated_to": to_agent_id }))
            }

            ActionKind::CreateTicket => {
                let subject = required_str(&config, "subject")?.to_string();
                let ticket = self
                    .tickets
                    .create(NewTicket {
                        tenant_id: rule.tenant_id,
                        customer_id: payload_uuid(payload, "customer_id"),
                        subject,
                        details: config["details"].as_str().map(String::from),
                        priority: config["priority"].as_str().unwrap_or("normal").to_string(),
                        channel: config["channel"].as_str().map(String::from),
                    })
                    .await?;
                Ok(json!({ "ticket_id": ticket.id }))
            }

            ActionKind::CloseTicket => {
                let ticket_id = payload_uuid(payload, "ticket_id")
                    .ok_or_else(|| StepError::MissingField("ticket_id".to_string()))?;
                self.tickets.close(ticket_id).await?;
                self.tickets
                    .append_timeline(ticket_id, "status_change", "Closed by automation", Some(&action.name))
                    .await?;
                Ok(json!({ "ticket_id": ticket_id, "status": "closed" }))
            }

            ActionKind::AddNote => {
                let ticket_id = payload_uuid(payload, "ticket_id")
                    .ok_or_else(|| StepError::MissingField("ticket_id".to_string()))?;
                let content = required_str(&config, "content")?;
                self.tickets
                    .append_timeline(ticket_id, "note", content, Some(&action.name))
                    .await?;
                Ok(json!({ "ticket_id": ticket_id }))
            }

            ActionKind::SendMessage => self.execute_send_message(rule, action, &config, payload).await,

            ActionKind::CallApi => {
                let url = required_str(&config, "url")?;
                let method = config["method"].as_str().unwrap_or("POST");
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
                Ok(json!({ "status_code": status }))
            }
        }
    }

    /// Channel-bound sends (everything except email) pass through the tenant
    /// autopilot guardrails first. A blocked send is an outcome, not an
    /// error: it records an `autopilot_blocked` timeline note and the action
    /// reports the block reason.
    async fn execute_send_message(
        &self,
        rule: &Rule,
        action: &Action,
        config: &Value,
        payload: &Value,
    ) -> Result<Value, StepError> {
        let channel = required_str(config, "channel")?.to_string();
        let content = required_str(config, "content")?.to_string();

        if !channel.eq_ignore_ascii_case("email") {
            let policy = self.autopilot.policy_for(rule.tenant_id).await?;

            let conversation_id = payload_uuid(payload, "conversation_id");
            let sends_in_window = match conversation_id {
                Some(id) => {
                    let since = Utc::now() - ChronoDuration::seconds(self.autopilot_window_secs);
                    self.conversations.automated_sends_since(id, since).await?
                }
                None => 0,
            };

            let check = SendCheck {
                channel: channel.clone(),
                confidence: payload_f64(payload, &["ai_confidence", "aiConfidence"]),
                intent: payload_str(payload, &["intent", "aiIntent"]),
                sends_in_window,
            };

            if let GuardrailDecision::Blocked { reason } = check_send(&policy, &check) {
                info!("Autopilot blocked send for rule '{}': {}", rule.name, reason);
                if let Some(ticket_id) = payload_uuid(payload, "ticket_id") {
                    self.tickets
                        .append_timeline(
                            ticket_id,
                            "autopilot_blocked",
                            &format!("Automatic {} send blocked: {}", channel, reason),
                            Some(&action.name),
                        )
                        .await?;
                }
                return Ok(json!({ "blocked": true, "reason": reason }));
            }
        }

        let conversation_id = match payload_uuid(payload, "conversation_id") {
            Some(id) => id,
            None => {
                let customer_id = payload_uuid(payload, "customer_id")
                    .ok_or_else(|| StepError::MissingField("customer_id".to_string()))?;
                self.conversations
                    .find_or_create(rule.tenant_id, customer_id, &channel)
                    .await?
                    .id
            }
        };

        let message = self
            .conversations
            .append_message(conversation_id, "system", &content, &channel, true, Some(&action.name))
            .await?;

        Ok(json!({
            "conversation_id": conversation_id,
            "message_id": message.id,
            "channel": channel
        }))
    }

    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), StepError> {
        let email = self
            .email
            .as_ref()
            .ok_or_else(|| StepError::Failed("email transport not configured".to_string()))?;
        email
            .send_email(to, None, subject, body)
            .await
            .map_err(|e| StepError::Failed(e.to_string()))
    }
}

fn required_str<'a>(config: &'a Value, field: &str) -> Result<&'a str, StepError> {
    config[field]
        .as_str()
        .ok_or_else(|| StepError::MissingField(field.to_string()))
}

fn payload_uuid(payload: &Value, field: &str) -> Option<Uuid> {
    payload.get(field).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

fn config_uuid(config: &Value, fields: &[&str]) -> Option<Uuid> {
    fields
        .iter()
        .find_map(|f| config.get(*f).and_then(|v| v.as_str()))
        .and_then(|s| s.parse().ok())
}

fn payload_f64(payload: &Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| payload.get(*f).and_then(|v| v.as_f64()))
}

fn payload_str(payload: &Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| payload.get(*f).and_then(|v| v.as_str()))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_helpers() {
        let id = Uuid::new_v4();
        let payload = json!({
            "ticket_id": id.to_string(),
            "aiConfidence": 0.7,
            "intent": "question"
        });

        assert_eq!(payload_uuid(&payload, "ticket_id"), Some(id));
        assert_eq!(payload_uuid(&payload, "missing"), None);
        assert_eq!(payload_f64(&payload, &["ai_confidence", "aiConfidence"]), Some(0.7));
        assert_eq!(payload_str(&payload, &["intent", "aiIntent"]).as_deref(), Some("question"));
    }

    #[test]
    fn test_config_uuid_accepts_both_key_styles() {
        let agent = Uuid::new_v4();
        let snake = json!({"agent_id": agent.to_string()});
        let camel = json!({"agentId": agent.to_string()});
        assert_eq!(config_uuid(&snake, &["agent_id", "agentId"]), Some(agent));
        assert_eq!(config_uuid(&camel, &["agent_id", "agentId"]), Some(agent));
    }
}
