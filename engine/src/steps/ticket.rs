// Ticket lifecycle steps: create/update/assign/close
//
// These mutate the ticket store directly and are fail-hard: a missing
// required identifier or a store error aborts the whole run.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{StepContext, StepError, StepExecutor, StepKind, StepOutcome};
use crate::flows::model::FlowNode;
use crate::services::{NewTicket, TicketService};

pub struct TicketSteps {
    tickets: TicketService,
}

impl TicketSteps {
    pub fn new(tickets: TicketService) -> Self {
        Self { tickets }
    }

    fn required_uuid(config: &Value, ctx_value: Option<Uuid>, field: &str) -> Result<Uuid, StepError> {
        if let Some(raw) = config[field].as_str() {
            return raw
                .parse()
                .map_err(|_| StepError::Failed(format!("'{}' is not a valid id", field)));
        }
        ctx_value.ok_or_else(|| StepError::MissingField(field.to_string()))
    }
}

#[async_trait]
impl StepExecutor for TicketSteps {
    fn can_handle(&self, kind: &StepKind) -> bool {
        matches!(
            kind,
            StepKind::CreateTicket | StepKind::UpdateTicket | StepKind::AssignTicket | StepKind::CloseTicket
        )
    }

    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let config = ctx.render_config(&node.config);

        match node.kind {
            StepKind::CreateTicket => {
                let subject = config["subject"]
                    .as_str()
                    .ok_or_else(|| StepError::MissingField("subject".to_string()))?
                    .to_string();

                let ticket = self
                    .tickets
                    .create(NewTicket {
                        tenant_id: ctx.tenant_id,
                        customer_id: ctx.customer_id,
                        subject,
                        details: config["details"].as_str().map(String::from),
                        priority: config["priority"].as_str().unwrap_or("normal").to_string(),
                        channel: ctx.channel.clone(),
                    })
                    .await?;

                self.tickets
                    .append_timeline(ticket.id, "created", "Ticket created by automation", Some(&node.key))
                    .await?;

                ctx.ticket_id = Some(ticket.id);
                ctx.set_var("ticketId", json!(ticket.id.to_string()));
                Ok(StepOutcome::output(json!({ "ticket_id": ticket.id })))
            }

            StepKind::UpdateTicket => {
                let ticket_id = Self::required_uuid(&config, ctx.ticket_id, "ticket_id")?;
                let fields = config["fields"]
                    .as_object()
                    .ok_or_else(|| StepError::MissingField("fields".to_string()))?;

                let updates: Vec<(String, Value)> =
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                self.tickets.update_fields(ticket_id, &updates).await?;

                let summary = updates
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.tickets
                    .append_timeline(ticket_id, "field_update", &summary, Some(&node.key))
                    .await?;

                Ok(StepOutcome::output(json!({
                    "ticket_id": ticket_id,
                    "updated": updates.len()
                })))
            }

            StepKind::AssignTicket => {
                let ticket_id = Self::required_uuid(&config, ctx.ticket_id, "ticket_id")?;
                let agent_id: Uuid = config["agent_id"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StepError::MissingField("agent_id".to_string()))?;

                self.tickets.assign(ticket_id, agent_id).await?;
                self.tickets
                    .append_timeline(
                        ticket_id,
                        "assignment",
                        &format!("Assigned to {}", agent_id),
                        Some(&node.key),
                    )
                    .await?;

                Ok(StepOutcome::output(json!({
                    "ticket_id": ticket_id,
                    "assigned_to": agent_id
                })))
            }

            StepKind::CloseTicket => {
                let ticket_id = Self::required_uuid(&config, ctx.ticket_id, "ticket_id")?;
                self.tickets.close(ticket_id).await?;
                self.tickets
                    .append_timeline(ticket_id, "status_change", "Closed by automation", Some(&node.key))
                    .await?;

                Ok(StepOutcome::output(json!({ "ticket_id": ticket_id, "status": "closed" })))
            }

            _ => Err(StepError::NoExecutor(node.kind.as_str().to_string())),
        }
    }
}
