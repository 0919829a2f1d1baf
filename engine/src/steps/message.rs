// Send-message step
//
// Resolves (or creates) the customer's conversation on the configured
// channel, interpolates content and persists the message tagged as coming
// from a workflow. Like the ticket steps this is fail-hard.

use async_trait::async_trait;
use serde_json::json;

use super::{StepContext, StepError, StepExecutor, StepKind, StepOutcome};
use crate::flows::model::FlowNode;
use crate::services::ConversationService;

pub struct MessageSteps {
    conversations: ConversationService,
}

impl MessageSteps {
    pub fn new(conversations: ConversationService) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl StepExecutor for MessageSteps {
    fn can_handle(&self, kind: &StepKind) -> bool {
        matches!(kind, StepKind::SendMessage)
    }

    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let config = ctx.render_config(&node.config);

        let content = config["content"]
            .as_str()
            .ok_or_else(|| StepError::MissingField("content".to_string()))?;
        let channel = config["channel"]
            .as_str()
            .map(String::from)
            .or_else(|| ctx.channel.clone())
            .ok_or_else(|| StepError::MissingField("channel".to_string()))?;

        let conversation_id = match ctx.conversation_id {
            Some(id) => id,
            None => {
                let customer_id = ctx
                    .customer_id
                    .ok_or_else(|| StepError::MissingField("customer_id".to_string()))?;
                let conversation = self
                    .conversations
                    .find_or_create(ctx.tenant_id, customer_id, &channel)
                    .await?;
                ctx.conversation_id = Some(conversation.id);
                conversation.id
            }
        };

        let message = self
            .conversations
            .append_message(conversation_id, "system", content, &channel, true, Some(&node.key))
            .await?;

        Ok(StepOutcome::output(json!({
            "conversation_id": conversation_id,
            "message_id": message.id,
            "channel": channel
        })))
    }
}
