use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::{MessageBus, OutboundMessage};
use crate::tools::{Tool, ToolContext};

/// Tool that lets the agent push a message to a chat without ending its turn.
pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Defaults to the current conversation; \
         pass channel and chat_id to reach a different one."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The message content to send"
                },
                "channel": {
                    "type": "string",
                    "description": "Optional: target channel (telegram, slack, cli, ...)"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Optional: target chat or user ID"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;
        let channel = params
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.channel);
        let chat_id = params
            .get("chat_id")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.chat_id);

        self.bus
            .publish_outbound(OutboundMessage::new(channel, chat_id, content))
            .await?;
        Ok(format!("Message sent to {channel}:{chat_id}"))
    }
}
