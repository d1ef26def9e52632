use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::subagent::SubagentManager;
use crate::tools::{Tool, ToolContext};

/// Tool for spawning background subagent tasks.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent to work on a task independently. The subagent \
         runs with its own conversation and reports back to this chat when it finishes. \
         Use it for work that can proceed while you keep talking with the user."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Detailed description of the task for the subagent to perform"
                },
                "label": {
                    "type": "string",
                    "description": "Short label for identifying this subagent (e.g. 'research-api')"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<String> {
        let task = params
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;
        let label = params
            .get("label")
            .and_then(|v| v.as_str())
            .filter(|l| !l.trim().is_empty());

        Ok(self.manager.spawn(task, label, &ctx.channel, &ctx.chat_id))
    }
}
