use std::time::Duration;

use thiserror::Error;

use crate::bus::BusError;
use crate::providers::ProviderError;
use crate::session::PersistenceError;
use crate::tools::ToolError;

/// Failure raised by a channel adapter while delivering an outbound message.
#[derive(Debug, Error)]
#[error("delivery to {channel}:{chat_id} failed: {reason}")]
pub struct ChannelDeliveryError {
    pub channel: String,
    pub chat_id: String,
    pub reason: String,
}

impl ChannelDeliveryError {
    pub fn new(channel: &str, chat_id: &str, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the agent orchestration layer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("invalid arguments for tool '{tool}': {reason}")]
    ArgumentValidation { tool: String, reason: String },

    #[error("tool '{tool}' failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("model refused the request: {0}")]
    ContentPolicy(String),

    #[error("context budget exceeded: {0}")]
    ContextBudgetExceeded(String),

    #[error("loop limit reached after {0} iterations without a final response")]
    IterationLimit(usize),

    #[error("subagent {id} timed out after {}s", .after.as_secs())]
    SubagentTimeout { id: String, after: Duration },

    #[error(transparent)]
    ChannelDelivery(#[from] ChannelDeliveryError),

    #[error("session persistence failed: {0}")]
    SessionPersistence(#[from] PersistenceError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("turn cancelled")]
    Cancelled,
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ContentPolicy(msg) => AgentError::ContentPolicy(msg),
            other => AgentError::Provider(other.to_string()),
        }
    }
}

impl From<ToolError> for AgentError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound(name) => AgentError::ToolNotFound(name),
            ToolError::InvalidArguments { tool, errors } => AgentError::ArgumentValidation {
                tool,
                reason: errors.join("; "),
            },
            ToolError::Execution { tool, cause } => AgentError::ToolExecution {
                tool,
                reason: format!("{cause:#}"),
            },
        }
    }
}

impl AgentError {
    /// Whether the turn ended because the model or its backend failed,
    /// as opposed to local bookkeeping. Retrying requires a fresh message.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, AgentError::Provider(_) | AgentError::ContentPolicy(_))
    }
}
