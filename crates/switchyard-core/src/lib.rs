pub mod agent;
pub mod bus;
pub mod error;
pub mod providers;
pub mod session;
pub mod tools;

// Re-export key types
pub use agent::{AgentLoop, AgentSettings, SubagentManager};
pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use error::{AgentError, ChannelDeliveryError};
pub use providers::{LLMProvider, LLMResponse};
pub use session::{Message, Session, SessionManager};
pub use tools::{Tool, ToolContext, ToolRegistry};
