use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use switchyard_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use switchyard_core::error::ChannelDeliveryError;

/// Trait that all chat channel implementations must satisfy.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "console"). Outbound messages are
    /// routed by this name.
    fn name(&self) -> &str;

    /// Start receiving platform messages and publish them on `bus`. May run
    /// until [`stop`](Self::stop) is called.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<()>;

    /// Stop the channel and clean up resources.
    async fn stop(&self) -> Result<()>;

    /// Deliver one message to the platform.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelDeliveryError>;

    /// Check if a sender is allowed to use this bot.
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Publish a received message on the bus if its sender is allowed.
    /// Returns whether the message was forwarded.
    async fn forward(&self, bus: &MessageBus, msg: InboundMessage) -> bool {
        if !self.is_allowed(&msg.sender_id) {
            warn!(
                "Access denied for sender {} on channel {}",
                msg.sender_id,
                self.name()
            );
            return false;
        }
        match bus.publish_inbound(msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Channel {} dropped a message: {e}", self.name());
                false
            }
        }
    }
}

/// Allow-list check shared by channels. An empty list allows everyone;
/// composite ids like `123|alice` match on any part.
pub fn is_sender_allowed(allow_from: &[String], sender_id: &str) -> bool {
    if allow_from.is_empty() || allow_from.iter().any(|a| a == sender_id) {
        return true;
    }
    sender_id
        .split('|')
        .filter(|part| !part.is_empty())
        .any(|part| allow_from.iter().any(|a| a == part))
}
