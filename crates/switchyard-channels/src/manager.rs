//! Channel manager: coordinates the lifecycle of all registered channels
//! and routes outbound bus messages to the channel they name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use switchyard_core::bus::{MessageBus, MessageHandler, OutboundMessage, SubscriptionId, SYSTEM_CHANNEL};

use crate::base::Channel;

type ChannelMap = Arc<RwLock<HashMap<String, Arc<dyn Channel>>>>;

/// How long `stop_all` waits for a channel's receive task after `stop`.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Outbound subscriber that hands each message to its channel.
struct OutboundRouter {
    channels: ChannelMap,
}

#[async_trait]
impl MessageHandler<OutboundMessage> for OutboundRouter {
    async fn handle(&self, msg: &OutboundMessage) -> Result<()> {
        let channel = self.channels.read().await.get(&msg.channel).cloned();
        let Some(channel) = channel else {
            // CLI replies are read straight off the bus; system is internal.
            if msg.channel != "cli" && msg.channel != SYSTEM_CHANNEL {
                warn!("No channel registered for: {}", msg.channel);
            }
            return Ok(());
        };
        if let Err(e) = channel.send(msg).await {
            error!("Error sending to channel {}: {e}", msg.channel);
            return Err(e.into());
        }
        debug!("Delivered message to {}:{}", msg.channel, msg.chat_id);
        Ok(())
    }
}

/// Coordinates the lifecycle of all registered channels and delivers
/// outbound messages to the appropriate channel by name.
pub struct ChannelManager {
    channels: ChannelMap,
    subscription: Mutex<Option<SubscriptionId>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            subscription: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a channel. A channel with the same name is replaced.
    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!("Registered channel: {name}");
        if self.channels.write().await.insert(name.clone(), channel).is_some() {
            warn!("Channel {name} registered twice; keeping the newer one");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Names of all registered channels, sorted.
    pub async fn enabled_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Subscribe the outbound router on `bus`. Idempotent.
    pub async fn attach(&self, bus: &MessageBus) -> SubscriptionId {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = *subscription {
            return id;
        }
        let router = Arc::new(OutboundRouter {
            channels: self.channels.clone(),
        });
        let id = bus.subscribe_outbound(router).await;
        *subscription = Some(id);
        id
    }

    /// Route outbound messages and start every channel's receive task.
    pub async fn start_all(&self, bus: Arc<MessageBus>) {
        self.attach(&bus).await;

        let channels: Vec<(String, Arc<dyn Channel>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(name, ch)| (name.clone(), ch.clone()))
            .collect();
        if channels.is_empty() {
            warn!("No channels enabled");
        }

        let mut tasks = self.tasks.lock().await;
        for (name, channel) in channels {
            info!("Starting channel: {name}");
            let bus = bus.clone();
            let task_name = name.clone();
            tasks.push((
                name,
                tokio::spawn(async move {
                    if let Err(e) = channel.start(bus).await {
                        error!("Channel {task_name} failed: {e:#}");
                    }
                }),
            ));
        }
    }

    /// Detach from the bus, stop every channel and wait for their tasks.
    pub async fn stop_all(&self, bus: &MessageBus) {
        if let Some(id) = self.subscription.lock().await.take() {
            bus.unsubscribe(id).await;
            info!("Stopped outbound routing");
        }

        let channels: Vec<(String, Arc<dyn Channel>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(name, ch)| (name.clone(), ch.clone()))
            .collect();
        for (name, channel) in channels {
            info!("Stopping channel: {name}");
            if let Err(e) = channel.stop().await {
                warn!("Error stopping channel {name}: {e:#}");
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, handle) in tasks {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Channel {name} did not stop in time; aborting");
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use switchyard_core::bus::InboundMessage;
    use switchyard_core::error::ChannelDeliveryError;
    use tokio::sync::Notify;

    struct MockChannel {
        name: String,
        fail_sends: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        sent: std::sync::Mutex<Vec<String>>,
        stopped: Notify,
    }

    impl MockChannel {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_sends: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                sent: std::sync::Mutex::new(Vec::new()),
                stopped: Notify::new(),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, bus: Arc<MessageBus>) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.forward(&bus, InboundMessage::new(&self.name, "alice", "1", "hi"))
                .await;
            self.stopped.notified().await;
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.notify_one();
            Ok(())
        }

        async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelDeliveryError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ChannelDeliveryError::new(&msg.channel, &msg.chat_id, "rate limited"));
            }
            self.sent.lock().unwrap().push(msg.content.clone());
            Ok(())
        }

        fn is_allowed(&self, sender_id: &str) -> bool {
            sender_id != "mallory"
        }
    }

    #[tokio::test]
    async fn routes_outbound_by_channel_name() {
        let bus = Arc::new(MessageBus::new(16));
        let manager = ChannelManager::new();
        let telegram = Arc::new(MockChannel::new("telegram"));
        let discord = Arc::new(MockChannel::new("discord"));
        manager.register(telegram.clone()).await;
        manager.register(discord.clone()).await;
        manager.attach(&bus).await;

        bus.publish_outbound(OutboundMessage::new("telegram", "1", "hello"))
            .await
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("slack", "1", "nobody home"))
            .await
            .unwrap();

        assert_eq!(telegram.sent(), vec!["hello".to_string()]);
        assert!(discord.sent().is_empty());
        assert_eq!(manager.enabled_channels().await, vec!["discord", "telegram"]);
    }

    #[tokio::test]
    async fn delivery_failure_does_not_block_other_subscribers() {
        let bus = Arc::new(MessageBus::new(16));
        let manager = ChannelManager::new();
        let flaky = Arc::new(MockChannel::new("telegram"));
        flaky.fail_sends.store(true, Ordering::SeqCst);
        manager.register(flaky.clone()).await;
        manager.attach(&bus).await;
        let mut tap = bus.outbound_queue().await;

        bus.publish_outbound(OutboundMessage::new("telegram", "1", "lost"))
            .await
            .unwrap();
        assert_eq!(tap.recv().await.unwrap().content, "lost");
        assert!(flaky.sent().is_empty());

        flaky.fail_sends.store(false, Ordering::SeqCst);
        bus.publish_outbound(OutboundMessage::new("telegram", "1", "delivered"))
            .await
            .unwrap();
        assert_eq!(flaky.sent(), vec!["delivered".to_string()]);
    }

    #[tokio::test]
    async fn start_forwards_inbound_and_stop_detaches() {
        let bus = Arc::new(MessageBus::new(16));
        let mut inbound = bus.inbound_queue().await;
        let manager = ChannelManager::new();
        let ch = Arc::new(MockChannel::new("telegram"));
        manager.register(ch.clone()).await;

        manager.start_all(bus.clone()).await;
        let first = inbound.recv().await.unwrap();
        assert_eq!(first.session_key(), "telegram:1");
        assert_eq!(ch.starts.load(Ordering::SeqCst), 1);
        assert_eq!(bus.outbound_subscribers().await, 1);

        manager.stop_all(&bus).await;
        assert_eq!(ch.stops.load(Ordering::SeqCst), 1);
        assert_eq!(bus.outbound_subscribers().await, 0);
    }

    #[tokio::test]
    async fn disallowed_senders_are_not_forwarded() {
        let bus = MessageBus::new(4);
        let mut inbound = bus.inbound_queue().await;
        let ch = MockChannel::new("telegram");

        assert!(!ch.forward(&bus, InboundMessage::new("telegram", "mallory", "1", "x")).await);
        assert!(ch.forward(&bus, InboundMessage::new("telegram", "alice", "1", "y")).await);
        assert_eq!(inbound.recv().await.unwrap().content, "y");
    }
}
