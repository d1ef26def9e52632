//! In-process publish/subscribe transport between channels and agent loops.
//!
//! The bus carries two independent streams, inbound and outbound. Each stream
//! has its own set of handlers; publishing awaits every handler registered at
//! the moment of the call, in registration order. A failing or panicking
//! handler is logged and skipped so the remaining handlers still see the
//! message.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error};

/// Channel name used for synthetic messages produced inside the process.
pub const SYSTEM_CHANNEL: &str = "system";

pub fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Message received from a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            timestamp: default_timestamp(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Build a synthetic message addressed back to an existing conversation.
    /// The origin is packed into `chat_id` as `channel:chat_id`.
    pub fn system(sender_id: &str, origin_channel: &str, origin_chat_id: &str, content: &str) -> Self {
        Self::new(
            SYSTEM_CHANNEL,
            sender_id,
            &format!("{origin_channel}:{origin_chat_id}"),
            content,
        )
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }

    pub fn is_system(&self) -> bool {
        self.channel == SYSTEM_CHANNEL
    }

    /// The (channel, chat_id) this message belongs to. System messages name
    /// their origin in `chat_id`; a bare id falls back to the `cli` channel.
    pub fn origin(&self) -> (String, String) {
        if !self.is_system() {
            return (self.channel.clone(), self.chat_id.clone());
        }
        match self.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => ("cli".to_string(), self.chat_id.clone()),
        }
    }

    /// Session key of the conversation this message should be applied to.
    pub fn routing_key(&self) -> String {
        let (channel, chat_id) = self.origin();
        format!("{channel}:{chat_id}")
    }
}

/// Message to send to a chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Response addressed to the conversation `inbound` came from.
    pub fn reply(inbound: &InboundMessage, content: &str) -> Self {
        let (channel, chat_id) = inbound.origin();
        let mut msg = Self::new(&channel, &chat_id, content);
        msg.metadata = inbound.metadata.clone();
        msg
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus is shut down")]
    Closed,
}

/// Receives messages published on one stream of the bus.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, msg: &T) -> Result<()>;
}

/// Forwards each message into a bounded queue. Publishing waits while the
/// queue is full.
pub struct QueueHandler<T> {
    tx: mpsc::Sender<T>,
}

impl<T> QueueHandler<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageHandler<T> for QueueHandler<T> {
    async fn handle(&self, msg: &T) -> Result<()> {
        self.tx
            .send(msg.clone())
            .await
            .map_err(|_| anyhow::anyhow!("queue receiver dropped"))
    }
}

pub type SubscriptionId = u64;

type HandlerList<T> = Vec<(SubscriptionId, Arc<dyn MessageHandler<T>>)>;

struct Stream<T> {
    name: &'static str,
    handlers: RwLock<HandlerList<T>>,
}

impl<T: Send + Sync + 'static> Stream<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: RwLock::new(Vec::new()),
        }
    }

    async fn deliver(&self, msg: &T) {
        // Snapshot so subscribe/unsubscribe never contend with a slow handler.
        let snapshot: HandlerList<T> = self.handlers.read().await.clone();
        if snapshot.is_empty() {
            debug!("No {} subscribers; message dropped", self.name);
            return;
        }
        for (id, handler) in snapshot {
            match AssertUnwindSafe(handler.handle(msg)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} subscriber {id} failed: {e:#}", self.name),
                Err(_) => error!("{} subscriber {id} panicked", self.name),
            }
        }
    }

    async fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }
}

/// Async message bus connecting channels to agent loops.
///
/// Construct one per process and share it via `Arc`. `shutdown` stops new
/// publishes, waits for in-flight deliveries, and drops every handler.
pub struct MessageBus {
    inbound: Stream<InboundMessage>,
    outbound: Stream<OutboundMessage>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Marks one publish in progress for the shutdown drain.
struct InFlight<'a>(&'a MessageBus);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl MessageBus {
    /// `capacity` bounds queues created by `inbound_queue`/`outbound_queue`.
    pub fn new(capacity: usize) -> Self {
        Self {
            inbound: Stream::new("inbound"),
            outbound: Stream::new("outbound"),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn enter(&self) -> Result<InFlight<'_>, BusError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(self);
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(guard)
    }

    fn allocate_id(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        let _in_flight = self.enter()?;
        self.inbound.deliver(&msg).await;
        Ok(())
    }

    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        let _in_flight = self.enter()?;
        self.outbound.deliver(&msg).await;
        Ok(())
    }

    pub async fn subscribe_inbound(
        &self,
        handler: Arc<dyn MessageHandler<InboundMessage>>,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.inbound.handlers.write().await.push((id, handler));
        id
    }

    pub async fn subscribe_outbound(
        &self,
        handler: Arc<dyn MessageHandler<OutboundMessage>>,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.outbound.handlers.write().await.push((id, handler));
        id
    }

    /// Remove a handler from whichever stream it was registered on.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inbound.remove(id).await || self.outbound.remove(id).await
    }

    /// Subscribe a bounded queue to the inbound stream.
    pub async fn inbound_queue(&self) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribe_inbound(Arc::new(QueueHandler::new(tx))).await;
        rx
    }

    /// Subscribe a bounded queue to the outbound stream.
    pub async fn outbound_queue(&self) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribe_outbound(Arc::new(QueueHandler::new(tx))).await;
        rx
    }

    pub async fn inbound_subscribers(&self) -> usize {
        self.inbound.handlers.read().await.len()
    }

    pub async fn outbound_subscribers(&self) -> usize {
        self.outbound.handlers.read().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reject further publishes, wait for in-flight ones, then drop all
    /// handlers so queue consumers observe end-of-stream.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let pending = self.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            debug!("Bus shutdown waiting on {pending} in-flight publish(es)");
            notified.await;
        }
        let dropped = self.inbound.handlers.write().await.drain(..).count()
            + self.outbound.handlers.write().await.drain(..).count();
        if dropped > 0 {
            debug!("Bus shutdown released {dropped} subscriber(s)");
        }
    }
}
