//! Line-oriented channel over stdin/stdout, used by `switchyard serve`.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use switchyard_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use switchyard_core::error::ChannelDeliveryError;

use crate::base::Channel;

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

pub struct ConsoleChannel {
    sender_id: String,
    chat_id: String,
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
    cancel: CancellationToken,
}

impl ConsoleChannel {
    pub const NAME: &'static str = "console";

    pub fn new(input: Input, output: Output) -> Self {
        Self {
            sender_id: "user".into(),
            chat_id: "local".into(),
            input: Mutex::new(Some(input)),
            output: Mutex::new(output),
            cancel: CancellationToken::new(),
        }
    }

    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn with_chat_id(mut self, chat_id: &str) -> Self {
        self.chat_id = chat_id.to_string();
        self
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        Self::NAME
    }

    /// Publish each non-empty input line until EOF or `stop`.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<()> {
        let Some(input) = self.input.lock().await.take() else {
            bail!("console channel already started");
        };
        info!("Console channel listening (chat {})", self.chat_id);
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("Console input closed");
                break;
            };
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            self.forward(
                &bus,
                InboundMessage::new(Self::NAME, &self.sender_id, &self.chat_id, text),
            )
            .await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelDeliveryError> {
        let mut out = self.output.lock().await;
        let text = format!("{}\n", msg.content.trim_end());
        let written = async {
            out.write_all(text.as_bytes()).await?;
            out.flush().await
        };
        written
            .await
            .map_err(|e| ChannelDeliveryError::new(Self::NAME, &msg.chat_id, e.to_string()))
    }

    fn is_allowed(&self, _sender_id: &str) -> bool {
        true
    }
}
