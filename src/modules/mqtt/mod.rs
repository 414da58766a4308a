//! Message transport
//!
//! A [`Transport`] subscribes to a topic filter and feeds raw messages into a
//! bounded queue owned by the returned [`Subscription`]. Connection upkeep
//! (reconnects, backoff) is the transport's own business.

mod mqtt_client;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::Result;
use crate::features::ingestion::models::InboundMessage;

pub use mqtt_client::MqttTransport;

#[async_trait]
pub trait Transport: Sized + Send + 'static {
    /// Start delivering messages matching `topic_filter` until `shutdown` fires
    async fn subscribe(
        self,
        topic_filter: &str,
        shutdown: CancellationToken,
    ) -> Result<Subscription>;
}

/// Live subscription: the message queue plus the task feeding it
pub struct Subscription {
    messages: mpsc::Receiver<InboundMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(messages: mpsc::Receiver<InboundMessage>, task: JoinHandle<()>) -> Self {
        Self { messages, task }
    }

    /// Next message, or `None` once the transport has stopped
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.messages.recv().await
    }

    /// Stop reading and wait for the transport task to finish
    ///
    /// Messages still queued at this point are dropped and counted.
    pub async fn close(mut self) -> usize {
        self.messages.close();
        let mut discarded = 0;
        while self.messages.try_recv().is_ok() {
            discarded += 1;
        }
        if let Err(e) = self.task.await {
            tracing::error!("Transport task ended abnormally: {}", e);
        }
        discarded
    }
}
