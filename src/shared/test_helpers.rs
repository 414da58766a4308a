#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(test)]
use parking_lot::Mutex;
#[cfg(test)]
use tokio::sync::mpsc;
#[cfg(test)]
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use crate::core::error::{AppError, Result};
#[cfg(test)]
use crate::features::ingestion::models::{InboundMessage, IngestedRecord};
#[cfg(test)]
use crate::modules::mqtt::{Subscription, Transport};
#[cfg(test)]
use crate::modules::sink::RecordSink;

/// Fixed instant `secs` seconds after 2024-01-01T00:00:00Z
#[cfg(test)]
pub fn at_secs(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// In-memory sink that can be told to fail or to answer slowly
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<IngestedRecord>>,
    failing: AtomicBool,
    closed: AtomicBool,
    insert_calls: AtomicUsize,
    delay: Option<Duration>,
    hang_on_close: bool,
}

#[cfg(test)]
#[allow(dead_code)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.set_failing(true);
        sink
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Sink whose `close` never completes
    pub fn hanging_close() -> Self {
        Self {
            hang_on_close: true,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<IngestedRecord> {
        self.records.lock().clone()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl RecordSink for MemorySink {
    async fn insert(&self, record: &IngestedRecord) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Sink("connection reset by peer".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Transport that replays a fixed list of messages
#[cfg(test)]
pub struct ScriptedTransport {
    messages: Vec<InboundMessage>,
    finish_after_script: bool,
    subscribed: Arc<AtomicBool>,
}

#[cfg(test)]
#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(messages: Vec<InboundMessage>) -> Self {
        Self {
            messages,
            finish_after_script: false,
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Close the stream once the script is delivered instead of idling until shutdown
    pub fn finish_after_script(mut self) -> Self {
        self.finish_after_script = true;
        self
    }

    /// Flag flipped when `subscribe` is called
    pub fn subscribed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.subscribed)
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for ScriptedTransport {
    async fn subscribe(
        self,
        _topic_filter: &str,
        shutdown: CancellationToken,
    ) -> Result<Subscription> {
        self.subscribed.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.messages.len().max(1));
        let messages = self.messages;
        let finish = self.finish_after_script;
        let task = tokio::spawn(async move {
            for message in messages {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            if !finish {
                shutdown.cancelled().await;
            }
        });

        Ok(Subscription::new(rx, task))
    }
}
