use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::config::ThrottleConfig;
use crate::features::ingestion::models::{InboundMessage, IngestedRecord};
use crate::features::ingestion::services::{
    decode, CommitStrategy, RateGate, ThrottleKeyExtractor,
};
use crate::modules::mqtt::Subscription;
use crate::modules::sink::RecordSink;

/// Terminal state of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Persisted,
    DroppedMalformed,
    DroppedThrottled,
    PersistFailed,
}

#[derive(Debug, Default)]
struct PipelineStats {
    received: AtomicU64,
    persisted: AtomicU64,
    throttled: AtomicU64,
    malformed: AtomicU64,
    persist_failed: AtomicU64,
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub throttled: u64,
    pub malformed: u64,
    pub persist_failed: u64,
}

impl PipelineStats {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Persisted => &self.persisted,
            Outcome::DroppedMalformed => &self.malformed,
            Outcome::DroppedThrottled => &self.throttled,
            Outcome::PersistFailed => &self.persist_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            persist_failed: self.persist_failed.load(Ordering::Relaxed),
        }
    }
}

/// A message that passed the gate and is waiting to be written
struct PendingWrite {
    key: String,
    accepted_at_ms: i64,
    record: IngestedRecord,
}

/// Decode, gate and persist inbound messages
///
/// Decoding and the gate decision run synchronously in arrival order, so
/// decisions for one key are never reordered. Only the sink write is spawned,
/// which lets writes for many messages overlap while intake keeps going.
pub struct IngestionPipeline<S: RecordSink> {
    sink: Arc<S>,
    gate: Arc<RateGate>,
    keys: Arc<dyn ThrottleKeyExtractor>,
    commit_strategy: CommitStrategy,
    stats: Arc<PipelineStats>,
    writes: TaskTracker,
}

impl<S: RecordSink> IngestionPipeline<S> {
    pub fn new(sink: Arc<S>, config: &ThrottleConfig) -> Self {
        Self {
            sink,
            gate: Arc::new(RateGate::new(config.min_interval, config.max_keys)),
            keys: Arc::new(config.key_strategy.clone()),
            commit_strategy: config.commit_strategy,
            stats: Arc::new(PipelineStats::default()),
            writes: TaskTracker::new(),
        }
    }

    /// Replace the configured key derivation
    #[allow(dead_code)]
    pub fn with_key_extractor(mut self, keys: Arc<dyn ThrottleKeyExtractor>) -> Self {
        self.keys = keys;
        self
    }

    pub fn gate(&self) -> &RateGate {
        &self.gate
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Writes dispatched but not yet settled
    pub fn in_flight(&self) -> usize {
        self.writes.len()
    }

    /// Consume the subscription until it ends or `shutdown` fires
    pub async fn run(&self, subscription: &mut Subscription, shutdown: &CancellationToken) {
        info!(
            "Ingestion pipeline running (commit strategy: {}, throttling {})",
            self.commit_strategy,
            if self.gate.is_disabled() { "disabled" } else { "enabled" }
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Ingestion pipeline stopping intake");
                    break;
                }
                message = subscription.recv() => match message {
                    Some(message) => self.dispatch(message, Utc::now()),
                    None => {
                        warn!("Transport closed its message stream");
                        break;
                    }
                },
            }
        }
    }

    /// Gate `message` now and hand any resulting write to a background task
    pub fn dispatch(&self, message: InboundMessage, now: DateTime<Utc>) {
        let Ok(pending) = self.admit(message, now) else {
            return;
        };

        let sink = Arc::clone(&self.sink);
        let gate = Arc::clone(&self.gate);
        let stats = Arc::clone(&self.stats);
        let strategy = self.commit_strategy;
        self.writes.spawn(async move {
            write(sink.as_ref(), &gate, &stats, strategy, pending).await;
        });
    }

    /// Run one message through every step, waiting for the write
    #[allow(dead_code)]
    pub async fn process(&self, message: InboundMessage, now: DateTime<Utc>) -> Outcome {
        match self.admit(message, now) {
            Ok(pending) => {
                write(
                    self.sink.as_ref(),
                    &self.gate,
                    &self.stats,
                    self.commit_strategy,
                    pending,
                )
                .await
            }
            Err(outcome) => outcome,
        }
    }

    /// Stop accepting writes and wait up to `grace` for dispatched ones
    ///
    /// Returns the number of writes still outstanding at the deadline.
    pub async fn drain(&self, grace: Duration) -> usize {
        self.writes.close();
        if self.writes.is_empty() {
            return 0;
        }

        info!(
            "Waiting up to {:?} for {} in-flight writes",
            grace,
            self.writes.len()
        );
        match tokio::time::timeout(grace, self.writes.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let outstanding = self.writes.len();
                error!(
                    "{} writes still in flight after {:?} grace period",
                    outstanding, grace
                );
                outstanding
            }
        }
    }

    /// Decode, derive the key and consult the gate
    ///
    /// A dropped message comes back as its outcome, already logged and counted.
    fn admit(
        &self,
        message: InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<PendingWrite, Outcome> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let InboundMessage { topic, payload } = message;

        let payload = match decode(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    topic = %topic,
                    excerpt = %e.excerpt,
                    "Dropping malformed message: {}",
                    e.reason
                );
                self.stats.record(Outcome::DroppedMalformed);
                return Err(Outcome::DroppedMalformed);
            }
        };

        let key = self.keys.key(&topic, &payload);
        let now_ms = now.timestamp_millis();

        let accepted = match self.commit_strategy {
            CommitStrategy::BeforeWrite => self.gate.admit(&key, now_ms),
            CommitStrategy::AfterWrite => self.gate.reserve(&key, now_ms),
        };
        if !accepted {
            debug!(topic = %topic, key = %key, "Message throttled");
            self.stats.record(Outcome::DroppedThrottled);
            return Err(Outcome::DroppedThrottled);
        }

        Ok(PendingWrite {
            key,
            accepted_at_ms: now_ms,
            record: IngestedRecord::new(topic, payload, now),
        })
    }
}

/// Issue the sink write for an accepted message and settle the gate
async fn write<S: RecordSink>(
    sink: &S,
    gate: &RateGate,
    stats: &PipelineStats,
    strategy: CommitStrategy,
    pending: PendingWrite,
) -> Outcome {
    let mut guard = WriteGuard::new(&pending.record.topic);
    let result = sink.insert(&pending.record).await;
    guard.settled();

    if strategy == CommitStrategy::AfterWrite {
        gate.settle(&pending.key, pending.accepted_at_ms, result.is_ok());
    }

    let outcome = match result {
        Ok(()) => {
            info!(
                topic = %pending.record.topic,
                record_id = %pending.record.id,
                "Record persisted"
            );
            Outcome::Persisted
        }
        Err(e) => {
            error!(
                topic = %pending.record.topic,
                record_id = %pending.record.id,
                "Failed to persist record: {}",
                e
            );
            Outcome::PersistFailed
        }
    };
    stats.record(outcome);
    outcome
}

/// Logs a write that was dropped before the sink answered
struct WriteGuard<'a> {
    topic: &'a str,
    settled: bool,
}

impl<'a> WriteGuard<'a> {
    fn new(topic: &'a str) -> Self {
        Self {
            topic,
            settled: false,
        }
    }

    fn settled(&mut self) {
        self.settled = true;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(topic = %self.topic, "Persistence write abandoned before completion");
        }
    }
}
