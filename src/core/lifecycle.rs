//! Startup ordering and graceful shutdown
//!
//! The sink must be connected before the transport subscribes; a sink that
//! cannot be reached at boot aborts startup before any subscription is made.
//! On shutdown intake stops first, dispatched writes get a bounded grace
//! period, and only then is the sink closed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::ThrottleConfig;
use crate::core::error::{AppError, Result};
use crate::features::ingestion::{IngestionPipeline, PipelineStatsSnapshot};
use crate::modules::mqtt::Transport;
use crate::modules::sink::RecordSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
    grace: Duration,
}

impl Lifecycle {
    pub fn new(grace: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            state,
            shutdown: CancellationToken::new(),
            grace,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    #[allow(dead_code)]
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Token that starts the shutdown sequence when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drive the bridge from startup to a clean stop
    ///
    /// Returns the final pipeline counters. Errors are returned for startup
    /// failures and for a message stream that ends without a shutdown request;
    /// in the latter case the bridge still drains and closes the sink first.
    pub async fn run<S, C, T>(
        &self,
        connect_sink: C,
        transport: T,
        topic_filter: &str,
        throttle: &ThrottleConfig,
    ) -> Result<PipelineStatsSnapshot>
    where
        S: RecordSink,
        C: Future<Output = Result<S>>,
        T: Transport,
    {
        self.transition(LifecycleState::Starting);

        let sink = match connect_sink.await {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                error!("Sink connection failed during startup: {}", e);
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
        };
        info!("Sink connected");

        let pipeline = IngestionPipeline::new(Arc::clone(&sink), throttle);

        let transport_shutdown = self.shutdown.child_token();
        let mut subscription = match transport
            .subscribe(topic_filter, transport_shutdown.clone())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Transport subscription failed during startup: {}", e);
                self.close_sink(sink.as_ref()).await;
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
        };

        self.transition(LifecycleState::Running);
        pipeline.run(&mut subscription, &self.shutdown).await;
        let stream_lost = !self.shutdown.is_cancelled();
        if stream_lost {
            error!("Transport message stream ended before shutdown was requested");
        }

        self.transition(LifecycleState::Draining);
        transport_shutdown.cancel();
        let discarded = subscription.close().await;
        if discarded > 0 {
            warn!(
                "Discarded {} queued messages that arrived after intake stopped",
                discarded
            );
        }

        let abandoned = pipeline.drain(self.grace).await;
        if abandoned > 0 {
            warn!("Closing sink with {} writes still outstanding", abandoned);
        }
        self.close_sink(sink.as_ref()).await;

        let stats = pipeline.stats();
        info!(
            "Ingestion summary: received={}, persisted={}, throttled={}, malformed={}, persist_failed={}, in_flight={}, throttle_keys={}",
            stats.received,
            stats.persisted,
            stats.throttled,
            stats.malformed,
            stats.persist_failed,
            pipeline.in_flight(),
            pipeline.gate().tracked_keys()
        );

        self.transition(LifecycleState::Stopped);
        if stream_lost {
            return Err(AppError::Transport(
                "message stream ended before shutdown".to_string(),
            ));
        }
        Ok(stats)
    }

    /// Close the sink, giving up after the grace period
    async fn close_sink<S: RecordSink>(&self, sink: &S) {
        match tokio::time::timeout(self.grace, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to close sink: {}", e),
            Err(_) => warn!(
                "Sink did not close within {}s, abandoning it",
                self.grace.as_secs_f64()
            ),
        }
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Lifecycle: {:?} -> {:?}", previous, next);
        }
    }
}

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM"),
                _ = int.recv() => info!("Received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to register signal handlers, falling back to ctrl+c: {}", e);
            wait_for_ctrl_c().await;
        }
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
