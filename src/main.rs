mod core;
mod features;
mod modules;
mod shared;

use crate::core::config::Config;
use crate::core::error::AppError;
use crate::core::lifecycle::{self, Lifecycle};
use crate::modules::mqtt::MqttTransport;
use crate::modules::sink::PostgresSink;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    // Build Tokio runtime with configurable worker threads
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4)
        });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> anyhow::Result<()> {
    // Load .env file BEFORE initializing logger so RUST_LOG is available
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; nothing connects before this succeeds
    let config = Config::from_env().map_err(AppError::Config)?;

    tracing::info!(
        "System info: tokio_worker_threads={}, pid={}",
        worker_threads,
        std::process::id()
    );
    tracing::info!(
        "Configuration loaded: broker={}, topic={}, sink={}.{}, min_save_interval={:?}, throttle_key={}, commit={}",
        config.mqtt.broker_address(),
        config.mqtt.topic_filter,
        config.sink.schema,
        config.sink.table,
        config.throttle.min_interval,
        config.throttle.key_strategy,
        config.throttle.commit_strategy
    );

    let bridge = Lifecycle::new(config.lifecycle.shutdown_grace);

    let shutdown = bridge.shutdown_token();
    tokio::spawn(async move {
        lifecycle::wait_for_signal().await;
        shutdown.cancel();
    });

    let stats = bridge
        .run(
            PostgresSink::connect(&config.database, &config.sink),
            MqttTransport::new(&config.mqtt),
            &config.mqtt.topic_filter,
            &config.throttle,
        )
        .await
        .map_err(|e| anyhow::anyhow!("Bridge failed: {}", e))?;

    tracing::info!(
        "Bridge stopped after persisting {} of {} messages",
        stats.persisted,
        stats.received
    );

    Ok(())
}
