//! Frame Worker
//!
//! Standalone queue consumer: claims queued frames, runs the recognition
//! engine, appends the shared audit ledger and publishes replies.

use facegate_server::{
    audit_ledger::AuditLedger,
    dispatcher::{FrameQueue, WorkerPool},
    state::{build_recognizer, AppConfig},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facegate_server=debug,frame_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::default();
    tracing::info!(
        queue_url = %config.queue_url,
        workers = config.worker_pool_size,
        ledger_path = %config.ledger_path.display(),
        "Starting frame worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let queue = Arc::new(FrameQueue::connect(&config.queue_url, config.queue_lease).await?);
    let ledger = Arc::new(AuditLedger::open(&config.ledger_path).await?);
    let recognizer = build_recognizer(&config).await?;

    let pool = WorkerPool::new(
        config.worker_pool_size,
        queue,
        recognizer,
        ledger,
        config.queue_poll_interval,
    );
    pool.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, finishing current tasks");

    pool.stop().await;
    pool.join().await;
    tracing::info!("Frame worker stopped");

    Ok(())
}
