//! Facegate Server
//!
//! Main entry point: websocket frame gateway plus HTTP API.

use facegate_server::{
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facegate_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Facegate Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        dispatch_mode = %config.dispatch_mode,
        worker_pool_size = config.worker_pool_size,
        ledger_path = %config.ledger_path.display(),
        frames_dir = %config.frames_dir.display(),
        recognizer = %config.recognizer_program,
        recognizer_timeout_ms = config.recognizer_timeout.as_millis() as u64,
        min_frame_interval_ms = config.min_frame_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let (state, background) = AppState::initialize(config).await?;
    background.start().await;

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    background.stop().await;
    tracing::info!("Facegate Server stopped");

    Ok(())
}
