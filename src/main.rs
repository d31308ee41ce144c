use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod error;
mod registry;
mod v1;
mod vision;

use backend::ollama::OllamaLoader;
use config::{Cli, InferenceSettings};
use registry::ModelRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    /// Bounds how many generations run at once.
    pub generation_slots: Arc<Semaphore>,
    pub settings: Arc<InferenceSettings>,
}

impl AppState {
    pub fn new(registry: ModelRegistry, max_concurrent: usize, settings: InferenceSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            generation_slots: Arc::new(Semaphore::new(max_concurrent)),
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/healthcheck", get(v1::health_check))
        .route("/gemma3n/models", get(v1::list_models))
        .route("/gemma3n/inference", post(v1::inference))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    cli.validate()?;
    let addr = cli.bind_addr()?;

    tracing::info!(backend = %cli.ollama_url, "starting up and loading models");
    let loader = OllamaLoader::new(&cli.ollama_url).context("failed to build backend client")?;
    let registry = ModelRegistry::load(&loader, &cli.model_specs(), &cli.load_config())
        .await
        .context("model loading failed, refusing to start")?;
    tracing::info!(models = registry.len(), "models ready");

    let state = AppState::new(
        registry,
        cli.max_concurrent_generations,
        cli.inference_settings(),
    );
    let app = router(state, cli.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    tracing::info!("Gemma3N inference server listening on http://{}", addr);
    tracing::info!("Available endpoints:");
    tracing::info!("  - GET  /healthcheck        - Health check");
    tracing::info!("  - GET  /gemma3n/models     - List loaded models");
    tracing::info!("  - POST /gemma3n/inference  - Streaming image classification");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
