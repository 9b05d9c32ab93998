use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod inference;

use api::AppState;
use config::ServiceConfig;
use inference::T5Summarizer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    info!(
        "🚀 Starting summarization server (preset {})...",
        config.preset.name()
    );

    // -----------------------------
    // Shared state: model is loaded once and read by every request
    // -----------------------------
    let summarizer = Arc::new(T5Summarizer::load(&config).await?);
    let state = AppState { summarizer };

    let app = api::app(state);

    let addr = config.addr;
    let listener = TcpListener::bind(addr).await?;
    info!("🌐 HTTP listening on http://{addr}");
    info!("🛠 Summarization API at http://{addr}/summarize");

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
