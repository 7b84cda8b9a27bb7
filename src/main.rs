mod app_state;
mod config;
mod core;
mod relay;
mod shared;
mod upstream;
mod web;

use std::sync::Arc;

use app_state::AppState;
use config::AppConfig;
use tracing::info;
use tracing_appender::rolling;
use upstream::connector::HttpUpstream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tokio::fs::create_dir_all("logs").await?;
    let file_appender = rolling::daily("logs", "restreamer.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env()?;
    let upstream = Arc::new(HttpUpstream::from_config(&config));
    let state = Arc::new(AppState::new(config.clone(), upstream));
    let app = web::routes::build_router(state);

    // The upstream host and credentials stay out of the logs.
    info!(
        "{} listening on {} (relay {})",
        config.app_name, config.bind_addr, config.relay_name
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
