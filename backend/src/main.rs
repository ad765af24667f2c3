// backend/src/main.rs

use kpi_dashboard_api::{config::AppConfig, router, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let state = AppState::from_config(&config).await?;
    let _reaper = state.sessions.spawn_reaper(config.session_idle);
    let api = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, collection = %config.collection_path(), "KPI dashboard API listening");

    axum::serve(listener, api.into_make_service()).await?;
    Ok(())
}
