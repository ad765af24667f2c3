// backend/src/lib.rs

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod analysis;
pub mod auth;
pub mod config;
pub mod db;
pub mod derive;
pub mod error;
pub mod form;
pub mod models;
pub mod routes;
pub mod session;
pub mod store;
pub mod sync;

use analysis::{AnalysisRequester, GeminiClient, TextGenerator};
use config::{AppConfig, StoreBackend};
use error::{DashboardError, DashboardResult};
use session::SessionRegistry;
use store::{KpiCollection, MemoryKpiCollection, PgKpiCollection};
use sync::SyncLayer;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub store_backend: &'static str,
}

impl AppState {
    pub fn new(
        collection: Arc<dyn KpiCollection>,
        generator: Arc<dyn TextGenerator>,
        language: &str,
        store_backend: &'static str,
    ) -> Self {
        let sync = SyncLayer::new(collection);
        let requester = AnalysisRequester::new(generator, language);
        Self { sessions: Arc::new(SessionRegistry::new(sync, requester)), store_backend }
    }

    /// Connects the configured store and text generator.
    pub async fn from_config(config: &AppConfig) -> DashboardResult<Self> {
        let init = |e: sqlx::Error| DashboardError::Initialization(e.to_string());
        let path = config.collection_path();

        let collection: Arc<dyn KpiCollection> = match &config.store {
            StoreBackend::Postgres { database_url, max_connections } => {
                let pool = db::connect(database_url, *max_connections).await.map_err(init)?;
                db::ensure_schema(&pool).await.map_err(init)?;
                Arc::new(PgKpiCollection::new(pool, path))
            }
            StoreBackend::Memory => Arc::new(MemoryKpiCollection::new(path)),
        };
        info!(
            backend = config.store.name(),
            collection = collection.path(),
            "kpi store ready"
        );

        let generator = Arc::new(GeminiClient::new(&config.analysis)?);
        Ok(Self::new(collection, generator, &config.analysis.language, config.store.name()))
    }
}

pub fn router(state: AppState) -> Router {
    // Very permissive CORS so the dashboard page can be served from anywhere
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // health
        .route("/health", get(routes::health::health))
        // sessions (anonymous sign-in)
        .route("/api/v1/sessions", post(routes::sessions::open_session))
        .route("/api/v1/sessions/:user_id", delete(routes::sessions::close_session))
        .route(
            "/api/v1/sessions/:user_id/dashboard",
            get(routes::sessions::get_dashboard),
        )
        // kpi store + derived views
        .route("/api/v1/sessions/:user_id/kpis", get(routes::kpi::list_kpis))
        .route("/api/v1/sessions/:user_id/summary", get(routes::kpi::get_summary))
        .route("/api/v1/sessions/:user_id/chart", get(routes::kpi::get_chart))
        .route(
            "/api/v1/sessions/:user_id/events",
            get(routes::events::stream_snapshots),
        )
        // form
        .route("/api/v1/sessions/:user_id/draft", put(routes::sessions::put_draft))
        .route(
            "/api/v1/sessions/:user_id/draft/edit/:kpi_id",
            post(routes::sessions::start_edit),
        )
        .route(
            "/api/v1/sessions/:user_id/draft/cancel",
            post(routes::sessions::cancel_edit),
        )
        .route(
            "/api/v1/sessions/:user_id/draft/submit",
            post(routes::sessions::submit_draft),
        )
        // analysis
        .route("/api/v1/sessions/:user_id/analysis", post(routes::sessions::analyze))
        // state & middleware
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
