// backend/src/config.rs

use std::env;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String, max_connections: u32 },
    Memory,
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub api_base: String,
    pub model: String,
    pub api_key: String,
    pub language: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com".into(),
            model: "gemini-2.0-flash".into(),
            api_key: String::new(),
            language: "Thai".into(),
        }
    }
}

/// Everything the service needs at startup. Built once in `main` and passed
/// down; nothing reads the environment after this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    pub app_id: String,
    pub store: StoreBackend,
    pub analysis: AnalysisConfig,
    /// Sessions with no request for this long are closed.
    pub session_idle: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match get("PORT") {
            Some(p) => p.parse().with_context(|| format!("invalid PORT '{p}'"))?,
            None => 8080,
        };

        let store = match get("KPI_STORE").as_deref().unwrap_or("postgres") {
            "memory" => StoreBackend::Memory,
            "postgres" => {
                let database_url = get("DATABASE_URL")
                    .context("DATABASE_URL must be set when KPI_STORE=postgres")?;
                let max_connections = match get("DATABASE_MAX_CONNECTIONS") {
                    Some(n) => n
                        .parse()
                        .with_context(|| format!("invalid DATABASE_MAX_CONNECTIONS '{n}'"))?,
                    None => 10,
                };
                StoreBackend::Postgres { database_url, max_connections }
            }
            other => bail!("unknown KPI_STORE '{other}' (expected postgres or memory)"),
        };

        let session_idle = match get("SESSION_IDLE_SECS") {
            Some(n) => Duration::from_secs(
                n.parse().with_context(|| format!("invalid SESSION_IDLE_SECS '{n}'"))?,
            ),
            None => Duration::from_secs(30 * 60),
        };

        let defaults = AnalysisConfig::default();
        let analysis = AnalysisConfig {
            api_base: get("GEMINI_API_BASE").unwrap_or(defaults.api_base),
            model: get("GEMINI_MODEL").unwrap_or(defaults.model),
            api_key: get("GEMINI_API_KEY").unwrap_or(defaults.api_key),
            language: get("ANALYSIS_LANGUAGE").unwrap_or(defaults.language),
        };

        Ok(Self {
            port,
            app_id: get("KPI_APP_ID").unwrap_or_else(|| "kpi-srinarong".into()),
            store,
            analysis,
            session_idle,
        })
    }

    pub fn collection_path(&self) -> String {
        format!("artifacts/{}/public/data/kpis", self.app_id)
    }
}
