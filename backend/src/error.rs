// backend/src/error.rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures raised by a [`crate::store::KpiCollection`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no KPI with id {0}")]
    NotFound(i64),
    #[error("change feed closed")]
    FeedClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Initialization,
    Validation,
    Sync,
    Write,
    Analysis,
    NotFound,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DashboardError {
    #[error("could not start the dashboard: {0}")]
    Initialization(String),
    #[error("{0}")]
    Validation(String),
    #[error("could not load KPI data: {0}")]
    Sync(String),
    #[error("could not save KPI: {0}")]
    Write(String),
    #[error("KPI analysis failed: {0}")]
    Analysis(String),
    #[error("no KPI data to analyze, add a KPI first")]
    NothingToAnalyze,
    #[error("an analysis is already running")]
    AnalysisInProgress,
    #[error("{0} not found")]
    NotFound(String),
}

impl DashboardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization(_) => ErrorKind::Initialization,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Sync(_) => ErrorKind::Sync,
            Self::Write(_) => ErrorKind::Write,
            Self::Analysis(_) | Self::NothingToAnalyze | Self::AnalysisInProgress => {
                ErrorKind::Analysis
            }
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AnalysisInProgress => StatusCode::CONFLICT,
            Self::NothingToAnalyze => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Write(_) | Self::Analysis(_) => StatusCode::BAD_GATEWAY,
            Self::Initialization(_) | Self::Sync(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn write(e: StoreError) -> Self {
        Self::Write(e.to_string())
    }

    pub fn sync(e: StoreError) -> Self {
        Self::Sync(e.to_string())
    }
}

/// Body shape for every error the API returns, and for the session error slot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DashboardError> for ErrorBody {
    fn from(e: &DashboardError) -> Self {
        Self { kind: e.kind(), message: e.to_string() }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}

pub type DashboardResult<T> = Result<T, DashboardError>;
