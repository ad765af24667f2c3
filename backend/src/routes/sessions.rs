// backend/src/routes/sessions.rs

use axum::{extract::{Path, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::error::DashboardError;
use crate::form::DraftPatch;
use crate::models::{KpiId, SessionClosed, SessionOpened};
use crate::session::{DashboardView, DraftState};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResp {
    pub kpi_id: KpiId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalysisResp {
    pub analysis: String,
}

/// POST /api/v1/sessions
pub async fn open_session(State(state): State<AppState>) -> (StatusCode, Json<SessionOpened>) {
    let session = state.sessions.open();
    (StatusCode::CREATED, Json(SessionOpened { user_id: session.user_id().to_string() }))
}

// DELETE /api/v1/sessions/:user_id
pub async fn close_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionClosed>, DashboardError> {
    if !state.sessions.close(&user_id) {
        return Err(DashboardError::NotFound(format!("session {user_id}")));
    }
    Ok(Json(SessionClosed { closed: true }))
}

// GET /api/v1/sessions/:user_id/dashboard
pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DashboardView>, DashboardError> {
    Ok(Json(state.sessions.get(&user_id)?.view()))
}

// PUT /api/v1/sessions/:user_id/draft
pub async fn put_draft(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(patch): Json<DraftPatch>,
) -> Result<Json<DraftState>, DashboardError> {
    Ok(Json(state.sessions.get(&user_id)?.set_draft(patch)))
}

// POST /api/v1/sessions/:user_id/draft/edit/:kpi_id
pub async fn start_edit(
    State(state): State<AppState>,
    Path((user_id, kpi_id)): Path<(String, i64)>,
) -> Result<Json<DraftState>, DashboardError> {
    Ok(Json(state.sessions.get(&user_id)?.start_edit(KpiId(kpi_id))?))
}

// POST /api/v1/sessions/:user_id/draft/cancel
pub async fn cancel_edit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<DraftState>, DashboardError> {
    Ok(Json(state.sessions.get(&user_id)?.cancel_edit()))
}

// POST /api/v1/sessions/:user_id/draft/submit
pub async fn submit_draft(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SubmitResp>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    let kpi_id = session.submit().await?;
    Ok(Json(SubmitResp { kpi_id }))
}

// POST /api/v1/sessions/:user_id/analysis
pub async fn analyze(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<AnalysisResp>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    let analysis = session.analyze().await?;
    Ok(Json(AnalysisResp { analysis }))
}
