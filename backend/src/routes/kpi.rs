// backend/src/routes/kpi.rs

use axum::{extract::{Path, State}, Json};

use crate::derive::{chart_rows, entries, ChartRow, KpiEntry};
use crate::error::DashboardError;
use crate::session::SummaryView;
use crate::AppState;

// GET /api/v1/sessions/:user_id/kpis
pub async fn list_kpis(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<KpiEntry>>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    Ok(Json(entries(&session.kpis().current().records)))
}

// GET /api/v1/sessions/:user_id/summary
pub async fn get_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SummaryView>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    Ok(Json(SummaryView::of(&session.kpis().current().records)))
}

// GET /api/v1/sessions/:user_id/chart
pub async fn get_chart(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<ChartRow>>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    Ok(Json(chart_rows(&session.kpis().current().records)))
}
