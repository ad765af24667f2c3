// backend/src/routes/events.rs

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Serialize;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};

use crate::derive::{entries, KpiEntry};
use crate::error::DashboardError;
use crate::session::SummaryView;
use crate::AppState;

#[derive(Serialize)]
struct SnapshotEvent {
    kpis: Vec<KpiEntry>,
    summary: SummaryView,
    quarantined: usize,
}

/// GET /api/v1/sessions/:user_id/events
///
/// One `snapshot` event with the current list, then one per change. An open
/// stream keeps the session from expiring.
pub async fn stream_snapshots(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, DashboardError> {
    let session = state.sessions.get(&user_id)?;
    let lease = session.lease_stream();
    let stream = WatchStream::new(session.kpis().watch()).map(move |snapshot| {
        // the session stays open for as long as the client is connected
        let _held = &lease;
        Event::default().event("snapshot").json_data(SnapshotEvent {
            kpis: entries(&snapshot.records),
            summary: SummaryView::of(&snapshot.records),
            quarantined: snapshot.quarantined,
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
