use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use kpi_dashboard_api::analysis::{AnalysisRequester, TextGenerator};
use kpi_dashboard_api::error::{DashboardError, DashboardResult, ErrorKind, StoreError};
use kpi_dashboard_api::form::{Draft, DraftPatch, FormMode};
use kpi_dashboard_api::models::{KpiFields, KpiId, KpiRow, KpiSnapshot};
use kpi_dashboard_api::session::{DashboardSession, SessionRegistry};
use kpi_dashboard_api::store::{ChangeFeed, KpiCollection, MemoryKpiCollection};
use kpi_dashboard_api::sync::SyncLayer;
use tokio::sync::Notify;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedGenerator {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str) -> DashboardResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(DashboardError::Analysis("upstream unavailable".into()))
        } else {
            Ok("all good".into())
        }
    }
}

#[derive(Default)]
struct GatedGenerator {
    release: Notify,
}

#[async_trait]
impl TextGenerator for GatedGenerator {
    async fn generate(&self, _prompt: &str) -> DashboardResult<String> {
        self.release.notified().await;
        Ok("done".into())
    }
}

/// Reads work, writes are rejected.
struct RejectingWrites(MemoryKpiCollection);

#[async_trait]
impl KpiCollection for RejectingWrites {
    fn path(&self) -> &str {
        self.0.path()
    }
    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError> {
        self.0.snapshot().await
    }
    async fn insert(&self, _fields: &KpiFields) -> Result<KpiId, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
    async fn update(&self, _id: KpiId, _fields: &KpiFields) -> Result<(), StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
    async fn changes(&self) -> Result<ChangeFeed, StoreError> {
        self.0.changes().await
    }
}

/// The change feed cannot be opened.
struct NoFeed;

#[async_trait]
impl KpiCollection for NoFeed {
    fn path(&self) -> &str {
        "kpis"
    }
    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError> {
        Ok(vec![])
    }
    async fn insert(&self, _fields: &KpiFields) -> Result<KpiId, StoreError> {
        Err(StoreError::FeedClosed)
    }
    async fn update(&self, _id: KpiId, _fields: &KpiFields) -> Result<(), StoreError> {
        Err(StoreError::FeedClosed)
    }
    async fn changes(&self) -> Result<ChangeFeed, StoreError> {
        Err(StoreError::FeedClosed)
    }
}

/// The change feed never opens, so no snapshot ever arrives.
struct StalledFeed(MemoryKpiCollection);

#[async_trait]
impl KpiCollection for StalledFeed {
    fn path(&self) -> &str {
        self.0.path()
    }
    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError> {
        self.0.snapshot().await
    }
    async fn insert(&self, fields: &KpiFields) -> Result<KpiId, StoreError> {
        self.0.insert(fields).await
    }
    async fn update(&self, id: KpiId, fields: &KpiFields) -> Result<(), StoreError> {
        self.0.update(id, fields).await
    }
    async fn changes(&self) -> Result<ChangeFeed, StoreError> {
        std::future::pending().await
    }
}

fn registry(collection: Arc<dyn KpiCollection>, generator: Arc<dyn TextGenerator>) -> SessionRegistry {
    SessionRegistry::new(SyncLayer::new(collection), AnalysisRequester::new(generator, "Thai"))
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
}

fn fields(name: &str, target: f64, actual: f64, day: &str) -> KpiFields {
    KpiFields { name: name.into(), target, actual, date: date(day) }
}

fn draft(name: &str, target: &str, actual: &str, day: &str) -> DraftPatch {
    DraftPatch {
        name: Some(name.into()),
        target: Some(target.into()),
        actual: Some(actual.into()),
        date: Some(day.into()),
    }
}

async fn wait_for<F>(session: &DashboardSession, pred: F) -> Arc<KpiSnapshot>
where
    F: Fn(&KpiSnapshot) -> bool,
{
    let mut rx = session.kpis().watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = rx.borrow_and_update().clone();
            if pred(&current) && !session.is_loading() {
                return current;
            }
            rx.changed().await.expect("store alive");
        }
    })
    .await
    .expect("snapshot did not arrive in time")
}

async fn wait_loaded(session: &DashboardSession) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.is_loading() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never finished loading")
}

// ─────────────────────────────────────────────────────────────────────────────
// Form + sync
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_submit_writes_one_record_and_clears_draft() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;

    session.set_draft(draft("Bed occupancy", "85", "82.5", "2024-03-01"));
    let id = session.submit().await.expect("submit");

    let snap = wait_for(&session, |s| s.records.len() == 1).await;
    let rec = &snap.records[0];
    assert_eq!(rec.id, id);
    assert_eq!(rec.name, "Bed occupancy");
    assert_eq!(rec.target, 85.0);
    assert_eq!(rec.actual, 82.5);
    assert_eq!(rec.date, Some(date("2024-03-01")));

    let form = session.draft_state();
    assert_eq!(form.mode, FormMode::Create);
    assert_eq!(form.draft, Draft::default());
    assert_eq!(session.error(), None);
}

#[tokio::test]
async fn invalid_drafts_write_nothing() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;

    let cases = [
        draft("", "85", "80", "2024-03-01"),
        draft("Wait time", "", "80", "2024-03-01"),
        draft("Wait time", "85", "", "2024-03-01"),
        draft("Wait time", "85", "80", ""),
        draft("Wait time", "eighty", "80", "2024-03-01"),
        draft("Wait time", "85", "80%", "2024-03-01"),
    ];
    for case in cases {
        session.cancel_edit();
        session.set_draft(case);
        let err = session.submit().await.expect_err("must not validate");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(session.error(), Some(err));
    }

    assert!(store.snapshot().await.expect("snapshot").is_empty());
}

#[tokio::test]
async fn submit_before_first_snapshot_is_refused() {
    let store = Arc::new(StalledFeed(MemoryKpiCollection::new("kpis")));
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    assert!(session.is_loading());

    session.set_draft(draft("Bed occupancy", "85", "82.5", "2024-03-01"));
    let err = session.submit().await.expect_err("not ready");
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert_eq!(session.error(), Some(err));
    assert_eq!(session.draft_state().draft.name, "Bed occupancy");
    assert!(store.0.snapshot().await.expect("snapshot").is_empty());
}

#[tokio::test]
async fn start_edit_then_cancel_changes_nothing() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let id = store.insert(&fields("Falls", 2.0, 1.0, "2024-01-01")).await.expect("insert");
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    let before = wait_for(&session, |s| s.records.len() == 1).await;

    let editing = session.start_edit(id).expect("edit");
    assert_eq!(editing.mode, FormMode::Edit { kpi_id: id });
    assert_eq!(editing.draft.target, "2");

    let back = session.cancel_edit();
    assert_eq!(back.mode, FormMode::Create);
    assert_eq!(back.draft, Draft::default());
    assert_eq!(session.kpis().current(), before);
    assert_eq!(store.snapshot().await.expect("snapshot").len(), 1);
}

#[tokio::test]
async fn edit_updates_only_that_record() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let a = store.insert(&fields("A", 10.0, 12.0, "2024-01-01")).await.expect("insert");
    let b = store.insert(&fields("B", 5.0, 3.0, "2024-02-01")).await.expect("insert");
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    let before = wait_for(&session, |s| s.records.len() == 2).await;
    let old_a = before.records.iter().find(|r| r.id == a).cloned().expect("a");
    let old_b = before.records.iter().find(|r| r.id == b).cloned().expect("b");

    session.start_edit(a).expect("edit");
    session.set_draft(DraftPatch { target: Some("15".into()), ..Default::default() });
    assert_eq!(session.submit().await.expect("submit"), a);

    let after = wait_for(&session, |s| s.records.iter().any(|r| r.id == a && r.target == 15.0)).await;
    let new_a = after.records.iter().find(|r| r.id == a).expect("a");
    assert_eq!(new_a.created_at, old_a.created_at);
    assert_eq!(new_a.name, old_a.name);
    assert_eq!(new_a.actual, old_a.actual);
    assert_eq!(after.records.iter().find(|r| r.id == b), Some(&old_b));
    assert_eq!(session.draft_state().mode, FormMode::Create);
}

#[tokio::test]
async fn edit_of_unknown_record_is_not_found() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;
    assert!(matches!(session.start_edit(KpiId(99)), Err(DashboardError::NotFound(_))));
}

#[tokio::test]
async fn rejected_write_keeps_the_draft() {
    let store = Arc::new(RejectingWrites(MemoryKpiCollection::new("kpis")));
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;

    session.set_draft(draft("Bed occupancy", "85", "82.5", "2024-03-01"));
    let err = session.submit().await.expect_err("write rejected");
    assert_eq!(err.kind(), ErrorKind::Write);
    assert_eq!(session.error(), Some(err));
    assert_eq!(session.draft_state().draft.name, "Bed occupancy");
    assert!(session.kpis().current().records.is_empty());
}

#[tokio::test]
async fn other_clients_changes_show_up() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store.clone(), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;

    let id = store.insert(&fields("ER wait", 30.0, 25.0, "2024-05-01")).await.expect("insert");
    store.put_raw(KpiRow { name: Some("broken".into()), ..KpiRow::default() }).await;
    let snap = wait_for(&session, |s| s.records.len() == 1 && s.quarantined == 1).await;
    assert_eq!(snap.records[0].id, id);

    store.remove(id).await;
    wait_for(&session, |s| s.records.is_empty()).await;
}

#[tokio::test]
async fn sync_failure_is_surfaced() {
    let sessions = registry(Arc::new(NoFeed), Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_loaded(&session).await;
    let err = session.error().expect("sync error");
    assert_eq!(err.kind(), ErrorKind::Sync);
}

#[tokio::test]
async fn closing_a_session_releases_it_once() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    let user_id = session.user_id().to_string();
    assert_eq!(sessions.len(), 1);

    assert!(sessions.close(&user_id));
    assert!(!sessions.close(&user_id));
    assert!(!session.close());
    assert!(sessions.is_empty());
    assert!(matches!(sessions.get(&user_id), Err(DashboardError::NotFound(_))));
}

#[tokio::test]
async fn idle_sessions_are_closed_and_released() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let idle = sessions.open();
    let streaming = sessions.open();
    wait_loaded(&idle).await;
    wait_loaded(&streaming).await;
    assert!(idle.is_subscribed());

    let lease = streaming.lease_stream();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(sessions.close_idle(Duration::from_millis(20)), 1);
    assert!(!idle.is_subscribed());
    assert!(!idle.close());
    assert!(matches!(sessions.get(idle.user_id()), Err(DashboardError::NotFound(_))));
    assert!(streaming.is_subscribed());
    assert_eq!(sessions.len(), 1);

    // the idle clock restarts when the stream goes away
    drop(lease);
    assert_eq!(sessions.close_idle(Duration::from_secs(60)), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(sessions.close_idle(Duration::from_millis(20)), 1);
    assert!(!streaming.is_subscribed());
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn requests_keep_a_session_alive() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    let user_id = session.user_id().to_string();

    tokio::time::sleep(Duration::from_millis(30)).await;
    sessions.get(&user_id).expect("session");
    assert_eq!(sessions.close_idle(Duration::from_millis(20)), 0);
    assert!(session.idle_for() < Duration::from_millis(20));
}

#[tokio::test]
async fn reaper_sweeps_in_the_background() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    let sessions = Arc::new(registry(store, Arc::new(ScriptedGenerator::default())));
    let session = sessions.open();
    let reaper = sessions.spawn_reaper(Duration::from_millis(10));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("idle session was never reaped");
    assert!(!session.is_subscribed());
    reaper.abort();
}

// ─────────────────────────────────────────────────────────────────────────────
// Analysis
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn analysis_of_empty_store_makes_no_call() {
    let gen = Arc::new(ScriptedGenerator::default());
    let sessions = registry(Arc::new(MemoryKpiCollection::new("kpis")), gen.clone());
    let session = sessions.open();
    wait_loaded(&session).await;

    let err = session.analyze().await.expect_err("nothing to analyze");
    assert_eq!(err, DashboardError::NothingToAnalyze);
    assert_eq!(err.kind(), ErrorKind::Analysis);
    assert_eq!(gen.calls.load(Ordering::SeqCst), 0);
    assert!(!session.is_analyzing());
    assert!(!session.view().can_analyze);
}

#[tokio::test]
async fn analysis_result_is_published_and_cleared_by_next_save() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    store.insert(&fields("A", 10.0, 12.0, "2024-01-01")).await.expect("insert");
    let gen = Arc::new(ScriptedGenerator::default());
    let sessions = registry(store, gen.clone());
    let session = sessions.open();
    wait_for(&session, |s| s.records.len() == 1).await;

    assert_eq!(session.analyze().await.expect("analysis"), "all good");
    assert_eq!(session.analysis().as_deref(), Some("all good"));
    assert_eq!(gen.calls.load(Ordering::SeqCst), 1);

    session.set_draft(draft("B", "5", "3", "2024-02-01"));
    session.submit().await.expect("submit");
    assert_eq!(session.analysis(), None);
}

#[tokio::test]
async fn failed_analysis_clears_previous_text_and_resets_flag() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    store.insert(&fields("A", 10.0, 12.0, "2024-01-01")).await.expect("insert");
    let gen = Arc::new(ScriptedGenerator { fail: true, ..Default::default() });
    let sessions = registry(store, gen);
    let session = sessions.open();
    wait_for(&session, |s| s.records.len() == 1).await;

    let err = session.analyze().await.expect_err("upstream failure");
    assert_eq!(err.kind(), ErrorKind::Analysis);
    assert_eq!(session.analysis(), None);
    assert_eq!(session.error(), Some(err));
    assert!(!session.is_analyzing());
}

#[tokio::test]
async fn second_analysis_is_rejected_while_one_runs() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    store.insert(&fields("A", 10.0, 12.0, "2024-01-01")).await.expect("insert");
    let gen = Arc::new(GatedGenerator::default());
    let sessions = registry(store, gen.clone());
    let session = sessions.open();
    wait_for(&session, |s| s.records.len() == 1).await;

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.analyze().await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session.is_analyzing() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("analysis never started");

    assert!(!session.view().can_analyze);
    assert_eq!(session.analyze().await, Err(DashboardError::AnalysisInProgress));

    gen.release.notify_one();
    assert_eq!(running.await.expect("join").expect("analysis"), "done");
    assert!(!session.is_analyzing());
    assert_eq!(session.analysis().as_deref(), Some("done"));
}

#[tokio::test]
async fn dashboard_view_reports_counts_and_chart() {
    let store = Arc::new(MemoryKpiCollection::new("kpis"));
    store.insert(&fields("A", 10.0, 12.0, "2024-02-01")).await.expect("insert");
    store.insert(&fields("B", 5.0, 3.0, "2024-01-01")).await.expect("insert");
    let sessions = registry(store, Arc::new(ScriptedGenerator::default()));
    let session = sessions.open();
    wait_for(&session, |s| s.records.len() == 2).await;

    let view = session.view();
    assert!(!view.loading);
    assert_eq!(view.summary.counts.total, 2);
    assert_eq!(view.summary.counts.achieved, 1);
    assert_eq!(view.summary.counts.missed, 1);
    let chart: Vec<_> = view.chart.iter().map(|c| (c.name.as_str(), c.target, c.actual)).collect();
    assert_eq!(chart, [("A", 10.0, 12.0), ("B", 5.0, 3.0)]);
    assert!(view.can_analyze);
}
