// backend/src/session.rs
//
// One dashboard per anonymous identity: its own KPI Store fed by the Sync
// Layer, a form, a single error slot and the latest analysis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::AnalysisRequester;
use crate::auth::{AnonymousAuth, Identity};
use crate::derive::{chart_rows, entries, ChartRow, KpiEntry, Summary};
use crate::error::{DashboardError, DashboardResult, ErrorBody};
use crate::form::{Draft, DraftPatch, FormController, FormMode};
use crate::models::{KpiId, KpiRecord};
use crate::store::KpiCollection;
use crate::sync::{KpiStore, Subscription, SyncEvent, SyncLayer};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftState {
    #[serde(flatten)]
    pub mode: FormMode,
    pub draft: Draft,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryView {
    #[serde(flatten)]
    pub counts: Summary,
    pub achievement_rate: Option<f64>,
}

impl SummaryView {
    pub fn of(records: &[KpiRecord]) -> Self {
        let counts = Summary::of(records);
        Self { counts, achievement_rate: counts.achievement_rate() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub user_id: String,
    pub loading: bool,
    pub error: Option<ErrorBody>,
    pub kpis: Vec<KpiEntry>,
    pub quarantined: usize,
    pub summary: SummaryView,
    pub chart: Vec<ChartRow>,
    pub form: DraftState,
    pub analysis: Option<String>,
    pub is_analyzing: bool,
    pub can_analyze: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct SessionState {
    loading: bool,
    error: Option<DashboardError>,
    analysis: Option<String>,
    form: FormController,
}

struct AnalyzingFlag<'a>(&'a AtomicBool);

impl Drop for AnalyzingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Keeps a session from expiring while an event stream is attached.
pub struct StreamLease(Arc<DashboardSession>);

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.0.streams.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

pub struct DashboardSession {
    identity: Identity,
    kpis: KpiStore,
    state: Arc<Mutex<SessionState>>,
    analyzing: AtomicBool,
    last_seen: Mutex<Instant>,
    streams: AtomicUsize,
    collection: Arc<dyn KpiCollection>,
    requester: AnalysisRequester,
    subscription: Mutex<Option<Subscription>>,
}

impl DashboardSession {
    /// Starts the session's subscription; `identity` must already exist.
    pub fn open(identity: Identity, sync: &SyncLayer, requester: AnalysisRequester) -> Arc<Self> {
        let kpis = KpiStore::new();
        let state = Arc::new(Mutex::new(SessionState {
            loading: true,
            error: None,
            analysis: None,
            form: FormController::new(),
        }));

        let handler = {
            let kpis = kpis.clone();
            let state = Arc::clone(&state);
            move |event: SyncEvent| match event {
                SyncEvent::Snapshot(snapshot) => {
                    kpis.replace(snapshot);
                    lock(&state).loading = false;
                }
                SyncEvent::Failed(e) => {
                    let mut st = lock(&state);
                    st.loading = false;
                    st.error = Some(e);
                }
            }
        };
        let subscription = sync.subscribe(handler);

        Arc::new(Self {
            identity,
            kpis,
            state,
            analyzing: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
            streams: AtomicUsize::new(0),
            collection: Arc::clone(sync.collection()),
            requester,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn kpis(&self) -> &KpiStore {
        &self.kpis
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    pub fn error(&self) -> Option<DashboardError> {
        lock(&self.state).error.clone()
    }

    pub fn analysis(&self) -> Option<String> {
        lock(&self.state).analysis.clone()
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing.load(Ordering::SeqCst)
    }

    pub fn draft_state(&self) -> DraftState {
        let st = lock(&self.state);
        DraftState { mode: st.form.mode(), draft: st.form.draft().clone() }
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Time since the last request, or zero while an event stream is open.
    pub fn idle_for(&self) -> Duration {
        if self.streams.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        lock(&self.last_seen).elapsed()
    }

    pub fn lease_stream(self: &Arc<Self>) -> StreamLease {
        self.streams.fetch_add(1, Ordering::SeqCst);
        StreamLease(Arc::clone(self))
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).as_ref().is_some_and(Subscription::is_active)
    }

    /// Releases the subscription. Returns false if it was already released.
    pub fn close(&self) -> bool {
        match lock(&self.subscription).take() {
            Some(sub) => {
                sub.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn set_draft(&self, patch: DraftPatch) -> DraftState {
        lock(&self.state).form.set_fields(patch);
        self.draft_state()
    }

    pub fn start_edit(&self, id: KpiId) -> DashboardResult<DraftState> {
        let snapshot = self.kpis.current();
        let record = snapshot
            .records
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| DashboardError::NotFound(format!("kpi {id}")))?;
        {
            let mut st = lock(&self.state);
            st.form.start_edit(record, Utc::now().date_naive());
            st.error = None;
        }
        Ok(self.draft_state())
    }

    pub fn cancel_edit(&self) -> DraftState {
        {
            let mut st = lock(&self.state);
            st.form.cancel_edit();
            st.error = None;
        }
        self.draft_state()
    }

    /// Validates and writes the draft. The KPI list itself changes only when
    /// the write comes back through the subscription.
    pub async fn submit(&self) -> DashboardResult<KpiId> {
        let submission = {
            let mut st = lock(&self.state);
            if st.loading {
                let e = DashboardError::Initialization("the dashboard is still loading".into());
                st.error = Some(e.clone());
                return Err(e);
            }
            match st.form.prepare() {
                Ok(s) => s,
                Err(e) => {
                    st.error = Some(e.clone());
                    return Err(e);
                }
            }
        };

        match submission.apply(self.collection.as_ref()).await {
            Ok(id) => {
                let mut st = lock(&self.state);
                st.form.reset();
                st.error = None;
                st.analysis = None;
                info!(user_id = %self.identity.user_id, kpi_id = %id, "kpi saved");
                Ok(id)
            }
            Err(e) => {
                warn!(user_id = %self.identity.user_id, error = %e, "kpi write rejected");
                lock(&self.state).error = Some(e.clone());
                Err(e)
            }
        }
    }

    pub async fn analyze(&self) -> DashboardResult<String> {
        if self.analyzing.swap(true, Ordering::SeqCst) {
            return Err(DashboardError::AnalysisInProgress);
        }
        let _flag = AnalyzingFlag(&self.analyzing);

        {
            let mut st = lock(&self.state);
            st.analysis = None;
            st.error = None;
        }

        let snapshot = self.kpis.current();
        match self.requester.analyze(&snapshot.records).await {
            Ok(text) => {
                lock(&self.state).analysis = Some(text.clone());
                Ok(text)
            }
            Err(e) => {
                warn!(user_id = %self.identity.user_id, error = %e, "kpi analysis failed");
                lock(&self.state).error = Some(e.clone());
                Err(e)
            }
        }
    }

    pub fn view(&self) -> DashboardView {
        let snapshot = self.kpis.current();
        let is_analyzing = self.is_analyzing();
        let st = lock(&self.state);
        DashboardView {
            user_id: self.identity.user_id.clone(),
            loading: st.loading,
            error: st.error.as_ref().map(ErrorBody::from),
            kpis: entries(&snapshot.records),
            quarantined: snapshot.quarantined,
            summary: SummaryView::of(&snapshot.records),
            chart: chart_rows(&snapshot.records),
            form: DraftState { mode: st.form.mode(), draft: st.form.draft().clone() },
            analysis: st.analysis.clone(),
            is_analyzing,
            can_analyze: !is_analyzing && !snapshot.records.is_empty(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

pub struct SessionRegistry {
    auth: AnonymousAuth,
    sync: SyncLayer,
    requester: AnalysisRequester,
    sessions: RwLock<HashMap<String, Arc<DashboardSession>>>,
}

impl SessionRegistry {
    pub fn new(sync: SyncLayer, requester: AnalysisRequester) -> Self {
        Self { auth: AnonymousAuth, sync, requester, sessions: RwLock::new(HashMap::new()) }
    }

    /// Anonymous sign-in followed by a fresh dashboard for that identity.
    pub fn open(&self) -> Arc<DashboardSession> {
        let identity = self.auth.sign_in_anonymously();
        info!(user_id = %identity.user_id, "anonymous session opened");
        let session = DashboardSession::open(identity, &self.sync, self.requester.clone());
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.user_id().to_string(), Arc::clone(&session));
        session
    }

    pub fn get(&self, user_id: &str) -> DashboardResult<Arc<DashboardSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .map(|session| {
                session.touch();
                session
            })
            .ok_or_else(|| DashboardError::NotFound(format!("session {user_id}")))
    }

    /// Closes every session idle for at least `max_idle` and returns how
    /// many went.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Arc<DashboardSession>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= max_idle)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.close();
            info!(user_id = session.user_id(), "idle session expired");
        }
        expired.len()
    }

    /// Sweeps idle sessions in the background until the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = (max_idle / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else { return };
                let closed = registry.close_idle(max_idle);
                if closed > 0 {
                    debug!(closed, open = registry.len(), "idle sessions swept");
                }
            }
        })
    }

    pub fn close(&self, user_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        match removed {
            Some(session) => {
                session.close();
                info!(user_id, "session closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
