// backend/src/sync.rs

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::derive::sort_for_display;
use crate::error::{DashboardError, StoreError};
use crate::models::{KpiRecord, KpiRow, KpiSnapshot};
use crate::store::KpiCollection;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Snapshot(Arc<KpiSnapshot>),
    Failed(DashboardError),
}

/// Read-through cache of the collection: the latest snapshot, replaced
/// wholesale, never patched.
#[derive(Clone)]
pub struct KpiStore {
    tx: Arc<watch::Sender<Arc<KpiSnapshot>>>,
}

impl Default for KpiStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(KpiSnapshot::default()));
        Self { tx: Arc::new(tx) }
    }
}

impl KpiStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<KpiSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<KpiSnapshot>> {
        self.tx.subscribe()
    }

    pub(crate) fn replace(&self, snapshot: Arc<KpiSnapshot>) {
        self.tx.send_replace(snapshot);
    }
}

/// Turns raw documents into the ordered list the dashboard shows.
/// Documents that fail to decode are left out and counted.
pub fn decode_snapshot(rows: Vec<KpiRow>) -> KpiSnapshot {
    let mut quarantined = 0;
    let mut records: Vec<KpiRecord> = Vec::with_capacity(rows.len());
    for row in rows {
        match KpiRecord::try_from(row) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                warn!(error = %e, "skipping malformed kpi document");
                quarantined += 1;
            }
        }
    }
    sort_for_display(&mut records);
    KpiSnapshot { records, quarantined }
}

pub async fn load_snapshot(collection: &dyn KpiCollection) -> Result<KpiSnapshot, DashboardError> {
    let rows = collection.snapshot().await.map_err(DashboardError::sync)?;
    Ok(decode_snapshot(rows))
}

/// Handle to a running subscription. Releasing consumes the handle;
/// dropping an unreleased one releases it too.
#[must_use = "dropping a Subscription releases it immediately"]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Latest event of the shared feed. `None` until the first snapshot lands.
type Published = watch::Sender<Option<SyncEvent>>;
type FeedSlot = Arc<Mutex<Option<Arc<Published>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans one change feed out to any number of subscribers.
///
/// The feed is opened by the first subscriber and closed once the last one
/// is released, so a Postgres store holds one listener connection however
/// many dashboards are open. Each change is read from the store once and the
/// resulting snapshot is shared by every subscriber.
#[derive(Clone)]
pub struct SyncLayer {
    collection: Arc<dyn KpiCollection>,
    feed: FeedSlot,
}

impl SyncLayer {
    pub fn new(collection: Arc<dyn KpiCollection>) -> Self {
        Self { collection, feed: Arc::new(Mutex::new(None)) }
    }

    pub fn collection(&self) -> &Arc<dyn KpiCollection> {
        &self.collection
    }

    /// True while the shared change feed is open.
    pub fn is_listening(&self) -> bool {
        lock(&self.feed).is_some()
    }

    /// Delivers the current snapshot, then a fresh one after every change,
    /// until released or until the first failure (delivered once, no retry).
    /// A subscriber that arrives after a failure starts a new feed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        let events = self.attach();
        let task = tokio::spawn(deliver(events, handler));
        Subscription { task: Some(task) }
    }

    fn attach(&self) -> watch::Receiver<Option<SyncEvent>> {
        let mut slot = lock(&self.feed);
        if let Some(events) = slot.as_ref() {
            return events.subscribe();
        }
        let (tx, rx) = watch::channel(None);
        let events = Arc::new(tx);
        *slot = Some(Arc::clone(&events));
        tokio::spawn(pump(Arc::clone(&self.collection), events, Arc::clone(&self.feed)));
        rx
    }
}

async fn deliver<F>(mut events: watch::Receiver<Option<SyncEvent>>, handler: F)
where
    F: Fn(SyncEvent) + Send + Sync,
{
    loop {
        let event = events.borrow_and_update().clone();
        match event {
            Some(SyncEvent::Failed(e)) => return handler(SyncEvent::Failed(e)),
            Some(snapshot) => handler(snapshot),
            None => {}
        }
        if events.changed().await.is_err() {
            return handler(SyncEvent::Failed(DashboardError::sync(StoreError::FeedClosed)));
        }
    }
}

async fn pump(collection: Arc<dyn KpiCollection>, events: Arc<Published>, slot: FeedSlot) {
    debug!(collection = collection.path(), "opening kpi change feed");
    match follow(collection.as_ref(), &events, &slot).await {
        Ok(()) => debug!(collection = collection.path(), "kpi change feed closed, no subscribers left"),
        Err(e) => {
            warn!(collection = collection.path(), error = %e, "kpi change feed stopped");
            let mut current = lock(&slot);
            events.send_replace(Some(SyncEvent::Failed(e)));
            *current = None;
        }
    }
}

/// Publishes a snapshot per change until the feed fails or nobody listens.
async fn follow(
    collection: &dyn KpiCollection,
    events: &Published,
    slot: &Mutex<Option<Arc<Published>>>,
) -> Result<(), DashboardError> {
    // open the feed first so nothing written during the first read is missed
    let mut feed = collection.changes().await.map_err(DashboardError::sync)?;

    loop {
        let snapshot = load_snapshot(collection).await?;
        debug!(
            records = snapshot.records.len(),
            quarantined = snapshot.quarantined,
            "kpi snapshot"
        );
        events.send_replace(Some(SyncEvent::Snapshot(Arc::new(snapshot))));

        let tick = loop {
            tokio::select! {
                tick = feed.next() => break tick,
                () = events.closed() => {
                    if release_if_idle(events, slot) {
                        return Ok(());
                    }
                }
            }
        };
        match tick {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(DashboardError::sync(e)),
            None => return Err(DashboardError::sync(StoreError::FeedClosed)),
        }
    }
}

// checked under the slot lock so a concurrent attach either lands before
// the feed is dropped or starts a new one
fn release_if_idle(events: &Published, slot: &Mutex<Option<Arc<Published>>>) -> bool {
    let mut current = lock(slot);
    if events.receiver_count() > 0 {
        return false;
    }
    *current = None;
    true
}
