// backend/src/store/memory.rs

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{ChangeFeed, KpiCollection};
use crate::error::StoreError;
use crate::models::{KpiFields, KpiId, KpiRow};

#[derive(Default)]
struct Documents {
    last_id: i64,
    rows: BTreeMap<i64, KpiRow>,
}

/// Process-local collection for `KPI_STORE=memory`. Behaves like the
/// Postgres one: ids and `created_at` are assigned here and every mutation
/// ticks the change feed.
pub struct MemoryKpiCollection {
    path: String,
    docs: RwLock<Documents>,
    changed: broadcast::Sender<()>,
}

impl MemoryKpiCollection {
    pub fn new(path: impl Into<String>) -> Self {
        let (changed, _) = broadcast::channel(64);
        Self { path: path.into(), docs: RwLock::new(Documents::default()), changed }
    }

    /// Writes a document as-is, the way a foreign client could. Its id is
    /// still assigned here.
    pub async fn put_raw(&self, row: KpiRow) -> KpiId {
        let mut docs = self.docs.write().await;
        docs.last_id += 1;
        let id = docs.last_id;
        docs.rows.insert(id, KpiRow { kpi_id: id, ..row });
        drop(docs);
        self.notify();
        KpiId(id)
    }

    /// Direct removal. Not reachable from the dashboard.
    pub async fn remove(&self, id: KpiId) -> bool {
        let removed = self.docs.write().await.rows.remove(&id.0).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    fn notify(&self) {
        // no receivers just means nobody is subscribed yet
        let _ = self.changed.send(());
    }
}

#[async_trait]
impl KpiCollection for MemoryKpiCollection {
    fn path(&self) -> &str {
        &self.path
    }

    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError> {
        Ok(self.docs.read().await.rows.values().cloned().collect())
    }

    async fn insert(&self, fields: &KpiFields) -> Result<KpiId, StoreError> {
        let row = KpiRow {
            kpi_id: 0,
            name: Some(fields.name.clone()),
            target: Some(fields.target),
            actual: Some(fields.actual),
            date: Some(fields.date),
            created_at: Some(Utc::now()),
        };
        Ok(self.put_raw(row).await)
    }

    async fn update(&self, id: KpiId, fields: &KpiFields) -> Result<(), StoreError> {
        let mut docs = self.docs.write().await;
        let row = docs.rows.get_mut(&id.0).ok_or(StoreError::NotFound(id.0))?;
        row.name = Some(fields.name.clone());
        row.target = Some(fields.target);
        row.actual = Some(fields.actual);
        row.date = Some(fields.date);
        drop(docs);
        self.notify();
        Ok(())
    }

    async fn changes(&self) -> Result<ChangeFeed, StoreError> {
        // a lagged receiver still means "something changed"
        let feed = BroadcastStream::new(self.changed.subscribe()).map(|_| Ok::<(), StoreError>(()));
        Ok(Box::pin(feed))
    }
}
