// backend/src/store/mod.rs

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::StoreError;
use crate::models::{KpiFields, KpiId, KpiRow};

pub mod memory;
pub mod postgres;

pub use memory::MemoryKpiCollection;
pub use postgres::PgKpiCollection;

/// One item per change to the collection. Items carry no payload: a
/// subscriber re-reads the whole collection on every tick.
pub type ChangeFeed = Pin<Box<dyn Stream<Item = Result<(), StoreError>> + Send>>;

/// A KPI document collection in the remote store.
///
/// The store assigns `id` and `created_at` on insert. Updates replace the
/// four mutable fields and leave `created_at` alone.
#[async_trait]
pub trait KpiCollection: Send + Sync {
    /// Collection path, e.g. `artifacts/kpi-srinarong/public/data/kpis`.
    fn path(&self) -> &str;

    /// Every document in the collection, undecoded, in id order.
    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError>;

    async fn insert(&self, fields: &KpiFields) -> Result<KpiId, StoreError>;

    async fn update(&self, id: KpiId, fields: &KpiFields) -> Result<(), StoreError>;

    /// Opens a feed that ticks after every insert, update or delete.
    async fn changes(&self) -> Result<ChangeFeed, StoreError>;
}
