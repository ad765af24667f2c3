// backend/src/store/postgres.rs

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{query, query_as, query_scalar, Pool, Postgres};
use tokio_stream::StreamExt;
use tracing::debug;

use super::{ChangeFeed, KpiCollection};
use crate::db::KPI_CHANGES_CHANNEL;
use crate::error::StoreError;
use crate::models::{KpiFields, KpiId, KpiRow};

/// `public.kpis` rows scoped to one collection path. Change notifications
/// come from the `kpis_notify` trigger over `LISTEN/NOTIFY`.
#[derive(Clone)]
pub struct PgKpiCollection {
    pool: Pool<Postgres>,
    collection: String,
}

impl PgKpiCollection {
    pub fn new(pool: Pool<Postgres>, collection: impl Into<String>) -> Self {
        Self { pool, collection: collection.into() }
    }
}

#[async_trait]
impl KpiCollection for PgKpiCollection {
    fn path(&self) -> &str {
        &self.collection
    }

    async fn snapshot(&self) -> Result<Vec<KpiRow>, StoreError> {
        let rows = query_as::<_, KpiRow>(
            r#"SELECT kpi_id, name, target, actual, date, created_at
               FROM public.kpis WHERE collection = $1
               ORDER BY kpi_id"#,
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert(&self, fields: &KpiFields) -> Result<KpiId, StoreError> {
        let id = query_scalar::<_, i64>(
            r#"
            INSERT INTO public.kpis (collection, name, target, actual, date, created_at)
            VALUES ($1,$2,$3,$4,$5, now())
            RETURNING kpi_id
            "#,
        )
        .bind(&self.collection)
        .bind(&fields.name)
        .bind(fields.target)
        .bind(fields.actual)
        .bind(fields.date)
        .fetch_one(&self.pool)
        .await?;
        Ok(KpiId(id))
    }

    async fn update(&self, id: KpiId, fields: &KpiFields) -> Result<(), StoreError> {
        let res = query(
            r#"
            UPDATE public.kpis SET
              name   = $3,
              target = $4,
              actual = $5,
              date   = $6
            WHERE kpi_id = $1 AND collection = $2
            "#,
        )
        .bind(id)
        .bind(&self.collection)
        .bind(&fields.name)
        .bind(fields.target)
        .bind(fields.actual)
        .bind(fields.date)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.0));
        }
        Ok(())
    }

    /// Holds one pool connection for as long as the feed is open.
    /// `SyncLayer` keeps a single feed per collection.
    async fn changes(&self) -> Result<ChangeFeed, StoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(KPI_CHANGES_CHANNEL).await?;
        debug!(collection = %self.collection, "listening for kpi changes");

        let collection = self.collection.clone();
        let feed = listener.into_stream().filter_map(move |n| match n {
            Ok(n) if n.payload() == collection => Some(Ok(())),
            Ok(_) => None,
            Err(e) => Some(Err(StoreError::from(e))),
        });
        Ok(Box::pin(feed))
    }
}
