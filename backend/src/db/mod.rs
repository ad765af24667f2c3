// backend/src/db/mod.rs

use sqlx::{Pool, Postgres};
use tracing::info;

/// Channel the notify trigger publishes on; the payload is the collection path.
pub const KPI_CHANGES_CHANNEL: &str = "kpi_changes";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS public.kpis (
        kpi_id      BIGSERIAL PRIMARY KEY,
        collection  TEXT NOT NULL,
        name        TEXT,
        target      DOUBLE PRECISION,
        actual      DOUBLE PRECISION,
        date        DATE,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS kpis_collection_idx ON public.kpis (collection)"#,
    r#"
    CREATE OR REPLACE FUNCTION public.notify_kpi_change() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('kpi_changes', COALESCE(NEW.collection, OLD.collection));
        RETURN NULL;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"DROP TRIGGER IF EXISTS kpis_notify ON public.kpis"#,
    r#"
    CREATE TRIGGER kpis_notify
        AFTER INSERT OR UPDATE OR DELETE ON public.kpis
        FOR EACH ROW EXECUTE FUNCTION public.notify_kpi_change()
    "#,
];

pub async fn connect(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>, sqlx::Error> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!(max_connections, "connected to PostgreSQL");
    Ok(pool)
}

/// Serialises concurrent `ensure_schema` calls from several processes.
const SCHEMA_LOCK: i64 = 0x6b70_6973;

pub async fn ensure_schema(pool: &Pool<Postgres>) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK)
        .execute(&mut *tx)
        .await?;
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    info!("kpi schema ready");
    Ok(())
}
