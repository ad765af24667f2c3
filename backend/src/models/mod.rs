// backend/src/models/mod.rs

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

// ───────────────────────────────────────
// Identifiers
// ───────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct KpiId(pub i64);

impl std::fmt::Display for KpiId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ───────────────────────────────────────
// KPI records
// ───────────────────────────────────────

/// A KPI document exactly as the store holds it. Other clients may write
/// partial documents, so nothing here is trusted until decoded.
#[derive(Debug, Clone, Default, FromRow)]
pub struct KpiRow {
    pub kpi_id: i64,
    pub name: Option<String>,
    pub target: Option<f64>,
    pub actual: Option<f64>,
    pub date: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRecord {
    pub id: KpiId,
    pub name: String,
    pub target: f64,
    pub actual: f64,
    pub date: Option<NaiveDate>, // absent only on foreign documents
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedKpi {
    #[error("kpi {0}: missing or blank name")]
    Name(i64),
    #[error("kpi {0}: target is missing or not a finite number")]
    Target(i64),
    #[error("kpi {0}: actual is missing or not a finite number")]
    Actual(i64),
    #[error("kpi {0}: missing created_at")]
    CreatedAt(i64),
}

impl TryFrom<KpiRow> for KpiRecord {
    type Error = MalformedKpi;

    fn try_from(row: KpiRow) -> Result<Self, Self::Error> {
        let id = row.kpi_id;
        let name = row
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or(MalformedKpi::Name(id))?;
        let target = row.target.filter(|v| v.is_finite()).ok_or(MalformedKpi::Target(id))?;
        let actual = row.actual.filter(|v| v.is_finite()).ok_or(MalformedKpi::Actual(id))?;
        let created_at = row.created_at.ok_or(MalformedKpi::CreatedAt(id))?;
        Ok(KpiRecord { id: KpiId(id), name, target, actual, date: row.date, created_at })
    }
}

/// The mutable part of a record: what inserts and updates carry.
/// `id` and `created_at` are never part of a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiFields {
    pub name: String,
    pub target: f64,
    pub actual: f64,
    pub date: NaiveDate,
}

/// Full contents of the collection at one point in time, decoded and
/// ordered for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KpiSnapshot {
    pub records: Vec<KpiRecord>,
    pub quarantined: usize,
}

// ───────────────────────────────────────
// DTOs helpful for endpoints
// ───────────────────────────────────────
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionOpened {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClosed {
    pub closed: bool,
}
