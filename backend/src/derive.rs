// backend/src/derive.rs
//
// Pure views over the KPI Store: status, summary counts, chart rows, ordering.

use std::cmp::Ordering;

use serde::Serialize;

use crate::models::KpiRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiStatus {
    Achieved,
    Missed,
}

impl KpiStatus {
    /// The one threshold rule: meeting the target exactly counts as achieved.
    pub fn of(target: f64, actual: f64) -> Self {
        if actual >= target {
            Self::Achieved
        } else {
            Self::Missed
        }
    }
}

pub fn status(record: &KpiRecord) -> KpiStatus {
    KpiStatus::of(record.target, record.actual)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub achieved: usize,
    pub missed: usize,
}

impl Summary {
    pub fn of(records: &[KpiRecord]) -> Self {
        let total = records.len();
        let achieved = records
            .iter()
            .filter(|r| status(r) == KpiStatus::Achieved)
            .count();
        Self { total, achieved, missed: total - achieved }
    }

    /// Share of achieved KPIs in percent, `None` with nothing recorded.
    pub fn achievement_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.achieved as f64 * 100.0 / self.total as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartRow {
    pub name: String,
    pub target: f64,
    pub actual: f64,
}

pub fn chart_rows(records: &[KpiRecord]) -> Vec<ChartRow> {
    records
        .iter()
        .map(|r| ChartRow { name: r.name.clone(), target: r.target, actual: r.actual })
        .collect()
}

/// A record as the dashboard lists it, with its badge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiEntry {
    #[serde(flatten)]
    pub record: KpiRecord,
    pub status: KpiStatus,
}

pub fn entries(records: &[KpiRecord]) -> Vec<KpiEntry> {
    records
        .iter()
        .map(|r| KpiEntry { record: r.clone(), status: status(r) })
        .collect()
}

/// Newest date first, undated records last. Stable, so equal dates keep
/// the order the store returned them in.
pub fn sort_for_display(records: &mut [KpiRecord]) {
    records.sort_by(|a, b| match (a.date, b.date) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
