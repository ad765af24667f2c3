// backend/src/form.rs

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DashboardError, DashboardResult};
use crate::models::{KpiFields, KpiId, KpiRecord};
use crate::store::KpiCollection;

/// Form fields exactly as typed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub name: String,
    pub target: String,
    pub actual: String,
    pub date: String,
}

/// Partial draft update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DraftPatch {
    pub name: Option<String>,
    pub target: Option<String>,
    pub actual: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FormMode {
    Create,
    Edit { kpi_id: KpiId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Create(KpiFields),
    Update(KpiId, KpiFields),
}

impl Submission {
    /// Sends the write. Inserts get their `created_at` from the store;
    /// updates never carry it.
    pub async fn apply(&self, collection: &dyn KpiCollection) -> DashboardResult<KpiId> {
        match self {
            Self::Create(fields) => collection.insert(fields).await.map_err(DashboardError::write),
            Self::Update(id, fields) => {
                collection.update(*id, fields).await.map_err(DashboardError::write)?;
                Ok(*id)
            }
        }
    }
}

pub fn parse_number(field: &str, raw: &str) -> DashboardResult<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DashboardError::Validation(format!("{field} must be a number")))
}

pub fn parse_date(raw: &str) -> DashboardResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        DashboardError::Validation(format!("date '{raw}' is not a calendar date (YYYY-MM-DD)"))
    })
}

#[derive(Debug, Clone, Default)]
pub struct FormController {
    draft: Draft,
    editing: Option<KpiId>,
}

impl FormController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> FormMode {
        match self.editing {
            Some(kpi_id) => FormMode::Edit { kpi_id },
            None => FormMode::Create,
        }
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    pub fn set_fields(&mut self, patch: DraftPatch) {
        if let Some(v) = patch.name {
            self.draft.name = v;
        }
        if let Some(v) = patch.target {
            self.draft.target = v;
        }
        if let Some(v) = patch.actual {
            self.draft.actual = v;
        }
        if let Some(v) = patch.date {
            self.draft.date = v;
        }
    }

    /// Loads `record` into the draft. Undated records get `today`.
    pub fn start_edit(&mut self, record: &KpiRecord, today: NaiveDate) {
        self.editing = Some(record.id);
        self.draft = Draft {
            name: record.name.clone(),
            target: record.target.to_string(),
            actual: record.actual.to_string(),
            date: record.date.unwrap_or(today).format("%Y-%m-%d").to_string(),
        };
    }

    pub fn cancel_edit(&mut self) {
        self.reset();
    }

    /// Back to an empty Create form; called after a successful save.
    pub fn reset(&mut self) {
        self.editing = None;
        self.draft = Draft::default();
    }

    pub fn prepare(&self) -> DashboardResult<Submission> {
        let d = &self.draft;
        let missing: Vec<&str> = [
            ("name", d.name.trim()),
            ("target", d.target.trim()),
            ("actual", d.actual.trim()),
            ("date", d.date.trim()),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(DashboardError::Validation(format!(
                "please fill in every KPI field (missing: {})",
                missing.join(", ")
            )));
        }

        let fields = KpiFields {
            name: d.name.trim().to_string(),
            target: parse_number("target", &d.target)?,
            actual: parse_number("actual", &d.actual)?,
            date: parse_date(&d.date)?,
        };
        Ok(match self.editing {
            Some(id) => Submission::Update(id, fields),
            None => Submission::Create(fields),
        })
    }
}
