// backend/src/analysis.rs

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::derive::{status, KpiStatus};
use crate::error::{DashboardError, DashboardResult};
use crate::models::KpiRecord;

// ─────────────────────────────────────────────────────────────────────────────
// Prompt
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct PromptEntry<'a> {
    name: &'a str,
    target: f64,
    actual: f64,
    status: KpiStatus,
}

pub fn build_prompt(records: &[KpiRecord], language: &str) -> DashboardResult<String> {
    let entries: Vec<PromptEntry<'_>> = records
        .iter()
        .map(|r| PromptEntry { name: &r.name, target: r.target, actual: r.actual, status: status(r) })
        .collect();
    let data = serde_json::to_string_pretty(&entries)
        .map_err(|e| DashboardError::Analysis(format!("could not encode KPI data: {e}")))?;

    Ok(format!(
        "Analyze the performance of the following hospital Key Performance Indicators (KPIs). \
         For each KPI, state whether it met its target. For every KPI that missed its target, \
         give a short likely cause or a general suggestion for improvement.\n\
         KPI data:\n{data}\n\n\
         Answer in {language}, clearly and concisely, focusing on actionable insights for the \
         targets that were not met."
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// generateContent wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<RequestContent<'a>>,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Text of the first part of the first candidate, if the response has one.
    pub fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

fn malformed() -> DashboardError {
    DashboardError::Analysis("malformed response from the text generator".into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Generators
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> DashboardResult<String>;
}

/// `models/{model}:generateContent` over HTTPS.
pub struct GeminiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(cfg: &AnalysisConfig) -> DashboardResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DashboardError::Initialization(format!("reqwest build error: {e}")))?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            cfg.api_base.trim_end_matches('/'),
            cfg.model
        );
        Ok(Self { http, url, api_key: cfg.api_key.clone() })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> DashboardResult<String> {
        let body = GenerateRequest {
            contents: vec![RequestContent { role: "user", parts: vec![RequestPart { text: prompt }] }],
        };
        let transport = |e: reqwest::Error| DashboardError::Analysis(format!("request failed: {e}"));

        let bytes = self
            .http
            .post(&self.url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .bytes()
            .await
            .map_err(transport)?;

        let parsed: GenerateResponse = serde_json::from_slice(&bytes).map_err(|e| {
            warn!(error = %e, "undecodable generateContent response");
            malformed()
        })?;
        parsed.first_text().ok_or_else(malformed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requester
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AnalysisRequester {
    generator: Arc<dyn TextGenerator>,
    language: String,
}

impl AnalysisRequester {
    pub fn new(generator: Arc<dyn TextGenerator>, language: impl Into<String>) -> Self {
        Self { generator, language: language.into() }
    }

    /// One best-effort call. An empty list fails before anything is sent.
    pub async fn analyze(&self, records: &[KpiRecord]) -> DashboardResult<String> {
        if records.is_empty() {
            return Err(DashboardError::NothingToAnalyze);
        }
        let prompt = build_prompt(records, &self.language)?;
        info!(kpis = records.len(), "requesting kpi analysis");
        self.generator.generate(&prompt).await
    }
}
