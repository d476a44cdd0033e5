//! Company and source-document master data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A listed company, identified by its exchange code.
///
/// `code` is the natural key (e.g. `"600519"`); `company_id` is the opaque
/// reference used everywhere else in the system once resolved, per the
/// "break id cycles with opaque ids" design note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Company {
    pub company_id: uuid::Uuid,
    pub code: String,
    pub full_name: String,
    pub short_name: String,
    pub exchange: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Company {
    /// Resolution order per spec §4.1: exact code, else exact full name,
    /// else exact short name (case-insensitive, whitespace-stripped).
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        let needle = identifier.trim().to_lowercase();
        self.code.to_lowercase() == needle
            || self.full_name.to_lowercase() == needle
            || self.short_name.to_lowercase() == needle
    }

    /// `true` when `identifier` matches this company's code exactly
    /// (case-insensitive) — used to break ties when a short name collides
    /// with another company's code (spec §4.1: "prefer an exact code match
    /// over a name match").
    pub fn matches_code_exactly(&self, identifier: &str) -> bool {
        self.code.to_lowercase() == identifier.trim().to_lowercase()
    }
}

/// Extraction provenance recorded alongside a [`SourceDocument`] (spec §3:
/// "model id, prompt version, token counts, wall-clock").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_clock_ms: Option<u64>,
}

/// A report/document archived for a company (annual report, research report).
///
/// `file_hash` is the content-address used for idempotent re-archival
/// (spec §3 invariant: `(company_code, file_hash)` logically unique).
/// `raw_llm_output` is the extractor's entire structured output, kept
/// opaque so a failed fusion can always replay from it (spec §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceDocument {
    pub document_id: uuid::Uuid,
    pub company_id: uuid::Uuid,
    pub doc_type: DocumentType,
    pub title: String,
    pub file_path: String,
    pub file_hash: String,
    pub published_at: DateTime<Utc>,
    pub raw_llm_output: serde_json::Value,
    pub extraction_metadata: ExtractionMetadata,
    pub processing_status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    AnnualReport,
    ResearchReport,
}

/// Lifecycle of an archived document (spec §4.10).
///
/// `Pending` -> `Completed` on fusion success, `Pending` -> `Failed` on a
/// terminal fusion error (spec's error-isolation boundary: archival success
/// is independent of fusion outcome, and a `Failed` document is replayable
/// from its `raw_llm_output`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}
