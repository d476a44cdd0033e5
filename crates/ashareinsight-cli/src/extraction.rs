//! Wire shape for one extracted document on disk (spec §6.3's LLM extractor
//! contract: "produces a structured object with company metadata and a list
//! of business concepts"). The extractor itself is out of scope (spec §1);
//! this module only deserializes its output so the `archive`/`fuse` verbs
//! can hand it to C6/C7.
//!
//! The whole parsed value is also what gets stored verbatim as
//! `SourceDocument::raw_llm_output`, so `fuse <doc_id>` can deserialize the
//! same shape back out of storage to replay a failed fusion (spec §4.10).

use ashareinsight_core::usecases::fusion::ExtractedConcept;
use ashareinsight_core::{Company, DocumentType, ExtractionMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Company metadata as the extractor reports it, before a `company_id` has
/// been assigned (mirrors [`ashareinsight_core::storage::CompanyUpsert`],
/// kept as a separate type here since the storage draft isn't `Deserialize`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub code: String,
    pub full_name: String,
    pub short_name: String,
    pub exchange: String,
}

impl From<CompanyInfo> for ashareinsight_core::storage::CompanyUpsert {
    fn from(c: CompanyInfo) -> Self {
        Self {
            code: c.code,
            full_name: c.full_name,
            short_name: c.short_name,
            exchange: c.exchange,
        }
    }
}

/// One archived document's worth of extraction output, read from a single
/// JSON file per the CLI's `archive <path-or-dir>` verb (spec §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionFile {
    pub company: CompanyInfo,
    pub doc_type: DocumentType,
    pub title: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extraction_metadata: ExtractionMetadata,
    pub concepts: Vec<ExtractedConcept>,
}

impl ExtractionFile {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Content address for the archival idempotency invariant (spec §3:
/// `(company_code, file_hash)` logically unique) — SHA-256 over the file's
/// raw bytes, hex-encoded, so byte-identical re-archival always produces the
/// same hash regardless of field ordering inside the JSON.
pub fn file_hash(raw_bytes: &[u8]) -> String {
    let digest = Sha256::digest(raw_bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

/// `query_identifier` accepts either name; `Company::matches_identifier`
/// already does the real comparison. Kept here only as a tiny convenience
/// for commands that log a human-readable label.
pub fn display_label(company: &Company) -> String {
    format!("{} ({})", company.short_name, company.code)
}
