//! `archive <path-or-dir>` (spec §6.4): runs the (out-of-scope) extractor's
//! output through the Archival Use-Case (C6). Each input file is one
//! already-extracted document — see [`crate::extraction::ExtractionFile`].

use std::path::{Path, PathBuf};

use ashareinsight_core::usecases::archival::{archive_document, ArchivalInput, ArchivalOutcome};
use ashareinsight_core::Storage;
use chrono::Utc;

use crate::extraction::{display_label, file_hash, ExtractionFile};

/// Outcome of archiving one input file, used to decide the process exit
/// code (spec §6.4: 0 all succeeded, 1 one or more per-item failures).
pub struct ArchiveSummary {
    pub total: usize,
    pub archived: usize,
    pub already_existed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ArchiveSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

pub fn run(storage: &Storage, path: &Path) -> ArchiveSummary {
    let files = collect_input_files(path);
    let mut summary = ArchiveSummary {
        total: files.len(),
        archived: 0,
        already_existed: 0,
        skipped: 0,
        failed: 0,
    };

    for file in &files {
        match archive_one(storage, file) {
            Ok(ArchivalOutcome::Archived { document_id, already_existed, fusion }) => {
                if already_existed {
                    summary.already_existed += 1;
                    tracing::info!(path = %file.display(), %document_id, "already archived, skipping");
                } else {
                    summary.archived += 1;
                    let fusion = fusion.unwrap_or_default();
                    tracing::info!(
                        path = %file.display(),
                        %document_id,
                        inserted = fusion.inserted,
                        updated = fusion.updated,
                        fusion_failures = fusion.failed.len(),
                        "archived"
                    );
                }
            }
            Ok(ArchivalOutcome::SkippedUnknownCompany { code }) => {
                summary.skipped += 1;
                tracing::warn!(path = %file.display(), code, "research report for unknown company, skipped");
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(path = %file.display(), error = %e, "failed to archive");
            }
        }
    }

    summary
}

fn archive_one(storage: &Storage, path: &Path) -> Result<ArchivalOutcome, String> {
    let raw = std::fs::read(path).map_err(|e| format!("reading {}: {e}", path.display()))?;
    let text = String::from_utf8(raw.clone()).map_err(|e| format!("{} is not valid UTF-8: {e}", path.display()))?;
    let extraction = ExtractionFile::parse(&text).map_err(|e| format!("parsing {}: {e}", path.display()))?;
    let hash = file_hash(&raw);

    let raw_llm_output =
        serde_json::to_value(&extraction).map_err(|e| format!("re-serializing {}: {e}", path.display()))?;

    let input = ArchivalInput {
        company: extraction.company.clone().into(),
        doc_type: extraction.doc_type,
        title: extraction.title.clone(),
        file_path: path.display().to_string(),
        file_hash: hash,
        published_at: extraction.published_at.unwrap_or_else(Utc::now),
        raw_llm_output,
        extraction_metadata: extraction.extraction_metadata.clone(),
        concepts: extraction.concepts.clone(),
    };

    let outcome = archive_document(storage, input, Utc::now().date_naive())
        .map_err(|e| format!("archiving {}: {e}", path.display()))?;

    if let Ok(Some(company)) = storage.get_company(&extraction.company.code) {
        tracing::debug!(company = %display_label(&company), "resolved");
    }

    Ok(outcome)
}

/// A single file, or every `*.json` file directly inside a directory,
/// sorted for deterministic processing order.
fn collect_input_files(path: &Path) -> Vec<PathBuf> {
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ashareinsight_core::search::VectorIndexConfig;

    fn storage() -> Storage {
        Storage::open_in_memory(VectorIndexConfig::default()).unwrap()
    }

    const ANNUAL_REPORT: &str = r#"{
        "company": {"code": "300257", "full_name": "开山股份", "short_name": "开山", "exchange": "SZSE"},
        "doc_type": "annual_report",
        "title": "2025 annual report",
        "published_at": "2026-01-01T00:00:00Z",
        "concepts": [
            {
                "concept_name": "螺杆空气压缩机",
                "concept_category": "core",
                "description": "a longer description of the core business",
                "development_stage": "mature",
                "details": {},
                "importance_score": 0.9
            }
        ]
    }"#;

    const RESEARCH_REPORT_UNKNOWN_COMPANY: &str = r#"{
        "company": {"code": "999999", "full_name": "unknown co", "short_name": "unknown", "exchange": "SZSE"},
        "doc_type": "research_report",
        "title": "some report",
        "concepts": []
    }"#;

    #[test]
    fn archives_a_single_new_document() {
        let storage = storage();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.json");
        std::fs::write(&file, ANNUAL_REPORT).unwrap();

        let summary = run(&storage, &file);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.exit_code(), 0);
        assert!(storage.get_company("300257").unwrap().is_some());
    }

    #[test]
    fn re_archiving_the_same_file_is_idempotent() {
        let storage = storage();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.json");
        std::fs::write(&file, ANNUAL_REPORT).unwrap();

        run(&storage, &file);
        let summary = run(&storage, &file);
        assert_eq!(summary.already_existed, 1);
        assert_eq!(summary.archived, 0);
    }

    #[test]
    fn skips_research_report_for_unknown_company() {
        let storage = storage();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.json");
        std::fs::write(&file, RESEARCH_REPORT_UNKNOWN_COMPANY).unwrap();

        let summary = run(&storage, &file);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.archived, 0);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn archives_every_json_file_in_a_directory() {
        let storage = storage();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), ANNUAL_REPORT).unwrap();
        std::fs::write(dir.path().join("not-json.txt"), "ignored").unwrap();

        let summary = run(&storage, dir.path());
        assert_eq!(summary.total, 1);
        assert_eq!(summary.archived, 1);
    }
}
