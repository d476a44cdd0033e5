//! `fuse <doc_id | all-unfused>` (spec §6.4): replays the Fusion Service
//! (C7) for already-archived documents, reading their concepts back out of
//! `raw_llm_output` (spec §4.10: "Failed documents are replayable by
//! re-running fusion given their raw_llm_output").

use ashareinsight_core::usecases::fusion::fuse_document;
use ashareinsight_core::{ProcessingStatus, SourceDocument, Storage};
use chrono::Utc;
use uuid::Uuid;

use crate::extraction::ExtractionFile;

pub struct FuseSummary {
    pub total: usize,
    pub fused: usize,
    pub failed: usize,
}

impl FuseSummary {
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// `target` is either a `doc_id` (UUID) or the literal `all-unfused`.
pub fn run(storage: &Storage, target: &str) -> FuseSummary {
    let documents = if target == "all-unfused" {
        storage.list_unfused_documents().unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to list unfused documents");
            Vec::new()
        })
    } else {
        match Uuid::parse_str(target) {
            Ok(id) => match storage.get_document(id) {
                Ok(Some(doc)) => vec![doc],
                Ok(None) => {
                    tracing::error!(doc_id = %id, "no such document");
                    Vec::new()
                }
                Err(e) => {
                    tracing::error!(doc_id = %id, error = %e, "failed to load document");
                    Vec::new()
                }
            },
            Err(_) => {
                tracing::error!(target, "expected a doc_id (UUID) or 'all-unfused'");
                Vec::new()
            }
        }
    };

    let mut summary = FuseSummary { total: documents.len(), fused: 0, failed: 0 };
    for doc in documents {
        match fuse_one(storage, &doc) {
            Ok(report) => {
                if report.failed.is_empty() {
                    summary.fused += 1;
                } else {
                    summary.failed += 1;
                }
                tracing::info!(
                    document_id = %doc.document_id,
                    inserted = report.inserted,
                    updated = report.updated,
                    per_concept_failures = report.failed.len(),
                    "fusion replayed"
                );
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(document_id = %doc.document_id, error = %e, "fusion replay failed");
            }
        }
    }
    summary
}

fn fuse_one(
    storage: &Storage,
    doc: &SourceDocument,
) -> Result<ashareinsight_core::usecases::fusion::FusionReport, String> {
    let extraction: ExtractionFile = serde_json::from_value(doc.raw_llm_output.clone())
        .map_err(|e| format!("raw_llm_output is not a replayable extraction: {e}"))?;

    let report = fuse_document(storage, doc.company_id, doc.document_id, &extraction.concepts, Utc::now().date_naive());

    let status = if report.failed.is_empty() {
        ProcessingStatus::Completed
    } else {
        ProcessingStatus::Failed
    };
    let error_text = (!report.failed.is_empty()).then(|| {
        report.failed.iter().map(|(name, err)| format!("{name}: {err}")).collect::<Vec<_>>().join("; ")
    });
    storage
        .set_document_status(doc.document_id, status, error_text.as_deref())
        .map_err(|e| e.to_string())?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionFile;
    use ashareinsight_core::search::VectorIndexConfig;
    use ashareinsight_core::usecases::archival::{archive_document, ArchivalInput, ArchivalOutcome};
    use ashareinsight_core::ProcessingStatus;
    use chrono::NaiveDate;

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
                "details": {
                    "timeline": {
                        "events": [{"date": "2020-06-01", "event": "IPO"}]
                    }
                },
                "importance_score": 0.9
            }
        ]
    }"#;

    fn archive_fixture(storage: &Storage) -> Uuid {
        let extraction = ExtractionFile::parse(ANNUAL_REPORT).unwrap();
        let input = ArchivalInput {
            company: extraction.company.clone().into(),
            doc_type: extraction.doc_type,
            title: extraction.title.clone(),
            file_path: "fixture.json".into(),
            file_hash: "deadbeef".into(),
            published_at: extraction.published_at.unwrap(),
            raw_llm_output: serde_json::to_value(&extraction).unwrap(),
            extraction_metadata: extraction.extraction_metadata.clone(),
            concepts: extraction.concepts.clone(),
        };
        match archive_document(storage, input, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()).unwrap() {
            ArchivalOutcome::Archived { document_id, .. } => document_id,
            other => panic!("expected Archived, got {other:?}"),
        }
    }

    #[test]
    fn replays_fusion_for_a_specific_document() {
        let storage = Storage::open_in_memory(VectorIndexConfig::default()).unwrap();
        let document_id = archive_fixture(&storage);

        // Force the document back to pending to exercise a manual replay.
        storage.set_document_status(document_id, ProcessingStatus::Pending, None).unwrap();

        let summary = run(&storage, &document_id.to_string());
        assert_eq!(summary.total, 1);
        assert_eq!(summary.fused, 1);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn replaying_the_same_document_does_not_duplicate_timeline_events() {
        let storage = Storage::open_in_memory(VectorIndexConfig::default()).unwrap();
        let document_id = archive_fixture(&storage);
        let company = storage.get_company("300257").unwrap().unwrap();

        // Replay the exact same doc_id twice, as `fuse <doc_id>` does for a
        // failed or re-run document.
        storage.set_document_status(document_id, ProcessingStatus::Pending, None).unwrap();
        run(&storage, &document_id.to_string());
        storage.set_document_status(document_id, ProcessingStatus::Pending, None).unwrap();
        run(&storage, &document_id.to_string());

        let concept = storage
            .find_active_concept(company.company_id, "螺杆空气压缩机")
            .unwrap()
            .unwrap();
        assert_eq!(concept.details.timeline.events.len(), 1);
    }

    #[test]
    fn fuses_all_unfused_documents() {
        let storage = Storage::open_in_memory(VectorIndexConfig::default()).unwrap();
        let document_id = archive_fixture(&storage);
        storage.set_document_status(document_id, ProcessingStatus::Failed, Some("retry")).unwrap();

        let summary = run(&storage, "all-unfused");
        assert_eq!(summary.total, 1);
        assert_eq!(summary.fused, 1);
    }

    #[test]
    fn unknown_target_yields_zero_total() {
        let storage = Storage::open_in_memory(VectorIndexConfig::default()).unwrap();
        let summary = run(&storage, "not-a-uuid");
        assert_eq!(summary.total, 0);
        assert_eq!(summary.exit_code(), 0);
    }
}
