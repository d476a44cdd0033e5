//! Archival Use-Case (C6): the entry point for a newly extracted document.
//! Company upsert and document insert happen in one transaction and are
//! idempotent on `(company_code, file_hash)`; fusion of the document's
//! concepts runs afterward as its own unit of work so a fusion failure
//! never rolls back an already-archived document (spec §4.5).

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{DocumentType, ExtractionMetadata};
use crate::error::ArchivalError;
use crate::storage::{upsert_company_tx, CompanyUpsert, NewSourceDocument, Storage};
use crate::usecases::fusion::{fuse_document, ExtractedConcept, FusionReport};

/// Everything needed to archive one extracted document.
pub struct ArchivalInput {
    pub company: CompanyUpsert,
    pub doc_type: DocumentType,
    pub title: String,
    pub file_path: String,
    pub file_hash: String,
    pub published_at: DateTime<Utc>,
    pub raw_llm_output: serde_json::Value,
    pub extraction_metadata: ExtractionMetadata,
    pub concepts: Vec<ExtractedConcept>,
}

#[derive(Debug)]
pub enum ArchivalOutcome {
    /// The document (and, on first archival, the concepts it extracted)
    /// was processed. `already_existed` mirrors [`Storage::archive_document`]:
    /// when `true`, fusion did not run because this exact `(company_code,
    /// file_hash)` pair was archived before.
    Archived {
        document_id: Uuid,
        already_existed: bool,
        fusion: Option<FusionReport>,
    },
    /// A research report named a company code with no existing `companies`
    /// row. Per spec §4.5, research reports never create a company on
    /// their own (only annual reports do); the archival is skipped rather
    /// than silently fabricating a company.
    SkippedUnknownCompany { code: String },
}

/// Archives one extracted document: upserts its company, inserts the
/// document (both inside one transaction, idempotent on file hash), then
/// fuses its concepts into the company's master set.
pub fn archive_document(
    storage: &Storage,
    input: ArchivalInput,
    today: NaiveDate,
) -> Result<ArchivalOutcome, ArchivalError> {
    if matches!(input.doc_type, DocumentType::ResearchReport)
        && storage.get_company(&input.company.code)?.is_none()
    {
        tracing::warn!(
            code = %input.company.code,
            "research report references unknown company, skipping archival"
        );
        return Ok(ArchivalOutcome::SkippedUnknownCompany {
            code: input.company.code,
        });
    }

    let company_upsert = input.company.clone();
    let (company_id, document_id, already_existed) = storage.transaction(|tx| {
        let company = upsert_company_tx(tx, company_upsert)?;
        let (document_id, already_existed) = crate::storage::archive_document_tx(
            tx,
            NewSourceDocument {
                company_id: company.company_id,
                doc_type: input.doc_type,
                title: input.title.clone(),
                file_path: input.file_path.clone(),
                file_hash: input.file_hash.clone(),
                published_at: input.published_at,
                raw_llm_output: input.raw_llm_output.clone(),
                extraction_metadata: input.extraction_metadata.clone(),
            },
        )?;
        Ok((company.company_id, document_id, already_existed))
    })?;

    if already_existed {
        return Ok(ArchivalOutcome::Archived {
            document_id,
            already_existed: true,
            fusion: None,
        });
    }

    let fusion = fuse_document(storage, company_id, document_id, &input.concepts, today);
    let status = if fusion.failed.is_empty() {
        crate::domain::ProcessingStatus::Completed
    } else {
        crate::domain::ProcessingStatus::Failed
    };
    let error_text = if fusion.failed.is_empty() {
        None
    } else {
        Some(
            fusion
                .failed
                .iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    };
    storage.set_document_status(document_id, status, error_text.as_deref())?;

    Ok(ArchivalOutcome::Archived {
        document_id,
        already_existed: false,
        fusion: Some(fusion),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConceptCategory, ConceptDetails};
    use crate::search::VectorIndexConfig;

    fn storage() -> Storage {
        Storage::open_in_memory(VectorIndexConfig {
            dimensions: 4,
            m: 8,
            ef_construction: 32,
            ef_search: 32,
        })
        .unwrap()
    }

    fn input(code: &str, doc_type: DocumentType, file_hash: &str) -> ArchivalInput {
        ArchivalInput {
            company: CompanyUpsert {
                code: code.into(),
                full_name: format!("{code} Full Name"),
                short_name: format!("{code}-short"),
                exchange: "SZSE".into(),
            },
            doc_type,
            title: "2025 annual report".into(),
            file_path: format!("/reports/{code}.pdf"),
            file_hash: file_hash.into(),
            published_at: Utc::now(),
            raw_llm_output: serde_json::json!({}),
            extraction_metadata: ExtractionMetadata::default(),
            concepts: vec![ExtractedConcept {
                concept_name: "螺杆空气压缩机".into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "成熟".into(),
                details: ConceptDetails::default(),
                importance_score: 0.8,
            }],
        }
    }

    #[test]
    fn annual_report_creates_company_and_fuses_concepts() {
        let s = storage();
        let today = "2026-07-28".parse().unwrap();
        let outcome = archive_document(&s, input("300257", DocumentType::AnnualReport, "h1"), today).unwrap();
        match outcome {
            ArchivalOutcome::Archived { already_existed, fusion, .. } => {
                assert!(!already_existed);
                assert_eq!(fusion.unwrap().inserted, 1);
            }
            _ => panic!("expected archived"),
        }
        assert!(s.get_company("300257").unwrap().is_some());
    }

    #[test]
    fn re_archiving_same_file_hash_is_idempotent_and_skips_fusion() {
        let s = storage();
        let today = "2026-07-28".parse().unwrap();
        archive_document(&s, input("300257", DocumentType::AnnualReport, "h1"), today).unwrap();
        let second = archive_document(&s, input("300257", DocumentType::AnnualReport, "h1"), today).unwrap();
        match second {
            ArchivalOutcome::Archived { already_existed, fusion, .. } => {
                assert!(already_existed);
                assert!(fusion.is_none());
            }
            _ => panic!("expected archived"),
        }
    }

    #[test]
    fn research_report_for_unknown_company_is_skipped() {
        let s = storage();
        let today = "2026-07-28".parse().unwrap();
        let outcome =
            archive_document(&s, input("999999", DocumentType::ResearchReport, "h1"), today).unwrap();
        assert!(matches!(outcome, ArchivalOutcome::SkippedUnknownCompany { .. }));
        assert!(s.get_company("999999").unwrap().is_none());
    }

    #[test]
    fn research_report_for_known_company_proceeds() {
        let s = storage();
        let today = "2026-07-28".parse().unwrap();
        archive_document(&s, input("300257", DocumentType::AnnualReport, "h1"), today).unwrap();
        let outcome =
            archive_document(&s, input("300257", DocumentType::ResearchReport, "h2"), today).unwrap();
        assert!(matches!(outcome, ArchivalOutcome::Archived { .. }));
    }
}
