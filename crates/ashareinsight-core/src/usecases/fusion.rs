//! Fusion Service (C7): merges a freshly extracted concept into the
//! existing master row for the same `(company_id, concept_name)`, or
//! inserts it as new. The field-level merge table and the optimistic-lock
//! retry loop below are the single hardest piece of business logic in the
//! system (spec §4.6).
//!
//! Storage is synchronous (`rusqlite` over a `Mutex<Connection>`), so this
//! driver is synchronous too and blocks its caller for the duration of a
//! batch — callers on an async runtime (the CLI's `fuse`/`archive` verbs)
//! run it inside `tokio::task::spawn_blocking`.

use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::domain::{hash_description, BusinessConcept, ConceptCategory, ConceptDetails};
use crate::error::{FusionError, StorageError};
use crate::storage::{NewConcept, Storage};

/// Concepts are fused in batches of this size (spec §4.6 default `B=50`).
pub const FUSION_BATCH_SIZE: usize = 50;
/// Optimistic-lock / unique-violation retries per concept before giving up
/// (spec §4.6 default `N=3`).
pub const FUSION_MAX_RETRIES: u32 = 3;

/// One concept as produced by an extraction, before it is merged into the
/// company's master set. Mirrors [`NewConcept`] minus the identifiers
/// fusion itself assigns. Also the wire shape for one concept inside an
/// archived extraction file, so a document's `raw_llm_output` can be
/// deserialized straight back into fusion's input on replay (CLI `fuse`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExtractedConcept {
    pub concept_name: String,
    pub concept_category: ConceptCategory,
    pub description: String,
    pub development_stage: String,
    pub details: ConceptDetails,
    pub importance_score: f32,
}

#[derive(Debug, Default)]
pub struct FusionReport {
    pub inserted: usize,
    pub updated: usize,
    /// `(concept_name, error message)` for concepts that exhausted retries
    /// or hit a non-retryable error — isolated so one bad concept never
    /// aborts the rest of the document (spec §4.6's failure-isolation rule).
    pub failed: Vec<(String, String)>,
}

/// What a single fusion decides to do with one concept, before it is
/// applied to storage. Exposed mainly so the merge rules can be unit
/// tested without a database.
#[derive(Debug, Clone)]
pub enum FusionAction {
    Insert(NewConcept),
    Update {
        updated: BusinessConcept,
        expected_version: i64,
        /// `true` when the merged description's hash differs from the
        /// stored one — the embedding is stale and must be nulled so C8
        /// picks the concept back up (Open Question #1).
        clear_embedding: bool,
    },
}

/// Pure merge function: decides how `incoming` combines with `existing`
/// (`None` for a brand-new concept name). Field-level rules per spec §4.6:
/// `concept_category`/`importance_score`/`development_stage`/`metrics`
/// overwrite; `description` keeps whichever is longer; `timeline.established`
/// is kept once set; `timeline.events` accrues one entry per fusion;
/// `relations`/`source_sentences` are cumulative set-unions (capped at 20
/// for sentences); `last_updated_from_doc_id` always moves to the new
/// document.
pub fn plan_fusion(
    existing: Option<&BusinessConcept>,
    incoming: &ExtractedConcept,
    company_id: Uuid,
    doc_id: Uuid,
    today: NaiveDate,
) -> FusionAction {
    match existing {
        None => FusionAction::Insert(NewConcept {
            company_id,
            concept_name: incoming.concept_name.clone(),
            concept_category: incoming.concept_category,
            description: incoming.description.clone(),
            development_stage: incoming.development_stage.clone(),
            details: incoming.details.clone(),
            importance_score: incoming.importance_score,
            last_updated_from_doc_id: doc_id,
        }),
        Some(existing) => {
            let mut updated = existing.clone();
            updated.concept_category = incoming.concept_category;

            let keep_existing_description =
                existing.description.chars().count() >= incoming.description.chars().count();
            if !keep_existing_description {
                updated.description = incoming.description.clone();
            }
            let new_hash = hash_description(&updated.description);
            let clear_embedding = new_hash != existing.description_hash;
            updated.description_hash = new_hash;

            updated.importance_score = incoming.importance_score;
            updated.development_stage = incoming.development_stage.clone();
            updated.details.metrics = incoming.details.metrics.clone();
            // A replay of the same document must not re-append its timeline
            // event (spec §8's fusion-idempotent-on-replay property).
            let already_applied = existing.last_updated_from_doc_id == doc_id;
            updated.details.merge_cumulative_fields(&incoming.details, today, already_applied);
            updated.last_updated_from_doc_id = doc_id;

            FusionAction::Update {
                updated,
                expected_version: existing.version,
                clear_embedding,
            }
        }
    }
}

/// Fuses every concept extracted from one document into `company_id`'s
/// master set, in batches of [`FUSION_BATCH_SIZE`]. Failures are isolated
/// per concept: a concept that exhausts its retries is recorded in
/// [`FusionReport::failed`] and fusion continues with the rest.
pub fn fuse_document(
    storage: &Storage,
    company_id: Uuid,
    doc_id: Uuid,
    concepts: &[ExtractedConcept],
    today: NaiveDate,
) -> FusionReport {
    let mut report = FusionReport::default();
    for batch in concepts.chunks(FUSION_BATCH_SIZE) {
        for concept in batch {
            match fuse_one_with_retry(storage, company_id, doc_id, concept, today, FUSION_MAX_RETRIES) {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    tracing::error!(
                        concept_name = %concept.concept_name,
                        error = %e,
                        "fusion failed for concept, continuing with remaining concepts"
                    );
                    report.failed.push((concept.concept_name.clone(), e.to_string()));
                }
            }
        }
    }
    report
}

/// Re-reads, plans, and applies one concept, retrying on the two races that
/// can legitimately occur under concurrent fusion of the same company:
/// a concurrent insert of the same name (`UniqueViolation`) or a concurrent
/// update of the same row (`OptimisticLock`). Returns `Ok(true)` for an
/// insert, `Ok(false)` for an update.
fn fuse_one_with_retry(
    storage: &Storage,
    company_id: Uuid,
    doc_id: Uuid,
    incoming: &ExtractedConcept,
    today: NaiveDate,
    max_retries: u32,
) -> Result<bool, FusionError> {
    let mut attempt = 1;
    loop {
        let existing = storage.find_active_concept(company_id, &incoming.concept_name)?;
        let action = plan_fusion(existing.as_ref(), incoming, company_id, doc_id, today);

        let result = match action {
            FusionAction::Insert(new_concept) => storage.insert_concept(new_concept).map(|_| true),
            FusionAction::Update {
                updated,
                expected_version,
                clear_embedding,
            } => storage
                .update_concept(&updated, expected_version, clear_embedding)
                .map(|_| false),
        };

        match result {
            Ok(is_insert) => return Ok(is_insert),
            Err(e) => {
                let retryable =
                    matches!(e, StorageError::UniqueViolation(_) | StorageError::OptimisticLock { .. });
                if retryable && attempt < max_retries {
                    // 0.1 * attempt second backoff, mirroring the retry
                    // policy's fixed-backoff formula (resilience::RetryPolicy).
                    thread::sleep(Duration::from_secs_f64(0.1 * attempt as f64));
                    attempt += 1;
                    continue;
                }
                if retryable {
                    return Err(FusionError::RetriesExhausted {
                        attempts: attempt,
                        concept_name: incoming.concept_name.clone(),
                    });
                }
                return Err(FusionError::Storage(e));
            }
        }
    }
}
