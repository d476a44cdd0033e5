//! `vectorize [--rebuild-all] [--company-code CODE]` (spec §6.4): drives the
//! Vectorization Use-Case (C8).

use ashareinsight_core::usecases::vectorization::{vectorize, VectorizationMode, DEFAULT_PAGE_SIZE};
use ashareinsight_core::{EmbeddingClient, Storage};

/// Pre-tokenization character cap passed to `BusinessConcept::vectorization_text`.
const MAX_TEXT_CHARS: usize = 8192;

pub struct VectorizeArgs {
    pub rebuild_all: bool,
    pub company_code: Option<String>,
}

pub async fn run(storage: &Storage, embedding_client: &EmbeddingClient, args: VectorizeArgs) -> i32 {
    let company_id = match args.company_code.as_deref() {
        None => None,
        Some(code) => match storage.get_company(code) {
            Ok(Some(company)) => Some(company.company_id),
            Ok(None) => {
                tracing::error!(code, "no such company");
                return 1;
            }
            Err(e) => {
                tracing::error!(code, error = %e, "failed to resolve company");
                return 3;
            }
        },
    };

    let mode = if args.rebuild_all {
        VectorizationMode::FullRebuild
    } else {
        VectorizationMode::Incremental
    };

    match vectorize(storage, embedding_client, company_id, mode, MAX_TEXT_CHARS, DEFAULT_PAGE_SIZE).await {
        Ok(report) => {
            tracing::info!(
                processed = report.processed,
                skipped_dimension_mismatch = report.skipped_dimension_mismatch,
                "vectorization complete"
            );
            if report.skipped_dimension_mismatch > 0 {
                1
            } else {
                0
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "vectorization failed");
            3
        }
    }
}
