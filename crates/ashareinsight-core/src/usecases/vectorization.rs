//! Vectorization Use-Case (C8): drives concepts without a current embedding
//! through the embedding client and back into storage, in checkpoint-
//! resumable pages (spec §4.7).

use uuid::Uuid;

use crate::clients::EmbeddingClient;
use crate::error::VectorizationError;
use crate::storage::Storage;

/// Default page size for the scan over `business_concepts` (bounded well
/// above [`crate::clients::embedding::BATCH_SIZE`] — the embedding client
/// re-chunks internally, this only bounds how much is read/written to
/// SQLite per round trip).
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorizationMode {
    /// Re-embed every active concept regardless of current embedding state.
    FullRebuild,
    /// Only concepts with `embedding IS NULL` (new concepts, or concepts
    /// whose description changed under fusion).
    Incremental,
}

#[derive(Debug, Default, Clone)]
pub struct VectorizationReport {
    pub processed: usize,
    pub skipped_dimension_mismatch: usize,
}

/// Runs one vectorization pass. `company_id` restricts the scan to one
/// company (the CLI's `--company-code` filter, already resolved by the
/// caller); `None` scans the whole concept store.
pub async fn vectorize(
    storage: &Storage,
    embedding_client: &EmbeddingClient,
    company_id: Option<Uuid>,
    mode: VectorizationMode,
    max_text_chars: usize,
    page_size: usize,
) -> Result<VectorizationReport, VectorizationError> {
    let only_missing = matches!(mode, VectorizationMode::Incremental);
    let mut report = VectorizationReport::default();

    let mut after = if only_missing {
        storage.get_vectorization_checkpoint()?
    } else {
        None
    };

    loop {
        let batch =
            storage.list_concepts_for_vectorization(company_id, after, page_size, only_missing)?;
        if batch.is_empty() {
            break;
        }

        let texts: Vec<String> = batch.iter().map(|c| c.vectorization_text(max_text_chars)).collect();
        let vectors = embedding_client.embed_batch(&texts).await?;

        let mut writes = Vec::with_capacity(batch.len());
        for (concept, vector) in batch.iter().zip(vectors.into_iter()) {
            if vector.len() != embedding_client.dimensions() {
                report.skipped_dimension_mismatch += 1;
                tracing::error!(
                    concept_id = %concept.concept_id,
                    expected = embedding_client.dimensions(),
                    got = vector.len(),
                    "embedding dimension mismatch, concept remains scheduled for vectorization"
                );
                continue;
            }
            writes.push((concept.concept_id, vector));
        }
        if !writes.is_empty() {
            storage.batch_update_embeddings(&writes)?;
            report.processed += writes.len();
        }

        let reached = batch.len() < page_size;
        after = batch.last().map(|c| c.concept_id);
        if only_missing {
            if let Some(id) = after {
                storage.set_vectorization_checkpoint(id)?;
            }
        }
        if reached {
            break;
        }
    }

    Ok(report)
}
