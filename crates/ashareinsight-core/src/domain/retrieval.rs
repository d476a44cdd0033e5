//! Ephemeral value objects produced and consumed only within one retrieval
//! request — never persisted.

use serde::{Deserialize, Serialize};

/// One matched concept surfaced for a candidate company, before aggregation.
///
/// `source_concept_id` is the query company's concept whose recall produced
/// this hit (spec §4.8 step 4: "decorated with the source_concept_id that
/// recalled it"); it also serves as the deterministic tie-break key in step
/// 8 when two documents land on the same `final_score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub concept_id: uuid::Uuid,
    pub company_id: uuid::Uuid,
    pub concept_name: String,
    pub source_concept_id: uuid::Uuid,
    pub similarity: f32,
    pub rerank_score: Option<f32>,
    pub importance_score: f32,
    pub final_score: f32,
    pub evidence: Option<String>,
}

/// Orders documents by descending `final_score`, ties broken by ascending
/// `concept_id` (spec §4.8 step 8: "ties broken by concept_id to guarantee
/// determinism").
pub fn sort_documents_deterministically(documents: &mut [Document]) {
    documents.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.concept_id.cmp(&b.concept_id))
    });
}

/// A candidate company with its matched concepts aggregated, ready for
/// market filtering and pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCompany {
    pub company_id: uuid::Uuid,
    pub code: String,
    pub name: String,
    pub company_score: f32,
    pub matched_concepts: Vec<Document>,
}

/// Aggregation strategy for rolling per-concept `final_score`s up into one
/// per-company score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    Max,
    Mean,
}

/// How many of a company's matched concepts are retained in the response,
/// per spec's "top-5 concepts" aggregation rule.
pub const TOP_CONCEPTS_PER_COMPANY: usize = 5;

/// Rolls a company's matched documents (already deduped, already scored)
/// into one `AggregatedCompany`, keeping only the top
/// [`TOP_CONCEPTS_PER_COMPANY`] concepts by `final_score`.
pub fn aggregate_company(
    company_id: uuid::Uuid,
    code: String,
    name: String,
    mut documents: Vec<Document>,
    strategy: AggregationStrategy,
) -> AggregatedCompany {
    sort_documents_deterministically(&mut documents);
    documents.truncate(TOP_CONCEPTS_PER_COMPANY);

    let company_score = match strategy {
        AggregationStrategy::Max => documents
            .iter()
            .map(|d| d.final_score)
            .fold(f32::MIN, f32::max),
        AggregationStrategy::Mean => {
            if documents.is_empty() {
                0.0
            } else {
                documents.iter().map(|d| d.final_score).sum::<f32>() / documents.len() as f32
            }
        }
    };

    AggregatedCompany {
        company_id,
        code,
        name,
        company_score,
        matched_concepts: documents,
    }
}

/// Sorts aggregated companies by descending `company_score`, ascending
/// `code` as the stable tie-break (spec §4.8 step 9).
pub fn sort_companies_deterministically(companies: &mut [AggregatedCompany]) {
    companies.sort_by(|a, b| {
        b.company_score
            .total_cmp(&a.company_score)
            .then_with(|| a.code.cmp(&b.code))
    });
}
