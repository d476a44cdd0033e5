//! Wire shapes for `POST /api/v1/search/similar-companies` (spec §6.1),
//! translated from the internal [`ashareinsight_core::usecases::retrieval`]
//! types at the boundary so the internal field names (`company_code`,
//! `concept_name`, ...) stay free to evolve independently of the contract.

use ashareinsight_core::usecases::retrieval::{CompanyResult, RetrievalResponse};
use ashareinsight_core::usecases::market_filter::RequestedMarketFilters;
use ashareinsight_core::domain::AggregationStrategy;
use serde::{Deserialize, Serialize};

fn default_top_k() -> usize {
    20
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_aggregation_strategy() -> String {
    "max".into()
}

/// Mirrors spec §6.1's `market_filters` object verbatim, including the
/// `min_5day_avg_volume` field name kept "for compatibility" even though it
/// is used as an upper-bound exclusion threshold, not a minimum.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MarketFiltersDto {
    #[serde(default)]
    pub max_market_cap_cny: Option<f64>,
    #[serde(default)]
    pub min_5day_avg_volume: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchRequest {
    pub query_identifier: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_aggregation_strategy")]
    pub aggregation_strategy: String,
    #[serde(default)]
    pub market_filters: Option<MarketFiltersDto>,
}

/// `include_justification` is a query-string parameter, not a body field
/// (spec §6.1: `POST .../similar-companies?include_justification={bool}`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub include_justification: bool,
}

impl SearchRequest {
    pub fn aggregation_strategy(&self) -> Result<AggregationStrategy, String> {
        match self.aggregation_strategy.as_str() {
            "max" => Ok(AggregationStrategy::Max),
            "mean" => Ok(AggregationStrategy::Mean),
            other => Err(format!("aggregation_strategy must be 'max' or 'mean', got '{other}'")),
        }
    }

    pub fn market_filters(&self) -> RequestedMarketFilters {
        let filters = self.market_filters.clone().unwrap_or_default();
        RequestedMarketFilters {
            max_market_cap_cny: filters.max_market_cap_cny,
            max_avg_volume_5d: filters.min_5day_avg_volume,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryCompanyDto {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchedConceptDto {
    pub name: String,
    pub similarity_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct JustificationDto {
    pub summary: String,
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompanyResultDto {
    pub company_code: String,
    pub company_name: String,
    pub relevance_score: f32,
    pub matched_concepts: Vec<MatchedConceptDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<JustificationDto>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiltersAppliedDto {
    pub market_filter_applied: bool,
    pub reranked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataDto {
    pub total_results_before_limit: usize,
    pub filters_applied: FiltersAppliedDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponseDto {
    pub query_company: QueryCompanyDto,
    pub metadata: MetadataDto,
    pub results: Vec<CompanyResultDto>,
}

impl From<RetrievalResponse> for SearchResponseDto {
    fn from(r: RetrievalResponse) -> Self {
        Self {
            query_company: QueryCompanyDto {
                code: r.query_company.company_code,
                name: r.query_company.company_name,
            },
            metadata: MetadataDto {
                total_results_before_limit: r.metadata.total_results_before_limit,
                filters_applied: FiltersAppliedDto {
                    market_filter_applied: r.metadata.filters_applied.market_filter_applied,
                    reranked: r.metadata.filters_applied.reranked,
                },
                note: r.metadata.note,
            },
            results: r.results.into_iter().map(company_result_dto).collect(),
        }
    }
}

fn company_result_dto(c: CompanyResult) -> CompanyResultDto {
    let justification = c.justification.map(|j| JustificationDto {
        summary: summarize(&c.company_name, j.supporting_evidence.len()),
        supporting_evidence: j.supporting_evidence,
    });
    CompanyResultDto {
        company_code: c.company_code,
        company_name: c.company_name,
        relevance_score: c.relevance_score,
        matched_concepts: c
            .matched_concepts
            .into_iter()
            .map(|m| MatchedConceptDto { name: m.concept_name, similarity_score: m.similarity_score })
            .collect(),
        justification,
    }
}

/// Justification has no natural-language field internally (spec §4.8
/// step 11 only specifies sentence evidence) — synthesize one line here,
/// the one place the HTTP contract's `summary` field is filled in.
fn summarize(company_name: &str, evidence_count: usize) -> String {
    if evidence_count == 0 {
        format!("{company_name} matched on business concept similarity")
    } else {
        format!("{company_name} matched on business concept similarity, supported by {evidence_count} source sentence(s)")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_defaults_match_the_documented_contract() {
        let req: SearchRequest = serde_json::from_str(r#"{"query_identifier": "300257"}"#).unwrap();
        assert_eq!(req.top_k, 20);
        assert_eq!(req.similarity_threshold, 0.7);
        assert_eq!(req.aggregation_strategy, "max");
        assert!(req.market_filters.is_none());
    }

    #[test]
    fn market_filters_nested_object_is_accepted_with_compat_field_name() {
        let req: SearchRequest = serde_json::from_str(
            r#"{
                "query_identifier": "300257",
                "market_filters": {"max_market_cap_cny": 8500000000, "min_5day_avg_volume": 200000000}
            }"#,
        )
        .unwrap();
        let filters = req.market_filters();
        assert_eq!(filters.max_market_cap_cny, Some(8_500_000_000.0));
        assert_eq!(filters.max_avg_volume_5d, Some(200_000_000.0));
    }

    #[test]
    fn include_justification_is_not_part_of_the_request_body() {
        let req: Result<SearchRequest, _> = serde_json::from_str(
            r#"{"query_identifier": "300257", "include_justification": true}"#,
        );
        // unknown fields are ignored by default (no deny_unknown_fields), the
        // query-string parameter is what actually controls this (spec §6.1).
        assert!(req.is_ok());
    }
}
