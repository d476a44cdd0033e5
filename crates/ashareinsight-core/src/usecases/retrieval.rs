//! Retrieval Use-Case (C9): resolves a query company, fans its active
//! concepts out across the vector index, reranks and scores the hits,
//! aggregates by candidate company, applies the market filter, paginates,
//! and optionally justifies the result — the thirteen-step pipeline of
//! spec §4.8, cached by request fingerprint.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use uuid::Uuid;

use crate::cache::TtlLruCache;
use crate::clients::RerankClient;
use crate::config::Config;
use crate::domain::{
    aggregate_company, sort_companies_deterministically, AggregationStrategy, Document,
};
use crate::error::RetrievalError;
use crate::storage::Storage;
use crate::usecases::market_filter::{apply_market_filter, MarketFilterOutcome, RequestedMarketFilters};

/// Top-3 source sentences surfaced per matched concept when justification
/// is requested (spec §4.8 step 11).
pub const JUSTIFICATION_SENTENCES: usize = 3;

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query_identifier: String,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub aggregation_strategy: AggregationStrategy,
    pub market_filters: RequestedMarketFilters,
    pub include_justification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryCompanySummary {
    pub company_code: String,
    pub company_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedConceptView {
    pub concept_name: String,
    pub similarity_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Justification {
    pub supporting_evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyResult {
    pub company_code: String,
    pub company_name: String,
    pub relevance_score: f32,
    pub matched_concepts: Vec<MatchedConceptView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<Justification>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiltersApplied {
    pub market_filter_applied: bool,
    pub reranked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalMetadata {
    pub total_results_before_limit: usize,
    pub filters_applied: FiltersApplied,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResponse {
    pub query_company: QueryCompanySummary,
    pub metadata: RetrievalMetadata,
    pub results: Vec<CompanyResult>,
}

/// Orchestrates one similar-companies lookup. `storage` is `Arc`-wrapped
/// because step 4's parallel recall spawns one task per source concept,
/// each needing its own handle into the (thread-safe) connection.
pub async fn retrieve(
    storage: Arc<Storage>,
    rerank_client: Option<&RerankClient>,
    cache: &AsyncMutex<TtlLruCache<String, RetrievalResponse>>,
    config: &Config,
    request: RetrievalRequest,
) -> Result<RetrievalResponse, RetrievalError> {
    // Step 1: resolve the query company.
    let company = {
        let storage = storage.clone();
        let identifier = request.query_identifier.clone();
        tokio::task::spawn_blocking(move || storage.get_company(&identifier))
            .await
            .expect("blocking task panicked")?
    }
    .ok_or_else(|| RetrievalError::CompanyNotFound(request.query_identifier.clone()))?;

    // Step 2: fetch the query company's active concepts.
    let source_concepts = {
        let storage = storage.clone();
        let company_id = company.company_id;
        tokio::task::spawn_blocking(move || storage.list_active_concepts(company_id))
            .await
            .expect("blocking task panicked")?
    };

    if source_concepts.is_empty() {
        return Ok(RetrievalResponse {
            query_company: QueryCompanySummary {
                company_code: company.code,
                company_name: company.full_name,
            },
            metadata: RetrievalMetadata {
                total_results_before_limit: 0,
                filters_applied: FiltersApplied {
                    market_filter_applied: false,
                    reranked: false,
                },
                note: Some("query company has no active business concepts".into()),
            },
            results: vec![],
        });
    }

    // Step 3: cache probe.
    let cache_key = fingerprint(&request);
    {
        let mut cache = cache.lock().await;
        if let Some(hit) = cache.get(&cache_key) {
            return Ok(hit);
        }
    }

    // Step 4: parallel vector recall, one task per source concept that
    // already has an embedding (concepts pending vectorization cannot
    // recall anything yet).
    let semaphore = Arc::new(Semaphore::new(config.retrieval_concurrency.max(1)));
    let mut tasks = Vec::new();
    for concept in source_concepts.iter().filter(|c| c.embedding.is_some()) {
        let storage = storage.clone();
        let semaphore = semaphore.clone();
        let embedding = concept.embedding.clone().expect("filtered to Some above");
        let source_concept_id = concept.concept_id;
        let source_importance = concept.importance_score;
        let recall_limit = config.recall_limit;
        let threshold = request.similarity_threshold;

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let hits = tokio::task::spawn_blocking(move || storage.search_similar(&embedding, recall_limit, threshold))
                .await
                .expect("blocking task panicked");
            (source_concept_id, source_importance, hits)
        }));
    }

    let mut raw_hits = Vec::new();
    for task in tasks {
        let (source_concept_id, source_importance, hits) =
            task.await.expect("recall task panicked");
        for hit in hits? {
            raw_hits.push((source_concept_id, source_importance, hit));
        }
    }

    // Step 5: dedup by concept_id, keeping the highest similarity and the
    // source concept that produced it.
    let mut best: HashMap<Uuid, (Uuid, f32, crate::storage::SimilarConceptHit)> = HashMap::new();
    for (source_concept_id, source_importance, hit) in raw_hits {
        best.entry(hit.concept_id)
            .and_modify(|existing| {
                if hit.similarity_score > existing.2.similarity_score {
                    *existing = (source_concept_id, source_importance, hit.clone());
                }
            })
            .or_insert((source_concept_id, source_importance, hit));
    }

    // Step 6: drop self-matches (candidate concept belongs to the query company).
    let candidates: Vec<(Uuid, f32, crate::storage::SimilarConceptHit)> = best
        .into_values()
        .filter(|(_, _, hit)| hit.company_id != company.company_id)
        .collect();

    // Step 7: optional rerank, graceful degradation on failure.
    let mut reranked = false;
    let rerank_scores: HashMap<Uuid, f32> = if let Some(rerank_client) = rerank_client {
        let query_text = source_concepts
            .iter()
            .max_by(|a, b| a.importance_score.total_cmp(&b.importance_score))
            .map(|c| format!("{}: {}", c.concept_name, c.description))
            .unwrap_or_default();
        let documents: Vec<String> = candidates.iter().map(|(_, _, hit)| hit.concept_name.clone()).collect();
        // Reranker asked for every candidate back (`top_k = len`); it may
        // legitimately return fewer (truncation) but never more, and may
        // reorder, so hits are re-attached to candidates by `index` rather
        // than assumed positional.
        let top_k = documents.len();

        match rerank_client.rerank(&query_text, &documents, top_k).await {
            Ok(hits) if hits.len() <= candidates.len() => {
                reranked = true;
                hits.into_iter()
                    .map(|hit| (candidates[hit.index].2.concept_id, hit.score.clamp(0.0, 1.0)))
                    .collect()
            }
            Ok(_) => {
                tracing::warn!("rerank service returned more results than requested, proceeding without reranking");
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank unavailable, proceeding without reranking");
                HashMap::new()
            }
        }
    } else {
        HashMap::new()
    };

    // Step 8: final_score per matched concept.
    let documents: Vec<Document> = candidates
        .into_iter()
        .map(|(source_concept_id, _, hit)| {
            let rerank_score = rerank_scores.get(&hit.concept_id).copied();
            let final_score = match rerank_score {
                Some(r) => config.retrieval_w1_rerank * r + config.retrieval_w2_importance * hit.importance_score,
                None => hit.importance_score,
            };
            Document {
                concept_id: hit.concept_id,
                company_id: hit.company_id,
                concept_name: hit.concept_name,
                source_concept_id,
                similarity: hit.similarity_score,
                rerank_score,
                importance_score: hit.importance_score,
                final_score,
                evidence: None,
            }
        })
        .collect();

    // Step 9: aggregate by company.
    let mut by_company: HashMap<Uuid, Vec<Document>> = HashMap::new();
    for doc in documents {
        by_company.entry(doc.company_id).or_default().push(doc);
    }

    let company_meta = {
        let storage = storage.clone();
        let ids: Vec<Uuid> = by_company.keys().copied().collect();
        tokio::task::spawn_blocking(move || {
            ids.into_iter()
                .filter_map(|id| storage.get_company_by_id(id).ok().flatten().map(|c| (id, c)))
                .collect::<HashMap<_, _>>()
        })
        .await
        .expect("blocking task panicked")
    };

    let mut aggregated: Vec<_> = by_company
        .into_iter()
        .filter_map(|(company_id, docs)| {
            company_meta.get(&company_id).map(|meta| {
                aggregate_company(
                    company_id,
                    meta.code.clone(),
                    meta.full_name.clone(),
                    docs,
                    request.aggregation_strategy,
                )
            })
        })
        .collect();
    sort_companies_deterministically(&mut aggregated);

    // Step 10: market filter.
    let market_data = {
        let storage = storage.clone();
        let ids: Vec<Uuid> = aggregated.iter().map(|c| c.company_id).collect();
        tokio::task::spawn_blocking(move || storage.get_current(&ids))
            .await
            .expect("blocking task panicked")?
    };
    let MarketFilterOutcome {
        companies: filtered,
        applied: market_filter_applied,
        ..
    } = apply_market_filter(
        aggregated,
        &market_data,
        &request.market_filters,
        &config.market_filter,
        config.relevance_mapping_enabled,
    );

    // Step 11: pagination — total is measured after filtering, before the
    // top-K truncation (Open Question #2).
    let total_results_before_limit = filtered.len();
    let page: Vec<_> = filtered.into_iter().take(request.top_k).collect();

    // Step 12: optional justification.
    let results: Vec<CompanyResult> = if request.include_justification {
        let storage = storage.clone();
        let concept_ids: Vec<Uuid> = page
            .iter()
            .flat_map(|c| c.matched_concepts.iter().map(|d| d.concept_id))
            .collect();
        let concepts = tokio::task::spawn_blocking(move || {
            concept_ids
                .into_iter()
                .filter_map(|id| storage.get_concept(id).ok().flatten())
                .map(|c| (c.concept_id, c))
                .collect::<HashMap<_, _>>()
        })
        .await
        .expect("blocking task panicked");

        page.into_iter()
            .map(|c| company_result(c, true, &concepts))
            .collect()
    } else {
        page.into_iter().map(|c| company_result(c, false, &HashMap::new())).collect()
    };

    let response = RetrievalResponse {
        query_company: QueryCompanySummary {
            company_code: company.code,
            company_name: company.full_name,
        },
        metadata: RetrievalMetadata {
            total_results_before_limit,
            filters_applied: FiltersApplied {
                market_filter_applied,
                reranked,
            },
            note: None,
        },
        results,
    };

    // Step 13: cache write.
    {
        let mut cache = cache.lock().await;
        cache.put(cache_key, response.clone());
    }

    Ok(response)
}

fn company_result(
    company: crate::domain::AggregatedCompany,
    include_justification: bool,
    concepts: &HashMap<Uuid, crate::domain::BusinessConcept>,
) -> CompanyResult {
    let justification = include_justification.then(|| {
        let mut evidence = Vec::new();
        for doc in &company.matched_concepts {
            if let Some(concept) = concepts.get(&doc.concept_id) {
                evidence.extend(concept.details.source_sentences.iter().cloned());
            }
            if evidence.len() >= JUSTIFICATION_SENTENCES {
                break;
            }
        }
        evidence.truncate(JUSTIFICATION_SENTENCES);
        Justification { supporting_evidence: evidence }
    });

    CompanyResult {
        company_code: company.code,
        company_name: company.name,
        relevance_score: company.company_score,
        matched_concepts: company
            .matched_concepts
            .iter()
            .map(|d| MatchedConceptView {
                concept_name: d.concept_name.clone(),
                similarity_score: d.similarity,
            })
            .collect(),
        justification,
    }
}

/// Deterministic cache key: same identifier/top_k/threshold/filters always
/// hash to the same fingerprint, regardless of call order.
fn fingerprint(request: &RetrievalRequest) -> String {
    format!(
        "{}|{}|{:.4}|{:?}|{:?}|{:?}|{}",
        request.query_identifier.trim().to_lowercase(),
        request.top_k,
        request.similarity_threshold,
        request.aggregation_strategy,
        request.market_filters.max_market_cap_cny.map(|v| v.to_bits()),
        request.market_filters.max_avg_volume_5d.map(|v| v.to_bits()),
        request.include_justification,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConceptCategory, ConceptDetails};
    use crate::search::VectorIndexConfig;
    use crate::storage::{CompanyUpsert, NewConcept};
    use std::time::Duration;

    fn storage() -> Arc<Storage> {
        Arc::new(
            Storage::open_in_memory(VectorIndexConfig {
                dimensions: 4,
                m: 8,
                ef_construction: 32,
                ef_search: 32,
            })
            .unwrap(),
        )
    }

    fn insert_concept(storage: &Storage, company_id: Uuid, name: &str, importance: f32) -> Uuid {
        storage
            .insert_concept(NewConcept {
                company_id,
                concept_name: name.into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "".into(),
                details: ConceptDetails::default(),
                importance_score: importance,
                last_updated_from_doc_id: Uuid::new_v4(),
            })
            .unwrap()
    }

    fn request(identifier: &str) -> RetrievalRequest {
        RetrievalRequest {
            query_identifier: identifier.into(),
            top_k: 20,
            similarity_threshold: 0.0,
            aggregation_strategy: AggregationStrategy::Max,
            market_filters: RequestedMarketFilters::default(),
            include_justification: false,
        }
    }

    #[tokio::test]
    async fn unknown_company_is_a_retrieval_error() {
        let storage = storage();
        let cache = AsyncMutex::new(TtlLruCache::new(16, Duration::from_secs(60)));
        let config = Config::default();
        let err = retrieve(storage, None, &cache, &config, request("nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::CompanyNotFound(_)));
    }

    #[tokio::test]
    async fn company_with_no_active_concepts_returns_empty_results_with_a_note() {
        let storage = storage();
        storage
            .upsert_company(CompanyUpsert {
                code: "300257".into(),
                full_name: "开山股份".into(),
                short_name: "开山".into(),
                exchange: "SZSE".into(),
            })
            .unwrap();
        let cache = AsyncMutex::new(TtlLruCache::new(16, Duration::from_secs(60)));
        let config = Config::default();
        let response = retrieve(storage, None, &cache, &config, request("300257")).await.unwrap();
        assert!(response.results.is_empty());
        assert!(response.metadata.note.is_some());
    }

    #[tokio::test]
    async fn recalls_similar_concepts_from_other_companies_without_rerank() {
        let storage = storage();
        let query_co = storage
            .upsert_company(CompanyUpsert {
                code: "300257".into(),
                full_name: "开山股份".into(),
                short_name: "开山".into(),
                exchange: "SZSE".into(),
            })
            .unwrap();
        let match_co = storage
            .upsert_company(CompanyUpsert {
                code: "688448".into(),
                full_name: "磁谷科技".into(),
                short_name: "磁谷".into(),
                exchange: "SSE".into(),
            })
            .unwrap();

        let source_id = insert_concept(&storage, query_co.company_id, "螺杆空压机", 0.9);
        let match_id = insert_concept(&storage, match_co.company_id, "磁悬浮鼓风机", 0.6);

        let vector = vec![1.0, 0.0, 0.0, 0.0];
        storage.update_embedding(source_id, &vector).unwrap();
        storage.update_embedding(match_id, &vector).unwrap();

        let cache = AsyncMutex::new(TtlLruCache::new(16, Duration::from_secs(60)));
        let config = Config::default();
        let response = retrieve(storage, None, &cache, &config, request("300257")).await.unwrap();

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].company_code, "688448");
        assert!(!response.metadata.filters_applied.reranked);
        assert_eq!(response.metadata.total_results_before_limit, 1);
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let storage = storage();
        let query_co = storage
            .upsert_company(CompanyUpsert {
                code: "300257".into(),
                full_name: "开山股份".into(),
                short_name: "开山".into(),
                exchange: "SZSE".into(),
            })
            .unwrap();
        let source_id = insert_concept(&storage, query_co.company_id, "螺杆空压机", 0.9);
        storage.update_embedding(source_id, &vec![1.0, 0.0, 0.0, 0.0]).unwrap();

        let cache = AsyncMutex::new(TtlLruCache::new(16, Duration::from_secs(60)));
        let config = Config::default();
        let first = retrieve(storage.clone(), None, &cache, &config, request("300257")).await.unwrap();
        let second = retrieve(storage, None, &cache, &config, request("300257")).await.unwrap();
        assert_eq!(first, second);
    }
}
