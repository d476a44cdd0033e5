//! Rerank HTTP client (C5). Mirrors [`super::embedding::EmbeddingClient`]'s
//! transport/retry/circuit-breaker shape; an `Err` from `rerank()` is
//! treated by the retrieval use-case as "skip reranking" rather than a
//! request failure (spec §4.4/§4.8 step 7) — the same graceful-degradation
//! shape the teacher's local reranker uses when falling through to BM25.
//!
//! Wire shape is `POST /rerank { query, documents, top_k }` ->
//! `{ data: { results: [{ index, score, document }] } }` (spec §6.3):
//! `index` points back into the request's `documents` array, the results
//! are sorted by descending score, and the service may both reorder and
//! truncate to `top_k` — so the response is never assumed to line up
//! positionally with the request.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExternalServiceError;
use crate::resilience::{is_retryable_status, retry, CircuitBreaker, RetryPolicy};

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    data: RerankData,
}

#[derive(Debug, Deserialize)]
struct RerankData {
    results: Vec<RerankResultRaw>,
}

#[derive(Debug, Deserialize)]
struct RerankResultRaw {
    index: usize,
    score: f32,
}

/// One reranked hit, `index` into the request's `documents` slice so the
/// caller can re-attach metadata even though results may be reordered or
/// shorter than the input (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct RerankedHit {
    pub index: usize,
    pub score: f32,
}

pub struct RerankClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl RerankClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            timeout,
            breaker: CircuitBreaker::new("rerank", breaker_threshold, breaker_cooldown),
        }
    }

    /// Scores `documents` against `query`, returning up to `top_k` hits
    /// sorted by descending score (spec §4.4: `rerank(query, [documents],
    /// top_k) -> sequence of (index, score, document)`). Callers that want
    /// graceful degradation should treat `Err` as "proceed without
    /// reranking" rather than failing the whole retrieval request.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankedHit>, ExternalServiceError> {
        self.breaker.check()?;

        let policy = RetryPolicy::fixed_backoff(2, Duration::from_millis(100));
        let result = retry(
            policy,
            |_attempt| async {
                let resp = self
                    .http
                    .post(format!("{}/rerank", self.base_url))
                    .timeout(self.timeout)
                    .json(&RerankRequest { query, documents, top_k })
                    .send()
                    .await
                    .map_err(|e| ExternalServiceError::Transport(e, "rerank"))?;

                let status = resp.status().as_u16();
                if (200..300).contains(&status) {
                    return Ok(resp);
                }
                let body = resp.text().await.unwrap_or_default();
                Err(ExternalServiceError::BadResponse {
                    service: "rerank",
                    status,
                    body,
                })
            },
            |err| match err {
                ExternalServiceError::Transport(_, _) => true,
                ExternalServiceError::BadResponse { status, .. } => is_retryable_status(*status),
                _ => false,
            },
        )
        .await;

        match result {
            Ok(resp) => {
                self.breaker.record_success();
                let body: RerankResponse = resp
                    .json()
                    .await
                    .map_err(|e| ExternalServiceError::Transport(e, "rerank"))?;
                let hits = body
                    .data
                    .results
                    .into_iter()
                    .filter(|r| r.index < documents.len())
                    .map(|r| RerankedHit { index: r.index, score: r.score })
                    .collect();
                Ok(hits)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_indices_are_dropped_not_panicked_on() {
        let documents = vec!["a".to_string(), "b".to_string()];
        let raw = vec![
            RerankResultRaw { index: 0, score: 0.9 },
            RerankResultRaw { index: 5, score: 0.8 },
        ];
        let hits: Vec<RerankedHit> = raw
            .into_iter()
            .filter(|r| r.index < documents.len())
            .map(|r| RerankedHit { index: r.index, score: r.score })
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 0);
    }
}
