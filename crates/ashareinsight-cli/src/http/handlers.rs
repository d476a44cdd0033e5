//! Route handlers for the HTTP surface (spec §6.1).

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;

use ashareinsight_core::usecases::retrieval::{retrieve, RetrievalRequest};
use ashareinsight_core::AppError;

use super::dto::{ErrorBody, ErrorEnvelope, SearchQuery, SearchRequest, SearchResponseDto};
use super::middleware::RequestId;
use super::AppState;

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn search_similar_companies(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<SearchQuery>,
    Json(body): Json<SearchRequest>,
) -> Response {
    match handle_search(state, query, body).await {
        Ok(dto) => (StatusCode::OK, Json(dto)).into_response(),
        Err(err) => error_response(err, &request_id.0),
    }
}

async fn handle_search(
    state: AppState,
    query: SearchQuery,
    body: SearchRequest,
) -> Result<SearchResponseDto, AppError> {
    let aggregation_strategy = body.aggregation_strategy().map_err(|message| {
        AppError::Validation(ashareinsight_core::ValidationError::InvalidField {
            field: "aggregation_strategy".into(),
            message,
        })
    })?;
    if !(1..=100).contains(&body.top_k) {
        return Err(AppError::Validation(ashareinsight_core::ValidationError::InvalidField {
            field: "top_k".into(),
            message: "must be in range 1..100".into(),
        }));
    }

    let request = RetrievalRequest {
        query_identifier: body.query_identifier,
        top_k: body.top_k,
        similarity_threshold: body.similarity_threshold,
        aggregation_strategy,
        market_filters: body.market_filters(),
        include_justification: query.include_justification,
    };

    let response = retrieve(
        state.storage,
        state.rerank_client.as_deref(),
        &state.cache,
        &state.config,
        request,
    )
    .await
    .map_err(AppError::from)?;

    Ok(response.into())
}

fn error_response(err: AppError, request_id: &str) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: err.code(),
            message: err.to_string(),
            request_id: request_id.to_string(),
        },
    };
    (status, Json(envelope)).into_response()
}
