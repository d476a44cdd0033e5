//! HTTP surface (spec §6.1): one search endpoint plus a health check,
//! router shape grounded on the teacher's `dashboard::build_router`.

pub mod dto;
pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex as AsyncMutex;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ashareinsight_core::cache::TtlLruCache;
use ashareinsight_core::clients::RerankClient;
use ashareinsight_core::config::Config;
use ashareinsight_core::usecases::retrieval::RetrievalResponse;
use ashareinsight_core::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub rerank_client: Option<Arc<RerankClient>>,
    pub cache: Arc<AsyncMutex<TtlLruCache<String, RetrievalResponse>>>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/search/similar-companies", post(handlers::search_similar_companies))
        .route("/healthz", get(handlers::health_check))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

pub async fn serve(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = bind_addr.parse().unwrap_or_else(|e| {
        tracing::error!(bind_addr, error = %e, "invalid bind address, falling back to 0.0.0.0:8080");
        SocketAddr::from(([0, 0, 0, 0], 8080))
    });

    tracing::info!(%addr, "http server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}
