//! Composition root: the one place `Config`, `Storage`, and the external
//! collaborator clients are wired together, per spec §9's design note
//! ("express as constructor injection of interfaces; avoid global
//! registries; the composition root is the `serve` entry point and the CLI
//! entry points").

use std::sync::Arc;

use ashareinsight_core::search::VectorIndexConfig;
use ashareinsight_core::{Config, EmbeddingClient, RerankClient, Storage};

/// Everything a CLI verb or the HTTP server needs, built once from `Config`.
pub struct Runtime {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub embedding_client: EmbeddingClient,
    pub rerank_client: RerankClient,
}

impl Runtime {
    pub fn build(config: Config) -> Result<Self, ashareinsight_core::FatalConfigError> {
        config.validate()?;

        let vector_config = VectorIndexConfig {
            dimensions: config.embedding_dimensions,
            m: config.vector_index_m,
            ef_construction: config.vector_index_ef_construction,
            ef_search: config.vector_index_ef_construction / 2,
        };
        let storage = Storage::open_with_pool_size(&config.db_path, vector_config, config.db_pool_size)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "failed to open storage");
                std::process::exit(3);
            });

        let embedding_client = EmbeddingClient::new(
            config.embedding_service_url.clone(),
            config.embedding_timeout,
            config.embedding_dimensions,
            config.retrieval_concurrency,
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_cooldown,
        );
        let rerank_client = RerankClient::new(
            config.rerank_service_url.clone(),
            config.rerank_timeout,
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_cooldown,
        );

        Ok(Self {
            config,
            storage: Arc::new(storage),
            embedding_client,
            rerank_client,
        })
    }
}

/// Initializes the global tracing subscriber once per process, stderr-only
/// so stdout stays free for structured CLI output (JSON archive/fuse/vectorize
/// summaries and the HTTP server's own access logs).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
