//! # AShareInsight Core
//!
//! Concept-retrieval engine for Chinese A-share listed companies. Extracted
//! business concepts from annual reports and research reports are archived,
//! fused into a per-company master record, embedded, and indexed for
//! similarity search — so a query against one company's disclosed business
//! concepts surfaces other companies describing the same underlying
//! business, weighted by semantic similarity, cross-encoder relevance, and
//! market data.
//!
//! ## Pipeline
//!
//! - **Archival (C6)**: idempotent ingestion of one extracted document,
//!   keyed on `(company_code, file_hash)`.
//! - **Fusion (C7)**: merges a document's extracted concepts into the
//!   company's master `business_concepts` rows, field by field.
//! - **Vectorization (C8)**: embeds concepts lacking a current vector,
//!   checkpoint-resumable across both full-rebuild and incremental runs.
//! - **Retrieval (C9)**: the thirteen-step recall → rerank → aggregate →
//!   filter → paginate pipeline behind the public search surface.
//! - **Market Filter (C10)**: optional post-aggregation scoring and
//!   exclusion by market-cap/volume thresholds.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ashareinsight_core::{Config, Storage};
//! use ashareinsight_core::search::VectorIndexConfig;
//!
//! let config = Config::from_env()?;
//! config.validate()?;
//! let storage = Storage::open(&config.db_path, VectorIndexConfig::default())?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod clients;
pub mod config;
pub mod domain;
pub mod error;
pub mod resilience;
pub mod search;
pub mod storage;
pub mod usecases;

pub use config::{Config, MarketFilterConfig, ScoreTier};
pub use error::{
    AppError, ArchivalError, ExternalServiceError, FatalConfigError, FusionError,
    RetrievalError, StorageError, ValidationError, VectorizationError,
};

pub use domain::{
    aggregate_company, compute_market_data_current, hash_description, sort_companies_deterministically,
    sort_documents_deterministically, AggregatedCompany, AggregationStrategy, BusinessConcept,
    Company, ConceptCategory, ConceptDetails, ConceptRelation, Document, DocumentType,
    ExtractionMetadata, MarketDataCurrent, MarketDataDaily, MarketSyncOutcome, ProcessingStatus,
    Relations, SourceDocument, Timeline, TimelineEvent, MAX_SOURCE_SENTENCES,
    TOP_CONCEPTS_PER_COMPANY,
};

pub use storage::{CompanyUpsert, NewConcept, NewSourceDocument, SimilarConceptHit, Storage};

pub use clients::{EmbeddingClient, RerankClient};

pub use cache::TtlLruCache;

pub use resilience::{CircuitBreaker, RetryPolicy};

pub use search::{VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        AggregatedCompany, BusinessConcept, Company, Config, Document, RerankClient, Storage,
        VectorIndex,
    };
    pub use crate::usecases::{archival, fusion, market_filter, retrieval, vectorization};
}
