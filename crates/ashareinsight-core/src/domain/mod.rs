//! Domain types shared by storage, use-cases, and the HTTP surface.

mod company;
mod concept;
mod market;
mod retrieval;

pub use company::{Company, DocumentType, ExtractionMetadata, ProcessingStatus, SourceDocument};
pub use concept::{
    hash_description, BusinessConcept, ConceptCategory, ConceptDetails, ConceptRelation,
    Relations, Timeline, TimelineEvent, MAX_SOURCE_SENTENCES,
};
pub use market::{compute_market_data_current, MarketDataCurrent, MarketDataDaily, MarketSyncOutcome};
pub use retrieval::{
    aggregate_company, sort_companies_deterministically, sort_documents_deterministically,
    AggregatedCompany, AggregationStrategy, Document, TOP_CONCEPTS_PER_COMPANY,
};
