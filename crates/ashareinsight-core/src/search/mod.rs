//! Vector search (C2): an HNSW index over business-concept embeddings,
//! collocated with the relational store.

mod vector;

pub use vector::{
    VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError, DEFAULT_DIMENSIONS,
    DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH, DEFAULT_M,
};
