//! Application use-cases: the orchestration layer above storage/search/
//! clients. Each module here is one of the spec's lettered components
//! (C6-C10), composed at the HTTP/CLI boundary rather than exposing any
//! global state.

pub mod archival;
pub mod fusion;
pub mod market_filter;
pub mod retrieval;
pub mod vectorization;
