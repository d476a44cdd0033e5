//! External collaborator HTTP clients (C4, C5).

mod embedding;
mod rerank;

pub use embedding::EmbeddingClient;
pub use rerank::RerankClient;
