//! Storage Module (C1/C2/C3)
//!
//! SQLite-backed concept store, collocated vector index, and market-data
//! store, with a versioned migration table applied on boot.

mod migrations;
mod sqlite;

pub use migrations::{apply_migrations, get_current_version, Migration, MIGRATIONS};
pub use sqlite::{CompanyUpsert, NewConcept, NewSourceDocument, Result, SimilarConceptHit, Storage};

/// Transaction-scoped helpers used by `usecases::archival`/`usecases::fusion`
/// to run company-upsert + document-insert, or a fusion batch, inside one
/// caller-owned `rusqlite::Transaction` (spec §4.5/§4.6 transaction
/// boundaries).
pub(crate) use sqlite::{archive_document_tx, insert_concept_tx, update_concept_tx, upsert_company_tx};
