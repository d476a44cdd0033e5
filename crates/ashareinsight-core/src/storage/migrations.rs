//! Database migrations (C1/C3 schema).
//!
//! Versioned migration table, same shape as the teacher's own
//! `schema_version` / `apply_migrations` pattern, applied to a schema that
//! now models companies, source documents, business concepts, concept
//! relations, and daily market-data snapshots instead of generic
//! knowledge nodes.

/// Migration definitions.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial AShareInsight schema: companies, documents, concepts, market data",
    up: MIGRATION_V1_UP,
}];

/// A database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    company_id TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    full_name TEXT NOT NULL UNIQUE,
    short_name TEXT NOT NULL,
    exchange TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_companies_short_name ON companies(short_name);

CREATE TABLE IF NOT EXISTS source_documents (
    document_id TEXT PRIMARY KEY,
    company_id TEXT NOT NULL REFERENCES companies(company_id),
    doc_type TEXT NOT NULL,
    title TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    published_at TEXT NOT NULL,
    raw_llm_output TEXT NOT NULL,
    extraction_metadata TEXT NOT NULL DEFAULT '{}',
    processing_status TEXT NOT NULL DEFAULT 'pending',
    error_text TEXT,
    archived_at TEXT NOT NULL,
    UNIQUE (company_id, file_hash)
);

CREATE INDEX IF NOT EXISTS idx_source_documents_company ON source_documents(company_id);
CREATE INDEX IF NOT EXISTS idx_source_documents_status ON source_documents(processing_status);

CREATE TABLE IF NOT EXISTS business_concepts (
    concept_id TEXT PRIMARY KEY,
    company_id TEXT NOT NULL REFERENCES companies(company_id),
    concept_name TEXT NOT NULL,
    concept_category TEXT NOT NULL,
    description TEXT NOT NULL,
    description_hash INTEGER NOT NULL,
    development_stage TEXT NOT NULL DEFAULT '',
    details TEXT NOT NULL DEFAULT '{}',
    importance_score REAL NOT NULL,
    embedding BLOB,
    last_updated_from_doc_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Conditional unique index: at most one active concept per
-- (company_id, concept_name); soft-deleted rows are excluded (spec §4.1).
CREATE UNIQUE INDEX IF NOT EXISTS idx_concepts_active_unique
    ON business_concepts(company_id, concept_name)
    WHERE is_active = 1;

CREATE INDEX IF NOT EXISTS idx_concepts_company ON business_concepts(company_id);
CREATE INDEX IF NOT EXISTS idx_concepts_needs_vectorization
    ON business_concepts(is_active)
    WHERE embedding IS NULL AND is_active = 1;

CREATE TABLE IF NOT EXISTS concept_relations (
    relation_id TEXT PRIMARY KEY,
    source_concept_id TEXT NOT NULL REFERENCES business_concepts(concept_id),
    target_entity_type TEXT NOT NULL,
    target_entity_name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_concept_relations_source ON concept_relations(source_concept_id);

CREATE TABLE IF NOT EXISTS market_data_daily (
    company_id TEXT NOT NULL REFERENCES companies(company_id),
    trade_date TEXT NOT NULL,
    close_price REAL NOT NULL,
    turnover_amount INTEGER NOT NULL,
    market_cap INTEGER NOT NULL,
    circulating_cap INTEGER NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (company_id, trade_date)
);

CREATE INDEX IF NOT EXISTS idx_market_data_date ON market_data_daily(trade_date);

CREATE TABLE IF NOT EXISTS vectorization_checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_concept_id TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// Get current schema version from database.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
