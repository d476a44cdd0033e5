//! Concept Store (C1), collocated Vector Index (C2), and Market-Data Store
//! (C3), all backed by one SQLite database — the teacher's `Storage` shape
//! (a single struct owning the connection and the in-memory vector index,
//! loaded together on boot) generalized to the new schema.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use half::f16;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::domain::{
    BusinessConcept, Company, ConceptCategory, ConceptDetails, DocumentType, ExtractionMetadata,
    MarketDataCurrent, MarketDataDaily, ProcessingStatus, SourceDocument,
};
use crate::error::StorageError;
use crate::search::{VectorIndex, VectorIndexConfig};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Draft for [`Storage::upsert_company`] — company metadata known at
/// archival time, before `company_id`/timestamps are assigned.
#[derive(Debug, Clone)]
pub struct CompanyUpsert {
    pub code: String,
    pub full_name: String,
    pub short_name: String,
    pub exchange: String,
}

/// Draft for [`Storage::archive_document`].
#[derive(Debug, Clone)]
pub struct NewSourceDocument {
    pub company_id: Uuid,
    pub doc_type: DocumentType,
    pub title: String,
    pub file_path: String,
    pub file_hash: String,
    pub published_at: DateTime<Utc>,
    pub raw_llm_output: serde_json::Value,
    pub extraction_metadata: ExtractionMetadata,
}

/// Draft for [`Storage::insert_concept`] — everything needed to create a new
/// master concept row; `embedding` starts `NULL` per spec §4.1.
#[derive(Debug, Clone)]
pub struct NewConcept {
    pub company_id: Uuid,
    pub concept_name: String,
    pub concept_category: ConceptCategory,
    pub description: String,
    pub development_stage: String,
    pub details: ConceptDetails,
    pub importance_score: f32,
    pub last_updated_from_doc_id: Uuid,
}

/// One hit from [`Storage::search_similar`], the projection named in spec
/// §4.1: `(concept_id, company_code, concept_name, concept_category,
/// importance_score, similarity_score)`, plus `company_id` for callers that
/// need the opaque key rather than the natural one.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarConceptHit {
    pub concept_id: Uuid,
    pub company_id: Uuid,
    pub company_code: String,
    pub concept_name: String,
    pub concept_category: ConceptCategory,
    pub importance_score: f32,
    pub similarity_score: f32,
}

/// Default size of the file-backed connection pool (spec §5: "DB connection
/// pool: single shared pool with warmup ... size bounded").
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Concept Store (C1) + Vector Index (C2) + Market-Data Store (C3), one
/// SQLite file. `conns` is a small round-robin pool of `Mutex<Connection>`
/// standing in for the teacher's writer/reader pair — `r2d2`-free, since
/// SQLite's own locking makes a connection-pool crate unnecessary and the
/// teacher never reaches for one either. `usearch`'s index is held
/// alongside under its own lock so recall never blocks on a concept write
/// to an unrelated row.
pub struct Storage {
    conns: Vec<Mutex<Connection>>,
    next: AtomicUsize,
    vector_index: Mutex<VectorIndex>,
}

impl Storage {
    /// Opens (creating if absent) the database at `db_path`, applies
    /// pending migrations, warms up `pool_size` pooled connections (each
    /// issues `SELECT 1` per spec §5's warmup rule), and rebuilds the
    /// in-memory vector index from every concept that already has an
    /// embedding — mirroring the teacher's load-index-on-boot convention.
    pub fn open(db_path: impl AsRef<Path>, vector_config: VectorIndexConfig) -> Result<Self> {
        Self::open_with_pool_size(db_path, vector_config, DEFAULT_POOL_SIZE)
    }

    pub fn open_with_pool_size(
        db_path: impl AsRef<Path>,
        vector_config: VectorIndexConfig,
        pool_size: usize,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        let bootstrap = Connection::open(db_path)?;
        bootstrap.pragma_update(None, "journal_mode", "WAL")?;
        bootstrap.pragma_update(None, "foreign_keys", "ON")?;
        bootstrap.busy_timeout(std::time::Duration::from_secs(5))?;
        super::migrations::apply_migrations(&bootstrap).map_err(StorageError::Database)?;

        let mut vector_index = VectorIndex::new(vector_config)
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        load_existing_embeddings(&bootstrap, &mut vector_index)?;

        let mut conns = Vec::with_capacity(pool_size.max(1));
        conns.push(bootstrap);
        for _ in 1..pool_size.max(1) {
            let conn = Connection::open(db_path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conns.push(conn);
        }
        for conn in &conns {
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(StorageError::Database)?;
        }

        Ok(Self {
            conns: conns.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            vector_index: Mutex::new(vector_index),
        })
    }

    /// In-memory database for tests, same schema, empty vector index. A
    /// single connection, not a pool: SQLite's `:memory:` databases are
    /// private per connection, so pooling would silently fragment the data
    /// across independent in-memory databases.
    pub fn open_in_memory(vector_config: VectorIndexConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        super::migrations::apply_migrations(&conn).map_err(StorageError::Database)?;
        let vector_index = VectorIndex::new(vector_config)
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(Self {
            conns: vec![Mutex::new(conn)],
            next: AtomicUsize::new(0),
            vector_index: Mutex::new(vector_index),
        })
    }

    /// Picks the next pooled connection, round-robin.
    fn pick(&self) -> &Mutex<Connection> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[idx]
    }

    /// Runs `f` inside one SQLite transaction (archival's company+document
    /// step, or one fusion batch). Rolls back on error, mirroring the
    /// teacher's `Connection::transaction()` idiom in `ingest()`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pick().lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Company (C1)
    // ------------------------------------------------------------------

    /// Resolution order per spec §4.1: exact code, else exact full name,
    /// else exact short name, case-insensitive/trimmed; an exact code match
    /// is preferred when a short name collides with another company's code.
    pub fn get_company(&self, identifier: &str) -> Result<Option<Company>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let needle = identifier.trim();

        if let Some(company) = query_company(&conn, "code", needle)? {
            return Ok(Some(company));
        }
        if let Some(company) = query_company(&conn, "full_name", needle)? {
            return Ok(Some(company));
        }
        query_company(&conn, "short_name", needle)
    }

    pub fn get_company_by_id(&self, company_id: Uuid) -> Result<Option<Company>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.query_row(
            "SELECT company_id, code, full_name, short_name, exchange, created_at, updated_at
             FROM companies WHERE company_id = ?1",
            params![company_id.to_string()],
            row_to_company,
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Idempotent on `code`: creates the company if absent, otherwise
    /// enriches `short_name`/`exchange` in place (spec §4.5 step 1).
    pub fn upsert_company(&self, company: CompanyUpsert) -> Result<Company> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        upsert_company_tx(&conn, company)
    }

    // ------------------------------------------------------------------
    // SourceDocument (C1)
    // ------------------------------------------------------------------

    /// Idempotent on `(company_id, file_hash)`: if a row already exists,
    /// returns its id with `already_existed=true` and inserts nothing.
    pub fn archive_document(&self, doc: NewSourceDocument) -> Result<(Uuid, bool)> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        archive_document_tx(&conn, doc)
    }

    pub fn get_document(&self, document_id: Uuid) -> Result<Option<SourceDocument>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.query_row(
            "SELECT document_id, company_id, doc_type, title, file_path, file_hash,
                    published_at, raw_llm_output, extraction_metadata, processing_status,
                    error_text, archived_at
             FROM source_documents WHERE document_id = ?1",
            params![document_id.to_string()],
            row_to_document,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn set_document_status(
        &self,
        document_id: Uuid,
        status: ProcessingStatus,
        error_text: Option<&str>,
    ) -> Result<()> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.execute(
            "UPDATE source_documents SET processing_status = ?1, error_text = ?2
             WHERE document_id = ?3",
            params![status_to_str(status), error_text, document_id.to_string()],
        )?;
        Ok(())
    }

    /// Documents whose fusion has not terminated successfully yet
    /// (`pending` or `failed`), oldest first — the CLI's `fuse all-unfused`
    /// replay set (spec §4.10: "Failed documents are replayable by
    /// re-running fusion given their raw_llm_output").
    pub fn list_unfused_documents(&self) -> Result<Vec<SourceDocument>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT document_id, company_id, doc_type, title, file_path, file_hash,
                    published_at, raw_llm_output, extraction_metadata, processing_status,
                    error_text, archived_at
             FROM source_documents
             WHERE processing_status IN ('pending', 'failed')
             ORDER BY archived_at ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // BusinessConcept (C1)
    // ------------------------------------------------------------------

    pub fn find_active_concept(
        &self,
        company_id: Uuid,
        concept_name: &str,
    ) -> Result<Option<BusinessConcept>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.query_row(
            &concept_select_sql("WHERE company_id = ?1 AND concept_name = ?2 AND is_active = 1"),
            params![company_id.to_string(), concept_name],
            row_to_concept,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn get_concept(&self, concept_id: Uuid) -> Result<Option<BusinessConcept>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.query_row(
            &concept_select_sql("WHERE concept_id = ?1"),
            params![concept_id.to_string()],
            row_to_concept,
        )
        .optional()
        .map_err(StorageError::from)
    }

    /// Order unspecified per spec §4.1.
    pub fn list_active_concepts(&self, company_id: Uuid) -> Result<Vec<BusinessConcept>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(&concept_select_sql("WHERE company_id = ?1 AND is_active = 1"))?;
        let rows = stmt
            .query_map(params![company_id.to_string()], row_to_concept)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Concepts with `embedding IS NULL`, optionally restricted to one
    /// company, cursor-paginated by `concept_id` for [`C8`]'s resumable
    /// rebuild (spec §4.7).
    pub fn concepts_needing_vectorization(
        &self,
        company_id: Option<Uuid>,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<BusinessConcept>> {
        self.list_concepts_for_vectorization(company_id, after, limit, true)
    }

    /// Shared cursor-paginated scan behind [`Storage::concepts_needing_vectorization`].
    /// With `only_missing_embedding = false` every active concept is
    /// returned regardless of embedding state — the full-rebuild mode of
    /// [`C8`], which re-embeds the whole active set rather than just the
    /// rows scheduled by a `NULL` embedding.
    pub fn list_concepts_for_vectorization(
        &self,
        company_id: Option<Uuid>,
        after: Option<Uuid>,
        limit: usize,
        only_missing_embedding: bool,
    ) -> Result<Vec<BusinessConcept>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let predicate = if only_missing_embedding {
            "WHERE is_active = 1 AND embedding IS NULL"
        } else {
            "WHERE is_active = 1"
        };
        let mut sql = concept_select_sql(predicate).to_string();
        if company_id.is_some() {
            sql.push_str(" AND company_id = :company_id");
        }
        if after.is_some() {
            sql.push_str(" AND concept_id > :after");
        }
        sql.push_str(" ORDER BY concept_id ASC LIMIT :limit");

        let mut stmt = conn.prepare(&sql)?;
        let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
        let company_str = company_id.map(|c| c.to_string());
        let after_str = after.map(|c| c.to_string());
        if let Some(ref c) = company_str {
            named.push((":company_id", c));
        }
        if let Some(ref a) = after_str {
            named.push((":after", a));
        }
        let limit_i64 = limit as i64;
        named.push((":limit", &limit_i64));

        let rows = stmt
            .query_map(named.as_slice(), row_to_concept)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fails with [`StorageError::UniqueViolation`] if an active
    /// `(company_id, concept_name)` row already exists (spec §4.1) — the
    /// caller (fusion) treats this as a concurrent-insert race and falls
    /// back to the update path.
    pub fn insert_concept(&self, concept: NewConcept) -> Result<Uuid> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        insert_concept_tx(&conn, concept)
    }

    /// Conditional update keyed on `expected_version`; fails with
    /// [`StorageError::OptimisticLock`] if the stored version has moved on.
    /// `clear_embedding` nulls the embedding column (the vectorization
    /// scheduling flag) without otherwise touching it — callers decide this
    /// from the description-hash comparison (Open Question #1).
    pub fn update_concept(
        &self,
        updated: &BusinessConcept,
        expected_version: i64,
        clear_embedding: bool,
    ) -> Result<BusinessConcept> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        update_concept_tx(&conn, updated, expected_version, clear_embedding)
    }

    /// Writes one embedding WITHOUT bumping `version` (spec §4.1/§4.7:
    /// decouples index maintenance from optimistic locking on business
    /// fields).
    pub fn update_embedding(&self, concept_id: Uuid, vector: &[f32]) -> Result<()> {
        self.batch_update_embeddings(&[(concept_id, vector.to_vec())])
    }

    pub fn batch_update_embeddings(&self, items: &[(Uuid, Vec<f32>)]) -> Result<()> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let mut index = self.vector_index.lock().expect("vector index mutex poisoned");
        for (concept_id, vector) in items {
            let blob = pack_half(vector);
            conn.execute(
                "UPDATE business_concepts SET embedding = ?1 WHERE concept_id = ?2",
                params![blob, concept_id.to_string()],
            )?;
            index
                .add(*concept_id, vector)
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vector Index (C2)
    // ------------------------------------------------------------------

    /// Ordered by descending similarity, filtered to `>= threshold`,
    /// truncated to `limit` (spec §4.1). The ANN index decides candidate
    /// order; metadata is joined back from SQLite in that order.
    pub fn search_similar(
        &self,
        query_vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<SimilarConceptHit>> {
        let hits = {
            let index = self.vector_index.lock().expect("vector index mutex poisoned");
            index
                .search_with_threshold(query_vector, limit, threshold)
                .map_err(|e| StorageError::Migration(e.to_string()))?
        };
        if hits.is_empty() {
            return Ok(vec![]);
        }
        self.join_similarity_metadata(hits)
    }

    /// Same contract as [`Storage::search_similar`] applied to multiple
    /// query vectors; the caller (C9) is responsible for running these
    /// concurrently — this method itself is sequential per spec §4.1's
    /// "implementations may parallelize or pipeline" note.
    pub fn batch_search_similar(
        &self,
        queries: &[Vec<f32>],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<Vec<SimilarConceptHit>>> {
        queries
            .iter()
            .map(|q| self.search_similar(q, limit, threshold))
            .collect()
    }

    fn join_similarity_metadata(
        &self,
        hits: Vec<(Uuid, f32)>,
    ) -> Result<Vec<SimilarConceptHit>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let placeholders = hits.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT bc.concept_id, bc.company_id, c.code, bc.concept_name,
                    bc.concept_category, bc.importance_score
             FROM business_concepts bc
             JOIN companies c ON c.company_id = bc.company_id
             WHERE bc.concept_id IN ({placeholders}) AND bc.is_active = 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<String> = hits.iter().map(|(id, _)| id.to_string()).collect();
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut by_id: HashMap<Uuid, (Uuid, String, String, ConceptCategory, f32)> = HashMap::new();
        let mut rows = stmt.query(param_refs.as_slice())?;
        while let Some(row) = rows.next()? {
            let concept_id: String = row.get(0)?;
            let concept_id = Uuid::parse_str(&concept_id).map_err(invalid_uuid)?;
            let company_id: String = row.get(1)?;
            let company_id = Uuid::parse_str(&company_id).map_err(invalid_uuid)?;
            let code: String = row.get(2)?;
            let concept_name: String = row.get(3)?;
            let category: String = row.get(4)?;
            let importance_score: f64 = row.get(5)?;
            by_id.insert(
                concept_id,
                (company_id, code, concept_name, str_to_category(&category)?, importance_score as f32),
            );
        }

        Ok(hits
            .into_iter()
            .filter_map(|(concept_id, similarity_score)| {
                by_id.get(&concept_id).map(|(company_id, code, name, cat, imp)| {
                    SimilarConceptHit {
                        concept_id,
                        company_id: *company_id,
                        company_code: code.clone(),
                        concept_name: name.clone(),
                        concept_category: *cat,
                        importance_score: *imp,
                        similarity_score,
                    }
                })
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Market-Data Store (C3)
    // ------------------------------------------------------------------

    /// Upsert by `(company_id, trading_date)`: latest write for a date wins.
    pub fn save_daily_snapshot(&self, rows: &[MarketDataDaily]) -> Result<usize> {
        let mut conn = self.pick().lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO market_data_daily
                    (company_id, trade_date, close_price, turnover_amount, market_cap, circulating_cap, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(company_id, trade_date) DO UPDATE SET
                    close_price = excluded.close_price,
                    turnover_amount = excluded.turnover_amount,
                    market_cap = excluded.market_cap,
                    circulating_cap = excluded.circulating_cap,
                    volume = excluded.volume",
                params![
                    row.company_id.to_string(),
                    row.trade_date.to_string(),
                    row.close_price,
                    row.turnover_amount,
                    row.market_cap,
                    row.circulating_cap,
                    row.volume,
                ],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Latest snapshot plus the rolling 5-day average per company, computed
    /// over a 7-calendar-day lookback (spec §4.2). Companies with no rows
    /// at all are simply absent from the returned map.
    pub fn get_current(&self, company_ids: &[Uuid]) -> Result<HashMap<Uuid, MarketDataCurrent>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let mut out = HashMap::new();
        for &company_id in company_ids {
            let mut stmt = conn.prepare(
                "SELECT company_id, trade_date, close_price, turnover_amount, market_cap, circulating_cap, volume
                 FROM market_data_daily
                 WHERE company_id = ?1
                 ORDER BY trade_date DESC
                 LIMIT 10",
            )?;
            let rows = stmt
                .query_map(params![company_id.to_string()], row_to_market_daily)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if rows.is_empty() {
                continue;
            }
            let latest_date = rows[0].trade_date;
            let windowed: Vec<_> = rows
                .into_iter()
                .filter(|r| (latest_date - r.trade_date).num_days() <= 7)
                .collect();
            if let Some(current) = crate::domain::compute_market_data_current(company_id, &windowed) {
                out.insert(company_id, current);
            }
        }
        Ok(out)
    }

    pub fn prune_market_data(&self, retention_days: i64) -> Result<usize> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let cutoff = (Utc::now().date_naive() - chrono::Duration::days(retention_days)).to_string();
        let deleted = conn.execute(
            "DELETE FROM market_data_daily WHERE trade_date < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Vectorization checkpoint (spec §4.7: resumable rebuild)
    // ------------------------------------------------------------------

    pub fn get_vectorization_checkpoint(&self) -> Result<Option<Uuid>> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        let id: Option<String> = conn
            .query_row(
                "SELECT last_concept_id FROM vectorization_checkpoint WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        id.map(|s| Uuid::parse_str(&s).map_err(invalid_uuid)).transpose()
    }

    pub fn set_vectorization_checkpoint(&self, concept_id: Uuid) -> Result<()> {
        let conn = self.pick().lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO vectorization_checkpoint (id, last_concept_id, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET last_concept_id = excluded.last_concept_id,
                updated_at = excluded.updated_at",
            params![concept_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ==========================================================================
// Free functions shared between the connection-holding methods above and
// transaction-scoped callers in `usecases` (archival opens its own
// transaction spanning company-upsert + document-insert).
// ==========================================================================

pub(crate) fn upsert_company_tx(
    conn: &rusqlite::Connection,
    company: CompanyUpsert,
) -> Result<Company> {
    if let Some(existing) = query_company(conn, "code", &company.code)? {
        conn.execute(
            "UPDATE companies SET short_name = ?1, exchange = ?2, updated_at = ?3
             WHERE company_id = ?4",
            params![
                company.short_name,
                company.exchange,
                Utc::now().to_rfc3339(),
                existing.company_id.to_string(),
            ],
        )?;
        return query_company(conn, "code", &company.code)?
            .ok_or_else(|| StorageError::CompanyNotFound(company.code.clone()));
    }

    let now = Utc::now();
    let company_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO companies (company_id, code, full_name, short_name, exchange, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            company_id.to_string(),
            company.code,
            company.full_name,
            company.short_name,
            company.exchange,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;

    Ok(Company {
        company_id,
        code: company.code,
        full_name: company.full_name,
        short_name: company.short_name,
        exchange: company.exchange,
        created_at: now,
        updated_at: now,
    })
}

pub(crate) fn archive_document_tx(
    conn: &rusqlite::Connection,
    doc: NewSourceDocument,
) -> Result<(Uuid, bool)> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT document_id FROM source_documents WHERE company_id = ?1 AND file_hash = ?2",
            params![doc.company_id.to_string(), doc.file_hash],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        return Ok((Uuid::parse_str(&id).map_err(invalid_uuid)?, true));
    }

    let document_id = Uuid::new_v4();
    let now = Utc::now();
    conn.execute(
        "INSERT INTO source_documents
            (document_id, company_id, doc_type, title, file_path, file_hash, published_at,
             raw_llm_output, extraction_metadata, processing_status, error_text, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', NULL, ?10)",
        params![
            document_id.to_string(),
            doc.company_id.to_string(),
            doc_type_to_str(doc.doc_type),
            doc.title,
            doc.file_path,
            doc.file_hash,
            doc.published_at.to_rfc3339(),
            doc.raw_llm_output.to_string(),
            serde_json::to_string(&doc.extraction_metadata).unwrap_or_default(),
            now.to_rfc3339(),
        ],
    )?;
    Ok((document_id, false))
}

pub(crate) fn insert_concept_tx(conn: &rusqlite::Connection, concept: NewConcept) -> Result<Uuid> {
    let concept_id = Uuid::new_v4();
    let now = Utc::now();
    let description_hash = crate::domain::hash_description(&concept.description);
    let details_json = serde_json::to_string(&concept.details).unwrap_or_default();

    let inserted = conn.execute(
        "INSERT INTO business_concepts
            (concept_id, company_id, concept_name, concept_category, description,
             description_hash, development_stage, details, importance_score, embedding,
             last_updated_from_doc_id, version, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, 1, 1, ?11, ?11)",
        params![
            concept_id.to_string(),
            concept.company_id.to_string(),
            concept.concept_name,
            category_to_str(concept.concept_category),
            concept.description,
            description_hash as i64,
            concept.development_stage,
            details_json,
            concept.importance_score,
            concept.last_updated_from_doc_id.to_string(),
            now.to_rfc3339(),
        ],
    );

    match inserted {
        Ok(_) => Ok(concept_id),
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StorageError::UniqueViolation(
                msg.unwrap_or_else(|| "active (company_id, concept_name) already exists".into()),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn update_concept_tx(
    conn: &rusqlite::Connection,
    updated: &BusinessConcept,
    expected_version: i64,
    clear_embedding: bool,
) -> Result<BusinessConcept> {
    let details_json = serde_json::to_string(&updated.details).unwrap_or_default();
    let now = Utc::now();

    let changed = conn.execute(
        "UPDATE business_concepts SET
            concept_category = ?1, description = ?2, description_hash = ?3,
            development_stage = ?4, details = ?5, importance_score = ?6,
            last_updated_from_doc_id = ?7, version = version + 1, updated_at = ?8,
            embedding = CASE WHEN ?9 THEN NULL ELSE embedding END
         WHERE concept_id = ?10 AND version = ?11 AND is_active = 1",
        params![
            category_to_str(updated.concept_category),
            updated.description,
            updated.description_hash as i64,
            updated.development_stage,
            details_json,
            updated.importance_score,
            updated.last_updated_from_doc_id.to_string(),
            now.to_rfc3339(),
            clear_embedding,
            updated.concept_id.to_string(),
            expected_version,
        ],
    )?;

    if changed == 0 {
        let found_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM business_concepts WHERE concept_id = ?1",
                params![updated.concept_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        return Err(match found_version {
            Some(found) => StorageError::OptimisticLock {
                concept_id: updated.concept_id,
                expected: expected_version,
                found,
            },
            None => StorageError::ConceptNotFound(updated.concept_id),
        });
    }

    conn.query_row(
        &concept_select_sql("WHERE concept_id = ?1"),
        params![updated.concept_id.to_string()],
        row_to_concept,
    )
    .map_err(StorageError::from)
}

fn load_existing_embeddings(conn: &Connection, index: &mut VectorIndex) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT concept_id, embedding FROM business_concepts
         WHERE embedding IS NOT NULL AND is_active = 1",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        Ok((id, blob))
    })?;
    for row in rows {
        let (id, blob) = row?;
        let concept_id = Uuid::parse_str(&id).map_err(invalid_uuid)?;
        let vector = unpack_half(&blob);
        index
            .add(concept_id, &vector)
            .map_err(|e| StorageError::Migration(e.to_string()))?;
    }
    Ok(())
}

fn query_company(conn: &Connection, column: &'static str, needle: &str) -> Result<Option<Company>> {
    let sql = format!(
        "SELECT company_id, code, full_name, short_name, exchange, created_at, updated_at
         FROM companies WHERE {column} = ?1 COLLATE NOCASE"
    );
    conn.query_row(&sql, params![needle], row_to_company)
        .optional()
        .map_err(StorageError::from)
}

fn concept_select_sql(predicate: &str) -> String {
    format!(
        "SELECT concept_id, company_id, concept_name, concept_category, description,
                description_hash, development_stage, details, importance_score, embedding,
                last_updated_from_doc_id, version, is_active, created_at, updated_at
         FROM business_concepts {predicate}"
    )
}

fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
    let company_id: String = row.get(0)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Company {
        company_id: Uuid::parse_str(&company_id).map_err(|e| rusqlite_uuid_err(e, 0))?,
        code: row.get(1)?,
        full_name: row.get(2)?,
        short_name: row.get(3)?,
        exchange: row.get(4)?,
        created_at: parse_rfc3339(&created_at, 5)?,
        updated_at: parse_rfc3339(&updated_at, 6)?,
    })
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<SourceDocument> {
    let document_id: String = row.get(0)?;
    let company_id: String = row.get(1)?;
    let doc_type: String = row.get(2)?;
    let published_at: String = row.get(6)?;
    let raw_llm_output: String = row.get(7)?;
    let extraction_metadata: String = row.get(8)?;
    let processing_status: String = row.get(9)?;
    let archived_at: String = row.get(11)?;

    Ok(SourceDocument {
        document_id: Uuid::parse_str(&document_id).map_err(|e| rusqlite_uuid_err(e, 0))?,
        company_id: Uuid::parse_str(&company_id).map_err(|e| rusqlite_uuid_err(e, 1))?,
        doc_type: str_to_doc_type(&doc_type).map_err(|e| rusqlite_parse_err(e, 2))?,
        title: row.get(3)?,
        file_path: row.get(4)?,
        file_hash: row.get(5)?,
        published_at: parse_rfc3339(&published_at, 6)?,
        raw_llm_output: serde_json::from_str(&raw_llm_output).unwrap_or(serde_json::Value::Null),
        extraction_metadata: serde_json::from_str(&extraction_metadata).unwrap_or_default(),
        processing_status: str_to_status(&processing_status).map_err(|e| rusqlite_parse_err(e, 9))?,
        error_text: row.get(10)?,
        archived_at: parse_rfc3339(&archived_at, 11)?,
    })
}

fn row_to_concept(row: &rusqlite::Row) -> rusqlite::Result<BusinessConcept> {
    let concept_id: String = row.get(0)?;
    let company_id: String = row.get(1)?;
    let category: String = row.get(3)?;
    let description_hash: i64 = row.get(5)?;
    let details: String = row.get(7)?;
    let importance_score: f64 = row.get(8)?;
    let embedding: Option<Vec<u8>> = row.get(9)?;
    let last_updated_from_doc_id: String = row.get(10)?;
    let is_active: i64 = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(BusinessConcept {
        concept_id: Uuid::parse_str(&concept_id).map_err(|e| rusqlite_uuid_err(e, 0))?,
        company_id: Uuid::parse_str(&company_id).map_err(|e| rusqlite_uuid_err(e, 1))?,
        concept_name: row.get(2)?,
        concept_category: str_to_category(&category).map_err(|e| rusqlite_parse_err(e, 3))?,
        description: row.get(4)?,
        description_hash: description_hash as u64,
        development_stage: row.get(6)?,
        details: serde_json::from_str(&details).unwrap_or_default(),
        importance_score: importance_score as f32,
        embedding: embedding.map(|blob| unpack_half(&blob)),
        last_updated_from_doc_id: Uuid::parse_str(&last_updated_from_doc_id)
            .map_err(|e| rusqlite_uuid_err(e, 10))?,
        version: row.get(11)?,
        is_active: is_active != 0,
        created_at: parse_rfc3339(&created_at, 13)?,
        updated_at: parse_rfc3339(&updated_at, 14)?,
    })
}

fn row_to_market_daily(row: &rusqlite::Row) -> rusqlite::Result<MarketDataDaily> {
    let company_id: String = row.get(0)?;
    let trade_date: String = row.get(1)?;
    Ok(MarketDataDaily {
        company_id: Uuid::parse_str(&company_id).map_err(|e| rusqlite_uuid_err(e, 0))?,
        trade_date: trade_date
            .parse::<NaiveDate>()
            .map_err(|e| rusqlite_parse_err(e.to_string(), 1))?,
        close_price: row.get(2)?,
        turnover_amount: row.get(3)?,
        market_cap: row.get(4)?,
        circulating_cap: row.get(5)?,
        volume: row.get(6)?,
    })
}

fn parse_rfc3339(s: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite_parse_err(e, col))
}

fn rusqlite_uuid_err(e: uuid::Error, col: usize) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn rusqlite_parse_err(e: impl std::fmt::Display, col: usize) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
    )
}

fn invalid_uuid(e: uuid::Error) -> StorageError {
    StorageError::Migration(format!("invalid uuid in storage: {e}"))
}

fn doc_type_to_str(t: DocumentType) -> &'static str {
    match t {
        DocumentType::AnnualReport => "annual_report",
        DocumentType::ResearchReport => "research_report",
    }
}

fn str_to_doc_type(s: &str) -> std::result::Result<DocumentType, String> {
    match s {
        "annual_report" => Ok(DocumentType::AnnualReport),
        "research_report" => Ok(DocumentType::ResearchReport),
        other => Err(format!("unknown doc_type: {other}")),
    }
}

fn status_to_str(s: ProcessingStatus) -> &'static str {
    match s {
        ProcessingStatus::Pending => "pending",
        ProcessingStatus::Completed => "completed",
        ProcessingStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> std::result::Result<ProcessingStatus, String> {
    match s {
        "pending" => Ok(ProcessingStatus::Pending),
        "completed" => Ok(ProcessingStatus::Completed),
        "failed" => Ok(ProcessingStatus::Failed),
        other => Err(format!("unknown processing_status: {other}")),
    }
}

fn category_to_str(c: ConceptCategory) -> &'static str {
    match c {
        ConceptCategory::Core => "core",
        ConceptCategory::Emerging => "emerging",
        ConceptCategory::Strategic => "strategic",
    }
}

fn str_to_category(s: &str) -> rusqlite::Result<ConceptCategory> {
    match s {
        "core" => Ok(ConceptCategory::Core),
        "emerging" => Ok(ConceptCategory::Emerging),
        "strategic" => Ok(ConceptCategory::Strategic),
        other => Err(rusqlite_parse_err(format!("unknown concept_category: {other}"), 3)),
    }
}

/// Packs an `f32` vector into little-endian `f16` bytes — the storage
/// realization of spec §3's half-precision embedding column.
fn pack_half(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 2);
    for &v in vector {
        out.extend_from_slice(&f16::from_f32(v).to_le_bytes());
    }
    out
}

fn unpack_half(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(2)
        .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeline;

    fn storage() -> Storage {
        Storage::open_in_memory(VectorIndexConfig {
            dimensions: 8,
            m: 8,
            ef_construction: 32,
            ef_search: 32,
        })
        .unwrap()
    }

    fn company_upsert(code: &str) -> CompanyUpsert {
        CompanyUpsert {
            code: code.into(),
            full_name: format!("{code} Full Name"),
            short_name: format!("{code}-short"),
            exchange: "SZSE".into(),
        }
    }

    #[test]
    fn upsert_company_is_idempotent_on_code() {
        let s = storage();
        let a = s.upsert_company(company_upsert("300257")).unwrap();
        let mut b = company_upsert("300257");
        b.short_name = "开山股份".into();
        let updated = s.upsert_company(b).unwrap();
        assert_eq!(a.company_id, updated.company_id);
        assert_eq!(updated.short_name, "开山股份");
    }

    #[test]
    fn get_company_resolves_by_code_name_or_short_name() {
        let s = storage();
        s.upsert_company(company_upsert("300257")).unwrap();
        assert!(s.get_company("300257").unwrap().is_some());
        assert!(s.get_company(" 300257 ").unwrap().is_some());
        assert!(s.get_company("300257-short").unwrap().is_some());
        assert!(s.get_company("nonexistent").unwrap().is_none());
    }

    #[test]
    fn archive_document_is_idempotent_on_file_hash() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let doc = NewSourceDocument {
            company_id: company.company_id,
            doc_type: DocumentType::AnnualReport,
            title: "2025 annual report".into(),
            file_path: "/reports/300257-2025.pdf".into(),
            file_hash: "abc123".into(),
            published_at: Utc::now(),
            raw_llm_output: serde_json::json!({"concepts": []}),
            extraction_metadata: ExtractionMetadata::default(),
        };
        let (id1, existed1) = s.archive_document(doc.clone()).unwrap();
        assert!(!existed1);
        let (id2, existed2) = s.archive_document(doc).unwrap();
        assert!(existed2);
        assert_eq!(id1, id2);
    }

    #[test]
    fn insert_concept_rejects_duplicate_active_name() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let draft = NewConcept {
            company_id: company.company_id,
            concept_name: "螺杆空气压缩机".into(),
            concept_category: ConceptCategory::Core,
            description: "desc".into(),
            development_stage: "成熟".into(),
            details: ConceptDetails::default(),
            importance_score: 0.9,
            last_updated_from_doc_id: Uuid::new_v4(),
        };
        s.insert_concept(draft.clone()).unwrap();
        let err = s.insert_concept(draft).unwrap_err();
        assert!(matches!(err, StorageError::UniqueViolation(_)));
    }

    #[test]
    fn update_concept_bumps_version_and_rejects_stale_expected_version() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let id = s
            .insert_concept(NewConcept {
                company_id: company.company_id,
                concept_name: "真空泵".into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "成长".into(),
                details: ConceptDetails::default(),
                importance_score: 0.5,
                last_updated_from_doc_id: Uuid::new_v4(),
            })
            .unwrap();
        let mut concept = s.get_concept(id).unwrap().unwrap();
        concept.importance_score = 0.6;
        let updated = s.update_concept(&concept, 1, false).unwrap();
        assert_eq!(updated.version, 2);

        let stale_err = s.update_concept(&concept, 1, false).unwrap_err();
        assert!(matches!(stale_err, StorageError::OptimisticLock { .. }));
    }

    #[test]
    fn update_embedding_does_not_bump_version() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let id = s
            .insert_concept(NewConcept {
                company_id: company.company_id,
                concept_name: "磁悬浮鼓风机".into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "".into(),
                details: ConceptDetails { timeline: Timeline::default(), ..Default::default() },
                importance_score: 0.6,
                last_updated_from_doc_id: Uuid::new_v4(),
            })
            .unwrap();
        let vector = vec![0.1_f32; 8];
        s.update_embedding(id, &vector).unwrap();
        let concept = s.get_concept(id).unwrap().unwrap();
        assert_eq!(concept.version, 1);
        assert!(concept.embedding.is_some());
    }

    #[test]
    fn search_similar_finds_closest_and_respects_threshold() {
        let s = storage();
        let company_a = s.upsert_company(company_upsert("300257")).unwrap();
        let company_b = s.upsert_company(company_upsert("688448")).unwrap();

        let id_a = s
            .insert_concept(NewConcept {
                company_id: company_a.company_id,
                concept_name: "压缩机".into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "".into(),
                details: ConceptDetails::default(),
                importance_score: 0.9,
                last_updated_from_doc_id: Uuid::new_v4(),
            })
            .unwrap();
        let id_b = s
            .insert_concept(NewConcept {
                company_id: company_b.company_id,
                concept_name: "鼓风机".into(),
                concept_category: ConceptCategory::Core,
                description: "desc".into(),
                development_stage: "".into(),
                details: ConceptDetails::default(),
                importance_score: 0.7,
                last_updated_from_doc_id: Uuid::new_v4(),
            })
            .unwrap();

        let query = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        s.update_embedding(id_a, &query).unwrap();
        s.update_embedding(id_b, &vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();

        let hits = s.search_similar(&query, 5, 0.0).unwrap();
        assert_eq!(hits[0].concept_id, id_a);
        assert_eq!(hits[0].company_code, "300257");

        let filtered = s.search_similar(&query, 5, 0.99).unwrap();
        assert!(filtered.iter().all(|h| h.concept_id != id_b));
    }

    #[test]
    fn market_data_upsert_is_idempotent_per_day() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let row = MarketDataDaily {
            company_id: company.company_id,
            trade_date: "2026-07-27".parse().unwrap(),
            close_price: 10.0,
            turnover_amount: 1_000_000,
            market_cap: 5_000_000_000,
            circulating_cap: 4_000_000_000,
            volume: 100_000,
        };
        s.save_daily_snapshot(&[row.clone()]).unwrap();
        let mut updated = row.clone();
        updated.close_price = 11.0;
        s.save_daily_snapshot(&[updated]).unwrap();

        let current = s.get_current(&[company.company_id]).unwrap();
        let current = current.get(&company.company_id).unwrap();
        assert_eq!(current.close_price, 11.0);
        assert_eq!(current.current_circulating_cap, 4_000_000_000);
    }

    #[test]
    fn get_current_computes_rolling_five_day_average_within_seven_day_window() {
        let s = storage();
        let company = s.upsert_company(company_upsert("300257")).unwrap();
        let dates = [
            "2026-07-28", "2026-07-27", "2026-07-24", "2026-07-23", "2026-07-22", "2026-07-10",
        ];
        let volumes = [100, 200, 300, 400, 500, 99999];
        let rows: Vec<_> = dates
            .iter()
            .zip(volumes)
            .map(|(d, v)| MarketDataDaily {
                company_id: company.company_id,
                trade_date: d.parse().unwrap(),
                close_price: 1.0,
                turnover_amount: v * 10,
                market_cap: 1,
                circulating_cap: 1,
                volume: v,
            })
            .collect();
        s.save_daily_snapshot(&rows).unwrap();

        let current = s.get_current(&[company.company_id]).unwrap();
        let current = current.get(&company.company_id).unwrap();
        // 07-28 is "today" and excluded from its own average; 07-10 falls
        // outside the 7-day lookback, leaving the four sessions in between.
        assert_eq!(current.today_volume, 100);
        assert_eq!(current.avg_5day_volume, (200 + 300 + 400 + 500) as f64 / 4.0);
    }

    #[test]
    fn missing_company_omitted_from_get_current() {
        let s = storage();
        let result = s.get_current(&[Uuid::new_v4()]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn file_backed_pool_shares_state_across_pooled_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pool.sqlite3");
        let s = Storage::open_with_pool_size(
            &db_path,
            VectorIndexConfig { dimensions: 8, m: 8, ef_construction: 32, ef_search: 32 },
            3,
        )
        .unwrap();

        // Round-robins across 3 pooled connections; every write must still
        // be visible regardless of which connection served the read.
        for code in ["300257", "688448", "002598"] {
            s.upsert_company(company_upsert(code)).unwrap();
        }
        for code in ["300257", "688448", "002598"] {
            assert!(s.get_company(code).unwrap().is_some());
        }
    }
}
