//! Error taxonomy (spec §7), one `thiserror` enum per layer composed into
//! one `AppError` at the HTTP/CLI boundary — the same `#[from]` composition
//! style the teacher uses for `StorageError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
    #[error("concept not found: {0}")]
    ConceptNotFound(uuid::Uuid),
    #[error("optimistic lock conflict on concept {concept_id} (expected version {expected}, found {found})")]
    OptimisticLock {
        concept_id: uuid::Uuid,
        expected: i64,
        found: i64,
    },
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("migration error: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("request to {service} timed out after {timeout_secs}s")]
    Timeout { service: &'static str, timeout_secs: u64 },
    #[error("{service} returned status {status}: {body}")]
    BadResponse {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} transport error: {0}")]
    Transport(#[source] reqwest::Error, &'static str),
    #[error("circuit open for {service}, retry after {cooldown_secs}s")]
    CircuitOpen { service: &'static str, cooldown_secs: u64 },
    #[error("{service} rejected an empty input text")]
    EmptyInput { service: &'static str },
    #[error("{service} returned {got} embeddings for {expected} inputs")]
    CountMismatch {
        service: &'static str,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    InvalidField { field: String, message: String },
    #[error("unknown query identifier: {0}")]
    UnknownIdentifier(String),
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("fusion failed after {attempts} attempts for concept {concept_name}")]
    RetriesExhausted { attempts: u32, concept_name: String },
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("query company not found: {0}")]
    CompanyNotFound(String),
}

#[derive(Debug, Error)]
pub enum ArchivalError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum VectorizationError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    External(#[from] ExternalServiceError),
}

#[derive(Debug, Error)]
pub enum FatalConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Top-level error composed at the HTTP/CLI boundary, mapped to the uniform
/// error envelope (spec §6.1) and to process exit codes (spec §6.4).
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    External(#[from] ExternalServiceError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Archival(#[from] ArchivalError),
    #[error(transparent)]
    Vectorization(#[from] VectorizationError),
    #[error(transparent)]
    Config(#[from] FatalConfigError),
}

impl AppError {
    /// HTTP status code per the uniform error envelope in spec §6.1.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 422,
            AppError::Retrieval(RetrievalError::CompanyNotFound(_))
            | AppError::Storage(StorageError::CompanyNotFound(_))
            | AppError::Storage(StorageError::ConceptNotFound(_)) => 404,
            AppError::External(ExternalServiceError::CircuitOpen { .. }) => 503,
            _ => 500,
        }
    }

    /// Machine-readable error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::Retrieval(RetrievalError::CompanyNotFound(_))
            | AppError::Storage(StorageError::CompanyNotFound(_)) => "company_not_found",
            AppError::Storage(StorageError::ConceptNotFound(_)) => "concept_not_found",
            AppError::Storage(StorageError::OptimisticLock { .. }) => "conflict",
            AppError::External(ExternalServiceError::CircuitOpen { .. }) => "service_unavailable",
            AppError::External(_) => "external_service_error",
            _ => "internal_error",
        }
    }

    /// Exit code for CLI invocations per spec §6.4/§7 (0 success and 1
    /// partial success are decided by the CLI driver itself, not here).
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::Config(_) => 2,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_422_and_exit_2() {
        let err = AppError::Validation(ValidationError::InvalidField {
            field: "top_k".into(),
            message: "must be positive".into(),
        });
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn company_not_found_maps_to_404() {
        let err = AppError::Retrieval(RetrievalError::CompanyNotFound("999999".into()));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn circuit_open_maps_to_503() {
        let err = AppError::External(ExternalServiceError::CircuitOpen {
            service: "embedding",
            cooldown_secs: 60,
        });
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn config_error_exits_2() {
        let err = AppError::Config(FatalConfigError::MissingEnv("ASHAREINSIGHT_DB_PATH"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn storage_error_exits_3_as_unhandled_fatal() {
        let err = AppError::Storage(StorageError::CompanyNotFound("999999".into()));
        assert_eq!(err.exit_code(), 3);
    }
}
