use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("could not ingest document '{document}': {reason}")]
    Ingestion { document: String, reason: String },

    #[error("document '{0}' is already indexed (use --supersede to replace it)")]
    DuplicateDocument(String),

    #[error("vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk '{0}' is already in the index")]
    DuplicateChunk(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(
        "index was built with embedding model '{stored}' but '{configured}' is configured; run `lastro rebuild`"
    )]
    IndexIncompatible { stored: String, configured: String },

    #[error("answer generation failed: {0}")]
    Generation(GenerationFailure),

    #[error("all query workers are busy, try again shortly")]
    Busy,
}

/// Why a generator call failed.
///
/// `transient` failures (timeouts, connection errors, rate limits, server
/// errors) may be retried; everything else is surfaced immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationFailure {
    pub message: String,
    pub transient: bool,
}

impl GenerationFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl std::fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error {
    pub(crate) fn ingestion(
        document: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Ingestion {
            document: document.into(),
            reason: reason.into(),
        }
    }

    /// True for generator failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Generation(f) if f.transient)
    }
}

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Model(format!("tensor computation error: {e}"))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Redb(e.into())
    }
}
