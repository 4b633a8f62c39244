// src/error.rs
//
// =============================================================================
// COWFS: ERROR TAXONOMY
// =============================================================================
//
// Typed failures crossing the engine boundary. The FS adapter maps these to
// POSIX errnos; the CLI maps them to non-zero exit codes.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    #[error("not a directory: {0}")]
    NotDir(String),

    #[error("version {given} out of range 1..={max}")]
    OutOfRange { given: i64, max: usize },

    #[error("ambiguous selector: {0}")]
    AmbiguousSelector(String),

    #[error("missing blob: {0}")]
    MissingBlob(String),

    #[error("object still referenced: {0}")]
    StillReferenced(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("corrupt store: {0}")]
    CorruptStore(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::TransactionFailed(e.to_string())
    }
}
