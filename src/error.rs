//! Error types for the job engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Database-related errors.
///
/// Storage failures propagate to the caller unmodified — the engine cannot
/// safely recover from them.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
///
/// Only validation and not-found conditions raise. Invalid status
/// transitions and corruption repairs are absorbed locally with a warning
/// log instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid session id: {reason}")]
    InvalidSession { reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
