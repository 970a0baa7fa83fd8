// ABOUTME: Error types for the storage layer
// ABOUTME: Distinguishes database failures from lifecycle conflicts callers must act on

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Box not found: {0}")]
    BoxNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Box {0} already has a deployment in progress")]
    AlreadyDeploying(String),

    #[error("Subdomain already taken: {0}")]
    DuplicateSubdomain(String),

    #[error("Box {box_id} cannot move from {from} to {to}")]
    InvalidTransition {
        box_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Database conditions that may clear on retry
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::PoolTimedOut)
            | StorageError::Database(sqlx::Error::Io(_)) => true,
            StorageError::Database(sqlx::Error::Database(db)) => {
                let message = db.message();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}
