use thiserror::Error;

/// Failures raised by the local store.
///
/// Any I/O failure against the backing file is fatal to the specific
/// operation and surfaces here; it is never silently dropped. "No such
/// region" is an explicit variant so callers can tell it apart from a failed
/// lookup.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("region {0} not found")]
    RegionNotFound(i64),

    #[error("resource {0} not found")]
    ResourceNotFound(String),

    #[error("invalid region definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid region metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid region status: {0}")]
    InvalidStatus(String),

    #[error("merge from {path} failed: {reason}")]
    Merge { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
