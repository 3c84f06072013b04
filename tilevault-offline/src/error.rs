use thiserror::Error;
use tilevault_store::StoreError;

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid region definition: {0}")]
    InvalidDefinition(String),

    #[error("region {0} not found")]
    RegionNotFound(i64),

    #[error("region {0} has an active download")]
    DownloadActive(i64),

    #[error("tile count limit of {limit} exceeded")]
    TileCountLimitExceeded { limit: u64 },

    #[error("style document could not be resolved: {0}")]
    StyleResolution(String),
}

pub type Result<T> = std::result::Result<T, OfflineError>;
