use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("Missing Dataset: the index has no dataset to build from")]
    MissingDataset,

    #[error("Dimension Mismatch: expected {expected} columns, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Unsupported Type: {0}")]
    UnsupportedType(String),

    #[error("Index Not Built Error")]
    NotBuilt,

    #[error("Format Error: {0}")]
    Format(String),

    #[error("Allocation Error: {0}")]
    Allocation(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Data Error: {0}")]
    DataError(String),

    #[error("IO Error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Io(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for IndexError {
    fn from(e: std::collections::TryReserveError) -> Self {
        IndexError::Allocation(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for IndexError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        IndexError::Allocation(format!("thread pool: {}", e))
    }
}
