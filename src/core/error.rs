use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZipError {
    #[error("Malformed archive: {0}")]
    Format(String),

    #[error("Archive is closed")]
    Closed,

    #[error("Truncated data: needed {needed} bytes, only {available} available")]
    TruncatedData { needed: usize, available: usize },

    #[error("Value {value} does not fit in field (max {max})")]
    Range { value: u64, max: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Signing order violated: {0}")]
    SigningOrder(String),

    #[error("File {0} was modified outside of the archive")]
    ExternalModification(PathBuf),

    #[error("Invalid entry name: {0}")]
    InvalidName(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ZipError {
    /// Whether the caller can reasonably continue using the archive after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ZipError::NotFound(_) | ZipError::InvalidName(_) | ZipError::Config(_)
        )
    }
}

impl From<toml::de::Error> for ZipError {
    fn from(err: toml::de::Error) -> Self {
        ZipError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ZipError>;
