use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("duplicate key '{key}' in {table}")]
    Duplicate { table: &'static str, key: String },

    /// The lock marker stayed in place for the whole retry budget.
    #[error("timed out waiting for lock {}", .0.display())]
    LockTimeout(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;
