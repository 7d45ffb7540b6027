use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapbackError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WalkDir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Corrupt data in {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("Path recorded twice in signature cache: {0}")]
    DuplicatePath(PathBuf),

    #[error("Restore chain corrupt: {0}")]
    ChainCorrupt(String),

    #[error("cancelled")]
    Cancelled,
}

impl SnapbackError {
    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        SnapbackError::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
