use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("Store encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid glob pattern '{0}'")]
    InvalidGlob(String),

    #[error("Root path not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Root path is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("Path escapes scan root: {0}")]
    RootEscape(PathBuf),

    #[error("Scan not found: {0}")]
    ScanNotFound(String),

    #[error("Scan {0} is not complete")]
    ScanNotComplete(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Group member not found: {0}")]
    MemberNotFound(String),

    #[error("Folder not present in scan index: {0}")]
    FolderNotIndexed(String),

    #[error("Deletion is disabled for this scan")]
    DeletionDisabled,

    #[error("Cannot plan deletion of canonical member: {0}")]
    CannotPlanCanonical(String),

    #[error("Path cannot be planned for deletion: {0}")]
    InvalidPlanPath(String),

    #[error("Deletion plan not found: {0}")]
    PlanNotFound(String),

    #[error("Confirmation token is invalid")]
    TokenInvalid,

    #[error("Confirmation token has expired")]
    TokenExpired,

    #[error("Drift detected for queued path: {0}")]
    DriftDetected(String),

    #[error("Scan was cancelled")]
    Cancelled,
}
