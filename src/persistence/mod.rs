//! File-backed session, checkpoint and plan storage

pub mod plan_store;
pub mod session_store;

pub use plan_store::FilePlanStore;
pub use session_store::{FileSessionStore, SessionRecord, StoredCheckpoint, DEFAULT_MAX_CHECKPOINTS};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors that can occur in the file-backed stores
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid module name '{module}': {reason}")]
    InvalidModule { module: String, reason: String },

    #[error("State corruption detected in {path}: {reason}")]
    StateCorruption { path: PathBuf, reason: String },
}

/// Where and by whom a record was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub pid: u32,
    pub hostname: String,
    pub version: String,
}

impl WriterMetadata {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Module names become path components, so only a conservative set is allowed
pub(crate) fn validate_module(module: &str) -> Result<(), PersistenceError> {
    let invalid = |reason: &str| PersistenceError::InvalidModule {
        module: module.to_string(),
        reason: reason.to_string(),
    };

    if module.is_empty() {
        return Err(invalid("empty"));
    }
    if module.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if !module
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("only ASCII letters, digits, '-', '_' and '.' are allowed"));
    }
    Ok(())
}

/// Write to a sibling temp file, then rename over the target
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_file = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&temp_file, contents).await?;
    fs::rename(&temp_file, path).await?;
    Ok(())
}

/// Read a file, treating "not found" as `None`
pub(crate) async fn read_optional(path: &Path) -> Result<Option<String>, PersistenceError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
