use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Errors surfaced at the orchestrator's call boundary
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Errors raised by a model invocation
#[derive(Debug, Error)]
pub enum ModelError {
    /// The model could not serve the request; another model may.
    #[error("Model '{model}' unavailable: {message}")]
    Unavailable { model: String, message: String },

    #[error("Model invocation cancelled")]
    Cancelled,

    #[error("I/O error during model invocation: {0}")]
    Io(#[from] io::Error),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Model invocation failed: {0}")]
    Invocation(String),
}

/// Failure kinds that stop a run on first occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriticalKind {
    Io,
    Permission,
    ResourceExhausted,
    Security,
}

impl ModelError {
    pub fn unavailable(model: impl Into<String>, message: impl Into<String>) -> Self {
        ModelError::Unavailable {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ModelError::Unavailable { .. })
    }

    /// Map the error onto the closed set of critical kinds, if it belongs there
    pub fn critical_kind(&self) -> Option<CriticalKind> {
        match self {
            ModelError::Io(e) => Some(match e.kind() {
                io::ErrorKind::PermissionDenied => CriticalKind::Permission,
                io::ErrorKind::OutOfMemory => CriticalKind::ResourceExhausted,
                _ => CriticalKind::Io,
            }),
            ModelError::PermissionDenied(_) => Some(CriticalKind::Permission),
            ModelError::ResourceExhausted(_) => Some(CriticalKind::ResourceExhausted),
            ModelError::Security(_) => Some(CriticalKind::Security),
            ModelError::Unavailable { .. } | ModelError::Cancelled | ModelError::Invocation(_) => {
                None
            }
        }
    }

    pub fn is_critical(&self) -> bool {
        self.critical_kind().is_some()
    }
}
