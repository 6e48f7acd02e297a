//! Cloud orchestration error types

use thiserror::Error;

/// Errors raised by the orchestration core and its collaborators
#[derive(Error, Debug)]
pub enum CloudError {
    /// Lost a compare-and-swap race (e.g. another worker claimed the task)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A cancellable wait was superseded by a newer action
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Error surfaced by a provider API call; retried by polling or task requeue
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Task {id} exhausted {attempts} attempts: {error}")]
    Exhausted {
        id: String,
        attempts: u32,
        error: String,
    },

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("No handler registered for task type {0}")]
    NoHandler(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CloudError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CloudError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CloudError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CloudError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
