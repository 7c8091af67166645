// src/error.rs
use thiserror::Error;

/// Result type for queue, lock, processor and scheduler operations.
pub type Result<T> = std::result::Result<T, PantryError>;

#[derive(Debug, Error)]
pub enum PantryError {
    /// Start/stop called in the wrong running state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unroutable job type, bad cron expression, malformed job.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PantryError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Store, lock and serialization failures all count as internal.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Redis(_) | Self::Serialization(_) | Self::Internal(_)
        )
    }
}

impl From<cron::error::Error> for PantryError {
    fn from(err: cron::error::Error) -> Self {
        Self::Validation(format!("invalid cron expression: {err}"))
    }
}
