//! Error types for pairtrace-core

use thiserror::Error;

/// Errors raised while building correlation components
///
/// Missing or expired correlation partners are not errors; they surface as
/// ordinary results from the pair timer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A component was constructed with settings it cannot honor
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The background sweep thread could not be started
    #[error("Failed to start sweeper: {0}")]
    SweeperSpawn(#[from] std::io::Error),
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidConfiguration(message.into())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
