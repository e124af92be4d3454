//! CLI error types

use thiserror::Error;
use warden_core::CoreError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Supervisor error: {0}")]
    SupervisorError(#[from] CoreError),
}

impl CliError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CliError::CommandFailed(_) => "CLI001",
            CliError::ConfigError(_) => "CLI003",
            CliError::SupervisorError(_) => "CLI006",
        }
    }
}

/// CLI-specific result type
pub type Result<T> = std::result::Result<T, CliError>;
