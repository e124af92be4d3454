//! Core error types and utilities

use thiserror::Error;

/// Errors produced by the supervisor, its children and the config loader
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Process signal error: {0}")]
    ProcessSignal(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Stdin closed: {0}")]
    StdinClosed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("Stream write error: {0}")]
    StreamWrite(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::IoError(_) => "CORE005",
            CoreError::ProcessSpawn(_) => "CORE010",
            CoreError::ProcessSignal(_) => "CORE011",
            CoreError::ProcessWait(_) => "CORE012",
            CoreError::StdinClosed(_) => "CORE013",
            CoreError::InvalidState(_) => "CORE014",
            CoreError::StreamRead(_) => "CORE015",
            CoreError::StreamWrite(_) => "CORE016",
            CoreError::Other(_) => "CORE999",
        }
    }

    /// Whether this error was reported while the child was already running,
    /// as opposed to a synchronous failure at the call site
    pub fn is_io_error(&self) -> bool {
        matches!(
            self,
            CoreError::StreamRead(_) | CoreError::StreamWrite(_) | CoreError::ProcessSignal(_)
        )
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

// Convenience implementations
impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::ConfigurationError("test".to_string()).code(), "CORE001");
        assert_eq!(CoreError::ValidationError("test".to_string()).code(), "CORE002");
        assert_eq!(CoreError::InitializationError("test".to_string()).code(), "CORE003");
        assert_eq!(CoreError::ProcessSpawn("test".to_string()).code(), "CORE010");
        assert_eq!(CoreError::StdinClosed("test".to_string()).code(), "CORE013");
        assert_eq!(CoreError::Other("test".to_string()).code(), "CORE999");
    }

    #[test]
    fn test_error_display() {
        let error = CoreError::ProcessSpawn("no such file".to_string());
        assert_eq!(error.to_string(), "Process spawn error: no such file");
    }

    #[test]
    fn test_from_implementations() {
        let error: CoreError = "test error".into();
        assert_eq!(error.to_string(), "Generic error: test error");

        let error: CoreError = "test error".to_string().into();
        assert_eq!(error.to_string(), "Generic error: test error");
    }
}
