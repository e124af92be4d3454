//! Core functionality for the warden process supervisor
//!
//! This crate spawns child processes, streams their output asynchronously,
//! and tracks them in a supervisor that can terminate and wait for all of
//! them. Everything is driven by a tokio runtime supplied by the caller.

pub mod callbacks;
pub mod child;
pub mod config;
pub mod error;
pub mod options;
#[cfg(unix)]
pub mod process;
pub mod supervisor;

#[cfg(test)]
mod error_tests;

pub use callbacks::ProcessCallbacks;
pub use child::{AsyncChildProcess, ChildState, OutputStream, Target};
pub use error::{CoreError, Result};
pub use options::ProcessOptions;
#[cfg(unix)]
pub use process::EXIT_CODE_UNKNOWN;
pub use supervisor::{ChildId, ProcessSupervisor};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }

    /// Map an exit code to the status a shell would report for it
    ///
    /// Signal deaths (negative codes) become `128 + signo`; an unknown status
    /// becomes 1.
    pub fn shell_exit_status(code: i32) -> i32 {
        if code == crate::EXIT_CODE_UNKNOWN {
            1
        } else if code < 0 {
            128 + code.saturating_neg()
        } else {
            code
        }
    }
}
