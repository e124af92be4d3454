//! Spawn-time configuration for a single child process

use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default interpreter for shell-mode children
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Default number of bytes requested per read completion
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Default time exit handling waits for the output pipes to reach EOF
pub const DEFAULT_OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Options describing how one child is spawned
///
/// Owned by the caller and copied into the child when it is created; the
/// child never observes later changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOptions {
    /// Working directory for the child (inherits ours when `None`)
    pub working_directory: Option<PathBuf>,
    /// Environment variables to set or override
    pub environment: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting ours
    pub clear_environment: bool,
    /// Interpreter used for shell-mode children, invoked as `<shell> -c <line>`
    pub shell: PathBuf,
    /// Place the child in a new session and process group via `setsid()`
    pub new_process_group: bool,
    /// Send stderr down the stdout pipe
    pub merge_stderr: bool,
    /// Maximum bytes delivered by a single read completion
    pub read_buffer_size: usize,
    /// Signal sent by `terminate()`
    pub terminate_signal: Signal,
    /// Escalate to SIGKILL if the child outlives a terminate request by this long
    pub kill_after: Option<Duration>,
    /// How long exit handling waits for stdout/stderr to reach EOF
    pub output_drain_timeout: Duration,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            working_directory: None,
            environment: HashMap::new(),
            clear_environment: false,
            shell: PathBuf::from(DEFAULT_SHELL),
            new_process_group: false,
            merge_stderr: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            terminate_signal: Signal::SIGTERM,
            kill_after: None,
            output_drain_timeout: DEFAULT_OUTPUT_DRAIN_TIMEOUT,
        }
    }
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_clear_environment(mut self, clear: bool) -> Self {
        self.clear_environment = clear;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    pub fn with_merge_stderr(mut self, enabled: bool) -> Self {
        self.merge_stderr = enabled;
        self
    }

    /// Set the per-read buffer size; zero is clamped to one byte
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_terminate_signal(mut self, signal: Signal) -> Self {
        self.terminate_signal = signal;
        self
    }

    pub fn with_kill_after(mut self, grace: Duration) -> Self {
        self.kill_after = Some(grace);
        self
    }

    pub fn with_output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.output_drain_timeout = timeout;
        self
    }
}
