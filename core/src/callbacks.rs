//! User-supplied notification handlers for a child process
//!
//! Every handler is optional. A child spawned with `ProcessCallbacks::default()`
//! is still reaped normally; its output is drained and discarded.

use crate::child::AsyncChildProcess;
use crate::CoreError;
use std::fmt;
use std::sync::Arc;

/// Handler invoked once after a successful spawn, before any output is delivered
pub type StartedCallback = Box<dyn FnOnce(&AsyncChildProcess) + Send + 'static>;

/// Handler for incremental stdout/stderr deliveries
pub type OutputCallback = Arc<dyn Fn(&AsyncChildProcess, &[u8]) + Send + Sync + 'static>;

/// Handler invoked exactly once with the child's exit code
pub type ExitCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Handler for I/O failures on a running child
pub type ErrorCallback = Arc<dyn Fn(&AsyncChildProcess, &CoreError) + Send + Sync + 'static>;

/// The notification set for one child
///
/// Output handlers receive exactly the bytes of one read completion; they are
/// not aligned to lines. Handlers run on a runtime worker thread and may run
/// concurrently with handlers of other children.
///
/// A panic in any handler other than `on_exit` is logged and contained; the
/// child is still reaped and `on_exit` still fires.
#[derive(Default)]
pub struct ProcessCallbacks {
    pub(crate) on_started: Option<StartedCallback>,
    pub(crate) on_stdout: Option<OutputCallback>,
    pub(crate) on_stderr: Option<OutputCallback>,
    pub(crate) on_exit: Option<ExitCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl ProcessCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&AsyncChildProcess) + Send + 'static,
    {
        self.on_started = Some(Box::new(f));
        self
    }

    pub fn on_stdout<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncChildProcess, &[u8]) + Send + Sync + 'static,
    {
        self.on_stdout = Some(Arc::new(f));
        self
    }

    pub fn on_stderr<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncChildProcess, &[u8]) + Send + Sync + 'static,
    {
        self.on_stderr = Some(Arc::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(i32) + Send + 'static,
    {
        self.on_exit = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncChildProcess, &CoreError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Detach the exit handler so the supervisor can wrap it
    pub(crate) fn take_exit(&mut self) -> Option<ExitCallback> {
        self.on_exit.take()
    }
}

impl fmt::Debug for ProcessCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCallbacks")
            .field("on_started", &self.on_started.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
