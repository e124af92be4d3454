//! Asynchronous child process
//!
//! An [`AsyncChildProcess`] is one OS process plus its three pipes, driven by
//! tasks on a tokio runtime. It moves through the states
//!
//! ```text
//! Created → Running → Exited → Reaped
//!    └────→ Failed
//! ```
//!
//! `run` is the only call that can fail synchronously (the spawn itself).
//! Everything after a successful spawn is reported through the
//! [`ProcessCallbacks`] on a runtime worker thread:
//!
//! - one driver task per child fires `on_started`, watches for exit and
//!   handles terminate requests, then fires `on_exit` exactly once
//! - one reader task per output pipe delivers each read completion as-is
//! - one writer task drains the stdin queue in FIFO order
//!
//! Handles are cheap to clone; all clones refer to the same child.

use crate::callbacks::ProcessCallbacks;
use crate::options::ProcessOptions;
use crate::process;
use crate::{CoreError, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

mod io_task;


/// What a child executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Execute a program directly with an explicit argument vector
    Program { executable: String, args: Vec<String> },
    /// Hand a command line to the configured shell
    Shell { command_line: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Program { executable, args } if args.is_empty() => write!(f, "{}", executable),
            Target::Program { executable, args } => write!(f, "{} {}", executable, args.join(" ")),
            Target::Shell { command_line } => f.write_str(command_line),
        }
    }
}

/// Lifecycle state of a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildState {
    /// Constructed, not yet spawned
    Created,
    /// Spawned and not yet observed to exit
    Running,
    /// Exit observed; the exit notification is being delivered
    Exited,
    /// Exit notification has completed
    Reaped,
    /// The spawn itself failed
    Failed,
}

/// Which output pipe a delivery came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One queued stdin write
#[derive(Debug)]
pub(crate) struct StdinChunk {
    data: Vec<u8>,
    close: bool,
}

/// Requests handled by the driver task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlMsg {
    /// Send the configured terminate signal
    Terminate,
    /// Send SIGKILL
    Kill,
}

#[derive(Debug)]
struct Shared {
    state: ChildState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    stdin_tx: Option<mpsc::UnboundedSender<StdinChunk>>,
    stdin_close_requested: bool,
    control_tx: Option<mpsc::UnboundedSender<ControlMsg>>,
}

struct ChildInner {
    target: Target,
    options: ProcessOptions,
    runtime: Handle,
    shared: Mutex<Shared>,
}

/// Handle to one supervised OS process
#[derive(Clone)]
pub struct AsyncChildProcess {
    inner: Arc<ChildInner>,
}

impl AsyncChildProcess {
    /// Create a child that executes `executable` directly with `args`
    pub fn program<S: Into<String>>(
        runtime: Handle,
        executable: impl Into<String>,
        args: impl IntoIterator<Item = S>,
        options: ProcessOptions,
    ) -> Self {
        let target = Target::Program {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
        };
        Self::new(runtime, target, options)
    }

    /// Create a child that runs `command_line` through the configured shell
    pub fn command(runtime: Handle, command_line: impl Into<String>, options: ProcessOptions) -> Self {
        let target = Target::Shell {
            command_line: command_line.into(),
        };
        Self::new(runtime, target, options)
    }

    pub fn new(runtime: Handle, target: Target, options: ProcessOptions) -> Self {
        Self {
            inner: Arc::new(ChildInner {
                target,
                options,
                runtime,
                shared: Mutex::new(Shared {
                    state: ChildState::Created,
                    pid: None,
                    exit_code: None,
                    stdin_tx: None,
                    stdin_close_requested: false,
                    control_tx: None,
                }),
            }),
        }
    }

    /// Spawn the process and start streaming its I/O
    ///
    /// Returns `CoreError::ProcessSpawn` if the process could not be created;
    /// in that case the child moves to `Failed` and no callback is invoked.
    /// Calling `run` on a child that is not `Created` is `InvalidState`.
    pub fn run(&self, callbacks: ProcessCallbacks) -> Result<()> {
        let mut shared = self.lock();
        if shared.state != ChildState::Created {
            return Err(CoreError::InvalidState(format!(
                "cannot run '{}' in state {:?}",
                self.inner.target, shared.state
            )));
        }

        let spawned = {
            let _runtime = self.inner.runtime.enter();
            process::spawn_child(&self.inner.target, &self.inner.options)
        };
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                shared.state = ChildState::Failed;
                return Err(e);
            }
        };

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        shared.state = ChildState::Running;
        shared.pid = Some(spawned.pid.as_raw() as u32);
        shared.stdin_tx = Some(stdin_tx);
        shared.control_tx = Some(control_tx);
        drop(shared);

        debug!("Process {} running: {}", spawned.pid, self.inner.target);

        self.inner.runtime.spawn(io_task::drive(
            self.clone(),
            spawned,
            callbacks,
            stdin_rx,
            control_rx,
        ));
        Ok(())
    }

    /// Queue bytes for the child's standard input
    ///
    /// Writes are delivered in call order. With `close_after_write` the pipe
    /// is closed once this write and every earlier one has been flushed.
    /// After a close has been requested every further call fails with
    /// `CoreError::StdinClosed` and nothing is queued.
    pub fn write_to_stdin(&self, data: impl Into<Vec<u8>>, close_after_write: bool) -> Result<()> {
        let mut shared = self.lock();
        if shared.stdin_close_requested {
            return Err(CoreError::StdinClosed(format!(
                "close already requested for stdin of '{}'",
                self.inner.target
            )));
        }
        if shared.state != ChildState::Running {
            return Err(CoreError::InvalidState(format!(
                "cannot write to stdin of '{}' in state {:?}",
                self.inner.target, shared.state
            )));
        }

        let tx = shared.stdin_tx.as_ref().ok_or_else(|| {
            CoreError::StdinClosed(format!("stdin of '{}' is no longer writable", self.inner.target))
        })?;
        tx.send(StdinChunk {
            data: data.into(),
            close: close_after_write,
        })
        .map_err(|_| {
            CoreError::StdinClosed(format!("stdin writer of '{}' has stopped", self.inner.target))
        })?;

        if close_after_write {
            shared.stdin_close_requested = true;
            shared.stdin_tx = None;
        }
        Ok(())
    }

    /// Ask the process to terminate with the configured signal
    ///
    /// The exit is still reported through `on_exit` once it is observed. A
    /// child that has already exited, been reaped or failed to spawn is left
    /// alone and `Ok(())` is returned.
    pub fn terminate(&self) -> Result<()> {
        self.control(ControlMsg::Terminate)
    }

    /// Forcefully kill the process with SIGKILL
    pub fn kill(&self) -> Result<()> {
        self.control(ControlMsg::Kill)
    }

    fn control(&self, msg: ControlMsg) -> Result<()> {
        let shared = self.lock();
        match shared.state {
            ChildState::Created => Err(CoreError::InvalidState(format!(
                "'{}' has not been started",
                self.inner.target
            ))),
            ChildState::Running => {
                if let Some(tx) = &shared.control_tx {
                    if tx.send(msg).is_err() {
                        debug!("Driver of '{}' already finished, dropping {:?}", self.inner.target, msg);
                    }
                }
                Ok(())
            }
            ChildState::Exited | ChildState::Reaped | ChildState::Failed => Ok(()),
        }
    }

    /// Process ID, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn state(&self) -> ChildState {
        self.lock().state
    }

    /// Exit code, once the exit has been observed
    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.inner.options
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_exited(&self, code: i32) {
        let mut shared = self.lock();
        shared.state = ChildState::Exited;
        shared.exit_code = Some(code);
        shared.stdin_tx = None;
        shared.control_tx = None;
    }

    pub(crate) fn mark_reaped(&self) {
        self.lock().state = ChildState::Reaped;
    }

    /// Record that the stdin writer stopped on an error
    pub(crate) fn mark_stdin_broken(&self) {
        self.lock().stdin_tx = None;
    }
}

impl fmt::Debug for AsyncChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock();
        f.debug_struct("AsyncChildProcess")
            .field("target", &self.inner.target)
            .field("state", &shared.state)
            .field("pid", &shared.pid)
            .field("exit_code", &shared.exit_code)
            .finish()
    }
}
