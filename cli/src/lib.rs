//! Runner used by the `warden` binary
//!
//! [`Runner`] wraps a [`ProcessSupervisor`], spawns children with callbacks
//! that forward their output to a pair of sinks, and records every exit code.

pub mod error;

pub use error::{CliError, Result};

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};
use warden_core::config::ProcessEntry;
use warden_core::{
    AsyncChildProcess, CoreError, OutputStream, ProcessCallbacks, ProcessOptions,
    ProcessSupervisor, Target,
};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Destinations for child stdout and stderr
#[derive(Clone)]
pub struct Sinks {
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl Sinks {
    pub fn new(stdout: impl Write + Send + 'static, stderr: impl Write + Send + 'static) -> Self {
        Self {
            stdout: Arc::new(Mutex::new(Box::new(stdout))),
            stderr: Arc::new(Mutex::new(Box::new(stderr))),
        }
    }

    /// The process's own stdout and stderr
    pub fn stdio() -> Self {
        Self::new(std::io::stdout(), std::io::stderr())
    }

    fn write(&self, stream: OutputStream, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let sink = match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        };
        let mut writer = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(data).and_then(|_| writer.flush()) {
            debug!("Failed to forward {} output: {}", stream, e);
        }
    }
}

/// Splits arbitrary output chunks into whole lines prefixed with a label
#[derive(Debug)]
pub struct LinePrefixer {
    prefix: String,
    pending: Vec<u8>,
}

impl LinePrefixer {
    pub fn new(name: &str) -> Self {
        Self {
            prefix: format!("[{}] ", name),
            pending: Vec::new(),
        }
    }

    /// Feed a chunk and return every line it completed, prefixed
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        let mut out = Vec::with_capacity(complete.len());
        for line in complete.split_inclusive(|b| *b == b'\n') {
            out.extend_from_slice(self.prefix.as_bytes());
            out.extend_from_slice(line);
        }
        out
    }

    /// Return the unterminated tail, if any, as a final prefixed line
    pub fn finish(&mut self) -> Vec<u8> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let mut out = self.prefix.as_bytes().to_vec();
        out.append(&mut self.pending);
        out.push(b'\n');
        out
    }
}

/// How a child's output reaches the sinks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Bytes are forwarded unchanged
    Raw,
    /// Each line is prefixed with `[name] `
    Prefixed,
}

/// What the child receives on stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinMode {
    /// Write the bytes once the child starts, then close stdin
    Text(Vec<u8>),
    /// Leave stdin open for the caller to feed through the returned handle
    Open,
}

/// Exit record of one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub name: String,
    pub code: i32,
}

/// Spawns named children under one supervisor and collects their exits
#[derive(Clone)]
pub struct Runner {
    supervisor: ProcessSupervisor,
    sinks: Sinks,
    exits: Arc<Mutex<Vec<ChildExit>>>,
}

impl Runner {
    pub fn new(runtime: Handle, sinks: Sinks) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(runtime),
            sinks,
            exits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Spawn one configured entry with prefixed output
    pub fn spawn_entry(&self, entry: &ProcessEntry) -> Result<AsyncChildProcess> {
        let target = entry.target()?;
        let options = entry.to_options()?;
        let stdin = entry.stdin.clone().unwrap_or_default().into_bytes();
        self.spawn(&entry.name, target, options, StdinMode::Text(stdin), OutputMode::Prefixed)
    }

    /// Spawn a child and forward its output to the sinks
    pub fn spawn(
        &self,
        name: &str,
        target: Target,
        options: ProcessOptions,
        stdin: StdinMode,
        mode: OutputMode,
    ) -> Result<AsyncChildProcess> {
        let prefixers = match mode {
            OutputMode::Raw => None,
            OutputMode::Prefixed => Some(Arc::new((
                Mutex::new(LinePrefixer::new(name)),
                Mutex::new(LinePrefixer::new(name)),
            ))),
        };

        let mut callbacks = ProcessCallbacks::new()
            .on_stdout(self.forwarder(OutputStream::Stdout, prefixers.clone()))
            .on_stderr(self.forwarder(OutputStream::Stderr, prefixers.clone()));

        if let StdinMode::Text(data) = stdin {
            let label = name.to_string();
            callbacks = callbacks.on_started(move |child| {
                if let Err(e) = child.write_to_stdin(data, true) {
                    warn!("[{}] Failed to queue stdin: {}", label, e);
                }
            });
        }

        let label = name.to_string();
        callbacks = callbacks.on_error(move |_, err| {
            if err.is_io_error() {
                warn!("[{}] {}", label, err);
            } else {
                error!("[{}] {}", label, err);
            }
        });

        let label = name.to_string();
        let sinks = self.sinks.clone();
        let exits = self.exits.clone();
        callbacks = callbacks.on_exit(move |code| {
            if let Some(prefixers) = prefixers {
                let tail = lock(&prefixers.0).finish();
                sinks.write(OutputStream::Stdout, &tail);
                let tail = lock(&prefixers.1).finish();
                sinks.write(OutputStream::Stderr, &tail);
            }
            debug!("[{}] exited with code {}", label, code);
            lock(&exits).push(ChildExit { name: label, code });
        });

        let child = match target {
            Target::Program { executable, args } => {
                self.supervisor.run_program(executable, args, options, callbacks)?
            }
            Target::Shell { command_line } => {
                self.supervisor.run_command(command_line, options, callbacks)?
            }
        };
        debug!("[{}] started with pid {:?}", name, child.pid());
        Ok(child)
    }

    fn forwarder(
        &self,
        stream: OutputStream,
        prefixers: Option<Arc<(Mutex<LinePrefixer>, Mutex<LinePrefixer>)>>,
    ) -> impl Fn(&AsyncChildProcess, &[u8]) + Send + Sync + 'static {
        let sinks = self.sinks.clone();
        move |_, data| match &prefixers {
            None => sinks.write(stream, data),
            Some(pair) => {
                let prefixer = match stream {
                    OutputStream::Stdout => &pair.0,
                    OutputStream::Stderr => &pair.1,
                };
                let lines = lock(prefixer).feed(data);
                sinks.write(stream, &lines);
            }
        }
    }

    /// Wait for every child without blocking a runtime worker
    pub async fn wait(&self, max_wait: Option<Duration>) -> Result<bool> {
        let supervisor = self.supervisor.clone();
        tokio::task::spawn_blocking(move || supervisor.wait(max_wait))
            .await
            .map_err(|e| CliError::CommandFailed(format!("wait task failed: {}", e)))
    }

    /// Exits recorded so far, in delivery order
    pub fn exits(&self) -> Vec<ChildExit> {
        lock(&self.exits).clone()
    }
}

/// Copy `input` to the child's stdin until EOF, then close the child's stdin
///
/// Stops early once the child no longer accepts input.
pub async fn forward_input<R: AsyncRead + Unpin>(mut input: R, child: AsyncChildProcess) {
    let mut buf = vec![0u8; 8192];
    loop {
        match input.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = child.write_to_stdin(&buf[..n], false) {
                    report_stdin_error(&child, &e);
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to read input for '{}': {}", child.target(), e);
                break;
            }
        }
    }
    if let Err(e) = child.write_to_stdin("", true) {
        report_stdin_error(&child, &e);
    }
}

/// A child that exited or closed its stdin is expected; anything else is logged
fn report_stdin_error(child: &AsyncChildProcess, err: &CoreError) {
    match err {
        CoreError::StdinClosed(_) | CoreError::InvalidState(_) => {
            debug!("Stopped forwarding input to '{}': {}", child.target(), err);
        }
        _ => warn!("Failed to forward input to '{}': {}", child.target(), err),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exit status for `warden run`: 2 if the wait did not complete, 0 when every
/// child exited 0, otherwise 1
pub fn run_status(exits: &[ChildExit], completed: bool) -> i32 {
    if !completed {
        2
    } else if exits.iter().all(|e| e.code == 0) {
        0
    } else {
        1
    }
}
