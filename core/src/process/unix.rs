//! Unix spawn and signal primitives
//!
//! This module is the boundary between the supervisor and the operating
//! system. It builds a [`tokio::process::Command`] from a [`Target`] and
//! [`ProcessOptions`], wires up the stdio pipes, and delivers signals.
//!
//! ## Process Groups
//!
//! When `new_process_group` is set the child calls `setsid()` before `exec()`,
//! which makes it the leader of a new session and process group. Termination
//! signals are then sent to the negative process ID so the whole tree sees
//! them.
//!
//! ## Merged Output
//!
//! With `merge_stderr` both descriptors 1 and 2 of the child point at the
//! write end of one anonymous pipe, and the parent reads the combined stream
//! from the read end.

// setsid() in pre_exec requires unsafe
#![allow(unsafe_code)]

use crate::child::Target;
use crate::options::ProcessOptions;
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error};

/// Exit code reported when the exit status could not be collected
pub const EXIT_CODE_UNKNOWN: i32 = i32::MIN;

/// A readable end of one of the child's output pipes
pub type OutputReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// A freshly spawned OS process with its pipe ends detached
pub struct SpawnedChild {
    /// Handle used for exit detection and reaping
    pub child: Child,
    /// Process ID of the child
    pub pid: Pid,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<OutputReader>,
    /// `None` when stderr is merged into stdout
    pub stderr: Option<OutputReader>,
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild")
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Build the command for a target without spawning it
///
/// Program targets are executed directly; shell targets run as
/// `<options.shell> -c <command_line>`.
pub fn build_command(target: &Target, options: &ProcessOptions) -> Command {
    let mut command = match target {
        Target::Program { executable, args } => {
            let mut command = Command::new(executable);
            command.args(args);
            command
        }
        Target::Shell { command_line } => {
            let mut command = Command::new(&options.shell);
            command.arg("-c").arg(command_line);
            command
        }
    };

    if options.clear_environment {
        command.env_clear();
    }
    command.envs(&options.environment);

    if let Some(dir) = &options.working_directory {
        command.current_dir(dir);
    }

    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    if options.new_process_group {
        // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
        #[deny(unsafe_op_in_unsafe_fn)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    command
}

/// Spawn a target and detach its pipe ends
///
/// Must be called from within a tokio runtime context: the process handle and
/// the pipe readers register with the runtime's reactor.
pub fn spawn_child(target: &Target, options: &ProcessOptions) -> Result<SpawnedChild> {
    let description = describe(target, options);
    debug!("Spawning process: {}", description);

    let mut command = build_command(target, options);

    let merged_reader = if options.merge_stderr {
        let (read_end, write_end) = output_pipe()?;
        let stderr_end = write_end.try_clone().map_err(|e| {
            CoreError::ProcessSpawn(format!("Failed to duplicate output pipe: {}", e))
        })?;
        command.stdout(Stdio::from(write_end));
        command.stderr(Stdio::from(stderr_end));
        Some(read_end)
    } else {
        None
    };

    let mut child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", description, e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", description, e))
    })?;
    // Releases our copies of the merged pipe's write end so EOF is observable
    drop(command);

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);

    let stdin = child.stdin.take();
    let (stdout, stderr): (Option<OutputReader>, Option<OutputReader>) = match merged_reader {
        Some(read_end) => {
            let receiver = pipe::Receiver::from_owned_fd(read_end).map_err(|e| {
                CoreError::ProcessSpawn(format!("Failed to register output pipe: {}", e))
            })?;
            (Some(Box::pin(receiver) as OutputReader), None)
        }
        None => (
            child.stdout.take().map(|s| Box::pin(s) as OutputReader),
            child.stderr.take().map(|s| Box::pin(s) as OutputReader),
        ),
    };

    debug!("Successfully spawned process {} ({})", pid, description);

    Ok(SpawnedChild {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// The command line as it is actually executed
pub fn describe(target: &Target, options: &ProcessOptions) -> String {
    match target {
        Target::Program { .. } => target.to_string(),
        Target::Shell { command_line } => {
            format!("{} -c {:?}", options.shell.display(), command_line)
        }
    }
}

/// Create an anonymous pipe whose ends are not inherited by unrelated children
fn output_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = nix::unistd::pipe()
        .map_err(|e| CoreError::ProcessSpawn(format!("Failed to create output pipe: {}", e)))?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
            CoreError::ProcessSpawn(format!("Failed to set FD_CLOEXEC on output pipe: {}", e))
        })?;
    }
    Ok((read_end, write_end))
}

/// Send a signal to a process, or to its whole process group
///
/// `ESRCH` and `EPERM` are treated as success: both mean the target has
/// already exited (or been replaced) and there is nothing left to signal.
pub fn signal_process(pid: Pid, signal: Signal, group: bool) -> Result<()> {
    let scope = if group { "process group" } else { "process" };
    debug!("Sending {} to {} {}", signal, scope, pid);

    let result = if group {
        killpg(pid, signal)
    } else {
        kill(pid, signal)
    };

    match result {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!("{} {} already exited", scope, pid);
            Ok(())
        }
        Err(Errno::EPERM) => {
            debug!(
                "Permission denied signaling {} {} (likely already exited)",
                scope, pid
            );
            Ok(())
        }
        Err(e) => {
            error!("Failed to send {} to {} {}: {}", signal, scope, pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to {} {}: {}",
                signal, scope, pid, e
            )))
        }
    }
}

/// Forcefully kill a process or its process group with SIGKILL
pub fn kill_process(pid: Pid, group: bool) -> Result<()> {
    signal_process(pid, Signal::SIGKILL, group)
}

/// Map an OS exit status onto the integer exit-code convention
///
/// Normal exits report their code; deaths by signal report the negated signal
/// number.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => EXIT_CODE_UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(executable: &str, args: &[&str]) -> Target {
        Target::Program {
            executable: executable.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_spawn_simple_command() {
        let spawned = spawn_child(&program("echo", &["hello"]), &ProcessOptions::default())
            .expect("Failed to spawn echo");
        assert!(spawned.pid.as_raw() > 0);
        assert!(spawned.stdin.is_some());
        assert!(spawned.stdout.is_some());
        assert!(spawned.stderr.is_some());
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let mut spawned = spawn_child(&program("true", &[]), &ProcessOptions::default())
            .expect("Failed to spawn true");
        let status = spawned.child.wait().await.expect("Failed to wait for process");
        assert_eq!(exit_code(status), 0);
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let result = spawn_child(
            &program("nonexistent_command_12345", &[]),
            &ProcessOptions::default(),
        );
        match result {
            Err(CoreError::ProcessSpawn(_)) => {}
            other => panic!("Expected ProcessSpawn error, got: {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_merged_output_has_single_reader() {
        let options = ProcessOptions::default().with_merge_stderr(true);
        let spawned = spawn_child(&program("true", &[]), &options).expect("Failed to spawn true");
        assert!(spawned.stdout.is_some());
        assert!(spawned.stderr.is_none());
    }

    #[tokio::test]
    async fn test_new_process_group_leader() {
        let options = ProcessOptions::default().with_new_process_group(true);
        let mut spawned =
            spawn_child(&program("sleep", &["5"]), &options).expect("Failed to spawn sleep");

        let pgid = nix::unistd::getpgid(Some(spawned.pid)).expect("getpgid failed");
        assert_eq!(pgid, spawned.pid);

        signal_process(spawned.pid, Signal::SIGKILL, true).expect("killpg failed");
        let status = spawned.child.wait().await.expect("wait failed");
        assert_eq!(exit_code(status), -9);
    }

    #[tokio::test]
    async fn test_signal_nonexistent_process() {
        // Very unlikely to be a live pid in a test environment
        let result = signal_process(Pid::from_raw(999_999), Signal::SIGTERM, false);
        assert!(result.is_ok());
        assert!(kill_process(Pid::from_raw(999_999), true).is_ok());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(0)), 0);
        // wait(2) encoding: exit code in the second byte
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(127 << 8)), 127);
        // killed by SIGTERM
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(15)), -15);
    }

    #[test]
    fn test_describe_names_configured_shell() {
        let shell = Target::Shell {
            command_line: "echo hi".to_string(),
        };
        assert_eq!(describe(&shell, &ProcessOptions::default()), "/bin/sh -c \"echo hi\"");

        let bash = ProcessOptions::default().with_shell("/bin/bash");
        assert_eq!(describe(&shell, &bash), "/bin/bash -c \"echo hi\"");

        assert_eq!(describe(&program("/bin/echo", &["a"]), &bash), "/bin/echo a");
    }

    #[test]
    fn test_missing_shell_is_named_in_spawn_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        let _guard = runtime.enter();

        let options = ProcessOptions::default().with_shell("/nonexistent/warden-shell");
        let target = Target::Shell {
            command_line: "true".to_string(),
        };
        match spawn_child(&target, &options) {
            Err(CoreError::ProcessSpawn(msg)) => {
                assert!(msg.contains("/nonexistent/warden-shell -c"), "message was {}", msg)
            }
            other => panic!("Expected ProcessSpawn, got {:?}", other),
        }
    }
}
