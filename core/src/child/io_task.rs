//! Runtime tasks that drive one child from spawn to reap

use super::{AsyncChildProcess, ControlMsg, OutputStream, StdinChunk};
use crate::callbacks::{ErrorCallback, OutputCallback, ProcessCallbacks};
use crate::process::{self, OutputReader, SpawnedChild, EXIT_CODE_UNKNOWN};
use crate::CoreError;
use nix::unistd::Pid;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, warn};

/// Driver task: owns the OS child handle until its exit has been delivered
pub(super) async fn drive(
    child: AsyncChildProcess,
    spawned: SpawnedChild,
    callbacks: ProcessCallbacks,
    stdin_rx: mpsc::UnboundedReceiver<StdinChunk>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
) {
    let ProcessCallbacks {
        on_started,
        on_stdout,
        on_stderr,
        on_exit,
        on_error,
    } = callbacks;
    let SpawnedChild {
        child: mut os_child,
        pid,
        stdin,
        stdout,
        stderr,
    } = spawned;
    let options = child.options().clone();

    if let Some(on_started) = on_started {
        guarded(pid, "on_started", || on_started(&child));
    }

    let stdout_task = stdout.map(|reader| {
        tokio::spawn(read_stream(
            child.clone(),
            pid,
            reader,
            OutputStream::Stdout,
            on_stdout,
            on_error.clone(),
        ))
    });
    let stderr_task = stderr.map(|reader| {
        tokio::spawn(read_stream(
            child.clone(),
            pid,
            reader,
            OutputStream::Stderr,
            on_stderr,
            on_error.clone(),
        ))
    });
    let stdin_task = stdin.map(|writer| {
        tokio::spawn(write_stdin(
            child.clone(),
            pid,
            writer,
            stdin_rx,
            on_error.clone(),
        ))
    });

    let group = options.new_process_group;
    let mut kill_deadline: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = os_child.wait() => break status,

            Some(msg) = control_rx.recv() => match msg {
                ControlMsg::Terminate => {
                    if let Err(e) = process::signal_process(pid, options.terminate_signal, group) {
                        report_error(&child, pid, on_error.as_ref(), &e);
                    }
                    if let (Some(grace), None) = (options.kill_after, kill_deadline) {
                        kill_deadline = Some(Instant::now() + grace);
                    }
                }
                ControlMsg::Kill => {
                    kill_deadline = None;
                    if let Err(e) = process::kill_process(pid, group) {
                        report_error(&child, pid, on_error.as_ref(), &e);
                    }
                }
            },

            _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                kill_deadline = None;
                warn!(
                    "Process {} still running {:?} after terminate request, sending SIGKILL",
                    pid, options.kill_after
                );
                if let Err(e) = process::kill_process(pid, group) {
                    report_error(&child, pid, on_error.as_ref(), &e);
                }
            }
        }
    };

    let code = match status {
        Ok(status) => process::exit_code(status),
        Err(e) => {
            let err = CoreError::ProcessWait(format!("Failed to wait for process {}: {}", pid, e));
            report_error(&child, pid, on_error.as_ref(), &err);
            EXIT_CODE_UNKNOWN
        }
    };
    debug!("Process {} exited with code {}", pid, code);

    // Output already sitting in the pipes is delivered before the exit
    let deadline = Instant::now() + options.output_drain_timeout;
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        drain(task, deadline, pid).await;
    }
    if let Some(task) = stdin_task {
        task.abort();
    }

    child.mark_exited(code);
    if let Some(on_exit) = on_exit {
        on_exit(code);
    }
    child.mark_reaped();
    debug!("Process {} reaped", pid);
}

async fn drain(mut task: JoinHandle<()>, deadline: Instant, pid: Pid) {
    if timeout_at(deadline, &mut task).await.is_err() {
        // A grandchild may still hold the pipe open
        debug!("Output of process {} still open after exit, abandoning reader", pid);
        task.abort();
    }
}

async fn read_stream(
    child: AsyncChildProcess,
    pid: Pid,
    mut reader: OutputReader,
    stream: OutputStream,
    on_output: Option<OutputCallback>,
    on_error: Option<ErrorCallback>,
) {
    let mut buf = vec![0u8; child.options().read_buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(on_output) = &on_output {
                    guarded(pid, "output", || on_output(&child, &buf[..n]));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let err = CoreError::StreamRead(format!("{} of process {}: {}", stream, pid, e));
                report_error(&child, pid, on_error.as_ref(), &err);
                break;
            }
        }
    }
    debug!("{} of process {} reached EOF", stream, pid);
}

async fn write_stdin(
    child: AsyncChildProcess,
    pid: Pid,
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<StdinChunk>,
    on_error: Option<ErrorCallback>,
) {
    while let Some(chunk) = queue.recv().await {
        if !chunk.data.is_empty() {
            if let Err(e) = write_chunk(&mut stdin, &chunk.data).await {
                child.mark_stdin_broken();
                let err = CoreError::StreamWrite(format!("stdin of process {}: {}", pid, e));
                report_error(&child, pid, on_error.as_ref(), &err);
                return;
            }
        }
        if chunk.close {
            break;
        }
    }
    debug!("Closing stdin of process {}", pid);
}

async fn write_chunk(stdin: &mut ChildStdin, data: &[u8]) -> io::Result<()> {
    stdin.write_all(data).await?;
    stdin.flush().await
}

fn report_error(child: &AsyncChildProcess, pid: Pid, on_error: Option<&ErrorCallback>, err: &CoreError) {
    match on_error {
        Some(on_error) => guarded(pid, "on_error", || on_error(child, err)),
        None => warn!("Process {}: {}", pid, err),
    }
}

/// Run a caller's handler, containing any panic so the exit is still delivered
fn guarded(pid: Pid, handler: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{} handler of process {} panicked", handler, pid);
    }
}
