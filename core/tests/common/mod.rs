//! Shared fixtures for supervisor integration tests.

#![allow(dead_code)]

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;
use warden_core::{ProcessCallbacks, ProcessSupervisor};

/// Default upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// A multi-thread runtime acting as the event substrate, plus a supervisor on it.
///
/// Tests drive the supervisor from the plain test thread, so the blocking
/// `wait` never runs on a runtime worker.
pub struct Fixture {
    pub runtime: Runtime,
    pub supervisor: ProcessSupervisor,
}

impl Fixture {
    pub fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Failed to build runtime");
        let supervisor = ProcessSupervisor::new(runtime.handle().clone());
        Self { runtime, supervisor }
    }
}

/// Output sink shared between a callback and the test body
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn push(&self, bytes: &[u8]) {
        self.0.lock().unwrap().extend_from_slice(bytes);
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Callbacks capturing stdout and sending the exit code down a channel
pub fn capture_stdout() -> (ProcessCallbacks, Captured, mpsc::Receiver<i32>) {
    let output = Captured::default();
    let (exit_tx, exit_rx) = mpsc::channel();

    let sink = output.clone();
    let callbacks = ProcessCallbacks::new()
        .on_stdout(move |_, bytes| sink.push(bytes))
        .on_exit(move |code| {
            let _ = exit_tx.send(code);
        });
    (callbacks, output, exit_rx)
}
