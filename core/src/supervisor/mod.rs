//! Process supervisor
//!
//! [`ProcessSupervisor`] owns the set of live children and guarantees that
//! spawning, reaping, bulk termination and bulk waiting stay consistent while
//! exits arrive concurrently on runtime worker threads.
//!
//! ## Reap protocol
//!
//! The caller's `on_exit` is never handed to the child directly. The
//! supervisor installs a wrapper that
//!
//! 1. locks, removes the child from the live set, marks a notification as in
//!    progress, unlocks
//! 2. calls the caller's `on_exit` outside the lock, so it may call back into
//!    the supervisor (for example to spawn a replacement)
//! 3. locks, clears the in-progress mark, and wakes every waiter if the
//!    supervisor is now quiescent
//!
//! "Quiescent" means the live set is empty *and* no exit notification is in
//! progress, so [`ProcessSupervisor::wait`] never reports success while a
//! caller's `on_exit` is still running.
//!
//! The wrapper captures only the child's [`ChildId`]; the live set is the
//! single owner of child handles.
//!
//! A child enters the live set before it is spawned. If `terminate_all` finds
//! it still `Created`, the request is parked and delivered as soon as the
//! spawn completes.

use crate::callbacks::ProcessCallbacks;
use crate::child::{AsyncChildProcess, ChildState, Target};
use crate::options::ProcessOptions;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};


/// Opaque identifier of a child in the supervisor's live set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildId(u64);

impl fmt::Display for ChildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct LiveSet {
    next_id: u64,
    children: HashMap<ChildId, AsyncChildProcess>,
    /// Exit notifications that have left the live set but not yet returned
    notifying: usize,
    /// Children asked to terminate before their spawn completed
    pending_terminate: HashSet<ChildId>,
}

impl LiveSet {
    fn is_quiescent(&self) -> bool {
        self.children.is_empty() && self.notifying == 0
    }
}

struct SupervisorInner {
    runtime: Handle,
    live: Mutex<LiveSet>,
    quiescent: Condvar,
}

impl SupervisorInner {
    fn lock(&self) -> MutexGuard<'_, LiveSet> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_if_quiescent(&self, live: &LiveSet) {
        if live.is_quiescent() {
            debug!("Supervisor has no running children, waking waiters");
            self.quiescent.notify_all();
        }
    }
}

/// Marks one exit notification as finished, even if the caller's `on_exit` panics
struct NotificationGuard {
    inner: Arc<SupervisorInner>,
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        let mut live = self.inner.lock();
        live.notifying = live.notifying.saturating_sub(1);
        self.inner.notify_if_quiescent(&live);
    }
}

/// Spawns children and tracks them until their exit has been delivered
///
/// Cloning yields another handle to the same supervisor. Dropping every
/// handle does not terminate children that are still running; use
/// [`terminate_all`](Self::terminate_all) and [`wait`](Self::wait).
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// Create a supervisor whose children are driven by `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                runtime,
                live: Mutex::new(LiveSet::default()),
                quiescent: Condvar::new(),
            }),
        }
    }

    /// Run `executable` directly with `args`
    ///
    /// Returns an error only if the process could not be spawned; all later
    /// events arrive through `callbacks`.
    pub fn run_program<S: Into<String>>(
        &self,
        executable: impl Into<String>,
        args: impl IntoIterator<Item = S>,
        options: ProcessOptions,
        callbacks: ProcessCallbacks,
    ) -> Result<AsyncChildProcess> {
        let target = Target::Program {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
        };
        self.run_child(target, options, callbacks)
    }

    /// Run `command_line` through the shell configured in `options`
    ///
    /// A command line the shell cannot execute is not an error here: the
    /// shell starts and reports exit code 127 through `on_exit`.
    pub fn run_command(
        &self,
        command_line: impl Into<String>,
        options: ProcessOptions,
        callbacks: ProcessCallbacks,
    ) -> Result<AsyncChildProcess> {
        let target = Target::Shell {
            command_line: command_line.into(),
        };
        self.run_child(target, options, callbacks)
    }

    fn run_child(
        &self,
        target: Target,
        options: ProcessOptions,
        callbacks: ProcessCallbacks,
    ) -> Result<AsyncChildProcess> {
        let child = AsyncChildProcess::new(self.inner.runtime.clone(), target, options);
        let id = self.track(&child);
        self.launch(id, &child, callbacks)?;
        Ok(child)
    }

    fn track(&self, child: &AsyncChildProcess) -> ChildId {
        let mut live = self.inner.lock();
        let id = ChildId(live.next_id);
        live.next_id += 1;
        live.children.insert(id, child.clone());
        id
    }

    fn launch(
        &self,
        id: ChildId,
        child: &AsyncChildProcess,
        mut callbacks: ProcessCallbacks,
    ) -> Result<()> {
        let user_on_exit = callbacks.take_exit();
        let inner = self.inner.clone();
        let callbacks = callbacks.on_exit(move |code| {
            {
                let mut live = inner.lock();
                live.children.remove(&id);
                live.pending_terminate.remove(&id);
                live.notifying += 1;
            }
            let _guard = NotificationGuard { inner };
            debug!("{} exited with code {}", id, code);
            if let Some(on_exit) = user_on_exit {
                on_exit(code);
            }
        });

        if let Err(e) = child.run(callbacks) {
            let mut live = self.inner.lock();
            live.children.remove(&id);
            live.pending_terminate.remove(&id);
            self.inner.notify_if_quiescent(&live);
            return Err(e);
        }
        debug!("{} started: {}", id, child.target());

        let parked = self.inner.lock().pending_terminate.remove(&id);
        if parked {
            debug!("{} was asked to terminate while starting", id);
            if let Err(e) = child.terminate() {
                warn!("Failed to terminate {} ({}): {}", id, child.target(), e);
            }
        }
        Ok(())
    }

    /// Whether any child is still in the live set
    ///
    /// Only accurate as of the instant the lock was held.
    pub fn has_running_children(&self) -> bool {
        !self.inner.lock().children.is_empty()
    }

    /// Number of children in the live set
    pub fn running_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Process IDs of the children in the live set
    pub fn running_pids(&self) -> Vec<u32> {
        let children: Vec<AsyncChildProcess> = self.inner.lock().children.values().cloned().collect();
        children.iter().filter_map(AsyncChildProcess::pid).collect()
    }

    /// Request termination of every live child
    ///
    /// Individual failures are logged and do not stop the remaining
    /// terminations. Exits are still reported through each child's `on_exit`.
    /// Children whose spawn is still in progress are terminated once it
    /// completes.
    pub fn terminate_all(&self) {
        let children: Vec<(ChildId, AsyncChildProcess)> = {
            let mut live = self.inner.lock();
            let LiveSet {
                children,
                pending_terminate,
                ..
            } = &mut *live;
            let mut running = Vec::with_capacity(children.len());
            for (id, child) in children.iter() {
                if child.state() == ChildState::Created {
                    pending_terminate.insert(*id);
                } else {
                    running.push((*id, child.clone()));
                }
            }
            if !pending_terminate.is_empty() {
                debug!("terminate_all: {} children still starting", pending_terminate.len());
            }
            running
        };

        if children.is_empty() {
            debug!("terminate_all: no running children");
            return;
        }

        info!("Terminating {} running children", children.len());
        for (id, child) in children {
            if let Err(e) = child.terminate() {
                warn!("Failed to terminate {} ({}): {}", id, child.target(), e);
            }
        }
    }

    /// Block until every child has exited and its `on_exit` has returned
    ///
    /// `None` waits indefinitely. Returns whether the supervisor was
    /// quiescent on return; returns `true` immediately if nothing is running.
    /// This blocks the calling thread, so async code should call it through
    /// `tokio::task::spawn_blocking`.
    pub fn wait(&self, max_wait: Option<Duration>) -> bool {
        let live = self.inner.lock();
        if live.is_quiescent() {
            return true;
        }

        match max_wait {
            None => {
                let live = self
                    .inner
                    .quiescent
                    .wait_while(live, |live| !live.is_quiescent())
                    .unwrap_or_else(PoisonError::into_inner);
                live.is_quiescent()
            }
            Some(max_wait) => {
                let (live, _timeout) = self
                    .inner
                    .quiescent
                    .wait_timeout_while(live, max_wait, |live| !live.is_quiescent())
                    .unwrap_or_else(PoisonError::into_inner);
                live.is_quiescent()
            }
        }
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.inner.lock();
        f.debug_struct("ProcessSupervisor")
            .field("running", &live.children.len())
            .field("notifying", &live.notifying)
            .finish()
    }
}
