//! Worker Pools
//!
//! A worker is a named thread looping over one [`OnceTasker`]. Pools route
//! every task of a group to the same worker, so per-group ordering holds
//! without per-group locks.

use crate::task::Task;
use crate::tasker::{Dispatch, OnceTasker};
use crate::wake::Wake;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Deterministic worker index for `identity` in a pool of `size`.
///
/// FNV-1a over the identity bytes: stable across runs and platforms.
pub fn affinity(identity: &str, size: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    if size == 0 {
        return 0;
    }
    let hash = identity
        .bytes()
        .fold(OFFSET, |acc, byte| (acc ^ u64::from(byte)).wrapping_mul(PRIME));
    (hash % size as u64) as usize
}

/// Runs a thread body and aborts the process if it panics.
///
/// Callers block on waiters and replies owned by these threads, so a dead
/// engine or worker thread would leave them hanging.
pub(crate) fn abort_on_panic<F: FnOnce()>(body: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        let thread = thread::current();
        tracing::error!(thread = thread.name().unwrap_or_default(), panic = message, "Runtime thread panicked, aborting");
        process::abort();
    }
}

/// A dedicated thread with a private once-queue.
pub struct Worker {
    name: String,
    tasker: Arc<OnceTasker>,
    bell: Arc<Wake>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the worker thread, which dispatches into `handler`.
    pub fn spawn(name: String, mut handler: Box<dyn Dispatch + Send>) -> io::Result<Self> {
        let bell = Arc::new(Wake::new());
        let tasker = Arc::new(OnceTasker::new(Arc::clone(&bell)));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let bell = Arc::clone(&bell);
            let tasker = Arc::clone(&tasker);
            let running = Arc::clone(&running);
            thread::Builder::new().name(name.clone()).spawn(move || {
                abort_on_panic(|| {
                    tracing::trace!(worker = %thread::current().name().unwrap_or_default(), "Worker started");
                    loop {
                        bell.wait();
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        tasker.run(handler.as_mut());
                    }
                    // Unprocessed tasks are dropped here; their responders
                    // report the shutdown to any waiting caller.
                    let dropped = tasker.take_all().len();
                    tracing::trace!(dropped, "Worker stopped");
                })
            })?
        };

        Ok(Self {
            name,
            tasker,
            bell,
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hands `task` to this worker.
    pub fn give(&self, task: Task) {
        self.tasker.give(task);
    }

    /// Tasks queued but not yet picked up.
    pub fn backlog(&self) -> usize {
        self.tasker.len()
    }

    /// Signals exit and joins the thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.running.store(false, Ordering::Release);
            self.bell.signal();
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Fixed-size set of workers addressed by group identity.
pub struct WorkerPool {
    role: &'static str,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawns `size` workers named `{role}-{n}`, each with its own handler.
    pub fn new<F>(role: &'static str, size: usize, mut handler: F) -> io::Result<Self>
    where
        F: FnMut(usize) -> Box<dyn Dispatch + Send>,
    {
        let size = size.max(1);
        let workers = (0..size)
            .map(|n| Worker::spawn(format!("{role}-{n}"), handler(n)))
            .collect::<io::Result<Vec<_>>>()?;
        tracing::debug!(role, size, "Worker pool started");
        Ok(Self { role, workers })
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Index of the worker that owns `identity`.
    pub fn worker_index(&self, identity: &str) -> usize {
        affinity(identity, self.workers.len())
    }

    /// Hands `task` to the worker owning its group.
    pub fn give(&self, task: Task) {
        let index = self.worker_index(task.identity());
        self.workers[index].give(task);
    }

    /// Stops and joins every worker.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.shutdown();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
