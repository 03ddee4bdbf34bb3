//! Executors: the capability that actually runs dispatched work.
//!
//! The queue only decides *when* a task may run. Running it is delegated to
//! an [`Executor`], which must eventually run every task it accepts, in the
//! order it accepted them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

use crate::error::Result;
use crate::model::Task;

/// Runs submitted tasks at some later point.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

// ---------------------------------------------------------------------------
// Tokio
// ---------------------------------------------------------------------------

/// Production executor backed by tokio's blocking thread pool.
///
/// Task bodies are plain closures that may block, so they go through
/// `spawn_blocking` rather than onto the async workers.
pub struct TokioExecutor {
    handle: Handle,
    _runtime: Option<OwnedRuntime>,
}

/// Runtime created by the executor itself when there was no ambient one.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        // The last reference may be released on one of this runtime's own
        // threads, where a blocking shutdown would panic.
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl TokioExecutor {
    /// Use the ambient runtime if there is one, otherwise start a dedicated
    /// multi-threaded runtime owned by this executor.
    pub fn new() -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self::from_handle(handle));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("workq-worker")
            .enable_all()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(OwnedRuntime(Some(runtime))),
        })
    }

    /// Run tasks on an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        // Detached: the queue learns about completion from the task wrapper,
        // not from the join handle.
        drop(self.handle.spawn_blocking(task));
    }
}

// ---------------------------------------------------------------------------
// Manual
// ---------------------------------------------------------------------------

/// Executor that only runs a task when told to.
///
/// Accepted tasks are parked until `run_next`/`run_last` is called, which
/// makes dispatch order fully observable in tests. Tasks run on the calling
/// thread with the executor's own lock released, so a task may submit more
/// work to the same executor.
#[derive(Default)]
pub struct ManualExecutor {
    tasks: Mutex<VecDeque<Task>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted tasks that have not run yet.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Run the oldest parked task. Returns false if there was none.
    pub fn run_next(&self) -> bool {
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run the newest parked task. Returns false if there was none.
    pub fn run_last(&self) -> bool {
        let task = self.tasks.lock().pop_back();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until none are parked, including tasks accepted while
    /// draining. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}

// ---------------------------------------------------------------------------
// Inline
// ---------------------------------------------------------------------------

/// Executor that runs each task immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}
