//! Serialized task queue.
//!
//! Every result set owns one queue backed by a dedicated worker thread. Tasks
//! run one at a time in submission order, which is what gives a result set its
//! mutual exclusion: polls, handle additions and change-log updates never
//! interleave.
//!
//! The caller's tracing span is carried into the worker so that logs emitted
//! by a task nest under whoever queued it.

use crossbeam_channel::{bounded, unbounded, Sender};
use ripple_core::{Error, Result};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use tracing::{error, trace, Span};

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// Owner of the queue whose worker is the current thread.
    static CURRENT_OWNER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Returns the owner id of the queue running the current task, if any.
pub fn current_owner() -> Option<u64> {
    CURRENT_OWNER.with(Cell::get)
}

/// A job sent to the worker thread.
struct Job {
    task: Task,
    span: Span,
}

/// Handle to a serialized worker.
///
/// Dropping the queue closes its channel; the worker drains what was already
/// queued and exits. Drop never joins, so a queue may be dropped from inside
/// one of its own tasks.
pub struct TaskQueue {
    tx: Sender<Job>,
    name: String,
    owner: u64,
    worker: ThreadId,
}

impl TaskQueue {
    /// Spawns the worker thread for result set `owner`.
    pub fn new(name: impl Into<String>, owner: u64) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let thread_name = name.clone();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT_OWNER.with(|current| current.set(Some(owner)));
                while let Ok(Job { task, span }) = rx.recv() {
                    let _guard = span.enter();
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(queue = %thread_name, "task panicked");
                    }
                }
                trace!(queue = %thread_name, "task queue worker exiting");
            })
            .map_err(|e| Error::store("task_queue", format!("failed to spawn worker: {e}")))?;

        Ok(Self {
            tx,
            name,
            owner,
            worker: worker.thread().id(),
        })
    }

    /// Enqueues a task without waiting for it.
    pub fn queue_task(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .send(Job {
                task: Box::new(task),
                span: Span::current(),
            })
            .map_err(|_| Error::queue_closed(&self.name))
    }

    /// Enqueues a task and blocks until it has run, returning its result.
    ///
    /// Fails with `Error::ReentrantTask` when called from one of this queue's
    /// own tasks, which would otherwise wait on itself forever. A panic in the
    /// task resumes on the caller.
    pub fn run_task<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Err(Error::ReentrantTask {
                result_set: self.owner,
            });
        }

        let (reply_tx, reply_rx) = bounded(1);
        self.queue_task(move || {
            let _ = reply_tx.send(catch_unwind(AssertUnwindSafe(task)));
        })?;

        match reply_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => resume_unwind(panic),
            Err(_) => Err(Error::queue_closed(&self.name)),
        }
    }

    /// Blocks until every task queued before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.run_task(|| ())
    }

    /// Returns true if the calling thread is this queue's worker.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("pending", &self.tx.len())
            .finish()
    }
}
