//! Fire-and-forget task submission for rotation bookkeeping.
//!
//! A rolling histogram with history chunks has to fold every retired chunk
//! into its archive. By default the writer that wins the rotation does this
//! inline; handing an [`Executor`] to the histogram moves the work off the
//! recording thread.

use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use tracing::{debug, warn};

use crate::error::Result;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted tasks at some point in the future.
///
/// Submission never blocks and never reports failure. A task that is dropped
/// or panics only delays bookkeeping; the next rotation picks up whatever is
/// still pending.
pub trait Executor: Send + Sync + Debug {
    fn execute(&self, task: Task);
}

/// Runs every task immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    #[inline]
    fn execute(&self, task: Task) {
        task()
    }
}

/// A single named worker thread draining an unbounded task queue.
///
/// The worker survives panicking tasks. Dropping the executor closes the
/// queue, lets the worker finish what was already submitted and joins it.
#[derive(Debug)]
pub struct BackgroundExecutor {
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundExecutor {
    /// Spawns the worker thread.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let name = name.into();

        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            for task in receiver {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!("background task panicked; pending bookkeeping deferred");
                }
            }
        })?;

        debug!(worker = %name, "background executor started");

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl Executor for BackgroundExecutor {
    fn execute(&self, task: Task) {
        let submitted = self
            .sender
            .as_ref()
            .map(|sender| sender.send(task).is_ok())
            .unwrap_or(false);

        if !submitted {
            warn!("background executor is shut down; task dropped");
        }
    }
}

impl Drop for BackgroundExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("background worker exited abnormally");
            }
        }
    }
}
