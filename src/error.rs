//! Error types reported by the pool and by joined tasks.

use std::error::Error as StdError;
use std::io;

use crate::platform::*;

/// The error type a [`Task::compute`](crate::Task::compute) implementation may
/// return. Any error that is `Send + Sync` converts into it with `?`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Everything that can go wrong when building a pool, submitting work to it, or
/// joining a task.
///
/// Errors are cheap to clone, so a failure cached in a task can be observed by
/// every caller that joins it.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The pool was configured with fewer than one worker.
    #[error("invalid parallelism {parallelism}: a pool needs at least one worker")]
    Configuration {
        /// The rejected number of workers.
        parallelism: usize,
    },

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(Arc<io::Error>),

    /// The pool has been shut down and no longer accepts external submissions.
    #[error("task submission rejected: the pool is shutting down")]
    Rejected,

    /// The task's computation returned an error or panicked.
    #[error("task failed: {0}")]
    Failed(#[from] TaskFailure),

    /// The task was cancelled before it started running.
    #[error("task was cancelled")]
    Cancelled,

    /// The task's value has already been moved out by another join on a clone
    /// of the same handle.
    #[error("task result was already taken by another join")]
    Consumed,

    /// At least one task in a batch did not complete successfully. Each failure
    /// is paired with the position of its task in the batch.
    #[error("{} of {total} tasks did not complete successfully", .failures.len())]
    Batch {
        /// The number of tasks in the batch.
        total: usize,
        /// Each failed task's position in the batch, with its error.
        failures: Vec<(usize, Error)>,
    },

    /// A batch operation that needs at least one task received none.
    #[error("no tasks were given")]
    NoTasks,
}

impl Error {
    /// Returns true if this error reports a cancelled task.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Spawn(Arc::new(err))
    }
}

/// Why a task's computation did not produce a value.
#[derive(thiserror::Error, Debug, Clone)]
pub enum TaskFailure {
    /// `compute` returned an error.
    #[error("{0}")]
    Error(Arc<dyn StdError + Send + Sync + 'static>),

    /// `compute` panicked. Holds the panic message when it was a string.
    #[error("task panicked: {0}")]
    Panicked(Arc<str>),
}

impl TaskFailure {
    /// Attempts to view the underlying error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            TaskFailure::Error(err) => err.downcast_ref::<E>(),
            TaskFailure::Panicked(_) => None,
        }
    }
}

impl From<BoxError> for TaskFailure {
    fn from(err: BoxError) -> TaskFailure {
        TaskFailure::Error(Arc::from(err))
    }
}
