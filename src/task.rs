//! This module defines the unit of work scheduled on the pool: the [`Task`]
//! trait implemented by client code, the [`TaskCell`] that tracks one
//! submission through its life, and the [`Handle`] returned to whoever forked
//! or submitted it.
//!
//! A task cell moves through its states exactly once:
//!
//! ```text
//! Pending -> Forked -> Running -> Completed | Failed | Cancelled
//!               \_______________________________________/
//!                        (cancelled before it ran)
//! ```
//!
//! Claiming a cell for execution is a CAS from `Forked` to `Running`, so a cell
//! that was cancelled while queued, or that is somehow dequeued twice, is never
//! computed more than once. Once a cell is terminal its [`Latch`] is set and
//! the outcome stays cached for every later join.

use core::fmt;
use std::error::Error as StdError;

use tracing::trace;

use crate::error::BoxError;
use crate::error::Error;
use crate::error::Result;
use crate::error::TaskFailure;
use crate::latch::Latch;
use crate::platform::*;
use crate::thread_pool::Registry;
use crate::thread_pool::Worker;
use crate::unwind;

// -----------------------------------------------------------------------------
// Task capability

/// A divide-and-conquer computation that can run on a [`ThreadPool`].
///
/// There is a single shape for every task: `compute` consumes the task and
/// produces its output. A task that exists only for its side effects (an
/// "action") uses `()` as its output.
///
/// Inside `compute`, a task may split its input, [`fork`](Worker::fork) part of
/// it as a child task, compute the rest inline, and then
/// [`join`](Handle::join) the child. Joining from inside a task never blocks
/// the worker thread; it keeps running other work until the child is done.
///
/// Errors returned from `compute`, and panics raised by it, are captured as a
/// [`TaskFailure`] and reported to whoever joins the task.
///
/// [`ThreadPool`]: crate::ThreadPool
pub trait Task: Send + 'static {
    /// The value produced by the task.
    type Output: Send + 'static;

    /// Runs the task on the given worker.
    fn compute(self, worker: &Worker) -> core::result::Result<Self::Output, BoxError>;
}

/// A task defined by a closure. See [`from_fn`].
pub struct FnTask<F>(F);

/// Creates a task from a closure.
///
/// ```
/// # use fjord::{ThreadPool, from_fn};
/// let pool = ThreadPool::new(2)?;
/// let answer = pool.invoke(from_fn(|_| Ok(6 * 7)))?;
/// assert_eq!(answer, 42);
/// # Ok::<(), fjord::Error>(())
/// ```
pub fn from_fn<F, T>(f: F) -> FnTask<F>
where
    F: FnOnce(&Worker) -> core::result::Result<T, BoxError> + Send + 'static,
    T: Send + 'static,
{
    FnTask(f)
}

impl<F, T> Task for FnTask<F>
where
    F: FnOnce(&Worker) -> core::result::Result<T, BoxError> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn compute(self, worker: &Worker) -> core::result::Result<T, BoxError> {
        (self.0)(worker)
    }
}

/// Runs a task for its side effects, then yields a fixed value in place of the
/// task's own output. Failures of the wrapped task are still reported.
pub(crate) struct WithResult<J, V> {
    pub(crate) task: J,
    pub(crate) value: V,
}

impl<J, V> Task for WithResult<J, V>
where
    J: Task,
    V: Send + 'static,
{
    type Output = V;

    fn compute(self, worker: &Worker) -> core::result::Result<V, BoxError> {
        self.task.compute(worker)?;
        Ok(self.value)
    }
}

// -----------------------------------------------------------------------------
// Identity and state

/// An opaque identifier, unique to each submitted or forked task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> TaskId {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

const PENDING: u32 = 0;
const FORKED: u32 = 1;
const RUNNING: u32 = 2;
const COMPLETED: u32 = 3;
const FAILED: u32 = 4;
const CANCELLED: u32 = 5;

/// The lifecycle state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created, but not yet handed to a queue.
    Pending,
    /// Waiting in a queue to be claimed by a worker.
    Forked,
    /// Claimed by a worker and currently computing.
    Running,
    /// Finished and produced a value.
    Completed,
    /// Finished with an error or a panic.
    Failed,
    /// Cancelled before it ran, or ended by a cancelled join after cancellation
    /// was requested.
    Cancelled,
}

impl TaskState {
    fn from_raw(state: u32) -> TaskState {
        match state {
            PENDING => TaskState::Pending,
            FORKED => TaskState::Forked,
            RUNNING => TaskState::Running,
            COMPLETED => TaskState::Completed,
            FAILED => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }

    /// Returns true for `Completed`, `Failed` and `Cancelled`. Terminal states
    /// are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

// -----------------------------------------------------------------------------
// Type-erased jobs

/// The scheduler's view of a task: something that can be run or thrown away.
/// Queues hold [`JobRef`]s, so they do not need to know the task's output type.
pub(crate) trait Job: Send + Sync {
    /// Runs the task if it can still be claimed. Returns false if it was
    /// already claimed or cancelled, in which case nothing happens.
    fn execute(&self, worker: &Worker) -> bool;

    /// Cancels the task if it has not started. Returns true if it was
    /// cancelled by this call.
    fn discard(&self) -> bool;

    /// Returns true once cancellation has been requested for this task.
    fn cancel_requested(&self) -> bool;
}

/// A shared, type-erased reference to a task cell.
pub(crate) type JobRef = Arc<dyn Job>;

type Body<T> = Box<dyn FnOnce(&Worker) -> core::result::Result<T, BoxError> + Send>;

// -----------------------------------------------------------------------------
// Task cell

/// The shared state of one task submission.
pub(crate) struct TaskCell<T> {
    id: TaskId,
    state: AtomicU32,
    cancel_requested: AtomicBool,
    /// The computation; taken exactly once, by whoever claims the cell.
    body: Mutex<Option<Body<T>>>,
    /// Write-once outcome. A success value may be moved out by one join.
    outcome: Mutex<Option<Result<T>>>,
    /// Set once the cell is terminal.
    completed: Latch,
    registry: Arc<Registry>,
}

impl<T> TaskCell<T>
where
    T: Send + 'static,
{
    /// Allocates a new, pending cell. The pool counts the cell as outstanding
    /// work from this point until it reaches a terminal state.
    pub(crate) fn new<J>(task: J, registry: Arc<Registry>) -> Arc<TaskCell<T>>
    where
        J: Task<Output = T>,
    {
        let body: Body<T> = Box::new(move |worker: &Worker| task.compute(worker));
        registry.task_accepted();
        Arc::new(TaskCell {
            id: TaskId::next(),
            state: AtomicU32::new(PENDING),
            cancel_requested: AtomicBool::new(false),
            body: Mutex::new(Some(body)),
            outcome: Mutex::new(None),
            completed: Latch::new(),
            registry,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn completion_latch(&self) -> &Latch {
        &self.completed
    }

    /// Records that the cell is about to be pushed onto a queue.
    pub(crate) fn mark_forked(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, FORKED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Cancels the task if it has not started running. A running task only
    /// has its cancellation flag raised, which it may observe through
    /// [`Worker::is_cancelled`].
    pub(crate) fn cancel(&self) -> bool {
        self.cancel_requested.store(true, Ordering::Release);

        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state != PENDING && state != FORKED {
                return false;
            }
            match self.state.compare_exchange(
                state,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => state = current,
            }
        }

        trace!("cancelled {} before it started", self.id);

        // Release whatever the computation captured.
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(body);

        self.finish();
        true
    }

    /// Claims and runs the task, storing its outcome.
    fn run(&self, worker: &Worker) -> bool {
        if self
            .state
            .compare_exchange(FORKED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(body) = body else {
            return false;
        };

        let (state, outcome) = match unwind::halt_unwinding(|| body(worker)) {
            Ok(Ok(value)) => (COMPLETED, Ok(value)),
            Ok(Err(err)) if self.cancelled_by(&*err, worker) => (CANCELLED, Err(Error::Cancelled)),
            Ok(Err(err)) => (FAILED, Err(Error::Failed(TaskFailure::from(err)))),
            Err(payload) => (FAILED, Err(Error::Failed(unwind::panic_failure(payload)))),
        };

        if state == FAILED {
            trace!("{} failed", self.id);
        }

        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.state.store(state, Ordering::Release);
        self.finish();
        true
    }

    /// A running task that was asked to cancel, and then failed because one of
    /// its own joins was cancelled, ends up `Cancelled` rather than `Failed`.
    fn cancelled_by(&self, err: &(dyn StdError + Send + Sync + 'static), worker: &Worker) -> bool {
        let requested = self.cancel_requested.load(Ordering::Acquire) || worker.is_stopping();
        requested && err.downcast_ref::<Error>().is_some_and(Error::is_cancelled)
    }

    /// Opens the completion latch and tells the pool one less task is
    /// outstanding.
    fn finish(&self) {
        if self.completed.set() {
            self.registry.wake_all();
        }
        self.registry.task_finished();
    }

    /// Moves the outcome out of a terminal cell. Failures stay cached; a value
    /// can only be moved out once.
    pub(crate) fn take(&self) -> Result<T> {
        debug_assert!(self.completed.probe());
        if self.state.load(Ordering::Acquire) == CANCELLED {
            return Err(Error::Cancelled);
        }
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        match outcome.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => {
                *outcome = Some(Err(err.clone()));
                Err(err)
            }
            None => Err(Error::Consumed),
        }
    }

    /// Clones the outcome out of a terminal cell.
    pub(crate) fn peek(&self) -> Result<T>
    where
        T: Clone,
    {
        debug_assert!(self.completed.probe());
        if self.state.load(Ordering::Acquire) == CANCELLED {
            return Err(Error::Cancelled);
        }
        match &*self.outcome.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(outcome) => outcome.clone(),
            None => Err(Error::Consumed),
        }
    }
}

impl<T> Job for TaskCell<T>
where
    T: Send + 'static,
{
    fn execute(&self, worker: &Worker) -> bool {
        self.run(worker)
    }

    fn discard(&self) -> bool {
        self.cancel()
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Handle

/// A handle to a submitted or forked task.
///
/// Handles are cheap to clone; every clone refers to the same task. Status
/// queries never block. Joining waits until the task is terminal: from a
/// worker thread of the task's pool the wait keeps the worker busy with other
/// tasks, from any other thread it blocks.
pub struct Handle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Handle<T> {
        Handle {
            cell: self.cell.clone(),
        }
    }
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Handle<T> {
        Handle { cell }
    }

    /// Returns the task's identifier.
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Returns the task's current state.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Returns true once the task has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns true if the task ended up cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Returns true if the task's computation failed.
    pub fn is_failed(&self) -> bool {
        self.state() == TaskState::Failed
    }

    /// Requests cancellation.
    ///
    /// If the task has not started, it is marked cancelled, will be skipped
    /// when a worker dequeues it, and joining it returns [`Error::Cancelled`].
    /// Returns true in that case.
    ///
    /// If the task is already running, cancellation is advisory: the running
    /// computation is not interrupted, but [`Worker::is_cancelled`] reports
    /// true inside it and any further [`Worker::fork`] it makes is a no-op.
    /// Returns false.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    /// Waits for the task and moves its result out.
    ///
    /// Joining a terminal task returns the cached outcome without running
    /// anything. A value can be moved out by one join only; joining another
    /// clone of the same handle afterwards returns [`Error::Consumed`]. Use
    /// [`Handle::get`] to observe a value more than once.
    pub fn join(self) -> Result<T> {
        Worker::with_current(|worker| self.wait(worker));
        self.cell.take()
    }

    /// Waits for the task and returns a clone of its result. Can be called any
    /// number of times.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        Worker::with_current(|worker| self.wait(worker));
        self.cell.peek()
    }

    /// Waits for the task to become terminal. If `worker` belongs to the
    /// task's pool it keeps scheduling work while it waits; otherwise the
    /// thread blocks.
    pub(crate) fn wait(&self, worker: Option<&Worker>) {
        let latch = self.cell.completion_latch();
        if latch.probe() {
            return;
        }
        match worker {
            Some(worker) if Arc::ptr_eq(worker.registry(), self.cell.registry()) => {
                worker.run_until(latch);
            }
            _ => latch.wait(),
        }
    }

    pub(crate) fn take(self) -> Result<T> {
        self.cell.take()
    }
}

impl<T> fmt::Debug for Handle<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.cell.id())
            .field("state", &self.cell.state())
            .finish()
    }
}
