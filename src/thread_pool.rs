//! This module contains the api and worker logic for the fjord thread pool.

use core::fmt;
use core::num::NonZero;
use core::ptr;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::env;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::trace;
use tracing::trace_span;

use crate::deque::Deque;
use crate::deque::Steal;
use crate::deque::Stealer;
use crate::error::Error;
use crate::error::Result;
use crate::latch::Latch;
use crate::platform::*;
use crate::task::Handle;
use crate::task::JobRef;
use crate::task::Task;
use crate::task::TaskCell;
use crate::task::WithResult;
use crate::unwind;
use crate::util::XorShift64Star;

// -----------------------------------------------------------------------------
// Configuration

/// Default capacity of each worker's deque. Work forked past this depth
/// overflows into the pool's shared queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of times an idle worker looks for work again before it
/// goes to sleep.
pub const DEFAULT_IDLE_SPINS: u32 = 64;

/// The environment variable read by [`common`] to size the common pool.
pub const THREADS_ENV: &str = "FJORD_NUM_THREADS";

/// Upper bound on how long a parked worker sleeps before it looks around
/// again, even if nobody wakes it.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Configuration for a [`ThreadPool`]. Usually built with a
/// [`ThreadPoolBuilder`].
#[derive(Clone, Debug)]
pub struct Config {
    /// The number of worker threads. Must be at least one.
    pub num_threads: usize,
    /// The capacity of each worker's deque, rounded up to a power of two.
    pub queue_capacity: usize,
    /// How many times an idle worker retries before it sleeps.
    pub idle_spins: u32,
    /// Produces the name of the worker thread with the given index.
    pub thread_name: fn(usize) -> String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_threads: default_parallelism(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            idle_spins: DEFAULT_IDLE_SPINS,
            thread_name: |index| format!("fjord-worker-{index}"),
        }
    }
}

/// Returns the number of threads the hardware can run in parallel, or one if
/// that cannot be determined.
fn default_parallelism() -> usize {
    available_parallelism().map(NonZero::get).unwrap_or(1)
}

/// Builds a [`ThreadPool`] with custom settings.
///
/// ```
/// # use fjord::ThreadPool;
/// let pool = ThreadPool::builder()
///     .num_threads(3)
///     .queue_capacity(256)
///     .thread_name(|i| format!("sorter-{i}"))
///     .build()?;
/// assert_eq!(pool.num_threads(), 3);
/// # Ok::<(), fjord::Error>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct ThreadPoolBuilder {
    config: Config,
}

impl ThreadPoolBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> ThreadPoolBuilder {
        ThreadPoolBuilder::default()
    }

    /// Sets the number of worker threads.
    pub fn num_threads(mut self, num_threads: usize) -> ThreadPoolBuilder {
        self.config.num_threads = num_threads;
        self
    }

    /// Sets the capacity of each worker's deque.
    pub fn queue_capacity(mut self, queue_capacity: usize) -> ThreadPoolBuilder {
        self.config.queue_capacity = queue_capacity;
        self
    }

    /// Sets how many times an idle worker retries before it sleeps.
    pub fn idle_spins(mut self, idle_spins: u32) -> ThreadPoolBuilder {
        self.config.idle_spins = idle_spins;
        self
    }

    /// Sets the function used to name worker threads.
    pub fn thread_name(mut self, thread_name: fn(usize) -> String) -> ThreadPoolBuilder {
        self.config.thread_name = thread_name;
        self
    }

    /// Returns the configuration built so far.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the pool's worker threads.
    pub fn build(self) -> Result<ThreadPool> {
        ThreadPool::start(self.config)
    }
}

// -----------------------------------------------------------------------------
// Shared pool state

/// Accepting external submissions.
const RUNNING: u32 = 0;
/// No longer accepting external submissions; queued work still runs.
const SHUTDOWN: u32 = 1;
/// Queued work is discarded and running work is asked to cancel.
const STOP: u32 = 2;

/// Counters describing what the pool has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks whose computation was run to a terminal state.
    pub executed: u64,
    /// Tasks taken from another worker's deque.
    pub stolen: u64,
    /// Forks that did not fit in the forking worker's deque and were moved to
    /// the shared queue.
    pub overflowed: u64,
    /// Dequeued tasks that were skipped because they had been cancelled.
    pub skipped: u64,
    /// Queued tasks thrown away by [`ThreadPool::shutdown_now`].
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    stolen: AtomicU64,
    overflowed: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            executed: self.executed.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// The state shared by a pool's handle, its workers, and every task cell.
pub(crate) struct Registry {
    config: Config,
    /// One stealer per worker, indexed like the workers.
    stealers: Vec<Stealer<JobRef>>,
    state: Mutex<PoolState>,
    /// Signaled when work becomes available, when a watched latch opens, and
    /// when the lifecycle changes.
    job_is_ready: Condvar,
    /// Signaled when the last worker exits.
    terminated: Condvar,
    /// One of `RUNNING`, `SHUTDOWN` or `STOP`. Only written under `state`.
    lifecycle: AtomicU32,
    /// Tasks created on this pool that have not reached a terminal state.
    pending: AtomicUsize,
    /// Workers currently parked on `job_is_ready`.
    sleepers: AtomicUsize,
    /// Length of the shared queue, readable without the lock.
    injected_len: AtomicUsize,
    counters: Counters,
}

struct PoolState {
    /// Tasks submitted from outside the pool, and forks that overflowed.
    injected: VecDeque<JobRef>,
    /// Worker threads that have not yet exited their loop.
    live_workers: usize,
}

impl Registry {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> u32 {
        self.lifecycle.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.lifecycle() == STOP
    }

    pub(crate) fn task_accepted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Called exactly once per task cell, when it becomes terminal.
    pub(crate) fn task_finished(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.lifecycle() != RUNNING {
            // The pool is draining and that was the last task: let the
            // workers notice they can exit.
            self.wake_all();
        }
    }

    /// Wakes every parked worker.
    pub(crate) fn wake_all(&self) {
        let _state = self.lock_state();
        self.job_is_ready.notify_all();
    }

    /// Wakes one parked worker, if there are any, after work was pushed onto a
    /// deque.
    fn notify_work(&self) {
        // Pairs with the fence in `park`: either the sleeper sees the work we
        // just pushed, or we see the sleeper.
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _state = self.lock_state();
            self.job_is_ready.notify_one();
        }
    }

    fn push_injected(&self, state: &mut PoolState, job: JobRef) {
        state.injected.push_back(job);
        self.injected_len
            .store(state.injected.len(), Ordering::Release);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            self.job_is_ready.notify_one();
        }
    }

    fn pop_injected(&self) -> Option<JobRef> {
        if self.injected_len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut state = self.lock_state();
        let job = state.injected.pop_front();
        self.injected_len
            .store(state.injected.len(), Ordering::Release);
        job
    }

    fn has_visible_work(&self, state: &PoolState) -> bool {
        !state.injected.is_empty() || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    /// Puts an idle worker to sleep until new work arrives, the pool's
    /// lifecycle changes, or `latch` (when given) is set.
    ///
    /// Returns false when the worker's main loop should exit: the pool has been
    /// shut down and every task it accepted is terminal.
    fn park(&self, latch: Option<&Latch>) -> bool {
        let mut state = self.lock_state();

        match latch {
            None if self.lifecycle() != RUNNING && self.pending.load(Ordering::Acquire) == 0 => {
                // Anything still queued was cancelled while queued. Drop it
                // outside the lock.
                let leftovers: Vec<JobRef> = state.injected.drain(..).collect();
                self.injected_len.store(0, Ordering::Release);
                drop(state);
                drop(leftovers);
                return false;
            }
            Some(latch) if latch.watch() => return true,
            _ => {}
        }

        self.sleepers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        if !self.has_visible_work(&state) {
            trace!("worker going to sleep");
            state = self
                .job_is_ready
                .wait_timeout(state, PARK_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            trace!("worker woke up");
        }

        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        drop(state);
        true
    }
}

// -----------------------------------------------------------------------------
// Thread pool

/// A fixed set of worker threads that execute [`Task`]s with work-stealing.
///
/// # Creating thread pools
///
/// ```
/// # use fjord::{ThreadPool, from_fn};
/// // A pool with four workers.
/// let pool = ThreadPool::new(4)?;
///
/// // Submit a task and wait for it.
/// let handle = pool.submit(from_fn(|_| Ok("hello")))?;
/// assert_eq!(handle.join()?, "hello");
///
/// // Stop accepting work, and wait for the workers to exit.
/// pool.shutdown();
/// assert!(pool.await_termination(std::time::Duration::from_secs(5)));
/// # Ok::<(), fjord::Error>(())
/// ```
///
/// Pools are independent of one another. For a lazily created, process-wide
/// pool see [`common`].
///
/// # Shutting down
///
/// [`ThreadPool::shutdown`] stops external submissions, but lets everything
/// already accepted run to completion. [`ThreadPool::shutdown_now`]
/// additionally throws away queued tasks that have not started and asks
/// running tasks to cancel. Neither call blocks; use
/// [`ThreadPool::await_termination`] to wait for the workers. Dropping a pool
/// shuts it down and waits for its workers to exit.
pub struct ThreadPool {
    registry: Arc<Registry>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a pool with `parallelism` worker threads.
    ///
    /// Fails with [`Error::Configuration`] if `parallelism` is zero.
    pub fn new(parallelism: usize) -> Result<ThreadPool> {
        ThreadPool::builder().num_threads(parallelism).build()
    }

    /// Creates a pool with one worker per available hardware thread.
    pub fn with_default_parallelism() -> Result<ThreadPool> {
        ThreadPool::builder().build()
    }

    /// Returns a builder for a pool with custom settings.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    #[cold]
    fn start(config: Config) -> Result<ThreadPool> {
        let num_threads = config.num_threads;
        if num_threads == 0 {
            return Err(Error::Configuration {
                parallelism: num_threads,
            });
        }

        debug!("starting thread pool with {} worker(s)", num_threads);

        let deques: Vec<Deque<JobRef>> = (0..num_threads)
            .map(|_| Deque::new(config.queue_capacity))
            .collect();
        let stealers = deques.iter().map(Deque::stealer).collect();

        let registry = Arc::new(Registry {
            config,
            stealers,
            state: Mutex::new(PoolState {
                injected: VecDeque::new(),
                live_workers: num_threads,
            }),
            job_is_ready: Condvar::new(),
            terminated: Condvar::new(),
            lifecycle: AtomicU32::new(RUNNING),
            pending: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            injected_len: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for (index, deque) in deques.into_iter().enumerate() {
            let worker_registry = registry.clone();
            let spawned = ThreadBuilder::new()
                .name((registry.config.thread_name)(index))
                .spawn(move || managed_worker(index, deque, worker_registry));

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    debug!("failed to spawn worker {}: {}", index, err);
                    // Retire the slots that never got a thread, then tear down
                    // the ones that did.
                    {
                        let mut state = registry.lock_state();
                        state.live_workers -= num_threads - index;
                        registry.lifecycle.store(SHUTDOWN, Ordering::Release);
                        registry.job_is_ready.notify_all();
                    }
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(Error::from(err));
                }
            }
        }

        Ok(ThreadPool {
            registry,
            threads: Mutex::new(threads),
        })
    }

    /// Returns the number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.registry.stealers.len()
    }

    /// Returns a snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        self.registry.counters.snapshot()
    }

    /// Returns true if the calling thread is one of this pool's workers.
    pub fn is_worker_thread(&self) -> bool {
        Worker::map_current(|worker| Arc::ptr_eq(&worker.registry, &self.registry))
            .unwrap_or(false)
    }
}

// -----------------------------------------------------------------------------
// Thread pool scheduling api

impl ThreadPool {
    /// Submits a task and returns a handle to it, without waiting.
    ///
    /// From one of this pool's workers, the task is pushed onto that worker's
    /// own deque, exactly like [`Worker::fork`]. From any other thread it is
    /// pushed onto the pool's shared queue, and fails with
    /// [`Error::Rejected`] once the pool has been shut down.
    pub fn submit<J>(&self, task: J) -> Result<Handle<J::Output>>
    where
        J: Task,
    {
        Worker::with_current(|worker| match worker {
            Some(worker) if Arc::ptr_eq(&worker.registry, &self.registry) => Ok(worker.fork(task)),
            _ => self.inject(task),
        })
    }

    /// Pushes a task from outside the pool onto the shared queue.
    fn inject<J>(&self, task: J) -> Result<Handle<J::Output>>
    where
        J: Task,
    {
        let mut state = self.registry.lock_state();
        if self.registry.lifecycle() != RUNNING {
            trace!("rejecting submission to a pool that is shutting down");
            return Err(Error::Rejected);
        }
        let cell = TaskCell::new(task, self.registry.clone());
        cell.mark_forked();
        self.registry.push_injected(&mut state, cell.clone());
        Ok(Handle::new(cell))
    }

    /// Submits a task that is run for its side effects. When it completes, the
    /// handle yields `value` in place of the task's own output. If the task
    /// fails or is cancelled, that is still what the handle reports.
    pub fn submit_with_result<J, V>(&self, task: J, value: V) -> Result<Handle<V>>
    where
        J: Task,
        V: Send + 'static,
    {
        self.submit(WithResult { task, value })
    }

    /// Submits a task and waits for its result.
    pub fn invoke<J>(&self, task: J) -> Result<J::Output>
    where
        J: Task,
    {
        self.submit(task)?.join()
    }

    /// Submits every task in order, then joins them in the same order.
    ///
    /// On success the results are returned in input order. If any task fails
    /// or is cancelled, every task is still joined, and the failures are
    /// reported together as [`Error::Batch`].
    ///
    /// If a submission is rejected partway through because the pool was shut
    /// down, the tasks submitted before it are joined first, and then the
    /// rejection is returned. Their results are discarded.
    pub fn invoke_all<I, J>(&self, tasks: I) -> Result<Vec<J::Output>>
    where
        I: IntoIterator<Item = J>,
        J: Task,
    {
        let (handles, rejected) = self.submit_all(tasks);
        if let Some(err) = rejected {
            for handle in handles {
                let _ = handle.join();
            }
            return Err(err);
        }

        let total = handles.len();
        let mut values = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(value) => values.push(value),
                Err(err) => failures.push((index, err)),
            }
        }

        if failures.is_empty() {
            Ok(values)
        } else {
            Err(Error::Batch { total, failures })
        }
    }

    /// Submits every task, and returns the result of the first one that is
    /// seen to complete successfully. Tasks still queued at that point are
    /// cancelled.
    ///
    /// Before each blocking join, tasks that have already finished are
    /// checked first, in input order. When none has finished, this blocks on
    /// the earliest remaining task, so a slow task early in the input can delay
    /// the result even if a later one completes in the meantime.
    ///
    /// If every task fails, the failures are reported together as
    /// [`Error::Batch`], ordered by input position. An empty input fails with
    /// [`Error::NoTasks`]. A rejected submission cancels the tasks submitted
    /// before it and returns the rejection.
    pub fn invoke_any<I, J>(&self, tasks: I) -> Result<J::Output>
    where
        I: IntoIterator<Item = J>,
        J: Task,
    {
        let (handles, rejected) = self.submit_all(tasks);
        if let Some(err) = rejected {
            for handle in &handles {
                handle.cancel();
            }
            return Err(err);
        }

        if handles.is_empty() {
            return Err(Error::NoTasks);
        }

        let total = handles.len();
        let mut failures = Vec::new();
        let mut remaining: Vec<_> = handles.into_iter().enumerate().collect();
        while !remaining.is_empty() {
            let next = remaining
                .iter()
                .position(|(_, handle)| handle.is_done())
                .unwrap_or(0);
            let (index, handle) = remaining.remove(next);
            match handle.join() {
                Ok(value) => {
                    for (_, rest) in remaining {
                        rest.cancel();
                    }
                    return Ok(value);
                }
                Err(err) => failures.push((index, err)),
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        Err(Error::Batch { total, failures })
    }

    /// Submits tasks in order until one is rejected. Returns the handles of
    /// the accepted tasks, and the rejection if there was one.
    fn submit_all<I, J>(&self, tasks: I) -> (Vec<Handle<J::Output>>, Option<Error>)
    where
        I: IntoIterator<Item = J>,
        J: Task,
    {
        let mut handles = Vec::new();
        for task in tasks {
            match self.submit(task) {
                Ok(handle) => handles.push(handle),
                Err(err) => return (handles, Some(err)),
            }
        }
        (handles, None)
    }
}

// -----------------------------------------------------------------------------
// Thread pool lifecycle

impl ThreadPool {
    /// Stops accepting external submissions. Tasks already queued or running
    /// still run to completion, and may keep forking. Does not block.
    pub fn shutdown(&self) {
        let state = self.registry.lock_state();
        if self.registry.lifecycle() == RUNNING {
            debug!("shutting down thread pool");
            self.registry.lifecycle.store(SHUTDOWN, Ordering::Release);
        }
        self.registry.job_is_ready.notify_all();
        drop(state);
    }

    /// Stops accepting external submissions, discards every queued task that
    /// has not started, and asks running tasks to cancel. Discarded tasks
    /// report [`Error::Cancelled`] when joined. Does not block.
    pub fn shutdown_now(&self) {
        let mut state = self.registry.lock_state();
        if self.registry.lifecycle() != STOP {
            debug!("stopping thread pool");
            self.registry.lifecycle.store(STOP, Ordering::Release);
        }
        let discarded: Vec<JobRef> = state.injected.drain(..).collect();
        self.registry.injected_len.store(0, Ordering::Release);
        self.registry.job_is_ready.notify_all();
        drop(state);

        // Cancelling completes the task, which may need the state lock.
        for job in discarded {
            if job.discard() {
                Counters::bump(&self.registry.counters.discarded);
            }
        }
    }

    /// Returns true once [`ThreadPool::shutdown`] or
    /// [`ThreadPool::shutdown_now`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.registry.lifecycle() != RUNNING
    }

    /// Returns true once every worker thread has exited its loop.
    pub fn is_terminated(&self) -> bool {
        self.registry.lock_state().live_workers == 0
    }

    /// Blocks until every worker thread has exited, or until `timeout`
    /// elapses. Returns true if the pool terminated.
    ///
    /// The workers only exit after the pool has been shut down, so without a
    /// prior call to [`ThreadPool::shutdown`] this waits out the full timeout.
    /// A timeout of [`Duration::MAX`] waits for as long as it takes.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let mut state = self.registry.lock_state();

        // A timeout too large to represent as a deadline waits indefinitely.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while state.live_workers > 0 {
                state = self
                    .registry
                    .terminated
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            return true;
        };

        while state.live_workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .registry
                .terminated
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();

        let threads = core::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );

        // A worker cannot wait for itself to exit, so if the pool is dropped
        // from one of its own tasks the threads are left to finish on their own.
        if self.is_worker_thread() {
            return;
        }

        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .field("is_shutdown", &self.is_shutdown())
            .field("pending", &self.registry.pending.load(Ordering::Relaxed))
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Common pool

static COMMON: OnceLock<ThreadPool> = OnceLock::new();

/// Returns the process-wide common pool, creating it on first use.
///
/// The common pool has one worker per available hardware thread, unless the
/// `FJORD_NUM_THREADS` environment variable holds a positive integer, which
/// is used instead. It lives for the rest of the process. Shutting it down is
/// allowed but permanent, so libraries should prefer their own pools.
///
/// # Panics
///
/// Panics if the operating system refuses to start the worker threads.
pub fn common() -> &'static ThreadPool {
    COMMON.get_or_init(|| {
        let num_threads = env::var(THREADS_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|&num_threads| num_threads > 0)
            .unwrap_or_else(default_parallelism);

        ThreadPool::builder()
            .num_threads(num_threads)
            .thread_name(|index| format!("fjord-common-{index}"))
            .build()
            .expect("failed to start the common fjord thread pool")
    })
}

// -----------------------------------------------------------------------------
// Worker thread data

thread_local! {
    static WORKER_PTR: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// The local context of one of a pool's worker threads.
///
/// Every task is computed with a reference to the worker running it. The
/// worker owns a deque: [`Worker::fork`] pushes onto its bottom, and the
/// worker pops from the bottom first when looking for something to do, so the
/// most recently forked work runs first. Other workers steal from the top.
pub struct Worker {
    index: usize,
    registry: Arc<Registry>,
    queue: Deque<JobRef>,
    rng: XorShift64Star,
    /// The tasks this thread is currently computing, innermost last. Nested
    /// joins make this deeper than one.
    running: RefCell<Vec<JobRef>>,
}

impl Worker {
    /// Calls the provided closure on the thread's worker instance, if it has one.
    ///
    /// Rust's thread locals are fairly costly, so this function is expensive.
    /// If you can avoid calling it, do so.
    #[inline]
    pub fn map_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        let worker_ptr = WORKER_PTR.with(Cell::get);
        if !worker_ptr.is_null() {
            // SAFETY: The `WORKER_PTR` static is only set by `occupy`, and it's
            // always set to a stack-allocated `Worker` which is never moved and
            // is only accessed through shared references. Therefore, if the
            // pointer is non-null, it must be safe to dereference.
            //
            // This creates a reference with an unbounded lifetime. To avoid
            // turning it into a `'static`, we pass it in to a closure.
            Some(f(unsafe { &*worker_ptr }))
        } else {
            None
        }
    }

    /// Looks up the current `Worker` instance from the thread local.
    ///
    /// Rust's thread locals are fairly costly, so this function is expensive.
    /// If you can avoid calling it, do so.
    #[inline]
    pub fn with_current<F, R>(f: F) -> R
    where
        F: FnOnce(Option<&Worker>) -> R,
    {
        let worker_ptr = WORKER_PTR.with(Cell::get);
        if !worker_ptr.is_null() {
            // SAFETY: See `map_current`.
            f(Some(unsafe { &*worker_ptr }))
        } else {
            f(None)
        }
    }

    /// Installs `self` as the thread's worker while `f` runs.
    fn occupy<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Worker) -> R,
    {
        let outer_ptr = WORKER_PTR.with(|ptr| ptr.replace(self));
        let result = f(self);
        WORKER_PTR.with(|ptr| ptr.set(outer_ptr));
        result
    }

    /// Returns this worker's index within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the number of workers in this worker's pool.
    pub fn num_threads(&self) -> usize {
        self.registry.stealers.len()
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.registry.is_stopping()
    }

    /// Returns true if the task currently running on this worker should stop
    /// early: either its cancellation was requested, or the pool is being
    /// stopped with [`ThreadPool::shutdown_now`].
    ///
    /// Cancellation is cooperative; long-running tasks should check this at
    /// convenient points.
    pub fn is_cancelled(&self) -> bool {
        self.is_stopping()
            || self
                .running
                .borrow()
                .last()
                .is_some_and(|job| job.cancel_requested())
    }
}

// -----------------------------------------------------------------------------
// Worker scheduling api

impl Worker {
    /// Pushes a task onto this worker's deque and returns a handle to it.
    /// Never blocks.
    ///
    /// The task may be run later by this worker, typically when it joins the
    /// handle, or stolen by an idle worker in the meantime.
    ///
    /// If the task currently running on this worker has been cancelled, the
    /// fork is a no-op: the returned handle is already cancelled.
    pub fn fork<J>(&self, task: J) -> Handle<J::Output>
    where
        J: Task,
    {
        let cell = TaskCell::new(task, self.registry.clone());

        if self.is_cancelled() {
            trace!("not forking {} from a cancelled task", cell.id());
            cell.cancel();
            return Handle::new(cell);
        }

        cell.mark_forked();
        self.push(cell.clone());
        Handle::new(cell)
    }

    /// Waits for a task and moves its result out. Equivalent to
    /// [`Handle::join`], but avoids looking up the current worker.
    pub fn join<T>(&self, handle: Handle<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        handle.wait(Some(self));
        handle.take()
    }

    /// Pushes a job onto the local deque, moving it to the shared queue if the
    /// deque is full, and wakes a sleeping worker to come and steal it.
    fn push(&self, job: JobRef) {
        if let Err(job) = self.queue.push(job) {
            trace!(
                "local queue full ({} slots); moving job to the shared queue",
                self.queue.capacity()
            );
            Counters::bump(&self.registry.counters.overflowed);
            let mut state = self.registry.lock_state();
            self.registry.push_injected(&mut state, job);
            return;
        }
        self.registry.notify_work();
    }

    /// Tries to find a job to execute: first the most recent job on the local
    /// deque, then the oldest job on the shared queue, then the oldest job on
    /// some other worker's deque.
    #[inline]
    fn find_work(&self) -> Option<JobRef> {
        self.queue
            .pop()
            .or_else(|| self.registry.pop_injected())
            .or_else(|| self.steal())
    }

    /// Probes every other worker's deque once, starting from a random victim.
    fn steal(&self) -> Option<JobRef> {
        let stealers = &self.registry.stealers;
        let num_workers = stealers.len();
        if num_workers <= 1 {
            return None;
        }

        let start = self.rng.next_usize(num_workers);
        for offset in 0..num_workers {
            let victim = (start + offset) % num_workers;
            if victim == self.index {
                continue;
            }
            loop {
                match stealers[victim].steal() {
                    Steal::Success(job) => {
                        trace!("worker {} stole a job from worker {}", self.index, victim);
                        Counters::bump(&self.registry.counters.stolen);
                        return Some(job);
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }

        None
    }

    /// Runs a job found by `find_work`. If the pool is being stopped, the job
    /// is discarded instead.
    fn execute(&self, job: JobRef) {
        if self.is_stopping() {
            if job.discard() {
                Counters::bump(&self.registry.counters.discarded);
            }
            return;
        }

        // Task failures are caught inside the job. Anything that unwinds past
        // here is a scheduler bug, which would leave joiners waiting forever.
        let abort_guard = unwind::AbortOnDrop;

        self.running.borrow_mut().push(job.clone());
        let ran = job.execute(self);
        self.running.borrow_mut().pop();

        if ran {
            Counters::bump(&self.registry.counters.executed);
        } else {
            trace!("skipping cancelled job");
            Counters::bump(&self.registry.counters.skipped);
        }

        core::mem::forget(abort_guard);
    }

    /// Backs off between failed searches for work.
    fn spin(&self, attempt: u32) {
        if attempt < self.registry.config.idle_spins / 2 {
            core::hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }

    /// Runs jobs until the latch is set. When this thread runs out of local,
    /// shared and stealable work while the latch is still unset, it parks on
    /// the pool until something changes.
    ///
    /// This is how a worker waits for a forked task: it never blocks while
    /// there is work it could be doing.
    pub(crate) fn run_until(&self, latch: &Latch) {
        let mut attempts = 0;
        while !latch.probe() {
            if let Some(job) = self.find_work() {
                self.execute(job);
                attempts = 0;
                continue;
            }

            if attempts < self.registry.config.idle_spins {
                self.spin(attempts);
                attempts += 1;
                continue;
            }

            attempts = 0;
            self.registry.park(Some(latch));
        }
    }

    /// The main loop of a worker thread: execute local work, then shared
    /// work, then stolen work, and sleep when there is none. Returns once the
    /// pool has been shut down and all of its tasks are terminal.
    fn work_loop(&self) {
        let mut attempts = 0;
        loop {
            if let Some(job) = self.find_work() {
                self.execute(job);
                attempts = 0;
                continue;
            }

            if attempts < self.registry.config.idle_spins {
                self.spin(attempts);
                attempts += 1;
                continue;
            }

            attempts = 0;
            if !self.registry.park(None) {
                break;
            }
        }

        // Anything left on the deque was cancelled while queued.
        if !self.queue.is_empty() {
            trace!("releasing {} cancelled job(s)", self.queue.len());
        }
        while let Some(job) = self.queue.pop() {
            job.discard();
        }
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// The body of a worker thread spawned by the pool.
fn managed_worker(index: usize, queue: Deque<JobRef>, registry: Arc<Registry>) {
    let span = trace_span!("worker", index);
    let _enter = span.enter();

    debug!("starting managed worker");

    let worker = Worker {
        index,
        registry,
        queue,
        rng: XorShift64Star::new(),
        running: RefCell::new(Vec::new()),
    };

    worker.occupy(Worker::work_loop);

    let mut state = worker.registry.lock_state();
    state.live_workers -= 1;
    if state.live_workers == 0 {
        debug!("thread pool terminated");
        worker.registry.terminated.notify_all();
    }
    drop(state);

    debug!("exiting managed worker");
}
