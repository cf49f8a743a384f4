//! A fork/join thread-pool built on work-stealing.
//!
//! Fjord runs divide-and-conquer computations on a fixed set of worker
//! threads. Each worker owns a double-ended queue of tasks: it pushes and pops
//! its own work at the bottom, while idle workers steal from the top. Tasks
//! submitted from outside the pool land on a shared overflow queue that every
//! worker drains.
//!
//! The central idea is that a worker never blocks while it waits for a forked
//! child. Joining from inside a task re-enters the scheduler, so the waiting
//! thread keeps executing its own queued work (or steals someone else's) until
//! the child completes. Only threads outside the pool actually sleep on a
//! join.
//!
//! ```
//! use fjord::{BoxError, Task, ThreadPool, Worker};
//!
//! struct OwnedSum(Vec<u64>);
//!
//! impl Task for OwnedSum {
//!     type Output = u64;
//!
//!     fn compute(mut self, worker: &Worker) -> Result<u64, BoxError> {
//!         if self.0.len() <= 1024 {
//!             return Ok(self.0.iter().sum());
//!         }
//!         let right = worker.fork(OwnedSum(self.0.split_off(self.0.len() / 2)));
//!         let left = self.compute(worker)?;
//!         Ok(left + right.join()?)
//!     }
//! }
//!
//! let pool = ThreadPool::new(4)?;
//! let total = pool.invoke(OwnedSum((1..=100_000).collect()))?;
//! assert_eq!(total, 5_000_050_000);
//! # Ok::<(), fjord::Error>(())
//! ```
//!
//! # Acknowledgments
//!
//! The worker/thread-local structure and the latch design follow
//! `rayon_core`. The deque is a bounded variant of the Chase–Lev deque.

// -----------------------------------------------------------------------------
// Modules

mod batch;
mod deque;
mod error;
mod latch;
mod merge_sort;
mod task;
mod thread_pool;
mod unwind;
mod util;

// -----------------------------------------------------------------------------
// Top-level exports

pub use batch::BatchAction;
pub use batch::par_for_each;
pub use error::BoxError;
pub use error::Error;
pub use error::Result;
pub use error::TaskFailure;
pub use merge_sort::MergeSort;
pub use merge_sort::merge;
pub use merge_sort::par_sort;
pub use merge_sort::par_sort_by;
pub use task::FnTask;
pub use task::Handle;
pub use task::Task;
pub use task::TaskId;
pub use task::TaskState;
pub use task::from_fn;
pub use thread_pool::Config;
pub use thread_pool::PoolStats;
pub use thread_pool::ThreadPool;
pub use thread_pool::ThreadPoolBuilder;
pub use thread_pool::Worker;
pub use thread_pool::common;

// -----------------------------------------------------------------------------
// Platform Support

// All of the core threading primitives are imported through this module, so
// that the rest of the crate has a single place to swap them out.
mod platform {

    // Core exports

    pub use std::sync::Arc;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::sync::MutexGuard;
    pub use std::sync::OnceLock;
    pub use std::sync::PoisonError;
    pub use std::sync::atomic::AtomicBool;
    pub use std::sync::atomic::AtomicIsize;
    pub use std::sync::atomic::AtomicPtr;
    pub use std::sync::atomic::AtomicU32;
    pub use std::sync::atomic::AtomicU64;
    pub use std::sync::atomic::AtomicUsize;
    pub use std::sync::atomic::Ordering;
    pub use std::sync::atomic::fence;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;
    pub use std::thread_local;
}
