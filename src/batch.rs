//! A parallel batch action: run a function once for every item of a vector.

use crate::error::BoxError;
use crate::error::Result;
use crate::platform::Arc;
use crate::task::Task;
use crate::thread_pool::ThreadPool;
use crate::thread_pool::Worker;

/// Applies `f` to every item, splitting the items in halves until each piece
/// holds at most `leaf_size` of them.
///
/// Every item is visited exactly once. The order in which items are visited is
/// unspecified.
pub struct BatchAction<T, F> {
    items: Vec<T>,
    leaf_size: usize,
    f: Arc<F>,
}

impl<T, F> BatchAction<T, F>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    /// Creates a batch action. A leaf size of zero is treated as one.
    pub fn new(items: Vec<T>, leaf_size: usize, f: F) -> BatchAction<T, F> {
        BatchAction {
            items,
            leaf_size: leaf_size.max(1),
            f: Arc::new(f),
        }
    }
}

impl<T, F> Task for BatchAction<T, F>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    type Output = ();

    fn compute(mut self, worker: &Worker) -> core::result::Result<(), BoxError> {
        if self.items.len() <= self.leaf_size {
            self.items.iter().for_each(|item| (self.f)(item));
            return Ok(());
        }

        let rest = self.items.split_off(self.items.len() / 2);
        let right = worker.fork(BatchAction {
            items: rest,
            leaf_size: self.leaf_size,
            f: self.f.clone(),
        });

        self.compute(worker)?;
        worker.join(right)?;
        Ok(())
    }
}

/// Runs `f` once for every item on `pool`, and waits for all of them.
///
/// ```
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let pool = fjord::ThreadPool::new(2)?;
/// let total = Arc::new(AtomicUsize::new(0));
/// let sum = total.clone();
/// fjord::par_for_each(&pool, (1..=10).collect(), 2, move |n: &usize| {
///     sum.fetch_add(*n, Ordering::Relaxed);
/// })?;
/// assert_eq!(total.load(Ordering::Relaxed), 55);
/// # Ok::<(), fjord::Error>(())
/// ```
pub fn par_for_each<T, F>(pool: &ThreadPool, items: Vec<T>, leaf_size: usize, f: F) -> Result<()>
where
    T: Send + 'static,
    F: Fn(&T) + Send + Sync + 'static,
{
    pool.invoke(BatchAction::new(items, leaf_size, f))
}
