//! A parallel merge sort, written as an ordinary [`Task`].
//!
//! Each task halves its input by index, forks the right half, sorts the left
//! half inline and then merges. Below the threshold a task sorts its slice
//! sequentially. The output depends only on this split/merge structure, never
//! on which worker ran what.

use core::cmp::Ordering;

use crate::error::BoxError;
use crate::error::Result;
use crate::platform::Arc;
use crate::task::Task;
use crate::thread_pool::ThreadPool;
use crate::thread_pool::Worker;

/// Sorts a vector of items with a comparison function.
///
/// The sort is stable: items that compare equal keep their relative order.
///
/// ```
/// # use fjord::{MergeSort, ThreadPool};
/// let pool = ThreadPool::new(2)?;
/// let sorted = pool.invoke(MergeSort::new(vec![3, 1, 2], 1, u32::cmp))?;
/// assert_eq!(sorted, [1, 2, 3]);
/// # Ok::<(), fjord::Error>(())
/// ```
pub struct MergeSort<T, F> {
    items: Vec<T>,
    threshold: usize,
    cmp: Arc<F>,
}

impl<T, F> MergeSort<T, F>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    /// Creates a sort task. Inputs of at most `threshold` items are sorted
    /// sequentially; a threshold of zero is treated as one.
    pub fn new(items: Vec<T>, threshold: usize, cmp: F) -> MergeSort<T, F> {
        MergeSort {
            items,
            threshold: threshold.max(1),
            cmp: Arc::new(cmp),
        }
    }

    fn child(&self, items: Vec<T>) -> MergeSort<T, F> {
        MergeSort {
            items,
            threshold: self.threshold,
            cmp: self.cmp.clone(),
        }
    }
}

impl<T, F> Task for MergeSort<T, F>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    type Output = Vec<T>;

    fn compute(mut self, worker: &Worker) -> core::result::Result<Vec<T>, BoxError> {
        if self.items.len() <= self.threshold {
            let cmp = &*self.cmp;
            self.items.sort_by(|a, b| cmp(a, b));
            return Ok(self.items);
        }

        let mid = self.items.len() / 2;
        let right = self.items.split_off(mid);
        let right = worker.fork(self.child(right));

        let cmp = self.cmp.clone();
        let left = self.compute(worker)?;
        let right = worker.join(right)?;

        Ok(merge(left, right, &*cmp))
    }
}

/// Merges two sorted vectors into one.
///
/// On ties the item from `left` comes first. When one side runs out, the rest
/// of the other side is appended as is.
///
/// ```
/// let merged = fjord::merge(vec![1, 4, 9], vec![2, 4, 5], u32::cmp);
/// assert_eq!(merged, [1, 2, 4, 4, 5, 9]);
/// ```
pub fn merge<T, F>(left: Vec<T>, right: Vec<T>, cmp: F) -> Vec<T>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => cmp(r, l) == Ordering::Less,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }

    merged
}

/// Sorts `items` on `pool`, splitting until pieces are at most `threshold`
/// items long.
pub fn par_sort<T>(pool: &ThreadPool, items: Vec<T>, threshold: usize) -> Result<Vec<T>>
where
    T: Ord + Send + 'static,
{
    par_sort_by(pool, items, threshold, T::cmp)
}

/// Sorts `items` on `pool` with a comparison function.
pub fn par_sort_by<T, F>(pool: &ThreadPool, items: Vec<T>, threshold: usize, cmp: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
    pool.invoke(MergeSort::new(items, threshold, cmp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_left_on_ties() {
        let left = vec![(1, 'a'), (2, 'a'), (2, 'b')];
        let right = vec![(0, 'c'), (2, 'c'), (3, 'c')];
        let merged = merge(left, right, |a, b| a.0.cmp(&b.0));
        assert_eq!(
            merged,
            [(0, 'c'), (1, 'a'), (2, 'a'), (2, 'b'), (2, 'c'), (3, 'c')]
        );
    }

    #[test]
    fn merge_appends_leftovers() {
        assert_eq!(merge(vec![], vec![1, 2], i32::cmp), [1, 2]);
        assert_eq!(merge(vec![5, 6], vec![], i32::cmp), [5, 6]);
        assert_eq!(merge(vec![7, 8], vec![1], i32::cmp), [1, 7, 8]);
    }

    #[test]
    fn sorts_with_tiny_threshold() {
        let pool = ThreadPool::new(3).unwrap();
        let items: Vec<u32> = (0..500).rev().collect();
        let sorted = par_sort(&pool, items, 1).unwrap();
        assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sorted.len(), 500);
    }

    #[test]
    fn zero_threshold_is_one() {
        let pool = ThreadPool::new(1).unwrap();
        let sorted = par_sort(&pool, vec![3, 2, 1], 0).unwrap();
        assert_eq!(sorted, [1, 2, 3]);
    }
}
