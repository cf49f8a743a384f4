//! Integration tests for the fjord thread pool.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use fjord::BoxError;
use fjord::Error;
use fjord::MergeSort;
use fjord::Task;
use fjord::TaskFailure;
use fjord::TaskState;
use fjord::ThreadPool;
use fjord::Worker;
use fjord::from_fn;
use fjord::par_for_each;
use fjord::par_sort;
use fjord::par_sort_by;
use proptest::prelude::*;
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let subscriber = Subscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Spins until `flag` is raised, or panics after the test timeout.
fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + TIMEOUT;
    while !flag.load(Ordering::Acquire) {
        assert!(Instant::now() < deadline, "timed out waiting for flag");
        thread::yield_now();
    }
}

// -----------------------------------------------------------------------------
// Merge sort

#[test]
fn sorts_scenario_with_every_threshold() {
    init_tracing();
    let pool = ThreadPool::new(4).unwrap();
    let input = vec![42, 1337, 69, 7, 420, 12];
    for threshold in 1..=input.len() {
        let sorted = par_sort(&pool, input.clone(), threshold).unwrap();
        assert_eq!(sorted, [7, 12, 42, 69, 420, 1337], "threshold {threshold}");
    }
}

#[test]
fn sorting_sorted_input_is_identity() {
    let pool = ThreadPool::new(3).unwrap();
    let input: Vec<i64> = (-200..200).collect();
    assert_eq!(par_sort(&pool, input.clone(), 1).unwrap(), input);
}

#[test]
fn sort_is_stable() {
    let pool = ThreadPool::new(4).unwrap();
    let input: Vec<(u8, usize)> = (0..300).map(|i| ((i * 7 % 5) as u8, i)).collect();
    let sorted = par_sort_by(&pool, input, 1, |a, b| a.0.cmp(&b.0)).unwrap();
    for pair in sorted.windows(2) {
        assert!(pair[0].0 <= pair[1].0);
        if pair[0].0 == pair[1].0 {
            assert!(pair[0].1 < pair[1].1, "equal keys reordered: {pair:?}");
        }
    }
}

#[test]
fn sort_on_a_single_worker() {
    // One worker must be able to run an entire recursion on its own.
    let pool = ThreadPool::new(1).unwrap();
    let input: Vec<u32> = (0..4096).rev().collect();
    let sorted = pool.invoke(MergeSort::new(input, 1, u32::cmp)).unwrap();
    assert_eq!(sorted, (0..4096).collect::<Vec<_>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sort_yields_sorted_permutation(
        input in prop::collection::vec(any::<i32>(), 0..200),
        threshold in 1usize..16,
    ) {
        let pool = fjord::common();
        let sorted = par_sort(pool, input.clone(), threshold).unwrap();

        let mut expected = input;
        expected.sort();
        prop_assert_eq!(sorted, expected);
    }

    #[test]
    fn threshold_does_not_change_output(input in prop::collection::vec(any::<u16>(), 0..120)) {
        let pool = fjord::common();
        let fine = par_sort(pool, input.clone(), 1).unwrap();
        let coarse = par_sort(pool, input.clone(), input.len().max(1)).unwrap();
        prop_assert_eq!(fine, coarse);
    }
}

// -----------------------------------------------------------------------------
// Batch action

#[test]
fn batch_visits_every_item_exactly_once() {
    init_tracing();
    let pool = ThreadPool::new(4).unwrap();
    let words = vec!["Ik", "Maan", "Roos", "Vis", "Sok", "Pen"];

    let leaves = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (counter, log) = (leaves.clone(), seen.clone());
    par_for_each(&pool, words.clone(), 1, move |word: &&str| {
        counter.fetch_add(1, Ordering::Relaxed);
        log.lock().unwrap().push(*word);
    })
    .unwrap();

    assert_eq!(leaves.load(Ordering::Relaxed), 6);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    let mut expected = words;
    expected.sort();
    assert_eq!(seen, expected);
}

// -----------------------------------------------------------------------------
// Fork and join

#[test]
fn join_on_completed_task_does_not_recompute() {
    let pool = ThreadPool::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = runs.clone();
    let handle = pool
        .submit(from_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        }))
        .unwrap();

    assert_eq!(handle.get().unwrap(), 99);
    assert!(handle.is_done());
    assert_eq!(handle.get().unwrap(), 99);
    assert_eq!(handle.clone().join().unwrap(), 99);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The value has been moved out; another consuming join cannot have it.
    assert!(matches!(handle.join(), Err(Error::Consumed)));
}

#[test]
fn fork_does_not_block() {
    let pool = ThreadPool::new(2).unwrap();
    let elapsed = pool
        .invoke(from_fn(|worker| {
            let start = Instant::now();
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    worker.fork(from_fn(|_| {
                        thread::sleep(Duration::from_millis(50));
                        Ok(())
                    }))
                })
                .collect();
            let elapsed = start.elapsed();
            for handle in handles {
                worker.join(handle)?;
            }
            Ok(elapsed)
        }))
        .unwrap();
    assert!(elapsed < Duration::from_millis(50), "forking took {elapsed:?}");
}

#[test]
fn submit_does_not_block() {
    let pool = ThreadPool::new(1).unwrap();
    let start = Instant::now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            pool.submit(from_fn(|_| {
                thread::sleep(Duration::from_millis(20));
                Ok(())
            }))
            .unwrap()
        })
        .collect();
    assert!(start.elapsed() < Duration::from_millis(20));
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn deep_recursion_on_one_worker() {
    struct Count(u32);

    impl Task for Count {
        type Output = u64;

        fn compute(self, worker: &Worker) -> Result<u64, BoxError> {
            if self.0 == 0 {
                return Ok(1);
            }
            let right = worker.fork(Count(self.0 - 1));
            let left = Count(self.0 - 1).compute(worker)?;
            Ok(left + worker.join(right)?)
        }
    }

    let pool = ThreadPool::new(1).unwrap();
    assert_eq!(pool.invoke(Count(12)).unwrap(), 1 << 12);
}

#[test]
fn work_is_stolen_by_idle_workers() {
    let pool = ThreadPool::new(4).unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let gate = barrier.clone();
    pool.invoke(from_fn(move |worker| {
        // The forked task can only finish if another worker runs it while
        // this one is blocked on the barrier.
        let other = worker.fork(from_fn(move |_| {
            gate.wait();
            Ok(())
        }));
        barrier.wait();
        worker.join(other)?;
        Ok(())
    }))
    .unwrap();
    assert!(pool.stats().stolen >= 1);
}

#[test]
fn submit_with_result_replaces_value() {
    let pool = ThreadPool::new(2).unwrap();
    let handle = pool
        .submit_with_result(from_fn(|_| Ok(1234)), "done")
        .unwrap();
    assert_eq!(handle.join().unwrap(), "done");

    let failing = pool
        .submit_with_result(from_fn(|_| Err::<(), BoxError>("nope".into())), "done")
        .unwrap();
    assert!(matches!(failing.join(), Err(Error::Failed(_))));
}

// -----------------------------------------------------------------------------
// Failures

#[test]
fn task_errors_are_reported_to_joiner() {
    let pool = ThreadPool::new(2).unwrap();
    let handle = pool
        .submit(from_fn(|_| {
            Err::<u8, BoxError>(Box::new(std::io::Error::other("disk on fire")))
        }))
        .unwrap();

    let err = handle.clone().join().unwrap_err();
    assert!(handle.is_failed());
    match err {
        Error::Failed(failure) => {
            let io = failure.downcast_ref::<std::io::Error>().unwrap();
            assert_eq!(io.to_string(), "disk on fire");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Failures stay observable.
    assert!(matches!(handle.join(), Err(Error::Failed(_))));
}

#[test]
fn panics_are_captured_and_pool_survives() {
    let pool = ThreadPool::new(1).unwrap();
    let err = pool
        .invoke(from_fn(|_| -> Result<(), BoxError> { panic!("boom") }))
        .unwrap_err();
    match err {
        Error::Failed(TaskFailure::Panicked(message)) => assert_eq!(&*message, "boom"),
        other => panic!("unexpected error: {other}"),
    }

    // The only worker is still alive.
    assert_eq!(pool.invoke(from_fn(|_| Ok(7))).unwrap(), 7);
}

#[test]
fn invoke_all_keeps_order() {
    let pool = ThreadPool::new(3).unwrap();
    let tasks = (0..10u64).map(|i| {
        from_fn(move |_| {
            thread::sleep(Duration::from_millis(10 - i));
            Ok(i * i)
        })
    });
    let squares = pool.invoke_all(tasks).unwrap();
    assert_eq!(squares, (0..10u64).map(|i| i * i).collect::<Vec<_>>());
}

#[test]
fn invoke_all_aggregates_every_failure() {
    let pool = ThreadPool::new(3).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6usize)
        .map(|i| {
            let finished = finished.clone();
            from_fn(move |_| -> Result<usize, BoxError> {
                finished.fetch_add(1, Ordering::SeqCst);
                match i {
                    1 => Err("bad input".into()),
                    4 => panic!("worse input"),
                    _ => Ok(i),
                }
            })
        })
        .collect();

    match pool.invoke_all(tasks) {
        Err(Error::Batch { total, failures }) => {
            assert_eq!(total, 6);
            let indices: Vec<usize> = failures.iter().map(|(i, _)| *i).collect();
            assert_eq!(indices, [1, 4]);
            assert!(matches!(failures[1].1, Error::Failed(TaskFailure::Panicked(_))));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(finished.load(Ordering::SeqCst), 6);
}

#[test]
fn invoke_any_returns_first_success() {
    let pool = ThreadPool::new(2).unwrap();
    let tasks: Vec<_> = (0..4u32)
        .map(|i| {
            from_fn(move |_| -> Result<u32, BoxError> {
                if i < 2 { Err("not yet".into()) } else { Ok(i) }
            })
        })
        .collect();
    assert_eq!(pool.invoke_any(tasks).unwrap(), 2);

    let none: Vec<fjord::FnTask<fn(&Worker) -> Result<u32, BoxError>>> = Vec::new();
    assert!(matches!(pool.invoke_any(none), Err(Error::NoTasks)));

    let failing = (0..3).map(|_| from_fn(|_| Err::<u32, BoxError>("no".into())));
    match pool.invoke_any(failing) {
        Err(Error::Batch { total, failures }) => {
            assert_eq!(total, 3);
            assert_eq!(failures.len(), 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn invoke_any_blocks_on_earliest_unfinished_task() {
    let pool = ThreadPool::new(2).unwrap();
    let second_done = Arc::new(AtomicBool::new(false));

    // The first task only finishes after the second one has, but nothing has
    // finished when the search starts, so the first task's value is returned.
    let (wait_on, signal) = (second_done.clone(), second_done.clone());
    let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
        Box::new(move || {
            wait_for(&wait_on);
            0
        }),
        Box::new(move || {
            thread::sleep(Duration::from_millis(100));
            signal.store(true, Ordering::Release);
            1
        }),
    ];
    let tasks = tasks.into_iter().map(|f| from_fn(move |_| Ok(f())));
    assert_eq!(pool.invoke_any(tasks).unwrap(), 0);
}

// -----------------------------------------------------------------------------
// Cancellation

#[test]
fn cancel_before_start() {
    let pool = ThreadPool::new(1).unwrap();
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    // Occupy the only worker.
    let (flag, gate) = (started.clone(), release.clone());
    let blocker = pool
        .submit(from_fn(move |_| {
            flag.store(true, Ordering::Release);
            wait_for(&gate);
            Ok(())
        }))
        .unwrap();
    wait_for(&started);

    let ran = Arc::new(AtomicBool::new(false));
    let witness = ran.clone();
    let queued = pool
        .submit(from_fn(move |_| {
            witness.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    assert_eq!(queued.state(), TaskState::Forked);
    assert!(queued.cancel());
    assert!(queued.is_cancelled());

    release.store(true, Ordering::Release);
    blocker.join().unwrap();

    assert!(matches!(queued.join(), Err(Error::Cancelled)));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn cancelling_running_task_is_advisory() {
    let pool = ThreadPool::new(2).unwrap();
    let started = Arc::new(AtomicBool::new(false));

    let flag = started.clone();
    let handle = pool
        .submit(from_fn(move |worker| {
            flag.store(true, Ordering::Release);
            let deadline = Instant::now() + TIMEOUT;
            while !worker.is_cancelled() {
                assert!(Instant::now() < deadline);
                thread::yield_now();
            }
            // Forks made after cancellation was observed do nothing.
            let child = worker.fork(from_fn(|_| Ok(1)));
            assert!(child.is_cancelled());
            Ok("finished anyway")
        }))
        .unwrap();

    wait_for(&started);
    assert!(!handle.cancel());
    assert_eq!(handle.clone().join().unwrap(), "finished anyway");
    assert_eq!(handle.state(), TaskState::Completed);
}

/// Spins until the running task is asked to cancel, then joins a child forked
/// after that point.
fn join_after_cancellation(
    started: Arc<AtomicBool>,
) -> impl FnOnce(&Worker) -> Result<u32, BoxError> + Send + 'static {
    move |worker| {
        started.store(true, Ordering::Release);
        let deadline = Instant::now() + TIMEOUT;
        while !worker.is_cancelled() {
            assert!(Instant::now() < deadline);
            thread::yield_now();
        }
        let child = worker.fork(from_fn(|_| Ok(1)));
        Ok(worker.join(child)?)
    }
}

#[test]
fn cancelled_join_in_cancelled_task_ends_cancelled() {
    let pool = ThreadPool::new(2).unwrap();
    let started = Arc::new(AtomicBool::new(false));

    let handle = pool
        .submit(from_fn(join_after_cancellation(started.clone())))
        .unwrap();
    wait_for(&started);
    assert!(!handle.cancel());

    assert!(matches!(handle.clone().join(), Err(Error::Cancelled)));
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(handle.is_cancelled());
    assert!(!handle.is_failed());
}

#[test]
fn cancelled_join_during_shutdown_now_ends_cancelled() {
    let pool = ThreadPool::new(1).unwrap();
    let started = Arc::new(AtomicBool::new(false));

    let handle = pool
        .submit(from_fn(join_after_cancellation(started.clone())))
        .unwrap();
    wait_for(&started);
    pool.shutdown_now();

    assert!(matches!(handle.clone().join(), Err(Error::Cancelled)));
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(pool.await_termination(TIMEOUT));
}

// -----------------------------------------------------------------------------
// Lifecycle

#[test]
fn rejects_zero_parallelism() {
    assert!(matches!(
        ThreadPool::new(0),
        Err(Error::Configuration { parallelism: 0 })
    ));
}

#[test]
fn shutdown_rejects_new_work_but_drains_queue() {
    init_tracing();
    let pool = ThreadPool::new(1).unwrap();
    let release = Arc::new(AtomicBool::new(false));

    let gate = release.clone();
    let first = pool
        .submit(from_fn(move |_| {
            wait_for(&gate);
            Ok(1)
        }))
        .unwrap();
    let queued: Vec<_> = (2..6)
        .map(|i| pool.submit(from_fn(move |_| Ok(i))).unwrap())
        .collect();

    pool.shutdown();
    pool.shutdown();
    assert!(pool.is_shutdown());
    assert!(matches!(
        pool.submit(from_fn(|_| Ok(0))),
        Err(Error::Rejected)
    ));

    release.store(true, Ordering::Release);
    assert_eq!(first.join().unwrap(), 1);
    let rest: Vec<i32> = queued.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(rest, [2, 3, 4, 5]);

    assert!(pool.await_termination(TIMEOUT));
    assert!(pool.is_terminated());
}

#[test]
fn workers_may_fork_after_shutdown() {
    let pool = ThreadPool::new(2).unwrap();
    let release = Arc::new(AtomicBool::new(false));

    let gate = release.clone();
    let parent = pool
        .submit(from_fn(move |worker| {
            wait_for(&gate);
            let child = worker.fork(from_fn(|_| Ok(20)));
            Ok(1 + worker.join(child)?)
        }))
        .unwrap();

    pool.shutdown();
    release.store(true, Ordering::Release);
    assert_eq!(parent.join().unwrap(), 21);
    assert!(pool.await_termination(TIMEOUT));
}

#[test]
fn shutdown_now_discards_queued_work() {
    let pool = ThreadPool::new(1).unwrap();
    let started = Arc::new(AtomicBool::new(false));

    let flag = started.clone();
    let running = pool
        .submit(from_fn(move |worker| {
            flag.store(true, Ordering::Release);
            let deadline = Instant::now() + TIMEOUT;
            while !worker.is_cancelled() {
                assert!(Instant::now() < deadline);
                thread::yield_now();
            }
            Ok("saw cancellation")
        }))
        .unwrap();
    wait_for(&started);

    let queued: Vec<_> = (0..4)
        .map(|i| pool.submit(from_fn(move |_| Ok(i))).unwrap())
        .collect();

    pool.shutdown_now();
    assert!(pool.is_shutdown());

    assert_eq!(running.join().unwrap(), "saw cancellation");
    for handle in queued {
        assert!(matches!(handle.join(), Err(Error::Cancelled)));
    }
    assert!(pool.await_termination(TIMEOUT));
    assert_eq!(pool.stats().discarded, 4);
}

#[test]
fn await_termination_times_out_while_running() {
    let pool = ThreadPool::new(1).unwrap();
    assert!(!pool.await_termination(Duration::from_millis(20)));
    assert!(!pool.is_terminated());
}

#[test]
fn await_termination_accepts_unbounded_timeout() {
    let pool = ThreadPool::new(2).unwrap();
    let handle = pool.submit(from_fn(|_| Ok(5))).unwrap();
    pool.shutdown();
    assert!(pool.await_termination(Duration::MAX));
    assert!(pool.is_terminated());
    assert_eq!(handle.join().unwrap(), 5);
}

#[test]
fn invoke_all_joins_accepted_tasks_before_reporting_rejection() {
    let pool = ThreadPool::new(2).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    let tasks = (0..4).map(|i| {
        if i == 2 {
            pool.shutdown();
        }
        let finished = finished.clone();
        from_fn(move |_| {
            thread::sleep(Duration::from_millis(10));
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(i)
        })
    });

    assert!(matches!(pool.invoke_all(tasks), Err(Error::Rejected)));
    assert_eq!(finished.load(Ordering::SeqCst), 2);
}

#[test]
fn external_join_across_pools() {
    let outer = ThreadPool::new(2).unwrap();
    let inner = Arc::new(ThreadPool::new(2).unwrap());

    let other = inner.clone();
    let value = outer
        .invoke(from_fn(move |_| {
            // A join on another pool's task blocks instead of helping.
            Ok(other.invoke(from_fn(|_| Ok(5)))? * 2)
        }))
        .unwrap();
    assert_eq!(value, 10);
}

#[test]
fn common_pool_is_shared() {
    let a = fjord::common();
    let b = fjord::common();
    assert!(std::ptr::eq(a, b));
    assert!(a.num_threads() >= 1);
    let in_range = a
        .invoke(from_fn(|worker| Ok(worker.index() < worker.num_threads())))
        .unwrap();
    assert!(in_range);
}

#[test]
fn stats_count_executed_tasks() {
    let pool = ThreadPool::new(2).unwrap();
    let handles: Vec<_> = (0..10)
        .map(|i| pool.submit(from_fn(move |_| Ok(i))).unwrap())
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    // Counters are bumped after the joiner is released; wait for the workers.
    pool.shutdown();
    assert!(pool.await_termination(TIMEOUT));
    assert_eq!(pool.stats().executed, 10);
}
