//! Divide-and-conquer parallel iteration.
//!
//! [`parallel_for`] recursively halves a [`Partitioner`], spawning the
//! front half on the scheduler and walking the back half on the current
//! stack, then joining. The join runs queued work while it waits (see
//! [`scheduler`](crate::scheduler)), so the recursion is deadlock-free on a
//! pool of any size, including one worker.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = enoki::scheduler::ThreadPool::with_threads(4);
//! let counter = Arc::new(AtomicUsize::new(0));
//! enoki::parallel_for(&pool, 0..1024, {
//!     let counter = counter.clone();
//!     move |_| {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     }
//! });
//! assert_eq!(counter.load(Ordering::Relaxed), 1024);
//! ```

use crate::scheduler::Schedule;
use crate::task::local_spawn;
use core::ops::Range;
use std::sync::Arc;
use std::thread;

/// A splittable chunk of iteration space.
pub trait Partitioner: IntoIterator + Sized + Send {
    /// Splits off roughly half of the remaining work and returns it, or
    /// returns `None` when the remainder is at the grain size and should be
    /// iterated in place.
    fn split(&mut self) -> Option<Self>;
}

/// Conversion into a [`Partitioner`], so iteration drivers accept plain
/// ranges as well as explicitly-configured partitioners.
pub trait IntoPartitioner {
    type Part: Partitioner;

    fn into_partitioner(self) -> Self::Part;
}

/// A [`Partitioner`] over a `Range<usize>`, splitting at the midpoint down
/// to a grain size.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    range: Range<usize>,
    grain: usize,
}

// === impl RangePartitioner ===

impl RangePartitioner {
    /// Returns a partitioner with an automatic grain size: roughly eight
    /// chunks per available worker, so the scheduler has slack to balance.
    #[must_use]
    pub fn new(range: Range<usize>) -> Self {
        let workers = thread::available_parallelism().map(usize::from).unwrap_or(2);
        let grain = range.len() / (8 * workers);
        Self::with_grain(range, grain)
    }

    /// Returns a partitioner that stops splitting at `grain` elements.
    #[must_use]
    pub fn with_grain(range: Range<usize>, grain: usize) -> Self {
        Self {
            range,
            grain: grain.max(1),
        }
    }
}

impl Partitioner for RangePartitioner {
    fn split(&mut self) -> Option<Self> {
        let len = self.range.len();
        if len <= self.grain {
            return None;
        }
        let mid = self.range.start + len / 2;
        let front = self.range.start..mid;
        self.range.start = mid;
        Some(Self {
            range: front,
            grain: self.grain,
        })
    }
}

impl IntoIterator for RangePartitioner {
    type Item = usize;
    type IntoIter = Range<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.range
    }
}

impl IntoPartitioner for RangePartitioner {
    type Part = Self;

    fn into_partitioner(self) -> Self {
        self
    }
}

impl IntoPartitioner for Range<usize> {
    type Part = RangePartitioner;

    fn into_partitioner(self) -> RangePartitioner {
        RangePartitioner::new(self)
    }
}

/// Applies `func` to every element of `range`, in parallel on `scheduler`.
///
/// Returns once every element has been visited exactly once. The calling
/// thread participates in the work.
pub fn parallel_for<S, I, F>(scheduler: &S, range: I, func: F)
where
    S: Schedule,
    I: IntoPartitioner,
    I::Part: 'static,
    F: Fn(<I::Part as IntoIterator>::Item) + Send + Sync + 'static,
{
    drive(scheduler, range.into_partitioner(), Arc::new(func))
}

fn drive<S, P, F>(scheduler: &S, mut part: P, func: Arc<F>)
where
    S: Schedule,
    P: Partitioner + 'static,
    F: Fn(P::Item) + Send + Sync + 'static,
{
    match part.split() {
        // At the grain: apply the function in place.
        None => {
            let func = &*func;
            for item in part {
                func(item);
            }
        }
        Some(front) => {
            let spawned = {
                let func = func.clone();
                let sched = scheduler.clone();
                local_spawn(scheduler, move || drive(&sched, front, func))
            };
            drive(scheduler, part, func);
            spawned.get();
        }
    }
}

/// Maps every element of `range` through `map` and folds the results with
/// `reduce`, in parallel on `scheduler`.
///
/// `identity` seeds each chunk's fold, so `reduce(identity, x)` must equal
/// `x` for the result to be independent of the split points. `reduce` must
/// be associative for the same reason.
pub fn parallel_reduce<S, I, R, M, RF>(
    scheduler: &S,
    range: I,
    identity: R,
    map: M,
    reduce: RF,
) -> R
where
    S: Schedule,
    I: IntoPartitioner,
    I::Part: 'static,
    R: Clone + Send + 'static,
    M: Fn(<I::Part as IntoIterator>::Item) -> R + Send + Sync + 'static,
    RF: Fn(R, R) -> R + Send + Sync + 'static,
{
    drive_reduce(
        scheduler,
        range.into_partitioner(),
        identity,
        Arc::new(map),
        Arc::new(reduce),
    )
}

fn drive_reduce<S, P, R, M, RF>(
    scheduler: &S,
    mut part: P,
    identity: R,
    map: Arc<M>,
    reduce: Arc<RF>,
) -> R
where
    S: Schedule,
    P: Partitioner + 'static,
    R: Clone + Send + 'static,
    M: Fn(P::Item) -> R + Send + Sync + 'static,
    RF: Fn(R, R) -> R + Send + Sync + 'static,
{
    match part.split() {
        None => {
            let map = &*map;
            let reduce = &*reduce;
            let mut acc = identity;
            for item in part {
                acc = reduce(acc, map(item));
            }
            acc
        }
        Some(front) => {
            let spawned = {
                let identity = identity.clone();
                let map = map.clone();
                let reduce = reduce.clone();
                let sched = scheduler.clone();
                local_spawn(scheduler, move || {
                    drive_reduce(&sched, front, identity, map, reduce)
                })
            };
            let back = drive_reduce(scheduler, part, identity, map, reduce.clone());
            // Front of the range first, to keep non-commutative reductions
            // in element order.
            (&*reduce)(spawned.get(), back)
        }
    }
}

/// Runs `fa` and `fb` in parallel, returning both results.
///
/// `fa` is spawned on the scheduler; `fb` runs on the calling thread.
pub fn parallel_invoke<S, FA, FB, A, B>(scheduler: &S, fa: FA, fb: FB) -> (A, B)
where
    S: Schedule,
    FA: FnOnce() -> A + Send + 'static,
    A: Send + 'static,
    FB: FnOnce() -> B,
{
    let spawned = local_spawn(scheduler, fa);
    let b = fb();
    (spawned.get(), b)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::scheduler::{InlineScheduler, ThreadPool};
    use crate::util::trace_init;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};

    #[test]
    fn counts_every_element() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(4);
        let counter = Arc::new(AtomicUsize::new(0));

        parallel_for(&pool, 0..1024, {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, SeqCst);
            }
        });

        assert_eq!(counter.load(SeqCst), 1024);
        pool.shutdown();
    }

    #[test]
    fn visits_each_element_exactly_once() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(4);
        let seen: Arc<Vec<AtomicBool>> =
            Arc::new((0..512).map(|_| AtomicBool::new(false)).collect());

        parallel_for(&pool, 0..512, {
            let seen = seen.clone();
            move |i| {
                assert!(!seen[i].swap(true, SeqCst), "element {i} visited twice");
            }
        });

        assert!(seen.iter().all(|flag| flag.load(SeqCst)));
        pool.shutdown();
    }

    #[test]
    fn single_worker_does_not_deadlock() {
        let _trace = trace_init();
        // Every join happens on the one worker or the caller; termination
        // requires the blocked thread to execute its own queued splits.
        let pool = ThreadPool::with_threads(1);
        let counter = Arc::new(AtomicUsize::new(0));

        parallel_for(&pool, 0..256, {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, SeqCst);
            }
        });

        assert_eq!(counter.load(SeqCst), 256);
        pool.shutdown();
    }

    #[test]
    fn inline_scheduler_runs_serially() {
        let counter = Arc::new(AtomicUsize::new(0));
        parallel_for(&InlineScheduler, 0..100, {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, SeqCst);
            }
        });
        assert_eq!(counter.load(SeqCst), 100);
    }

    #[test]
    fn coarse_grain_runs_in_place() {
        let counter = Arc::new(AtomicUsize::new(0));
        let part = RangePartitioner::with_grain(0..10, 100);
        parallel_for(&InlineScheduler, part, {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, SeqCst);
            }
        });
        assert_eq!(counter.load(SeqCst), 10);
    }

    #[test]
    fn empty_range_is_a_no_op() {
        parallel_for(&InlineScheduler, 0..0, |i| panic!("visited {i} in an empty range"));
    }

    #[test]
    fn reduce_sums_a_range() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(4);
        let sum = parallel_reduce(&pool, 0..1000, 0usize, |i| i, |a, b| a + b);
        assert_eq!(sum, 499_500);
        pool.shutdown();
    }

    #[test]
    fn reduce_keeps_element_order() {
        let pool = ThreadPool::with_threads(2);
        // String concatenation is associative but not commutative; the
        // result is order-sensitive.
        let digits = parallel_reduce(
            &pool,
            0..10,
            String::new(),
            |i| i.to_string(),
            |a, b| a + &b,
        );
        assert_eq!(digits, "0123456789");
        pool.shutdown();
    }

    #[test]
    fn invoke_runs_both_closures() {
        let pool = ThreadPool::with_threads(2);
        let (a, b) = parallel_invoke(&pool, || 6 * 7, || "forty-two");
        assert_eq!(a, 42);
        assert_eq!(b, "forty-two");
        pool.shutdown();
    }
}
