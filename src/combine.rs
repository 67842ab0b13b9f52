//! Joining sets of tasks.
//!
//! [`when_all`] and [`when_any`] fold a collection of tasks into a single
//! task, built out of the same machinery as everything else: an
//! externally-completed observer block plus one inline continuation per
//! input. No input is ever waited on; the last (or first) finisher
//! completes the observer from its own thread.

use crate::loom::blocking::Mutex;
use crate::scheduler::InlineScheduler;
use crate::task::raw::Core;
use crate::task::{ObserverRef, Task};
use core::sync::atomic::{AtomicUsize, Ordering::AcqRel};
use std::sync::Arc;

/// State shared by [`when_all`]'s per-input continuations.
struct AllState<T> {
    slots: Mutex<Vec<Option<T>>>,
    pending: AtomicUsize,
}

/// Returns a task that completes with every input's result, in input
/// order, once all inputs are terminal.
///
/// If any input is canceled, the returned task is canceled with the first
/// fault observed; the remaining inputs still run to completion, but their
/// results are discarded.
///
/// An empty input completes immediately with an empty `Vec`.
pub fn when_all<T: Send + 'static>(tasks: Vec<Task<T>>) -> Task<Vec<T>> {
    let observer = Core::<Vec<T>>::allocate();
    let handle = unsafe { Task::from_core(observer) };

    let count = tasks.len();
    if count == 0 {
        unsafe { Core::complete(observer, Vec::new()) };
        return handle;
    }

    let obs = unsafe { ObserverRef::new(observer) };
    let state = Arc::new(AllState::<T> {
        slots: Mutex::new((0..count).map(|_| None).collect()),
        pending: AtomicUsize::new(count),
    });

    for (index, task) in tasks.into_iter().enumerate() {
        let obs = obs.clone();
        let state = state.clone();
        // The handle returned by `then_task` is dropped: the continuation
        // is detached, and only the observer is ever waited on.
        drop(task.then_task(&InlineScheduler, move |parent: Task<T>| {
            match parent.take_outcome() {
                Ok(value) => state.slots.lock()[index] = Some(value),
                Err(fault) => {
                    // First fault wins; later faults lose the lock race and
                    // are dropped.
                    obs.try_terminate(fault);
                }
            }

            if state.pending.fetch_sub(1, AcqRel) == 1 {
                // Last input to finish. If every slot filled, no input
                // faulted, and the observer is still waiting for us.
                let mut slots = state.slots.lock();
                if slots.iter().all(Option::is_some) {
                    let values = slots.iter_mut().filter_map(Option::take).collect();
                    obs.try_complete(values);
                }
            }
        }));
    }

    handle
}

/// Returns a task that completes with the index and result of the first
/// input to finish.
///
/// If the first input to finish was canceled, its fault is propagated.
/// Results of the remaining inputs are discarded as they arrive.
///
/// # Panics
///
/// If `tasks` is empty; there would be nothing to wait for.
pub fn when_any<T: Send + 'static>(tasks: Vec<Task<T>>) -> Task<(usize, T)> {
    assert!(!tasks.is_empty(), "when_any requires at least one task");

    let observer = Core::<(usize, T)>::allocate();
    let handle = unsafe { Task::from_core(observer) };
    let obs = unsafe { ObserverRef::new(observer) };

    for (index, task) in tasks.into_iter().enumerate() {
        let obs = obs.clone();
        drop(task.then_task(&InlineScheduler, move |parent: Task<T>| {
            match parent.take_outcome() {
                Ok(value) => {
                    obs.try_complete((index, value));
                }
                Err(fault) => {
                    obs.try_terminate(fault);
                }
            }
        }));
    }

    handle
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::scheduler::ThreadPool;
    use crate::task::{spawn, EventTask};
    use crate::util::trace_init;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn all_collects_results_in_input_order() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(4);
        let tasks: Vec<_> = (0..16).map(|i| spawn(&pool, move || i * 2)).collect();

        let all = when_all(tasks);
        assert_eq!(all.get(), (0..16).map(|i| i * 2).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn all_of_nothing_is_immediately_ready() {
        let all = when_all(Vec::<Task<u32>>::new());
        assert!(all.ready());
        assert_eq!(all.get(), Vec::<u32>::new());
    }

    #[test]
    fn all_propagates_the_fault_of_a_canceled_input() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(2);
        let tasks = vec![
            spawn(&pool, || 1),
            spawn(&pool, || panic!("input failed")),
            spawn(&pool, || 3),
        ];

        let all = when_all(tasks);
        let err = catch_unwind(AssertUnwindSafe(|| all.get())).unwrap_err();
        assert_eq!(
            crate::fault::panic_message(&*err),
            Some("input failed"),
        );
        pool.shutdown();
    }

    #[test]
    fn any_yields_the_first_finisher() {
        let _trace = trace_init();
        let first = EventTask::new();
        let second = EventTask::new();

        let any = when_any(vec![first.task(), second.task()]);
        assert!(!any.ready());

        assert!(second.set("fast"));
        assert_eq!(any.get(), (1, "fast"));

        // The slow input's result is discarded without complaint.
        assert!(first.set("slow"));
    }

    #[test]
    fn any_propagates_a_first_place_fault() {
        let event = EventTask::<u32>::new();
        let any = when_any(vec![event.task()]);

        assert!(event.cancel(crate::fault::Fault::new("nope")));
        let err = catch_unwind(AssertUnwindSafe(|| any.get())).unwrap_err();
        assert_eq!(crate::fault::panic_message(&*err), Some("nope"));
    }
}
