//! Schedulers: where tasks go to run.
//!
//! The core hands every task, sooner or later, to a [`Schedule`]
//! implementation as a [`TaskRef`]. Two schedulers ship with the crate:
//!
//! - [`InlineScheduler`] runs the task synchronously on the submitting
//!   thread. The unwrap transfer and the wait machinery depend on it.
//! - [`ThreadPool`] runs tasks on a fixed set of worker threads, with a
//!   per-worker local queue so fork/join work submitted from a worker
//!   stays on that worker when possible.
//!
//! A process-wide pool is available from [`default_scheduler`].

use crate::loom::blocking::Mutex;
use crate::task::raw::Header;
use crate::task::TaskRef;
use crate::wait::{self, WaitEvent, TASK_AVAILABLE};
use core::cell::RefCell;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering::*};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

/// A sink for runnable tasks.
///
/// Accepting a [`TaskRef`] obliges the scheduler to eventually pass it to
/// [`TaskRef::run`], exactly once. Schedulers are cloned into every task
/// they will dispatch, so implementations should be cheap handles.
pub trait Schedule: Clone + Send + Sync + 'static {
    /// Submits a task for execution.
    fn schedule(&self, task: TaskRef);
}

/// Runs submitted tasks synchronously on the submitting thread.
#[derive(Copy, Clone, Debug, Default)]
pub struct InlineScheduler;

impl Schedule for InlineScheduler {
    fn schedule(&self, task: TaskRef) {
        task.run()
    }
}

/// A fixed-size pool of worker threads.
///
/// Cloning a `ThreadPool` clones a handle to the same pool. Work submitted
/// from one of the pool's own workers lands on that worker's local queue;
/// work submitted from anywhere else goes to the shared injector queue and
/// wakes an idle worker.
///
/// A worker blocked in [`Task::get`] executes other tasks from the pool's
/// queues while it waits, so recursive fork/join (see
/// [`parallel_for`](crate::parallel::parallel_for)) cannot starve the pool,
/// even with a single worker.
///
/// [`Task::get`]: crate::task::Task::get
#[derive(Clone)]
pub struct ThreadPool {
    core: Arc<PoolCore>,
}

struct PoolCore {
    /// The shared injector queue.
    injector: Mutex<VecDeque<TaskRef>>,
    /// Events of workers that are (or are about to go) idle.
    sleepers: Mutex<Vec<Arc<WaitEvent>>>,
    shutdown: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Per-thread worker context, present only on pool worker threads.
struct Worker {
    pool: Weak<PoolCore>,
    event: Arc<WaitEvent>,
    /// LIFO queue of work submitted by this worker.
    local: RefCell<VecDeque<TaskRef>>,
}

std::thread_local! {
    static CURRENT_WORKER: RefCell<Option<Worker>> = const { RefCell::new(None) };
}

// === impl ThreadPool ===

impl ThreadPool {
    /// Returns a pool sized by the `ENOKI_THREADS` environment variable, or
    /// the machine's available parallelism.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threads(default_thread_count())
    }

    /// Returns a pool with exactly `threads` workers.
    ///
    /// # Panics
    ///
    /// If `threads` is zero.
    #[must_use]
    pub fn with_threads(threads: usize) -> Self {
        assert!(threads > 0, "a thread pool needs at least one worker");
        let core = Arc::new(PoolCore {
            injector: Mutex::new(VecDeque::new()),
            sleepers: Mutex::new(Vec::with_capacity(threads)),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let core = core.clone();
            let handle = thread::Builder::new()
                .name(format!("enoki-worker-{index}"))
                .spawn(move || worker_main(core, index))
                .expect("failed to spawn pool worker thread");
            handles.push(handle);
        }
        *core.threads.lock() = handles;

        Self { core }
    }

    /// Stops the pool: workers finish the queued work, then exit, and this
    /// call joins them.
    ///
    /// Tasks submitted after shutdown run inline on the submitting thread,
    /// so handles into a stopped pool still make progress.
    ///
    /// # Panics
    ///
    /// If called from one of this pool's own workers.
    pub fn shutdown(&self) {
        assert!(
            !self.is_current_worker(),
            "cannot shut a pool down from one of its own workers",
        );
        self.core.shutdown.store(true, Release);
        self.core.wake_all();
        let threads = mem::take(&mut *self.core.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    fn is_current_worker(&self) -> bool {
        CURRENT_WORKER.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|worker| worker.pool.upgrade())
                .is_some_and(|pool| Arc::ptr_eq(&pool, &self.core))
        })
    }
}

impl Schedule for ThreadPool {
    fn schedule(&self, task: TaskRef) {
        self.core.submit(task)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("queued", &self.core.injector.lock().len())
            .field("shutdown", &self.core.shutdown.load(Relaxed))
            .finish()
    }
}

// === impl PoolCore ===

impl PoolCore {
    fn submit(self: &Arc<Self>, task: TaskRef) {
        tracing::trace!(task = ?task, "ThreadPool::schedule");

        // Work submitted from one of this pool's own workers prefers that
        // worker's local queue.
        let task = match CURRENT_WORKER.with(|slot| {
            let slot = slot.borrow();
            match slot.as_ref() {
                Some(worker)
                    if worker
                        .pool
                        .upgrade()
                        .is_some_and(|pool| Arc::ptr_eq(&pool, self)) =>
                {
                    worker.local.borrow_mut().push_back(task);
                    Ok(())
                }
                _ => Err(task),
            }
        }) {
            Ok(()) => return,
            Err(task) => task,
        };

        if self.shutdown.load(Acquire) {
            // The workers are gone (or going); run on the submitting thread
            // rather than stranding the task in the queue.
            task.run();
            return;
        }

        self.injector.lock().push_back(task);
        self.wake_one();
    }

    fn pop_global(&self) -> Option<TaskRef> {
        self.injector.lock().pop_front()
    }

    /// Registers `event` to be woken when work arrives.
    ///
    /// Callers must re-check the queues *after* registering, or an arrival
    /// between their last check and the sleep is missed.
    fn add_sleeper(&self, event: &Arc<WaitEvent>) {
        let mut sleepers = self.sleepers.lock();
        if !sleepers.iter().any(|e| Arc::ptr_eq(e, event)) {
            sleepers.push(event.clone());
        }
    }

    fn wake_one(&self) {
        let event = self.sleepers.lock().pop();
        if let Some(event) = event {
            event.signal(TASK_AVAILABLE);
        }
    }

    fn wake_all(&self) {
        let sleepers = mem::take(&mut *self.sleepers.lock());
        for event in sleepers {
            event.signal(TASK_AVAILABLE);
        }
    }
}

// === impl Worker ===

impl Worker {
    fn pop_task(&self) -> Option<TaskRef> {
        if let Some(task) = self.local.borrow_mut().pop_back() {
            return Some(task);
        }
        self.pool.upgrade()?.pop_global()
    }
}

fn worker_main(core: Arc<PoolCore>, index: usize) {
    let event = Arc::new(WaitEvent::new());
    event.init();
    CURRENT_WORKER.with(|slot| {
        *slot.borrow_mut() = Some(Worker {
            pool: Arc::downgrade(&core),
            event: event.clone(),
            local: RefCell::new(VecDeque::new()),
        });
    });

    let span = tracing::trace_span!("worker", index);
    let _entered = span.enter();

    loop {
        while run_queued_task() {}

        if core.shutdown.load(Acquire) {
            break;
        }

        // Register before the final queue check, so an arrival after the
        // check still signals this worker.
        core.add_sleeper(&event);
        if run_queued_task() {
            continue;
        }
        if core.shutdown.load(Acquire) {
            break;
        }
        let _mask = event.wait();
        test_trace!(mask = _mask, "worker: woke");
    }
}

/// Pops and runs one task from the current worker's queues.
///
/// Returns `false` if this thread is not a pool worker or its queues are
/// empty. The task runs outside the thread-local borrow, so tasks are free
/// to submit more work.
fn run_queued_task() -> bool {
    let task = CURRENT_WORKER.with(|slot| slot.borrow().as_ref().and_then(Worker::pop_task));
    match task {
        Some(task) => {
            task.run();
            true
        }
        None => false,
    }
}

/// Waits for `task` cooperatively, if the calling thread is a pool worker.
///
/// Returns `false` (without blocking) on non-worker threads. On a worker,
/// loops running queued tasks while the waited-on task is unfinished,
/// parking on the worker's event when the queues are dry; the event is
/// signalled both by the task finishing and by new work arriving.
pub(crate) fn try_worker_wait(task: NonNull<Header>) -> bool {
    let event = match CURRENT_WORKER
        .with(|slot| slot.borrow().as_ref().map(|worker| worker.event.clone()))
    {
        Some(event) => event,
        None => return false,
    };

    wait::register_finish_signal(task, event.clone());
    loop {
        if unsafe { task.as_ref() }.ready() {
            return true;
        }
        if run_queued_task() {
            continue;
        }

        // Queues are dry: register as a sleeper so new work wakes us, then
        // re-check both the queues and the task before sleeping.
        CURRENT_WORKER.with(|slot| {
            if let Some(worker) = slot.borrow().as_ref() {
                if let Some(pool) = worker.pool.upgrade() {
                    pool.add_sleeper(&worker.event);
                }
            }
        });
        if run_queued_task() {
            continue;
        }
        if unsafe { task.as_ref() }.ready() {
            return true;
        }
        // The finish signal may have landed while we were running queued
        // work; consuming it here skips a sleep that would wake instantly.
        if event.try_wait(wait::TASK_FINISHED) {
            continue;
        }
        let _mask = event.wait();
        test_trace!(mask = _mask, "worker wait: woke");
    }
}

/// Returns the process-wide default pool, creating it on first use.
///
/// The pool is sized by the `ENOKI_THREADS` environment variable when set
/// to a positive number, and by the machine's available parallelism
/// otherwise. It lives for the rest of the process.
pub fn default_scheduler() -> &'static ThreadPool {
    static DEFAULT: OnceLock<ThreadPool> = OnceLock::new();
    DEFAULT.get_or_init(ThreadPool::new)
}

fn default_thread_count() -> usize {
    if let Some(n) = std::env::var("ENOKI_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
    {
        return n;
    }
    thread::available_parallelism().map(usize::from).unwrap_or(2)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::task::{spawn, EventTask};
    use crate::util::trace_init;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn inline_scheduler_runs_immediately() {
        let task = spawn(&InlineScheduler, || 2 + 2);
        assert!(task.ready());
        assert_eq!(task.get(), 4);
    }

    #[test]
    fn pool_runs_spawned_tasks() {
        let _trace = trace_init();
        let pool = ThreadPool::with_threads(2);
        let task = spawn(&pool, || String::from("hello"));
        assert_eq!(task.get(), "hello");
        pool.shutdown();
    }

    #[test]
    fn many_tasks_all_run() {
        let _trace = trace_init();
        const TASKS: usize = 100;
        let pool = ThreadPool::with_threads(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let counter = counter.clone();
                spawn(&pool, move || {
                    counter.fetch_add(1, SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.get();
        }

        assert_eq!(counter.load(SeqCst), TASKS);
        pool.shutdown();
    }

    #[test]
    fn external_thread_blocks_until_completion() {
        let _trace = trace_init();
        let event = EventTask::new();
        let task = event.task();

        let setter = {
            let event = event.clone();
            thread::spawn(move || {
                assert!(event.set(54));
            })
        };

        assert_eq!(task.get(), 54);
        setter.join().unwrap();
    }

    #[test]
    fn worker_can_join_work_spawned_from_a_task() {
        let _trace = trace_init();
        // One worker: joining only terminates if the blocked worker runs
        // its own queued work while it waits.
        let pool = ThreadPool::with_threads(1);
        let task = {
            let pool = pool.clone();
            spawn(&pool.clone(), move || {
                let inner = spawn(&pool, || 20);
                inner.get() + 1
            })
        };
        assert_eq!(task.get(), 21);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let _trace = trace_init();
        const TASKS: usize = 32;
        let pool = ThreadPool::with_threads(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let counter = counter.clone();
                spawn(&pool, move || {
                    counter.fetch_add(1, SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.get();
        }
        pool.shutdown();

        assert_eq!(counter.load(SeqCst), TASKS);
    }

    #[test]
    fn submit_after_shutdown_runs_inline() {
        let pool = ThreadPool::with_threads(1);
        pool.shutdown();

        let task = spawn(&pool, || 7);
        assert!(task.ready());
        assert_eq!(task.get(), 7);
    }

    #[test]
    fn default_scheduler_works() {
        let task = spawn(default_scheduler(), || 6 * 7);
        assert_eq!(task.get(), 42);
    }
}
