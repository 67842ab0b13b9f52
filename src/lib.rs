//! A continuation-chaining task library for OS threads.
//!
//! `enoki` runs closures as *tasks* on a scheduler, and lets further
//! computation be chained onto their results without blocking:
//!
//! ```
//! use enoki::scheduler::ThreadPool;
//!
//! let pool = ThreadPool::with_threads(4);
//! let task = enoki::spawn(&pool, || 42).then(&pool, |n| n * 2);
//! assert_eq!(task.get(), 84);
//! ```
//!
//! A task travels through a small lock-light state machine (`pending` →
//! `completed` or `canceled`, with short-lived intermediate stages for
//! external completion and unwrapping). Continuations registered before the
//! task finishes are dispatched by the completer; registrations that race
//! the completion are dispatched by the registrant. Either way, each
//! continuation runs exactly once, on its own scheduler.
//!
//! Panics don't cross the library: a panicking task is *canceled*, the
//! payload is parked in the task as a [`Fault`], and it resurfaces when the
//! result is asked for, at [`get`](task::Task::get) or in whatever
//! continuation the cancellation propagates to.
//!
//! Blocking on a task from a [`ThreadPool`](scheduler::ThreadPool) worker
//! keeps the pool busy: the blocked worker executes queued tasks while it
//! waits, which is what makes the fork/join recursion in
//! [`parallel_for`](parallel::parallel_for) safe on a pool of any size.

#[macro_use]
mod trace;

pub(crate) mod loom;
pub(crate) mod util;
pub(crate) mod wait;

pub mod combine;
pub mod fault;
pub mod parallel;
pub mod scheduler;
pub mod task;

pub use self::combine::{when_all, when_any};
pub use self::fault::Fault;
pub use self::parallel::{parallel_for, parallel_invoke, parallel_reduce};
pub use self::scheduler::{default_scheduler, InlineScheduler, Schedule, ThreadPool};
pub use self::task::{local_spawn, ready_task, spawn, EventTask, SharedTask, Task, TaskRef};
