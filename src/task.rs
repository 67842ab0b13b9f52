//! Tasks and continuation chaining.
//!
//! A [`Task`] is a handle to a unit of deferred computation: it will
//! eventually hold either a result or a [`Fault`]. Handles come in three
//! flavors:
//!
//! - [`Task`], the single-consumer handle: [`get`](Task::get) moves the
//!   result out, continuations registered with [`then`](Task::then) consume
//!   the parent's value.
//! - [`SharedTask`], the shared-consumer handle: cloneable, delivers the
//!   result by reference to any number of observers.
//! - [`EventTask`], a task completed externally by [`set`](EventTask::set)
//!   or [`cancel`](EventTask::cancel) rather than by running a function.
//!
//! A task whose function produces *another* task can be collapsed with
//! [`flatten`](Task::flatten), which makes the outer task a transparent
//! observer of the inner one's outcome.

use crate::fault::Fault;
use crate::loom::sync::atomic::Ordering::Acquire;
use crate::scheduler::{InlineScheduler, Schedule};
use crate::wait;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use std::panic::{catch_unwind, AssertUnwindSafe};

pub(crate) mod raw;
mod stack;
mod state;

pub use self::raw::TaskRef;

use self::raw::{Core, FullTask, Header};
use self::state::Stage;

macro_rules! fmt_handle {
    ($name:literal) => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct($name)
                .field("addr", &self.core)
                .field("header", unsafe { self.core.as_ref() }.header())
                .finish()
        }
    };
}

/// A single-consumer handle to a task producing a `T`.
///
/// Dropping a `Task` detaches it: the computation still runs, but its
/// result is discarded when the task is destroyed.
pub struct Task<T> {
    core: NonNull<Core<T>>,
    _t: PhantomData<fn() -> T>,
}

/// A shared-consumer handle to a task producing a `T`.
///
/// Cloning is cheap (a reference-count bump). Every observer sees the same
/// stored result, by reference, and a canceled task delivers the same
/// [`Fault`] identity to each of them.
pub struct SharedTask<T> {
    core: NonNull<Core<T>>,
    _t: PhantomData<fn() -> T>,
}

/// A task completed from outside rather than by running a function.
///
/// `EventTask` is the producer side: clone it into whatever context will
/// eventually call [`set`](Self::set) or [`cancel`](Self::cancel). The
/// consumer side is the [`Task`] vended, at most once, by
/// [`task`](Self::task).
pub struct EventTask<T> {
    core: NonNull<Core<T>>,
    _t: PhantomData<fn() -> T>,
}

/// Spawns `func` on `scheduler`, returning the handle to its result.
pub fn spawn<S, F, T>(scheduler: &S, func: F) -> Task<T>
where
    S: Schedule,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let raw = FullTask::<S, _, T>::allocate(scheduler.clone(), move || Ok(func()));
    let core = Core::<T>::core_ptr(&raw);
    let handle = unsafe { Task::from_core_clone(core) };
    raw.dispatch();
    handle
}

/// Spawns `func` for intra-task fork/join.
///
/// Semantically identical to [`spawn`]; schedulers that maintain per-worker
/// queues (such as [`ThreadPool`](crate::scheduler::ThreadPool)) place work
/// submitted from one of their own workers on that worker's local queue, so
/// a spawn-then-[`get`](Task::get) pair stays on the submitting worker when
/// possible.
pub fn local_spawn<S, F, T>(scheduler: &S, func: F) -> Task<T>
where
    S: Schedule,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn(scheduler, func)
}

/// Returns a task that is already completed with `value`.
pub fn ready_task<T: Send + 'static>(value: T) -> Task<T> {
    let core = Core::allocate();
    unsafe {
        Core::complete(core, value);
        Task::from_core(core)
    }
}

// === impl Task ===

impl<T> Task<T> {
    /// Wraps a core pointer, taking over the reference it carries.
    pub(crate) unsafe fn from_core(core: NonNull<Core<T>>) -> Self {
        Self {
            core,
            _t: PhantomData,
        }
    }

    /// Wraps a core pointer, bumping the reference count.
    pub(crate) unsafe fn from_core_clone(core: NonNull<Core<T>>) -> Self {
        core.as_ref().header().state().clone_ref();
        Self {
            core,
            _t: PhantomData,
        }
    }

    fn header_ptr(&self) -> NonNull<Header> {
        Core::header_ptr(self.core)
    }

    /// Returns `true` if the task has reached a terminal stage.
    ///
    /// Observing `true` synchronizes-with the completion, so a `ready()`
    /// task's result can be taken without blocking.
    #[must_use]
    pub fn ready(&self) -> bool {
        unsafe { self.core.as_ref() }.header().ready()
    }

    #[cfg(test)]
    pub(crate) fn stage(&self) -> Stage {
        use crate::loom::sync::atomic::Ordering::Relaxed;
        unsafe { self.core.as_ref() }.header().state().stage(Relaxed)
    }
}

impl<T: Send + 'static> Task<T> {
    /// Waits for the task to finish and returns its result.
    ///
    /// If the task was canceled, rethrows the stored [`Fault`]: the calling
    /// thread unwinds with the original panic payload (or the fault itself,
    /// for an observer that arrives after the payload was taken).
    ///
    /// A thread blocked here on a [`ThreadPool`] worker executes other
    /// tasks from its queues while it waits, so fork/join recursion cannot
    /// starve the pool.
    ///
    /// [`ThreadPool`]: crate::scheduler::ThreadPool
    pub fn get(self) -> T {
        wait::wait_for(self.header_ptr());
        match self.take_outcome() {
            Ok(value) => value,
            Err(fault) => fault.rethrow(),
        }
    }

    /// Reads a terminal task's outcome, moving the result out.
    ///
    /// Only meaningful once the task is [`ready`](Self::ready):
    /// continuations and waiters call this after observing a terminal
    /// stage.
    pub(crate) fn take_outcome(self) -> Result<T, Fault> {
        let core = unsafe { self.core.as_ref() };
        match core.header().state().stage(Acquire) {
            Stage::Completed => Ok(unsafe { core.take_result() }),
            Stage::Canceled => Err(unsafe { core.clone_fault() }),
            stage => unreachable!("outcome read before the task finished (stage {stage:?})"),
        }
    }

    /// Registers a continuation on this task's value.
    ///
    /// When this task completes, `func` runs on `scheduler` with the result
    /// moved into it. If this task is canceled instead, `func` is never
    /// invoked: the returned task is canceled with a clone of the parent's
    /// fault.
    ///
    /// Void parents are ordinary `Task<()>`s; the continuation takes `()`.
    pub fn then<S, F, R>(self, scheduler: &S, func: F) -> Task<R>
    where
        S: Schedule,
        F: FnOnce(T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let parent_header = self.header_ptr();
        let parent = self;
        let exec = move || parent.take_outcome().map(func);
        let cont = FullTask::<S, _, R>::allocate(scheduler.clone(), exec);
        let handle = unsafe { Task::from_core_clone(Core::<R>::core_ptr(&cont)) };
        unsafe { Header::add_continuation(parent_header, cont) };
        handle
    }

    /// Registers a continuation on this task's *handle*.
    ///
    /// Unlike [`then`](Self::then), `func` runs whether the parent
    /// completed or was canceled; it receives the (by then terminal) parent
    /// handle and may inspect it, call [`get`](Self::get) to rethrow, or
    /// substitute a fallback value.
    pub fn then_task<S, F, R>(self, scheduler: &S, func: F) -> Task<R>
    where
        S: Schedule,
        F: FnOnce(Task<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let parent_header = self.header_ptr();
        let parent = self;
        let exec = move || Ok(func(parent));
        let cont = FullTask::<S, _, R>::allocate(scheduler.clone(), exec);
        let handle = unsafe { Task::from_core_clone(Core::<R>::core_ptr(&cont)) };
        unsafe { Header::add_continuation(parent_header, cont) };
        handle
    }

    /// Converts this task into a shared-consumer handle.
    #[must_use]
    pub fn share(self) -> SharedTask<T> {
        let core = self.core;
        mem::forget(self);
        SharedTask {
            core,
            _t: PhantomData,
        }
    }
}

impl<U: Send + 'static> Task<Task<U>> {
    /// Collapses a task returning a task into a single task observing the
    /// inner outcome.
    ///
    /// The returned task's result equals the inner task's; its fault is
    /// whichever of the outer's cancellation or the inner's cancellation
    /// actually fired, in that order of precedence. While the inner task is
    /// in flight, the returned task reports the `Unwrapped` stage.
    ///
    /// The result transfer runs on the [`InlineScheduler`], synchronously
    /// with whichever thread completes the inner task.
    pub fn flatten(self) -> Task<U> {
        let observer = Core::<U>::allocate();
        let handle = unsafe { Task::from_core(observer) };
        let transfer = unsafe { ObserverRef::new(observer) };

        let outer_header = self.header_ptr();
        let outer = self;
        let exec = move || {
            match outer.take_outcome() {
                Err(fault) => transfer.terminate(fault),
                Ok(inner) => {
                    transfer.set_unwrapped();

                    let inner_header = inner.header_ptr();
                    let inner_task = inner;
                    let exec = move || {
                        match inner_task.take_outcome() {
                            Ok(value) => transfer.complete(value),
                            Err(fault) => transfer.terminate(fault),
                        }
                        Ok(())
                    };
                    let cont =
                        FullTask::<InlineScheduler, _, ()>::allocate(InlineScheduler, exec);
                    unsafe { Header::add_continuation(inner_header, cont) };
                }
            }
            Ok(())
        };
        let cont = FullTask::<InlineScheduler, _, ()>::allocate(InlineScheduler, exec);
        unsafe { Header::add_continuation(outer_header, cont) };
        handle
    }
}

impl<U: Clone + Send + Sync + 'static> Task<SharedTask<U>> {
    /// Collapses a task returning a shared task; the returned task receives
    /// a clone of the shared result.
    ///
    /// If the clone itself panics, the returned task is canceled with that
    /// panic. See [`Task::flatten`].
    pub fn flatten(self) -> Task<U> {
        let observer = Core::<U>::allocate();
        let handle = unsafe { Task::from_core(observer) };
        let transfer = unsafe { ObserverRef::new(observer) };

        let outer_header = self.header_ptr();
        let outer = self;
        let exec = move || {
            match outer.take_outcome() {
                Err(fault) => transfer.terminate(fault),
                Ok(inner) => {
                    transfer.set_unwrapped();

                    let inner_header = inner.header_ptr();
                    let inner_task = inner;
                    let exec = move || {
                        // Cloning the shared result runs user code; a
                        // panicking `Clone` cancels the observer, not the
                        // transfer continuation.
                        match catch_unwind(AssertUnwindSafe(|| inner_task.peek_outcome())) {
                            Ok(Ok(value)) => transfer.complete(value),
                            Ok(Err(fault)) => transfer.terminate(fault),
                            Err(payload) => transfer.terminate(Fault::from_panic(payload)),
                        }
                        Ok(())
                    };
                    let cont =
                        FullTask::<InlineScheduler, _, ()>::allocate(InlineScheduler, exec);
                    unsafe { Header::add_continuation(inner_header, cont) };
                }
            }
            Ok(())
        };
        let cont = FullTask::<InlineScheduler, _, ()>::allocate(InlineScheduler, exec);
        unsafe { Header::add_continuation(outer_header, cont) };
        handle
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        unsafe { drop(TaskRef::from_ptr(Core::header_ptr(self.core))) }
    }
}

impl<T> fmt::Debug for Task<T> {
    fmt_handle!("Task");
}

unsafe impl<T: Send> Send for Task<T> {}
unsafe impl<T: Send> Sync for Task<T> {}

// === impl SharedTask ===

impl<T> SharedTask<T> {
    fn header_ptr(&self) -> NonNull<Header> {
        Core::header_ptr(self.core)
    }

    /// Returns `true` if the task has reached a terminal stage.
    #[must_use]
    pub fn ready(&self) -> bool {
        unsafe { self.core.as_ref() }.header().ready()
    }
}

impl<T: Send + Sync + 'static> SharedTask<T> {
    /// Waits for the task to finish and borrows its result.
    ///
    /// Every observer sees the same stored value. If the task was canceled,
    /// rethrows the stored [`Fault`]; all observers unwind with the same
    /// fault identity.
    pub fn get(&self) -> &T {
        wait::wait_for(self.header_ptr());
        let core = unsafe { self.core.as_ref() };
        match core.header().state().stage(Acquire) {
            Stage::Completed => unsafe { core.result_ref() },
            Stage::Canceled => unsafe { core.clone_fault() }.rethrow(),
            stage => unreachable!("wait returned before the task finished (stage {stage:?})"),
        }
    }

    /// Reads a terminal task's outcome, cloning the shared result.
    ///
    /// See [`Task::take_outcome`].
    pub(crate) fn peek_outcome(&self) -> Result<T, Fault>
    where
        T: Clone,
    {
        let core = unsafe { self.core.as_ref() };
        match core.header().state().stage(Acquire) {
            Stage::Completed => Ok(unsafe { core.result_ref() }.clone()),
            Stage::Canceled => Err(unsafe { core.clone_fault() }),
            stage => unreachable!("outcome read before the task finished (stage {stage:?})"),
        }
    }

    /// Registers a continuation on a clone of this task's value.
    ///
    /// Shared parents deliver by reference, so the continuation's input is
    /// cloned out of the stored result. Cancellation propagates exactly as
    /// in [`Task::then`].
    pub fn then<S, F, R>(&self, scheduler: &S, func: F) -> Task<R>
    where
        T: Clone,
        S: Schedule,
        F: FnOnce(T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let parent = self.clone();
        let exec = move || parent.peek_outcome().map(func);
        let cont = FullTask::<S, _, R>::allocate(scheduler.clone(), exec);
        let handle = unsafe { Task::from_core_clone(Core::<R>::core_ptr(&cont)) };
        unsafe { Header::add_continuation(self.header_ptr(), cont) };
        handle
    }

    /// Registers a continuation on this task's handle; runs whether the
    /// parent completed or was canceled.
    ///
    /// See [`Task::then_task`].
    pub fn then_task<S, F, R>(&self, scheduler: &S, func: F) -> Task<R>
    where
        S: Schedule,
        F: FnOnce(SharedTask<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let parent = self.clone();
        let exec = move || Ok(func(parent));
        let cont = FullTask::<S, _, R>::allocate(scheduler.clone(), exec);
        let handle = unsafe { Task::from_core_clone(Core::<R>::core_ptr(&cont)) };
        unsafe { Header::add_continuation(self.header_ptr(), cont) };
        handle
    }
}

impl<T> Clone for SharedTask<T> {
    fn clone(&self) -> Self {
        unsafe { self.core.as_ref() }.header().state().clone_ref();
        Self {
            core: self.core,
            _t: PhantomData,
        }
    }
}

impl<T> Drop for SharedTask<T> {
    fn drop(&mut self) {
        unsafe { drop(TaskRef::from_ptr(Core::header_ptr(self.core))) }
    }
}

impl<T> fmt::Debug for SharedTask<T> {
    fmt_handle!("SharedTask");
}

unsafe impl<T: Send + Sync> Send for SharedTask<T> {}
unsafe impl<T: Send + Sync> Sync for SharedTask<T> {}

// === impl EventTask ===

impl<T: Send + 'static> EventTask<T> {
    /// Returns a new externally-completable task.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Core::allocate(),
            _t: PhantomData,
        }
    }

    /// Vends the consumer handle for this task.
    ///
    /// # Panics
    ///
    /// The handle exists at most once; a second call panics.
    #[must_use]
    pub fn task(&self) -> Task<T> {
        let header = unsafe { self.core.as_ref() }.header();
        assert!(
            header.state().claim_handle(),
            "an `EventTask`'s consumer handle can only be claimed once",
        );
        unsafe { Task::from_core_clone(self.core) }
    }

    /// Completes the task with `value`.
    ///
    /// Returns `false` (dropping `value`) if the task already has an
    /// outcome; racing completers are serialized by a locked reservation of
    /// the terminal transition, so exactly one wins.
    pub fn set(&self, value: T) -> bool {
        unsafe { Core::try_complete(self.core, value) }
    }

    /// Cancels the task with `fault`.
    ///
    /// Returns `false` if the task already has an outcome.
    pub fn cancel(&self, fault: Fault) -> bool {
        unsafe { Core::try_terminate(self.core, fault) }
    }
}

impl<T: Send + 'static> Default for EventTask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventTask<T> {
    fn clone(&self) -> Self {
        unsafe { self.core.as_ref() }.header().state().clone_ref();
        Self {
            core: self.core,
            _t: PhantomData,
        }
    }
}

impl<T> Drop for EventTask<T> {
    fn drop(&mut self) {
        unsafe { drop(TaskRef::from_ptr(Core::header_ptr(self.core))) }
    }
}

impl<T> fmt::Debug for EventTask<T> {
    fmt_handle!("EventTask");
}

unsafe impl<T: Send> Send for EventTask<T> {}
unsafe impl<T: Send> Sync for EventTask<T> {}

// === impl ObserverRef ===

/// An owned reference to an observer core, used by the unwrap transfer and
/// the joining combinators to complete the observer from whichever thread
/// finishes an input task.
pub(crate) struct ObserverRef<T> {
    raw: TaskRef,
    core: NonNull<Core<T>>,
}

impl<T> ObserverRef<T> {
    /// # Safety
    ///
    /// The caller must hold a reference to the observer.
    pub(crate) unsafe fn new(core: NonNull<Core<T>>) -> Self {
        Self {
            raw: TaskRef::clone_raw(Core::header_ptr(core)),
            core,
        }
    }

    fn set_unwrapped(&self) {
        unsafe { Core::set_unwrapped(self.core) }
    }

    /// Completes the observer; the caller must be its unique completer.
    fn complete(self, value: T) {
        unsafe { Core::complete(self.core, value) }
        // dropping `self.raw` here releases the transfer's reference,
        // breaking the observer → inner-continuation → observer cycle
    }

    /// Cancels the observer; the caller must be its unique completer.
    fn terminate(self, fault: Fault) {
        unsafe { Core::terminate(self.core, fault) }
    }

    /// Completes the observer unless another completer won the race.
    pub(crate) fn try_complete(&self, value: T) -> bool {
        unsafe { Core::try_complete(self.core, value) }
    }

    /// Cancels the observer unless another completer won the race.
    pub(crate) fn try_terminate(&self, fault: Fault) -> bool {
        unsafe { Core::try_terminate(self.core, fault) }
    }
}

impl<T> Clone for ObserverRef<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            core: self.core,
        }
    }
}

unsafe impl<T: Send> Send for ObserverRef<T> {}
