//! The type-erased task block.
//!
//! Every task, whatever its concrete shape, begins with a [`Header`]: the
//! state cell, the dispatch table, and the continuation stack. Concrete
//! blocks layer typed storage behind the header with `#[repr(C)]`, so a
//! handle that knows only the result type can still address the result slot
//! of a task whose scheduler and function types have been erased:
//!
//! - [`Core<T>`] is a header plus the storage [`Slot`]. On its own it is
//!   the shape of externally-completed tasks (event tasks, unwrap
//!   observers).
//! - [`FullTask<S, F, T>`] is a `Core<T>` plus the function cell. It is the
//!   shape of root tasks and continuations.
//!
//! The [`Slot`] is a union whose arms live at disjoint times, keyed by the
//! state machine: the parked scheduler while the task is pending, the
//! result once it completes, the fault once it cancels. The [`Vtable`] has
//! one static instance per monomorphization; its entries are the only code
//! that knows a block's true shape.

use super::stack::ContinuationStack;
use super::state::{Stage, State, StateCell};
use crate::fault::Fault;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{self, Ordering::*};
use crate::scheduler::Schedule;
use crate::util::non_null;
use core::any::type_name;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use core::ptr::NonNull;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A type-erased, reference-counted pointer to a task block.
///
/// This is the currency schedulers deal in: a [`Schedule`] implementation
/// receives a `TaskRef` for every submitted task and must eventually pass it
/// to [`run`](TaskRef::run). Cloning bumps the task's reference count;
/// dropping the last `TaskRef` destroys the block through its vtable.
pub struct TaskRef(NonNull<Header>);

/// The fields shared by every task block, independent of its concrete type.
#[repr(C)]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
pub(crate) struct Header {
    state: StateCell,
    vtable: &'static Vtable,
    continuations: ContinuationStack,
    /// Intrusive link used while this task sits in a parent's continuation
    /// stack.
    next: UnsafeCell<Option<NonNull<Header>>>,
}

/// A task's dispatch table.
///
/// One static table exists per concrete `(scheduler, function, result)`
/// shape; sharing a table per monomorphization keeps the per-task overhead
/// to a single pointer.
pub(crate) struct Vtable {
    /// Run the stored function, installing the result or fault.
    run: unsafe fn(NonNull<Header>),

    /// Cancel the task before it has run: destroy the function cell, store
    /// the fault, flush continuations.
    cancel: unsafe fn(NonNull<Header>, Fault),

    /// Hand a continuation to the scheduler parked in its own slot. The
    /// first argument is the parent whose completion is dispatching it.
    schedule: unsafe fn(NonNull<Header>, TaskRef),

    /// Drop the task block through its true concrete type.
    destroy: unsafe fn(NonNull<Header>),
}

/// Typed storage behind a [`Header`].
///
/// `#[repr(C)]` so that the slot sits at the same offset for every concrete
/// task with the same result type, whatever its scheduler and function
/// types.
#[repr(C)]
pub(crate) struct Core<T> {
    header: Header,
    slot: UnsafeCell<Slot<T>>,
}

/// A task block with a function cell: root tasks and continuations.
///
/// The function is stored by value; zero-sized closures take up no space,
/// which is the empty-function optimization the original gets from
/// empty-base-class tricks.
#[repr(C)]
pub(crate) struct FullTask<S, F, T> {
    core: Core<T>,
    func: UnsafeCell<ManuallyDrop<F>>,
    _sched: PhantomData<S>,
}

/// The storage union.
///
/// Exactly one arm is live at a time, determined by the state machine:
///
/// - `sched` while `HAS_SCHED` is set (pending, not yet dispatched);
/// - `result` iff the stage is `Completed` (and not yet consumed);
/// - `fault` iff the stage is `Canceled`;
/// - `empty` otherwise.
union Slot<T> {
    /// The type-erased scheduler; reclaimed by the monomorphized `schedule`
    /// entry (or the block's destructor, if the task is never dispatched).
    sched: *const (),
    result: ManuallyDrop<T>,
    fault: ManuallyDrop<Fault>,
    empty: (),
}

// === impl Header ===

impl Header {
    fn new(vtable: &'static Vtable, has_sched: bool) -> Self {
        Self {
            state: StateCell::new(has_sched),
            vtable,
            continuations: ContinuationStack::new(),
            next: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> &StateCell {
        &self.state
    }

    /// Non-blocking terminal test with acquire ordering.
    #[inline]
    pub(crate) fn ready(&self) -> bool {
        self.state.ready()
    }

    /// Registers `cont` to be dispatched when the task pointed to by
    /// `parent` reaches a terminal stage.
    ///
    /// If the continuation stack has already been flushed (or is flushed
    /// mid-registration), the continuation is dispatched here, by the
    /// registrant: either the completer or the registrant dispatches each
    /// continuation, and never both.
    ///
    /// # Safety
    ///
    /// `parent` must point to a live task block.
    pub(crate) unsafe fn add_continuation(parent: NonNull<Header>, cont: TaskRef) {
        let header = parent.as_ref();
        let stage = header.state.stage(Relaxed);
        let cont = if !stage.is_terminal() {
            match header.continuations.try_push(cont) {
                Ok(()) => return,
                Err(cont) => cont,
            }
        } else {
            cont
        };

        // The stack was flushed while (or before) we tried to push: the
        // task is terminal. Synchronize with the completer, then dispatch
        // the continuation ourselves.
        atomic::fence(Acquire);
        Self::dispatch(parent, cont);
    }

    /// Installs a terminal stage, then flushes the continuation stack.
    ///
    /// Every continuation registered before this call is handed to its own
    /// scheduler; registrations racing with the flush dispatch themselves
    /// (see [`add_continuation`](Self::add_continuation)).
    pub(crate) unsafe fn finish(this: NonNull<Header>, stage: Stage) {
        this.as_ref().state.finish(stage);
        for cont in this.as_ref().continuations.close() {
            Self::dispatch(this, cont);
        }
    }

    unsafe fn dispatch(parent: NonNull<Header>, cont: TaskRef) {
        test_trace!(parent = ?parent, cont = ?cont.0, "Header::dispatch");
        let schedule = cont.header().vtable.schedule;
        schedule(parent, cont)
    }

    /// Stores the intrusive continuation-stack link.
    ///
    /// # Safety
    ///
    /// Only the continuation stack may touch the link, and only while it
    /// owns the node.
    pub(crate) unsafe fn set_next(this: NonNull<Header>, next: Option<NonNull<Header>>) {
        this.as_ref().next.with_mut(|link| *link = next)
    }

    /// Takes the intrusive continuation-stack link.
    ///
    /// # Safety
    ///
    /// See [`set_next`](Self::set_next).
    pub(crate) unsafe fn take_next(this: NonNull<Header>) -> Option<NonNull<Header>> {
        this.as_ref().next.with_mut(|link| (*link).take())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// === impl TaskRef ===

impl TaskRef {
    /// Executes the task on the calling thread.
    ///
    /// A scheduler must call this exactly once for every `TaskRef` it
    /// accepts. Running a task that already reached a terminal stage (a
    /// continuation canceled after its dispatch failed) is a no-op.
    pub fn run(self) {
        if self.header().state().ready() {
            test_debug!(task = ?self.0, "TaskRef::run: already terminal");
            return;
        }
        let run = self.header().vtable.run;
        unsafe { run(self.0) }
    }

    /// Hands a freshly-spawned root task to the scheduler parked in its
    /// slot.
    pub(crate) fn dispatch(self) {
        let ptr = self.ptr();
        unsafe { Header::dispatch(ptr, self) }
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn ptr(&self) -> NonNull<Header> {
        self.0
    }

    /// Consumes this reference without releasing it, returning the raw
    /// pointer.
    pub(crate) fn into_ptr(self) -> NonNull<Header> {
        let ptr = self.0;
        mem::forget(self);
        ptr
    }

    /// Reconstructs a reference from [`into_ptr`](Self::into_ptr), taking
    /// back ownership of the reference count it carried.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `into_ptr`, exactly once.
    pub(crate) unsafe fn from_ptr(ptr: NonNull<Header>) -> Self {
        Self(ptr)
    }

    /// Returns a new reference to the task behind `ptr`, bumping the
    /// reference count.
    ///
    /// # Safety
    ///
    /// The caller must already hold a reference to the task.
    pub(crate) unsafe fn clone_raw(ptr: NonNull<Header>) -> Self {
        ptr.as_ref().state().clone_ref();
        Self(ptr)
    }
}

impl Clone for TaskRef {
    #[inline]
    fn clone(&self) -> Self {
        self.header().state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    fn drop(&mut self) {
        if !self.header().state().drop_ref() {
            return;
        }

        debug_assert_eq!(self.header().state().load(Relaxed).ref_count(), 0);
        let destroy = self.header().vtable.destroy;
        unsafe { destroy(self.0) }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("addr", &self.0)
            .field("header", self.header())
            .finish()
    }
}

/// A `TaskRef` may be sent and shared freely: the creation APIs bound every
/// captured function, result, and scheduler by `Send`, and access to the
/// typed storage is serialized by the state machine.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

// === impl Core ===

impl<T> Core<T> {
    const OBSERVER_VTABLE: Vtable = Vtable {
        run: Self::observer_run,
        cancel: Self::observer_cancel,
        schedule: Self::observer_schedule,
        destroy: Self::observer_destroy,
    };

    /// Allocates a task block with no function and no scheduler: the shape
    /// of tasks completed externally through [`try_complete`] /
    /// [`try_terminate`] or the unwrap transfer.
    ///
    /// The returned pointer carries one reference.
    ///
    /// [`try_complete`]: Self::try_complete
    /// [`try_terminate`]: Self::try_terminate
    pub(crate) fn allocate() -> NonNull<Core<T>> {
        let this = Box::new(Core::<T> {
            header: Header::new(&Self::OBSERVER_VTABLE, false),
            slot: UnsafeCell::new(Slot { empty: () }),
        });
        let ptr = unsafe { non_null(Box::into_raw(this)) };
        tracing::trace!(ptr = ?ptr, output = %type_name::<T>(), "Core::allocate");
        ptr
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub(crate) fn header_ptr(this: NonNull<Self>) -> NonNull<Header> {
        // `Core` is `#[repr(C)]` and the header is its first field.
        this.cast::<Header>()
    }

    /// Returns the typed core of a task allocated by
    /// [`FullTask::allocate`].
    pub(crate) fn core_ptr(task: &TaskRef) -> NonNull<Core<T>> {
        // Every concrete task block is `#[repr(C)]` with the core first.
        task.ptr().cast::<Core<T>>()
    }

    /// Installs the result and finishes the task.
    ///
    /// # Safety
    ///
    /// The caller must be the task's unique completer.
    pub(crate) unsafe fn complete(this: NonNull<Self>, value: T) {
        this.as_ref().write_result(value);
        Header::finish(Self::header_ptr(this), Stage::Completed);
    }

    /// Installs a fault and finishes the task.
    ///
    /// # Safety
    ///
    /// The caller must be the task's unique completer.
    pub(crate) unsafe fn terminate(this: NonNull<Self>, fault: Fault) {
        this.as_ref().write_fault(fault);
        Header::finish(Self::header_ptr(this), Stage::Canceled);
    }

    /// Completes the task if no other completer got there first.
    ///
    /// Reserves the terminal transition by CAS-ing `Pending` to `Locked`
    /// before touching the slot, so racing completers cannot double-store.
    /// Returns `false` (dropping `value`) if the race was lost.
    ///
    /// # Safety
    ///
    /// `this` must point to a live block of this concrete type.
    pub(crate) unsafe fn try_complete(this: NonNull<Self>, value: T) -> bool {
        if !this.as_ref().header.state().try_lock() {
            return false;
        }
        this.as_ref().write_result(value);
        Header::finish(Self::header_ptr(this), Stage::Completed);
        true
    }

    /// Cancels the task if no other completer got there first.
    ///
    /// See [`try_complete`](Self::try_complete).
    pub(crate) unsafe fn try_terminate(this: NonNull<Self>, fault: Fault) -> bool {
        if !this.as_ref().header.state().try_lock() {
            return false;
        }
        this.as_ref().write_fault(fault);
        Header::finish(Self::header_ptr(this), Stage::Canceled);
        true
    }

    /// Marks the task as observing an inner task's outcome.
    ///
    /// # Safety
    ///
    /// `this` must point to a live block; the task must be pending.
    pub(crate) unsafe fn set_unwrapped(this: NonNull<Self>) {
        this.as_ref().header.state().set_unwrapped();
    }

    /// Moves the result out of the slot.
    ///
    /// # Safety
    ///
    /// The caller must have observed the `Completed` stage with acquire
    /// ordering, and must be the single consumer.
    pub(crate) unsafe fn take_result(&self) -> T {
        self.header.state().consume_result();
        self.slot
            .with_mut(|slot| ManuallyDrop::take(&mut (*slot).result))
    }

    /// Borrows the result in the slot.
    ///
    /// # Safety
    ///
    /// The caller must have observed the `Completed` stage with acquire
    /// ordering, and the result must never be consumed by value.
    pub(crate) unsafe fn result_ref(&self) -> &T {
        self.slot.with(|slot| &*(*slot).result)
    }

    /// Clones the fault in the slot.
    ///
    /// # Safety
    ///
    /// The caller must have observed the `Canceled` stage with acquire
    /// ordering.
    pub(crate) unsafe fn clone_fault(&self) -> Fault {
        self.slot.with(|slot| Fault::clone(&(*slot).fault))
    }

    unsafe fn write_result(&self, value: T) {
        self.slot
            .with_mut(|slot| (*slot).result = ManuallyDrop::new(value));
    }

    unsafe fn write_fault(&self, fault: Fault) {
        self.slot
            .with_mut(|slot| (*slot).fault = ManuallyDrop::new(fault));
    }

    unsafe fn observer_run(_: NonNull<Header>) {
        unreachable!("observer tasks are completed externally, never scheduled!")
    }

    unsafe fn observer_cancel(_: NonNull<Header>, _: Fault) {
        unreachable!("observer tasks are completed externally, never canceled in place!")
    }

    unsafe fn observer_schedule(_: NonNull<Header>, _: TaskRef) {
        unreachable!("observer tasks carry no scheduler!")
    }

    unsafe fn observer_destroy(ptr: NonNull<Header>) {
        tracing::trace!(ptr = ?ptr, output = %type_name::<T>(), "Core::observer_destroy");
        drop(Box::from_raw(ptr.cast::<Core<T>>().as_ptr()))
    }
}

impl<T> Drop for Core<T> {
    fn drop(&mut self) {
        // Relaxed suffices: the acquire fence that zeroed the reference
        // count ordered all prior writes before this destructor.
        let state = self.header.state.load(Relaxed);
        match state.stage() {
            Stage::Completed if !state.get(State::CONSUMED) => unsafe {
                self.slot
                    .with_mut(|slot| ManuallyDrop::drop(&mut (*slot).result))
            },
            Stage::Canceled => unsafe {
                self.slot
                    .with_mut(|slot| ManuallyDrop::drop(&mut (*slot).fault))
            },
            _ => {}
        }
    }
}

// === impl FullTask ===

impl<S, F, T> FullTask<S, F, T>
where
    S: Schedule,
    F: FnOnce() -> Result<T, Fault> + Send + 'static,
    T: Send + 'static,
{
    const VTABLE: Vtable = Vtable {
        run: Self::run,
        cancel: Self::cancel,
        schedule: Self::schedule,
        destroy: Self::destroy,
    };

    /// Allocates a task block holding `func`, with `sched` parked in the
    /// slot for dispatch.
    ///
    /// The returned reference is the only one; callers clone it for handles
    /// before enqueueing.
    pub(crate) fn allocate(sched: S, func: F) -> TaskRef {
        let this = Box::new(Self {
            core: Core {
                header: Header::new(&Self::VTABLE, true),
                slot: UnsafeCell::new(Slot {
                    sched: Box::into_raw(Box::new(sched)) as *const (),
                }),
            },
            func: UnsafeCell::new(ManuallyDrop::new(func)),
            _sched: PhantomData,
        });
        let ptr = unsafe { non_null(Box::into_raw(this)) };
        tracing::trace!(
            ptr = ?ptr,
            output = %type_name::<T>(),
            sched = %type_name::<S>(),
            "FullTask::allocate",
        );
        TaskRef(ptr.cast::<Header>())
    }

    unsafe fn run(ptr: NonNull<Header>) {
        test_trace!(ptr = ?ptr, output = %type_name::<T>(), "FullTask::run");
        let this = ptr.cast::<Self>();
        debug_assert_eq!(this.as_ref().core.header.state().stage(Relaxed), Stage::Pending);

        // Take the function out of its cell; unwinding consumes it either
        // way, so the cell is dead from here on.
        let func = this
            .as_ref()
            .func
            .with_mut(|func| ManuallyDrop::take(&mut *func));

        match catch_unwind(AssertUnwindSafe(func)) {
            Ok(Ok(value)) => {
                this.as_ref().core.write_result(value);
                Header::finish(ptr, Stage::Completed);
            }
            Ok(Err(fault)) => {
                this.as_ref().core.write_fault(fault);
                Header::finish(ptr, Stage::Canceled);
            }
            Err(payload) => {
                let fault = Fault::from_panic(payload);
                this.as_ref().core.write_fault(fault);
                Header::finish(ptr, Stage::Canceled);
            }
        }
    }

    unsafe fn cancel(ptr: NonNull<Header>, fault: Fault) {
        test_trace!(ptr = ?ptr, fault = %fault, "FullTask::cancel");
        let this = ptr.cast::<Self>();
        debug_assert!(!this.as_ref().core.header.state().stage(Relaxed).is_terminal());

        // The function will never run; destroy the cell now.
        this.as_ref()
            .func
            .with_mut(|func| ManuallyDrop::drop(&mut *func));
        this.as_ref().core.write_fault(fault);
        Header::finish(ptr, Stage::Canceled);
    }

    unsafe fn schedule(parent: NonNull<Header>, cont: TaskRef) {
        test_trace!(parent = ?parent, cont = ?cont.0, "FullTask::schedule");
        let this = cont.ptr().cast::<Self>();

        // Take the scheduler parked in the slot; the slot is dead until
        // the run installs a result or fault.
        let sched = {
            let raw = this.as_ref().core.slot.with(|slot| (*slot).sched);
            this.as_ref().core.header.state().take_sched();
            *Box::from_raw(raw as *mut S)
        };

        let backup = cont.clone();
        match catch_unwind(AssertUnwindSafe(move || sched.schedule(cont))) {
            Ok(()) => drop(backup),
            Err(payload) => {
                // The scheduler refused the continuation; cancel it in
                // place with the dispatch failure. A scheduler that ran the
                // task before panicking already terminalized it.
                let fault = Fault::from_panic(payload);
                if !backup.header().state().ready() {
                    Self::cancel(backup.ptr(), fault);
                }
                drop(backup);
            }
        }
    }

    unsafe fn destroy(ptr: NonNull<Header>) {
        tracing::trace!(ptr = ?ptr, output = %type_name::<T>(), "FullTask::destroy");
        drop(Box::from_raw(ptr.cast::<Self>().as_ptr()))
    }
}

impl<S, F, T> Drop for FullTask<S, F, T> {
    fn drop(&mut self) {
        let state = self.core.header.state().load(Relaxed);

        // Reclaim a scheduler that was never taken by dispatch.
        if state.get(State::HAS_SCHED) {
            unsafe {
                let raw = self.core.slot.with(|slot| (*slot).sched);
                drop(Box::from_raw(raw as *mut S));
            }
        }

        // The function cell is still live if the task never started
        // running and was never canceled.
        if matches!(state.stage(), Stage::Pending | Stage::Locked) {
            unsafe {
                self.func.with_mut(|func| ManuallyDrop::drop(&mut *func));
            }
        }
    }
}

#[cfg(test)]
fn observer_task() -> TaskRef {
    unsafe { TaskRef::from_ptr(Core::<()>::header_ptr(Core::<()>::allocate())) }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::thread;
    use std::sync::Arc;

    #[test]
    fn stack_yields_everything_pushed_before_the_close() {
        let stack = ContinuationStack::new();
        for _ in 0..3 {
            assert!(stack.try_push(observer_task()).is_ok());
        }

        assert_eq!(stack.close().count(), 3);

        // the transition is one-way: nothing more gets in
        assert_eq!(stack.close().count(), 0);
        assert!(stack.try_push(observer_task()).is_err());
    }

    #[test]
    fn racing_pushers_and_closer_account_for_every_task() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 100;

        let stack = Arc::new(ContinuationStack::new());
        let handles: Vec<_> = (0..PUSHERS)
            .map(|_| {
                let stack = stack.clone();
                thread::spawn(move || {
                    let mut rejected = 0;
                    for _ in 0..PER_PUSHER {
                        if stack.try_push(observer_task()).is_err() {
                            rejected += 1;
                        }
                    }
                    rejected
                })
            })
            .collect();

        thread::yield_now();
        let drained = stack.close().count();
        let rejected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(
            drained + rejected,
            PUSHERS * PER_PUSHER,
            "every push either lands before the close or is handed back",
        );
    }

    #[test]
    fn completed_result_is_dropped_with_the_block() {
        let tracker = Arc::new(());
        let core = Core::<Arc<()>>::allocate();
        let task = unsafe { TaskRef::from_ptr(Core::header_ptr(core)) };

        unsafe { Core::complete(core, tracker.clone()) };
        assert_eq!(Arc::strong_count(&tracker), 2);

        drop(task);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn consumed_result_is_not_dropped_again() {
        let tracker = Arc::new(());
        let core = Core::<Arc<()>>::allocate();
        let task = unsafe { TaskRef::from_ptr(Core::header_ptr(core)) };

        unsafe { Core::complete(core, tracker.clone()) };
        let taken = unsafe { core.as_ref().take_result() };
        assert_eq!(Arc::strong_count(&tracker), 2);

        drop(task);
        assert_eq!(Arc::strong_count(&tracker), 2, "the block must not drop a moved-out result");
        drop(taken);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn fault_is_dropped_with_the_block() {
        let fault = crate::fault::Fault::new("tracked");
        let core = Core::<()>::allocate();
        let task = unsafe { TaskRef::from_ptr(Core::header_ptr(core)) };

        unsafe { Core::terminate(core, fault.clone()) };
        let peeked = unsafe { core.as_ref().clone_fault() };
        assert!(peeked.ptr_eq(&fault));

        drop(peeked);
        drop(task);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, thread};
    use std::sync::Arc;

    #[test]
    fn push_races_close() {
        loom::model(|| {
            let stack = Arc::new(ContinuationStack::new());

            let pusher = {
                let stack = stack.clone();
                thread::spawn(move || stack.try_push(super::observer_task()).is_ok())
            };

            let drained = stack.close().count();
            let pushed = pusher.join().unwrap();

            if pushed {
                assert_eq!(drained, 1, "a successful push must be drained by the close");
            } else {
                assert_eq!(drained, 0);
            }
        })
    }

    #[test]
    fn registration_races_completion() {
        use crate::scheduler::InlineScheduler;
        use crate::task::EventTask;

        loom::model(|| {
            let event = EventTask::<i32>::new();
            let shared = event.task().share();

            let registrant = {
                let shared = shared.clone();
                thread::spawn(move || shared.then(&InlineScheduler, |n| n + 1))
            };

            assert!(event.set(1));
            let cont = registrant.join().unwrap();

            // Whether the completer flushed it or the registrant dispatched
            // it inline, the continuation has run by now.
            assert!(cont.ready());
            assert_eq!(cont.get(), 2);
        })
    }
}
