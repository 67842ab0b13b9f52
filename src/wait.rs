//! Blocking on a task from another thread.
//!
//! The [`WaitEvent`] is the OS-level primitive: a lazily-initialized
//! mutex/condvar pair guarding a bitmask of events. A thread waiting on a
//! task registers an inline continuation that signals its event when the
//! task finishes, then sleeps on the event.
//!
//! Threads that belong to a [`ThreadPool`] do not just sleep: the pool
//! signals [`TASK_AVAILABLE`] on their events when new work arrives, and
//! the cooperative wait loop in [`scheduler`](crate::scheduler) drains the
//! pool's queues between sleeps. That is what lets a worker block on a task
//! scheduled on its own pool without deadlocking the pool.
//!
//! [`ThreadPool`]: crate::scheduler::ThreadPool

use crate::loom::blocking::{Condvar, Mutex};
use crate::scheduler::{self, InlineScheduler};
use crate::task::raw::{FullTask, Header};
use core::mem;
use core::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// The task being waited on reached a terminal stage.
pub(crate) const TASK_FINISHED: u32 = 0b01;

/// The waiter's scheduler has more work for this thread.
pub(crate) const TASK_AVAILABLE: u32 = 0b10;

/// An event a blocked thread sleeps on, holding a bitmask of the reasons it
/// was woken.
///
/// The mutex and condvar are constructed on first use; an event that is
/// never waited on never touches the OS.
pub(crate) struct WaitEvent {
    inner: OnceLock<Inner>,
}

struct Inner {
    mask: Mutex<u32>,
    cond: Condvar,
}

// === impl WaitEvent ===

impl WaitEvent {
    pub(crate) const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Constructs the underlying primitives. Idempotent; also performed by
    /// the first operation that needs them.
    pub(crate) fn init(&self) {
        let _ = self.inner();
    }

    /// Blocks until at least one event bit is set, then returns and clears
    /// the whole mask.
    pub(crate) fn wait(&self) -> u32 {
        let inner = self.inner();
        let mut mask = inner.mask.lock();
        while *mask == 0 {
            mask = inner.cond.wait(mask);
        }
        mem::replace(&mut *mask, 0)
    }

    /// Non-blocking test-and-clear of the given bits.
    pub(crate) fn try_wait(&self, bits: u32) -> bool {
        let inner = self.inner();
        let mut mask = inner.mask.lock();
        let hit = *mask & bits;
        *mask &= !bits;
        hit != 0
    }

    /// ORs `bits` into the mask and wakes one waiter.
    ///
    /// The notification happens while the lock is still held: a waiter that
    /// wakes up on its own and returns could otherwise free the event
    /// before the signaller touches the condvar.
    pub(crate) fn signal(&self, bits: u32) {
        let inner = self.inner();
        let mut mask = inner.mask.lock();
        *mask |= bits;
        inner.cond.notify_one();
        drop(mask);
    }

    fn inner(&self) -> &Inner {
        self.inner.get_or_init(|| Inner {
            mask: Mutex::new(0),
            cond: Condvar::new(),
        })
    }
}

/// Blocks the calling thread until the task behind `task` reaches a
/// terminal stage.
///
/// On a pool worker this cooperates with the pool (see the module docs);
/// elsewhere it parks on a thread-local event.
///
/// # Safety contract
///
/// `task` must point to a live task block, kept alive by the caller for the
/// duration of the wait.
pub(crate) fn wait_for(task: NonNull<Header>) {
    if unsafe { task.as_ref() }.ready() {
        return;
    }

    if scheduler::try_worker_wait(task) {
        return;
    }

    external_wait(task)
}

/// Registers an inline continuation on `task` that signals `TASK_FINISHED`
/// on `event`.
///
/// The continuation runs on the completer's thread (or immediately, if the
/// task is already terminal), so the signal strictly follows the terminal
/// transition.
pub(crate) fn register_finish_signal(task: NonNull<Header>, event: Arc<WaitEvent>) {
    let exec = move || {
        event.signal(TASK_FINISHED);
        Ok(())
    };
    let cont = FullTask::<InlineScheduler, _, ()>::allocate(InlineScheduler, exec);
    unsafe { Header::add_continuation(task, cont) };
}

std::thread_local! {
    /// The wait event of a thread that is not a pool worker.
    ///
    /// Reused across waits; a stale `TASK_FINISHED` bit left over from an
    /// earlier wait costs one spurious wakeup, which the ready re-check
    /// absorbs.
    static THREAD_EVENT: Arc<WaitEvent> = Arc::new(WaitEvent::new());
}

fn external_wait(task: NonNull<Header>) {
    THREAD_EVENT.with(|event| {
        event.init();
        register_finish_signal(task, event.clone());
        loop {
            if unsafe { task.as_ref() }.ready() {
                return;
            }
            let _mask = event.wait();
            test_trace!(mask = _mask, "external_wait: woke");
        }
    })
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::loom::thread;

    #[test]
    fn signal_before_wait_returns_immediately() {
        let event = WaitEvent::new();
        event.init();
        event.signal(TASK_FINISHED);
        assert_eq!(event.wait(), TASK_FINISHED);
    }

    #[test]
    fn wait_clears_the_mask() {
        let event = WaitEvent::new();
        event.signal(TASK_FINISHED);
        event.signal(TASK_AVAILABLE);
        assert_eq!(event.wait(), TASK_FINISHED | TASK_AVAILABLE);
        assert!(!event.try_wait(TASK_FINISHED));
        assert!(!event.try_wait(TASK_AVAILABLE));
    }

    #[test]
    fn try_wait_clears_only_the_requested_bits() {
        let event = WaitEvent::new();
        event.signal(TASK_FINISHED | TASK_AVAILABLE);
        assert!(event.try_wait(TASK_AVAILABLE));
        assert!(!event.try_wait(TASK_AVAILABLE));
        assert!(event.try_wait(TASK_FINISHED));
    }

    #[test]
    fn cross_thread_signal_wakes_a_sleeping_waiter() {
        let event = Arc::new(WaitEvent::new());
        event.init();

        let signaller = {
            let event = event.clone();
            thread::spawn(move || {
                event.signal(TASK_FINISHED);
            })
        };

        // The signal must strictly precede the earliest wait that observes
        // its bit, whether or not the waiter was already asleep.
        let mask = event.wait();
        assert!(mask & TASK_FINISHED != 0);
        signaller.join().unwrap();
    }

    #[test]
    fn waiting_on_a_finished_task_does_not_block() {
        let task = crate::task::ready_task(5);
        assert_eq!(task.get(), 5);
    }
}
