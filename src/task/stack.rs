//! The continuation list.
//!
//! A lock-free Treiber stack of [`TaskRef`]s, with one terminal operation a
//! plain transfer stack does not have: [`close`], which atomically swings
//! the head to a sentinel and hands back everything pushed so far. Once
//! closed, every subsequent [`try_push`] fails, and the pusher dispatches
//! its continuation itself.
//!
//! The `next` link is intrusive: it lives in the task [`Header`], so
//! pushing never allocates.
//!
//! [`close`]: ContinuationStack::close
//! [`try_push`]: ContinuationStack::try_push

use super::raw::{Header, TaskRef};
use crate::loom::sync::atomic::{AtomicPtr, Ordering::*};
use core::ptr::{self, NonNull};

pub(crate) struct ContinuationStack {
    head: AtomicPtr<Header>,
}

/// Iterator over the continuations drained by [`ContinuationStack::close`].
///
/// Yields in reverse insertion order (per pushing thread), which is the
/// visitation order the completion path is permitted to use.
pub(crate) struct Drain {
    next: Option<NonNull<Header>>,
}

/// Sentinel head marking a closed stack. Never dereferenced; distinguishable
/// from real headers, which are cache-line aligned.
fn closed() -> *mut Header {
    usize::MAX as *mut Header
}

// === impl ContinuationStack ===

impl ContinuationStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `cont` unless the stack has been closed.
    ///
    /// On failure the continuation is handed back to the caller, which must
    /// dispatch it itself (after an acquire fence, so that it observes the
    /// completion that closed the stack).
    pub(crate) fn try_push(&self, cont: TaskRef) -> Result<(), TaskRef> {
        let ptr = cont.into_ptr();
        let mut head = self.head.load(Relaxed);
        loop {
            if head == closed() {
                unsafe {
                    Header::set_next(ptr, None);
                    return Err(TaskRef::from_ptr(ptr));
                }
            }

            unsafe {
                Header::set_next(ptr, NonNull::new(head));
            }

            match self
                .head
                .compare_exchange_weak(head, ptr.as_ptr(), AcqRel, Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Closes the stack, draining everything pushed before the close.
    ///
    /// The transition happens exactly once; a second `close` drains
    /// nothing.
    pub(crate) fn close(&self) -> Drain {
        let head = self.head.swap(closed(), AcqRel);
        let next = if head == closed() {
            None
        } else {
            NonNull::new(head)
        };
        Drain { next }
    }
}

impl Drop for ContinuationStack {
    fn drop(&mut self) {
        // Continuations registered on a task that is destroyed without ever
        // reaching a terminal stage are released without running.
        for cont in self.close() {
            drop(cont);
        }
    }
}

// === impl Drain ===

impl Iterator for Drain {
    type Item = TaskRef;

    fn next(&mut self) -> Option<Self::Item> {
        let curr = self.next.take()?;
        unsafe {
            // Advance the iterator to the next node after the current one
            // (if there is one).
            self.next = Header::take_next(curr);

            // Return the current node.
            Some(TaskRef::from_ptr(curr))
        }
    }
}
