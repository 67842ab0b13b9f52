//! Stored task failures.
//!
//! A task that panics (or is canceled explicitly) does not take the process
//! down; the failure is captured as a [`Fault`] and parked in the task until
//! an observer asks for the result. Rethrowing happens at [`get`], or when a
//! canceled parent's fault is propagated into a value continuation.
//!
//! [`get`]: crate::task::Task::get

use core::fmt;
use std::any::Any;
use std::borrow::Cow;
use std::panic;
use std::sync::{Arc, Mutex, PoisonError};

/// The failure a task was canceled with.
///
/// A `Fault` wraps either a caught panic payload or a value passed to an
/// explicit cancellation (such as [`EventTask::cancel`]). Cloning a `Fault`
/// is cheap and preserves identity: every observer of a canceled task, and
/// every continuation the fault is propagated into, sees the same
/// underlying cell, which can be compared with [`Fault::ptr_eq`].
///
/// Rethrowing resumes unwinding. The first rethrow re-raises the original
/// payload unchanged; subsequent rethrows (shared observers, propagated
/// clones) raise the `Fault` itself, which still carries the extracted
/// [`message`](Fault::message) and the shared identity.
///
/// [`EventTask::cancel`]: crate::task::EventTask::cancel
#[derive(Clone)]
pub struct Fault {
    cell: Arc<Cell>,
}

struct Cell {
    /// The original payload, present until the first rethrow takes it.
    payload: Mutex<Option<Box<dyn Any + Send>>>,
    message: Cow<'static, str>,
}

// === impl Fault ===

impl Fault {
    /// Returns a new `Fault` wrapping `payload`.
    ///
    /// This is the explicit-cancellation constructor; panics inside task
    /// functions are captured automatically.
    pub fn new(payload: impl Any + Send) -> Self {
        Self::from_panic(Box::new(payload))
    }

    /// Wraps a payload caught by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast_ref::<&'static str>() {
            Some(s) => Cow::Borrowed(*s),
            None => match payload.downcast_ref::<String>() {
                Some(s) => Cow::Owned(s.clone()),
                None => Cow::Borrowed("task canceled"),
            },
        };
        Self {
            cell: Arc::new(Cell {
                payload: Mutex::new(Some(payload)),
                message,
            }),
        }
    }

    /// Returns the message extracted from the payload, if it was a string
    /// panic, or a generic description otherwise.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.cell.message
    }

    /// Returns `true` if `self` and `other` were propagated from the same
    /// original failure.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Resumes unwinding with this fault.
    ///
    /// The original payload is raised if no observer has taken it yet;
    /// otherwise the `Fault` itself is raised, so late observers of a shared
    /// task still unwind with the same identity.
    pub fn rethrow(self) -> ! {
        let taken = self
            .cell
            .payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(payload) => panic::resume_unwind(payload),
            None => panic::resume_unwind(Box::new(self)),
        }
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Extracts a human-readable message from a caught panic payload, whether it
/// is a string panic or a propagated [`Fault`].
#[cfg(test)]
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return Some(s);
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return Some(s);
    }
    payload.downcast_ref::<Fault>().map(Fault::message)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn message_from_str_panic() {
        let fault = Fault::new("boom");
        assert_eq!(fault.message(), "boom");
    }

    #[test]
    fn message_from_string_panic() {
        let fault = Fault::new(format!("task {} failed", 7));
        assert_eq!(fault.message(), "task 7 failed");
    }

    #[test]
    fn message_from_opaque_payload() {
        let fault = Fault::new(42u32);
        assert_eq!(fault.message(), "task canceled");
    }

    #[test]
    fn clones_share_identity() {
        let fault = Fault::new("boom");
        let clone = fault.clone();
        assert!(fault.ptr_eq(&clone));
        assert!(!fault.ptr_eq(&Fault::new("boom")));
    }

    #[test]
    fn first_rethrow_raises_original_payload() {
        let fault = Fault::new("original");
        let err = std::panic::catch_unwind(move || fault.rethrow()).unwrap_err();
        assert_eq!(err.downcast_ref::<&'static str>(), Some(&"original"));
    }

    #[test]
    fn later_rethrows_preserve_identity() {
        let fault = Fault::new("original");
        let clone = fault.clone();
        let _ = std::panic::catch_unwind(move || fault.rethrow()).unwrap_err();

        let second = clone.clone();
        let err = std::panic::catch_unwind(move || second.rethrow()).unwrap_err();
        let refault = err.downcast_ref::<Fault>().expect("payload is a Fault");
        assert!(refault.ptr_eq(&clone));
        assert_eq!(refault.message(), "original");
    }
}
