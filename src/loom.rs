//! Abstracts over `loom` and `std` types, so the crate's synchronization can
//! be model-checked under `--cfg loom` and compiled against the real
//! primitives otherwise.

#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code)]

    pub(crate) use loom::{cell, hint, model, thread};

    pub(crate) mod sync {
        pub(crate) use loom::sync::*;
    }

    pub(crate) mod blocking {
        pub(crate) use loom::sync::MutexGuard;

        /// Mock version of the blocking mutex, using `loom::sync::Mutex`.
        /// The API hides poisoning, which loom's mutex never reports.
        #[derive(Debug)]
        pub(crate) struct Mutex<T>(loom::sync::Mutex<T>);

        #[derive(Debug)]
        pub(crate) struct Condvar(loom::sync::Condvar);

        impl<T> Mutex<T> {
            pub(crate) fn new(data: T) -> Self {
                Self(loom::sync::Mutex::new(data))
            }

            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                self.0.lock().expect("loom mutex will never poison")
            }
        }

        impl Condvar {
            pub(crate) fn new() -> Self {
                Self(loom::sync::Condvar::new())
            }

            pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
                self.0
                    .wait(guard)
                    .expect("loom condvar will never poison")
            }

            pub(crate) fn notify_one(&self) {
                self.0.notify_one()
            }
        }
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code, unused_imports)]

    pub(crate) mod sync {
        pub(crate) use std::sync::*;

        pub(crate) mod atomic {
            pub(crate) use core::sync::atomic::*;
        }
    }

    pub(crate) mod hint {
        pub(crate) use core::hint::spin_loop;
    }

    pub(crate) mod blocking {
        use std::sync::PoisonError;
        pub(crate) use std::sync::MutexGuard;

        /// A blocking mutex that shrugs off poisoning: no user code ever
        /// runs under the locks this crate takes, so a poisoned lock only
        /// means another thread panicked between guard and drop, and the
        /// data is still coherent.
        #[derive(Debug, Default)]
        pub(crate) struct Mutex<T>(std::sync::Mutex<T>);

        #[derive(Debug, Default)]
        pub(crate) struct Condvar(std::sync::Condvar);

        impl<T> Mutex<T> {
            pub(crate) const fn new(data: T) -> Self {
                Self(std::sync::Mutex::new(data))
            }

            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                self.0.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }

        impl Condvar {
            pub(crate) const fn new() -> Self {
                Self(std::sync::Condvar::new())
            }

            pub(crate) fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
                self.0
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner)
            }

            pub(crate) fn notify_one(&self) {
                self.0.notify_one()
            }
        }
    }

    #[cfg(test)]
    pub(crate) use std::thread;

    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        f()
    }

    pub(crate) mod cell {
        /// Mirror of `loom::cell::UnsafeCell`, shrunk to the accessors this
        /// crate uses.
        #[derive(Debug)]
        pub(crate) struct UnsafeCell<T: ?Sized>(core::cell::UnsafeCell<T>);

        impl<T> UnsafeCell<T> {
            pub(crate) const fn new(data: T) -> UnsafeCell<T> {
                UnsafeCell(core::cell::UnsafeCell::new(data))
            }
        }

        impl<T: ?Sized> UnsafeCell<T> {
            #[inline(always)]
            pub(crate) fn with<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*const T) -> R,
            {
                f(self.0.get())
            }

            #[inline(always)]
            pub(crate) fn with_mut<F, R>(&self, f: F) -> R
            where
                F: FnOnce(*mut T) -> R,
            {
                f(self.0.get())
            }
        }
    }
}
