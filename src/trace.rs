#![cfg_attr(not(test), allow(unused_macros))]

//! Test-only tracing macros.
//!
//! These expand to real [`tracing`] events in test builds (and when
//! `--cfg enoki_ultraverbose` is set), and to nothing in normal builds, so
//! the hot paths stay free of instrumentation overhead while still being
//! observable when debugging a failing interleaving.

#[cfg(all(not(test), not(enoki_ultraverbose)))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(any(test, enoki_ultraverbose))]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(all(not(test), not(enoki_ultraverbose)))]
macro_rules! test_debug {
    ($($args:tt)+) => {};
}

#[cfg(any(test, enoki_ultraverbose))]
macro_rules! test_debug {
    ($($args:tt)+) => {
        tracing::debug!($($args)+);
    };
}

#[cfg(all(not(test), not(enoki_ultraverbose)))]
macro_rules! test_trace {
    ($($args:tt)+) => {};
}

#[cfg(any(test, enoki_ultraverbose))]
macro_rules! test_trace {
    ($($args:tt)+) => {
        tracing::trace!($($args)+);
    };
}
