//! Hooks supplied by the scheduler that embeds these primitives.
//!
//! The locks in this crate sit below the scheduler they protect, so they
//! cannot ask it for help to make progress. What they do need from it is
//! small: to know how many workers may run in parallel, to be told when a
//! worker is about to block outside of its root context, and a way to stop
//! the process when an invariant breaks. A scheduler provides these by
//! implementing [`Host`] and installing it with [`set_host`] before any
//! worker thread starts. Without an installed host, [`DefaultHost`] is used.

use std::sync::OnceLock;

use crate::cfg;
use crate::context::ThreadContext;

/// An invariant violation detected by one of the primitives.
///
/// None of these are recoverable. They mean that either the calling
/// discipline was broken (unmatched lock and unlock calls, signaling a note
/// twice) or that the shared state got corrupted, and every thread in the
/// process is affected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Fatal {
    /// A thread's lock count went negative.
    #[error("{op}: lock count")]
    LockCount {
        /// The operation that observed the bad count.
        op: &'static str,
    },
    /// `unlock` was called on a mutex that is not locked.
    #[error("unlock: mutex is not locked")]
    UnlockOfUnlocked,
    /// A note was signaled twice without a `clear` in between.
    #[error("signal: double wakeup")]
    DoubleWakeup,
    /// A note held a value other than empty, signaled or the waiting thread.
    #[error("{op}: note out of sync")]
    NoteOutOfSync {
        /// The operation that observed the bad value.
        op: &'static str,
    },
    /// A granted semaphore count could not be consumed.
    #[error("timed_wait: unable to acquire, semaphore out of sync")]
    SemaphoreOutOfSync,
    /// An unbounded wait was issued from a lightweight task context.
    #[error("{op}: not on the root context")]
    NotOnRoot {
        /// The operation that was called.
        op: &'static str,
    },
    /// A task-context wait was issued from the root context.
    #[error("{op}: called on the root context")]
    OnRoot {
        /// The operation that was called.
        op: &'static str,
    },
    /// A primitive was used after the calling thread's context was torn
    /// down, typically from another thread local's destructor.
    #[error("thread context already destroyed")]
    NoContext,
}

/// Error returned by [`set_host`] when a host is already installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("a host is already installed")]
pub struct SetHostError;

/// Hooks the embedding scheduler provides to the primitives.
///
/// Every method has a default, so an implementor overrides only what its
/// scheduler cares about.
///
/// # Example
///
/// ```
/// use semalock::host::{self, Fatal, Host};
/// use semalock::ThreadContext;
///
/// struct Scheduler;
///
/// impl Host for Scheduler {
///     fn enter_blocking(&self, cx: &ThreadContext) {
///         // Hand this worker's run queue to another worker.
///         let _ = cx.id();
///     }
///
///     fn fatal(&self, fatal: Fatal) -> ! {
///         panic!("scheduler invariant broken: {fatal}");
///     }
/// }
///
/// static SCHEDULER: Scheduler = Scheduler;
/// host::set_host(&SCHEDULER).unwrap();
/// ```
pub trait Host: Sync {
    /// Number of workers that can run in parallel.
    ///
    /// When this is one, contended lockers skip the active spin phase.
    fn ncpu(&self) -> usize {
        cfg::ncpu()
    }

    /// Called before a worker running a lightweight task blocks on a bounded
    /// wait, so the scheduler can move other tasks to another worker.
    fn enter_blocking(&self, cx: &ThreadContext) {
        let _ = cx;
    }

    /// Called once the wait announced by [`enter_blocking`] is over.
    ///
    /// [`enter_blocking`]: Host::enter_blocking
    fn exit_blocking(&self, cx: &ThreadContext) {
        let _ = cx;
    }

    /// Terminates the process because of `fatal`.
    ///
    /// Implementations must not return. The default logs the reason and
    /// aborts.
    fn fatal(&self, fatal: Fatal) -> ! {
        abort(fatal)
    }
}

/// The host used when none is installed.
#[derive(Debug, Default)]
pub struct DefaultHost;

impl Host for DefaultHost {}

static HOST: OnceLock<&'static dyn Host> = OnceLock::new();

/// Installs the process wide host.
///
/// # Errors
///
/// Returns [`SetHostError`] if a host was already installed, the first one
/// stays in place.
pub fn set_host(host: &'static dyn Host) -> Result<(), SetHostError> {
    HOST.set(host).map_err(|_| SetHostError)
}

/// Returns the installed host, or [`DefaultHost`].
pub fn host() -> &'static dyn Host {
    static DEFAULT: DefaultHost = DefaultHost;
    HOST.get().copied().unwrap_or(&DEFAULT)
}

/// Reports `fatal` to the installed host, which terminates the process.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fatal(fatal: Fatal) -> ! {
    host().fatal(fatal)
}

/// Logs `fatal` and aborts the process.
#[cold]
pub fn abort(fatal: Fatal) -> ! {
    log::error!("fatal runtime error: {fatal}");
    std::process::abort()
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Fatal, SetHostError};

    #[test]
    fn fatal_messages() {
        assert_eq!(Fatal::LockCount { op: "lock" }.to_string(), "lock: lock count");
        assert_eq!(Fatal::DoubleWakeup.to_string(), "signal: double wakeup");
        let sync = Fatal::NoteOutOfSync { op: "wait" };
        assert_eq!(sync.to_string(), "wait: note out of sync");
        assert_eq!(Fatal::NoContext.to_string(), "thread context already destroyed");
    }

    #[test]
    fn second_install_fails() {
        crate::test::install_host();
        let host = crate::test::host();
        assert_eq!(super::set_host(host), Err(SetHostError));
    }
}
