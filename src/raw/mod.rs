//! The runtime mutex, without any protected data.
//!
//! [`RawMutex`] exposes the bare `lock` and `unlock` operations a scheduler
//! uses around its own critical sections. It does not guard a value, see
//! [`Mutex`] for the RAII flavor built on top of it.
//!
//! Contended lockers spin, yield, and finally park their worker thread on
//! its private semaphore, queued on a LIFO wait stack threaded through the
//! [`ThreadContext`] of each parked thread. Nothing is allocated: a mutex is
//! one machine word and starts unlocked.
//!
//! The mutex is generic over the relax strategy used while actively
//! spinning. User may choose a strategy as long as it implements the
//! [`Relax`] trait. The following modules provide type aliases for
//! [`RawMutex`] associated with a relax strategy.
//!
//! [`Mutex`]: crate::mutex::Mutex
//! [`ThreadContext`]: crate::ThreadContext
//! [`Relax`]: crate::relax::Relax

mod mutex;
pub use mutex::{MutexState, RawMutex};

/// A runtime mutex that implements a `spin` relax strategy.
///
/// During the active spin phase, this lock spins while signaling the
/// processor that it is running a busy-wait spin-loop.
pub mod spins {
    use crate::relax::Spin;

    /// A [`raw::RawMutex`] that implements the [`Spin`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use semalock::raw::spins::RawMutex;
    ///
    /// let mutex = RawMutex::new();
    /// mutex.lock();
    /// // SAFETY: this thread holds the lock.
    /// unsafe { mutex.unlock() };
    /// ```
    /// [`raw::RawMutex`]: super::RawMutex
    pub type RawMutex = super::RawMutex<Spin>;
}

/// A runtime mutex that implements a `yield` relax strategy.
///
/// During the active spin phase, this lock will yield the current time
/// slice to the OS scheduler.
pub mod yields {
    use crate::relax::Yield;

    /// A [`raw::RawMutex`] that implements the [`Yield`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use semalock::raw::yields::RawMutex;
    ///
    /// let mutex = RawMutex::new();
    /// mutex.lock();
    /// // SAFETY: this thread holds the lock.
    /// unsafe { mutex.unlock() };
    /// ```
    /// [`raw::RawMutex`]: super::RawMutex
    pub type RawMutex = super::RawMutex<Yield>;
}

/// A runtime mutex that implements a `loop` relax strategy.
///
/// During the active spin phase, this lock will rapidly spin without
/// telling the CPU to do any power down.
pub mod loops {
    use crate::relax::Loop;

    /// A [`raw::RawMutex`] that implements the [`Loop`] relax strategy.
    ///
    /// # Example
    ///
    /// ```
    /// use semalock::raw::loops::RawMutex;
    ///
    /// let mutex = RawMutex::new();
    /// mutex.lock();
    /// // SAFETY: this thread holds the lock.
    /// unsafe { mutex.unlock() };
    /// ```
    /// [`raw::RawMutex`]: super::RawMutex
    pub type RawMutex = super::RawMutex<Loop>;
}
