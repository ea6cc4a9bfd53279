//! The per-thread parking semaphore.
//!
//! Each worker thread owns one [`Semaphore`] and is the only thread that ever
//! waits on it. Any thread may signal it, and a signal that arrives before
//! the owner starts waiting is kept as a count, so the owner never misses a
//! wakeup that was granted to it.

use core::time::Duration;

/// Outcome of [`Semaphore::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// A count was consumed.
    Acquired,
    /// The timeout elapsed, or the wait was interrupted, before a count was
    /// available. No count was consumed.
    TimedOut,
}

impl Acquire {
    /// Returns `true` if a count was consumed.
    #[must_use]
    pub const fn is_acquired(self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// A counting semaphore used to park a single thread.
pub struct Semaphore {
    inner: imp::Semaphore,
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore").finish_non_exhaustive()
    }
}

impl Semaphore {
    /// Creates a semaphore with a zero count.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: imp::Semaphore::new() }
    }

    /// Waits until a count is available and consumes it.
    ///
    /// `None` waits without bound and always returns [`Acquire::Acquired`].
    pub fn wait(&self, timeout: Option<Duration>) -> Acquire {
        self.inner.wait(timeout)
    }

    /// Adds one count and wakes the waiter, if any.
    ///
    /// The semaphore is not accessed anymore once the count can be observed
    /// by the waiter, so the waiter may free it right after its `wait`
    /// returns.
    pub fn signal(&self) {
        self.inner.signal();
    }

    /// Number of counts available right now.
    #[cfg(test)]
    pub(crate) fn available(&self) -> u32 {
        self.inner.available()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(all(loom, test)))]
mod imp {
    use core::time::Duration;
    use std::time::Instant;

    use parking_lot::{Condvar, Mutex};

    use super::Acquire;

    #[derive(Default)]
    pub struct Semaphore {
        count: Mutex<u32>,
        cond: Condvar,
    }

    impl Semaphore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn wait(&self, timeout: Option<Duration>) -> Acquire {
            let mut count = self.count.lock();
            match timeout {
                None => {
                    while *count == 0 {
                        self.cond.wait(&mut count);
                    }
                }
                Some(timeout) => {
                    // An unrepresentable deadline is as good as no deadline.
                    let Some(deadline) = Instant::now().checked_add(timeout) else {
                        drop(count);
                        return self.wait(None);
                    };
                    while *count == 0 {
                        if self.cond.wait_until(&mut count, deadline).timed_out() {
                            break;
                        }
                    }
                    if *count == 0 {
                        return Acquire::TimedOut;
                    }
                }
            }
            *count -= 1;
            Acquire::Acquired
        }

        pub fn signal(&self) {
            let mut count = self.count.lock();
            *count += 1;
            self.cond.notify_one();
            // The owner can take the count, return and exit its thread as soon
            // as this guard is released, so nothing may touch `self` after it.
            drop(count);
        }

        #[cfg(test)]
        pub fn available(&self) -> u32 {
            *self.count.lock()
        }
    }
}

// Loom has no notion of time: bounded waits only try to take a count, which
// lets models explore deadlines expiring at every interleaving.
#[cfg(all(loom, test))]
mod imp {
    use core::time::Duration;

    use loom::sync::{Condvar, Mutex};

    use super::Acquire;

    pub struct Semaphore {
        count: Mutex<u32>,
        cond: Condvar,
    }

    impl Semaphore {
        pub fn new() -> Self {
            Self { count: Mutex::new(0), cond: Condvar::new() }
        }

        pub fn wait(&self, timeout: Option<Duration>) -> Acquire {
            let mut count = self.count.lock().unwrap();
            if timeout.is_none() {
                while *count == 0 {
                    count = self.cond.wait(count).unwrap();
                }
            }
            if *count == 0 {
                return Acquire::TimedOut;
            }
            *count -= 1;
            Acquire::Acquired
        }

        pub fn signal(&self) {
            let mut count = self.count.lock().unwrap();
            *count += 1;
            self.cond.notify_one();
            drop(count);
        }

        pub fn available(&self) -> u32 {
            *self.count.lock().unwrap()
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::ptr;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Acquire, Semaphore};

    #[test]
    fn signal_before_wait_is_kept() {
        let sema = Semaphore::new();
        sema.signal();
        assert_eq!(sema.available(), 1);
        assert_eq!(sema.wait(Some(Duration::ZERO)), Acquire::Acquired);
        assert_eq!(sema.available(), 0);
    }

    #[test]
    fn bounded_wait_times_out() {
        let sema = Semaphore::new();
        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        assert_eq!(sema.wait(Some(timeout)), Acquire::TimedOut);
        assert!(start.elapsed() >= timeout);
        assert_eq!(sema.available(), 0);
    }

    #[test]
    fn unbounded_wait_is_woken() {
        let sema = Arc::new(Semaphore::new());
        let c_sema = Arc::clone(&sema);
        let waiter = thread::spawn(move || c_sema.wait(None));
        thread::sleep(Duration::from_millis(10));
        sema.signal();
        assert_eq!(waiter.join().unwrap(), Acquire::Acquired);
        assert_eq!(sema.available(), 0);
    }

    // The waiter owns the semaphore on its stack and frees it as soon as its
    // wait returns, while the signaler only borrows it.
    #[test]
    fn waiter_frees_semaphore_right_after_wakeup() {
        for _ in 0..200 {
            let (tx, rx) = mpsc::channel();
            let waiter = thread::spawn(move || {
                let sema = Semaphore::new();
                tx.send(ptr::from_ref(&sema).expose_provenance()).unwrap();
                sema.wait(None)
            });
            let addr = rx.recv().unwrap();
            // SAFETY: The waiter keeps the semaphore alive until a count is
            // granted, and `signal` stops touching it once it is.
            let sema = unsafe { &*ptr::with_exposed_provenance::<Semaphore>(addr) };
            sema.signal();
            assert_eq!(waiter.join().unwrap(), Acquire::Acquired);
        }
    }

    #[test]
    fn huge_timeout_still_acquires() {
        let sema = Semaphore::new();
        sema.signal();
        assert!(sema.wait(Some(Duration::MAX)).is_acquired());
    }
}
