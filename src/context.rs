//! Per worker thread state.
//!
//! Every OS thread that touches a [`RawMutex`] or a [`Note`] gets one
//! [`ThreadContext`] in its thread local storage. The context doubles as the
//! thread's wait-queue node: mutexes chain contexts of blocked threads
//! through their `next` link, and notes record the context of their waiter.
//! Neither ever owns a context, they only borrow it while its thread is
//! parked, and a parked thread cannot exit.
//!
//! [`RawMutex`]: crate::raw::RawMutex
//! [`Note`]: crate::Note

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::time::Duration;
use std::sync::OnceLock;

use crate::cfg::atomic::{AtomicBool, AtomicI32, AtomicPtr};
use crate::host::{fatal, Fatal};
use crate::sema::{Acquire as Parked, Semaphore};

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static CURRENT: ThreadContext = ThreadContext::new();
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static CURRENT: ThreadContext = ThreadContext::new();
}

/// The state a worker thread carries for the locking primitives.
///
/// Fields are only written by their own thread, except `next`, which is
/// written by the owner before it is published on a mutex and read by the
/// thread that pops it. Other threads may read the flags for diagnostics.
pub struct ThreadContext {
    id: usize,
    next: AtomicPtr<ThreadContext>,
    parking: OnceLock<Semaphore>,
    locks: AtomicI32,
    blocked: AtomicBool,
    on_task: AtomicBool,
    preempt: AtomicBool,
    preempt_signaled: AtomicBool,
}

// Mutex state words keep a flag in the low bit of a context address.
const _: () = assert!(core::mem::align_of::<ThreadContext>() >= 2);

impl ThreadContext {
    fn new() -> Self {
        use core::sync::atomic::AtomicUsize;
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

        Self {
            id: NEXT_ID.fetch_add(1, Relaxed),
            next: AtomicPtr::new(ptr::null_mut()),
            parking: OnceLock::new(),
            locks: AtomicI32::new(0),
            blocked: AtomicBool::new(false),
            on_task: AtomicBool::new(false),
            preempt: AtomicBool::new(false),
            preempt_signaled: AtomicBool::new(false),
        }
    }

    /// Runs `f` against the context of the current thread.
    ///
    /// Every mutex and note operation goes through this function, so none of
    /// them may run once the context is gone. Calling it from a thread local
    /// destructor that runs after the context was destroyed is fatal, see
    /// [`Fatal::NoContext`].
    ///
    /// # Example
    ///
    /// ```
    /// use semalock::ThreadContext;
    ///
    /// let locks = ThreadContext::with(|cx| cx.lock_count());
    /// assert_eq!(locks, 0);
    /// ```
    #[inline]
    pub fn with<F, Ret>(f: F) -> Ret
    where
        F: FnOnce(&ThreadContext) -> Ret,
    {
        match CURRENT.try_with(f) {
            Ok(ret) => ret,
            Err(_) => fatal(Fatal::NoContext),
        }
    }

    /// Marks the current thread as running a lightweight task until the
    /// returned guard is dropped.
    ///
    /// Unbounded waits are forbidden while a task runs, see [`Note::wait`].
    ///
    /// [`Note::wait`]: crate::Note::wait
    pub fn enter_task() -> TaskGuard {
        let prev = Self::with(|cx| cx.on_task.swap(true, Relaxed));
        TaskGuard { prev, marker: PhantomData }
    }

    /// A process unique identifier for this thread, for diagnostics.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of runtime mutexes this thread currently holds.
    #[must_use]
    pub fn lock_count(&self) -> i32 {
        self.locks.load(Relaxed)
    }

    /// Returns `true` while this thread is parked inside a note wait.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Relaxed)
    }

    /// Returns `true` unless this thread is running a lightweight task.
    #[must_use]
    pub fn is_root(&self) -> bool {
        !self.on_task.load(Relaxed)
    }

    /// Asks this thread to yield to the scheduler at its next safe point.
    ///
    /// While the thread holds a runtime mutex the request is only recorded,
    /// it is asserted once the last mutex is released.
    pub fn request_preempt(&self) {
        self.preempt.store(true, Relaxed);
        if self.lock_count() == 0 {
            self.preempt_signaled.store(true, Relaxed);
        }
    }

    /// Returns `true` if a preemption request is asserted.
    #[must_use]
    pub fn preempt_pending(&self) -> bool {
        self.preempt_signaled.load(Relaxed)
    }

    /// Drops any recorded or asserted preemption request.
    pub fn clear_preempt(&self) {
        self.preempt.store(false, Relaxed);
        self.preempt_signaled.store(false, Relaxed);
    }

    /// Returns this thread's semaphore, creating it on first use.
    pub(crate) fn parking(&self) -> &Semaphore {
        self.parking.get_or_init(|| {
            log::trace!("thread {}: creating parking semaphore", self.id);
            Semaphore::new()
        })
    }

    /// Parks this thread on its semaphore.
    pub(crate) fn park(&self, timeout: Option<Duration>) -> Parked {
        self.parking().wait(timeout)
    }

    /// Parks this thread with the `blocked` flag raised.
    pub(crate) fn park_blocked(&self, timeout: Option<Duration>) -> Parked {
        self.blocked.store(true, Relaxed);
        let parked = self.park(timeout);
        self.blocked.store(false, Relaxed);
        parked
    }

    /// Wakes this thread, which is parked or about to park.
    pub(crate) fn wake(&self) {
        self.parking().signal();
    }

    pub(crate) fn as_ptr(&self) -> *mut ThreadContext {
        ptr::from_ref(self).cast_mut()
    }

    pub(crate) fn next(&self) -> *mut ThreadContext {
        self.next.load(Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut ThreadContext) {
        self.next.store(next, Release);
    }

    /// Counts a lock acquisition.
    pub(crate) fn inc_locks(&self) {
        if self.locks.fetch_add(1, Relaxed) < 0 {
            fatal(Fatal::LockCount { op: "lock" });
        }
    }

    /// Fails unless this thread holds at least one lock.
    pub(crate) fn check_unlock(&self) {
        if self.lock_count() <= 0 {
            fatal(Fatal::LockCount { op: "unlock" });
        }
    }

    /// Counts a lock release, asserting a deferred preemption request once
    /// no lock is held anymore.
    pub(crate) fn dec_locks(&self) {
        let locks = self.locks.fetch_sub(1, Relaxed) - 1;
        if locks < 0 {
            fatal(Fatal::LockCount { op: "unlock" });
        }
        if locks == 0 && self.preempt.load(Relaxed) {
            self.preempt_signaled.store(true, Relaxed);
        }
    }
}

impl core::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("locks", &self.lock_count())
            .field("blocked", &self.is_blocked())
            .field("root", &self.is_root())
            .field("preempt", &self.preempt_pending())
            .finish_non_exhaustive()
    }
}

/// Keeps the current thread in task context, see
/// [`ThreadContext::enter_task`].
#[must_use = "if unused the thread immediately returns to its root context"]
pub struct TaskGuard {
    prev: bool,
    // Restores the flag of the thread that created it.
    marker: PhantomData<*const ()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        ThreadContext::with(|cx| cx.on_task.store(self.prev, Relaxed));
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::thread;

    use super::ThreadContext;

    #[test]
    fn contexts_are_per_thread() {
        let here = ThreadContext::with(ThreadContext::id);
        let there = thread::spawn(|| ThreadContext::with(ThreadContext::id)).join().unwrap();
        assert_ne!(here, there);
        assert_eq!(here, ThreadContext::with(ThreadContext::id));
    }

    #[test]
    fn task_guard_nests() {
        ThreadContext::with(|cx| assert!(cx.is_root()));
        {
            let _outer = ThreadContext::enter_task();
            {
                let _inner = ThreadContext::enter_task();
                ThreadContext::with(|cx| assert!(!cx.is_root()));
            }
            ThreadContext::with(|cx| assert!(!cx.is_root()));
        }
        ThreadContext::with(|cx| assert!(cx.is_root()));
    }

    #[test]
    fn preempt_is_deferred_while_locked() {
        ThreadContext::with(|cx| {
            cx.inc_locks();
            cx.request_preempt();
            assert!(!cx.preempt_pending());
            cx.check_unlock();
            cx.dec_locks();
            assert!(cx.preempt_pending());
            cx.clear_preempt();
            assert!(!cx.preempt_pending());
        });
    }

    #[test]
    fn preempt_without_locks_is_immediate() {
        ThreadContext::with(|cx| {
            cx.request_preempt();
            assert!(cx.preempt_pending());
            cx.clear_preempt();
        });
    }

    #[test]
    fn parking_semaphore_is_lazy_and_reused() {
        thread::spawn(|| {
            ThreadContext::with(|cx| {
                assert!(cx.parking.get().is_none());
                let first: *const _ = cx.parking();
                let second: *const _ = cx.parking();
                assert_eq!(first, second);
            });
        })
        .join()
        .unwrap();
    }

    // glibc runs thread local destructors in reverse registration order, so
    // touching `LATE` before the context makes it outlive the context.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn use_after_context_teardown_is_fatal() {
        use std::cell::Cell;
        use std::panic::{self, AssertUnwindSafe};
        use std::sync::Mutex;

        use crate::host::Fatal;
        use crate::raw::spins::RawMutex;

        static SEEN: Mutex<Option<Option<Fatal>>> = Mutex::new(None);

        struct Late(Cell<bool>);

        impl Drop for Late {
            fn drop(&mut self) {
                let mutex = RawMutex::new();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| mutex.lock()));
                let fatal = outcome.err().and_then(|payload| payload.downcast::<Fatal>().ok());
                *SEEN.lock().unwrap() = Some(fatal.map(|fatal| *fatal));
            }
        }

        std::thread_local! {
            static LATE: Late = const { Late(Cell::new(false)) };
        }

        crate::test::install_host();
        thread::spawn(|| {
            LATE.with(|late| late.0.set(true));
            ThreadContext::with(ThreadContext::id);
        })
        .join()
        .unwrap();
        assert_eq!(*SEEN.lock().unwrap(), Some(Some(Fatal::NoContext)));
    }
}
