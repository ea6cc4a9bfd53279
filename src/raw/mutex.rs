use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicUsize;
use crate::context::ThreadContext;
use crate::host::{self, fatal, Fatal};
use crate::relax::{Contention, Relax};

/// Low bit of the state word: the mutex is held.
const LOCKED: usize = 1;
const UNLOCKED: usize = 0;

/// A view over a mutex state word.
///
/// The low bit is [`LOCKED`], the remaining bits are the address of the
/// [`ThreadContext`] at the top of the wait stack, or zero. Addresses enter
/// the word through [`expose_provenance`] and leave it through
/// [`with_exposed_provenance_mut`].
///
/// [`expose_provenance`]: pointer::expose_provenance
/// [`with_exposed_provenance_mut`]: ptr::with_exposed_provenance_mut
#[derive(Clone, Copy, PartialEq, Eq)]
struct Word(usize);

impl Word {
    const fn is_locked(self) -> bool {
        self.0 & LOCKED != 0
    }

    const fn head_addr(self) -> usize {
        self.0 & !LOCKED
    }

    fn head(self) -> Option<NonNull<ThreadContext>> {
        NonNull::new(ptr::with_exposed_provenance_mut(self.head_addr()))
    }

    /// A locked word with `cx` at the top of the wait stack.
    fn locked_by(cx: &ThreadContext) -> usize {
        cx.as_ptr().expose_provenance() | LOCKED
    }

    const fn state(self) -> MutexState {
        match (self.is_locked(), self.head_addr() != 0) {
            (false, false) => MutexState::Unlocked,
            (false, true) => MutexState::Handoff,
            (true, false) => MutexState::Locked,
            (true, true) => MutexState::Contended,
        }
    }
}

/// A decoded snapshot of a [`RawMutex`] state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutexState {
    /// Not held, nobody waiting.
    Unlocked,
    /// Held, nobody waiting.
    Locked,
    /// Held, with threads parked on the wait stack.
    Contended,
    /// Not held, but threads are still parked on the wait stack. Observed
    /// right after a release woke a waiter and before it retried.
    Handoff,
}

/// A mutual exclusion lock for worker threads of a scheduler.
///
/// Acquisition first tries a single compare-and-swap. Under contention the
/// locker spins for a short while (skipped on single worker systems), yields
/// once to the OS, then pushes its [`ThreadContext`] onto the wait stack kept
/// in the state word and parks on its semaphore. Waking up only grants a new
/// attempt, the woken thread competes again with everyone else.
///
/// The wait stack is LIFO: every release wakes the most recently parked
/// thread. This favors throughput over fairness, and long waiters may starve
/// under sustained contention.
///
/// Lock and unlock calls are counted per thread. Unlocking more often than
/// locking is a fatal error, see [`Fatal::LockCount`]. The mutex is not
/// reentrant: locking it again from the thread that holds it deadlocks.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use semalock::raw::spins::RawMutex;
///
/// let mutex = Arc::new(RawMutex::new());
/// let c_mutex = Arc::clone(&mutex);
///
/// mutex.lock();
/// let handle = thread::spawn(move || {
///     c_mutex.lock();
///     // SAFETY: this thread holds the lock.
///     unsafe { c_mutex.unlock() };
/// });
/// // SAFETY: this thread holds the lock.
/// unsafe { mutex.unlock() };
/// handle.join().expect("thread::spawn failed");
/// assert!(!mutex.is_locked());
/// ```
pub struct RawMutex<R> {
    state: AtomicUsize,
    relax: PhantomData<fn() -> R>,
}

impl<R> RawMutex<R> {
    /// Creates a new, unlocked mutex (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicUsize::new(UNLOCKED), relax: PhantomData }
    }

    /// Creates a new, unlocked and Loom based mutex (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { state: AtomicUsize::new(UNLOCKED), relax: PhantomData }
    }

    /// Returns `true` if some thread holds the mutex.
    ///
    /// The answer may be stale by the time it is read.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        Word(self.state.load(Relaxed)).is_locked()
    }

    /// Returns a snapshot of the mutex state.
    #[must_use]
    pub fn state(&self) -> MutexState {
        Word(self.state.load(Acquire)).state()
    }

    /// Attempts a single acquisition from the observed word `v`.
    fn try_acquire(&self, v: usize) -> bool {
        self.state.compare_exchange(v, v | LOCKED, Acquire, Relaxed).is_ok()
    }

    /// Attempts to acquire this mutex without blocking.
    ///
    /// Returns `true` if the lock was acquired, in which case it must be
    /// released with [`unlock`].
    ///
    /// # Examples
    ///
    /// ```
    /// use semalock::raw::spins::RawMutex;
    ///
    /// let mutex = RawMutex::new();
    /// assert!(mutex.try_lock());
    /// // SAFETY: this thread holds the lock.
    /// unsafe { mutex.unlock() };
    /// ```
    /// [`unlock`]: RawMutex::unlock
    pub fn try_lock(&self) -> bool {
        let mut v = self.state.load(Relaxed);
        while !Word(v).is_locked() {
            match self.state.compare_exchange_weak(v, v | LOCKED, Acquire, Relaxed) {
                Ok(_) => {
                    ThreadContext::with(ThreadContext::inc_locks);
                    return true;
                }
                Err(current) => v = current,
            }
        }
        false
    }

    /// Releases this mutex.
    ///
    /// If threads are parked on the wait stack, the most recent one is popped
    /// and woken. When the calling thread releases its last lock, a
    /// preemption request recorded while it held locks is asserted.
    ///
    /// # Safety
    ///
    /// The calling thread must hold this mutex. Calling this from a thread
    /// that holds no runtime mutex at all is detected and fatal, releasing a
    /// mutex locked by another thread is not.
    pub unsafe fn unlock(&self) {
        ThreadContext::with(|cx| {
            cx.check_unlock();
            self.release();
            cx.dec_locks();
        });
    }

    fn release(&self) {
        let mut v = self.state.load(Acquire);
        loop {
            if v == LOCKED {
                match self.state.compare_exchange(LOCKED, UNLOCKED, Release, Acquire) {
                    Ok(_) => return,
                    Err(current) => v = current,
                }
                continue;
            }
            let word = Word(v);
            let (true, Some(head)) = (word.is_locked(), word.head()) else {
                fatal(Fatal::UnlockOfUnlocked);
            };
            // SAFETY: Only the lock holder pops, so `head` stays on the stack
            // until our exchange below succeeds. A queued thread stays parked
            // until it is woken, so its context is alive.
            let head = unsafe { head.as_ref() };
            let next = head.next().expose_provenance();
            match self.state.compare_exchange(v, next, AcqRel, Acquire) {
                Ok(_) => {
                    head.wake();
                    return;
                }
                Err(current) => v = current,
            }
        }
    }

    /// Number of threads on the wait stack.
    ///
    /// The caller must hold the mutex, so that nothing gets popped while the
    /// stack is walked.
    #[cfg(test)]
    pub(crate) fn waiters(&self) -> usize {
        let mut count = 0;
        let mut node = Word(self.state.load(Acquire)).head();
        while let Some(cx) = node {
            count += 1;
            // SAFETY: Queued contexts belong to parked threads, and the caller
            // holds the lock so none of them is popped meanwhile.
            node = NonNull::new(unsafe { cx.as_ref() }.next());
        }
        count
    }
}

impl<R: Relax> RawMutex<R> {
    /// Acquires this mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// # Examples
    ///
    /// ```
    /// use semalock::raw::spins::RawMutex;
    ///
    /// let mutex = RawMutex::new();
    /// mutex.lock();
    /// assert!(mutex.is_locked());
    /// // SAFETY: this thread holds the lock.
    /// unsafe { mutex.unlock() };
    /// ```
    pub fn lock(&self) {
        ThreadContext::with(|cx| self.lock_contended(cx));
    }

    fn lock_contended(&self, cx: &ThreadContext) {
        cx.inc_locks();
        if self.try_acquire(UNLOCKED) {
            return;
        }
        cx.parking();

        let mut budget = Contention::<R>::new(host::host().ncpu());
        let mut v = self.state.load(Acquire);
        loop {
            if !Word(v).is_locked() {
                if self.try_acquire(v) {
                    return;
                }
                budget.reset();
            }
            if !budget.spin() {
                match self.push(cx, v) {
                    Ok(()) => {
                        log::trace!("thread {}: parking on contended mutex", cx.id());
                        cx.park(None);
                        budget.reset();
                    }
                    Err(unlocked) => {
                        v = unlocked;
                        continue;
                    }
                }
            }
            v = self.state.load(Acquire);
        }
    }

    /// Pushes `cx` onto the wait stack.
    ///
    /// Fails with the observed word if the mutex is seen unlocked, the
    /// caller should then retry the acquisition instead of parking.
    fn push(&self, cx: &ThreadContext, mut v: usize) -> Result<(), usize> {
        let top = Word::locked_by(cx);
        loop {
            let word = Word(v);
            if !word.is_locked() {
                return Err(v);
            }
            cx.set_next(ptr::with_exposed_provenance_mut(word.head_addr()));
            match self.state.compare_exchange(v, top, AcqRel, Acquire) {
                Ok(_) => return Ok(()),
                Err(current) => v = current,
            }
        }
    }
}

impl<R> Default for RawMutex<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawMutex<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex").field("state", &self.state()).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use super::{MutexState, Word, UNLOCKED};
    use crate::context::ThreadContext;
    use crate::host::Fatal;
    use crate::raw::spins::RawMutex;
    use crate::raw::yields::RawMutex as YieldMutex;
    use crate::test::{fatal_of, wait_until};

    #[test]
    fn lock_unlock_restores_unlocked_word() {
        let mutex = RawMutex::new();
        assert_eq!(mutex.state(), MutexState::Unlocked);
        mutex.lock();
        assert_eq!(mutex.state(), MutexState::Locked);
        ThreadContext::with(|cx| assert_eq!(cx.lock_count(), 1));
        unsafe { mutex.unlock() };
        assert_eq!(mutex.state.load(Relaxed), UNLOCKED);
        ThreadContext::with(|cx| assert_eq!(cx.lock_count(), 0));
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = Arc::new(RawMutex::new());
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let acquired = thread::spawn(move || c_mutex.try_lock()).join().unwrap();
        assert!(!acquired);
        unsafe { mutex.unlock() };
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
        assert_eq!(mutex.state(), MutexState::Unlocked);
    }

    #[test]
    fn lock_counts_nest_across_mutexes() {
        let first = RawMutex::new();
        let second = RawMutex::new();
        first.lock();
        second.lock();
        ThreadContext::with(|cx| assert_eq!(cx.lock_count(), 2));
        unsafe { second.unlock() };
        unsafe { first.unlock() };
        ThreadContext::with(|cx| assert_eq!(cx.lock_count(), 0));
    }

    #[test]
    fn contended_lock_parks_and_resumes() {
        let mutex = Arc::new(RawMutex::new());
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let waiter = thread::spawn(move || {
            c_mutex.lock();
            unsafe { c_mutex.unlock() };
        });
        wait_until(|| mutex.waiters() == 1);
        assert_eq!(mutex.state(), MutexState::Contended);
        unsafe { mutex.unlock() };
        waiter.join().unwrap();
        assert_eq!(mutex.state(), MutexState::Unlocked);
    }

    #[test]
    fn wakes_waiters_in_lifo_order() {
        let mutex = Arc::new(RawMutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        mutex.lock();
        let mut handles = Vec::new();
        for (queued, name) in ["A", "B", "C"].into_iter().enumerate() {
            let c_mutex = Arc::clone(&mutex);
            let c_order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                c_mutex.lock();
                c_order.lock().unwrap().push(name);
                unsafe { c_mutex.unlock() };
            }));
            wait_until(|| mutex.waiters() == queued + 1);
        }
        unsafe { mutex.unlock() };
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), ["C", "B", "A"]);
        assert_eq!(mutex.state(), MutexState::Unlocked);
    }

    // The popped waiter takes the lock, releases it and exits, freeing its
    // context, while the unlocking thread may still be inside `unlock`.
    #[test]
    fn woken_locker_thread_exits_immediately() {
        for _ in 0..100 {
            let mutex = Arc::new(RawMutex::new());
            mutex.lock();
            let c_mutex = Arc::clone(&mutex);
            let waiter = thread::spawn(move || {
                c_mutex.lock();
                unsafe { c_mutex.unlock() };
            });
            wait_until(|| mutex.waiters() == 1);
            unsafe { mutex.unlock() };
            waiter.join().unwrap();
            assert_eq!(mutex.state(), MutexState::Unlocked);
        }
    }

    fn exclusive_increments(threads: usize, iters: usize) {
        let mutex = Arc::new(YieldMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..iters {
                        mutex.lock();
                        // Split load and store: overlapping holders lose updates.
                        let value = counter.load(Relaxed);
                        counter.store(value + 1, Relaxed);
                        unsafe { mutex.unlock() };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Relaxed), threads * iters);
        assert_eq!(mutex.state(), MutexState::Unlocked);
    }

    #[test]
    fn no_lost_updates_two_threads() {
        exclusive_increments(2, 5000);
    }

    #[test]
    fn no_lost_updates_eight_threads() {
        exclusive_increments(8, 2000);
    }

    #[test]
    fn no_lost_updates_sixty_four_threads() {
        exclusive_increments(64, 1000);
    }

    #[test]
    fn unlock_without_lock_is_fatal() {
        let fatal = fatal_of(|| {
            let mutex = RawMutex::new();
            unsafe { mutex.unlock() };
        });
        assert_eq!(fatal, Fatal::LockCount { op: "unlock" });
    }

    #[test]
    fn unlock_by_thread_holding_nothing_is_fatal() {
        let mutex = Arc::new(RawMutex::new());
        mutex.lock();
        let c_mutex = Arc::clone(&mutex);
        let fatal = fatal_of(move || unsafe { c_mutex.unlock() });
        assert_eq!(fatal, Fatal::LockCount { op: "unlock" });
        assert!(mutex.is_locked());
        unsafe { mutex.unlock() };
    }

    #[test]
    fn unlock_of_unlocked_mutex_is_fatal() {
        let fatal = fatal_of(|| {
            let held = RawMutex::new();
            let other = RawMutex::new();
            held.lock();
            unsafe { other.unlock() };
        });
        assert_eq!(fatal, Fatal::UnlockOfUnlocked);
    }

    #[test]
    fn deferred_preempt_is_reasserted_on_last_unlock() {
        let first = RawMutex::new();
        let second = RawMutex::new();
        first.lock();
        second.lock();
        ThreadContext::with(|cx| {
            cx.request_preempt();
            assert!(!cx.preempt_pending());
        });
        unsafe { second.unlock() };
        ThreadContext::with(|cx| assert!(!cx.preempt_pending()));
        unsafe { first.unlock() };
        ThreadContext::with(|cx| {
            assert!(cx.preempt_pending());
            cx.clear_preempt();
        });
    }

    #[test]
    fn word_round_trips_context_address() {
        ThreadContext::with(|cx| {
            let word = Word(Word::locked_by(cx));
            assert!(word.is_locked());
            assert_eq!(word.state(), MutexState::Contended);
            let head = word.head().unwrap();
            assert_eq!(head.as_ptr(), cx.as_ptr());
            // SAFETY: `head` is the current thread's own live context.
            assert_eq!(unsafe { head.as_ref() }.id(), cx.id());
        });
    }

    #[test]
    fn debug_shows_state() {
        let mutex = RawMutex::new();
        assert_eq!(format!("{mutex:?}"), "RawMutex { state: Unlocked }");
    }
}
