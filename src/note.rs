//! One-shot notifications between two worker threads.
//!
//! A [`Note`] carries a single wakeup per session. A session starts with
//! [`Note::clear`], after which exactly one thread calls [`Note::signal`] and
//! exactly one thread waits with [`Note::wait`] or [`Note::timed_wait`],
//! in either order. The waiter parks on its own semaphore, the signaler hands
//! it a count. Starting a new session requires clearing the note again.
//!
//! The state word holds one of three things: empty, the context of the
//! registered waiter, or the woken marker. Bounded waits that reach their
//! deadline must unregister before returning, and may find that a signal
//! raced with the deadline. In that case the signal already granted a count
//! on the waiter's semaphore, which is consumed before returning so that the
//! next session starts with the semaphore and the note in agreement.

use core::fmt::{self, Debug, Formatter};
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use core::time::Duration;
use std::time::Instant;

use crate::cfg::atomic::AtomicUsize;
use crate::context::ThreadContext;
use crate::host::{fatal, host, Fatal};

/// No waiter registered, no signal yet.
const EMPTY: usize = 0;
/// The session's signal fired.
const WOKEN: usize = 1;

/// A one-shot notification.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use semalock::Note;
///
/// let ready = Arc::new(Note::new());
/// let c_ready = Arc::clone(&ready);
///
/// let worker = thread::spawn(move || {
///     // ... reach a safe point ...
///     c_ready.signal();
/// });
///
/// ready.wait();
/// worker.join().expect("thread::spawn failed");
///
/// // Reuse for the next handshake.
/// ready.clear();
/// ```
pub struct Note {
    state: AtomicUsize,
}

impl Note {
    /// Creates a new, cleared note (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { state: AtomicUsize::new(EMPTY) }
    }

    /// Creates a new, cleared and Loom based note (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { state: AtomicUsize::new(EMPTY) }
    }

    /// Starts a new session.
    ///
    /// Must not be called while a thread is waiting on this note.
    pub fn clear(&self) {
        self.state.store(EMPTY, Release);
    }

    /// Returns `true` once this session's signal fired.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Acquire) == WOKEN
    }

    /// Fires this session's signal, waking the waiter if one is parked.
    ///
    /// Signaling twice within a session is fatal, see
    /// [`Fatal::DoubleWakeup`].
    pub fn signal(&self) {
        match self.state.swap(WOKEN, AcqRel) {
            EMPTY => {}
            WOKEN => fatal(Fatal::DoubleWakeup),
            waiter => {
                // SAFETY: A registered waiter stays parked, or about to park,
                // until it consumes the count granted below.
                unsafe { context(waiter) }.wake();
            }
        }
    }

    /// Waits for this session's signal without bound.
    ///
    /// Returns immediately if the signal already fired. Parks the whole worker
    /// thread, so it may only be called from the thread's root context: a
    /// call from within a task is fatal, see [`Fatal::NotOnRoot`].
    pub fn wait(&self) {
        ThreadContext::with(|cx| {
            if !cx.is_root() {
                fatal(Fatal::NotOnRoot { op: "wait" });
            }
            cx.parking();
            if self.register(cx, "wait") {
                cx.park_blocked(None);
            }
        });
    }

    /// Waits for this session's signal for at most `timeout`, or without
    /// bound if `timeout` is `None`.
    ///
    /// Returns `true` if the signal was received and `false` if the timeout
    /// elapsed first. A signal racing with the deadline is never lost: either
    /// this call returns `true`, or the signal found the note unregistered.
    /// Either way the note can be cleared and reused afterwards.
    ///
    /// May only be called from the thread's root context, see
    /// [`timed_wait_from_task`] for waits issued by tasks.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use semalock::Note;
    ///
    /// let note = Note::new();
    /// assert!(!note.timed_wait(Some(Duration::from_millis(1))));
    ///
    /// note.clear();
    /// note.signal();
    /// assert!(note.timed_wait(Some(Duration::from_millis(1))));
    /// ```
    /// [`timed_wait_from_task`]: Note::timed_wait_from_task
    pub fn timed_wait(&self, timeout: Option<Duration>) -> bool {
        ThreadContext::with(|cx| {
            if !cx.is_root() {
                fatal(Fatal::NotOnRoot { op: "timed_wait" });
            }
            self.timed_wait_in(cx, timeout)
        })
    }

    /// Same as [`timed_wait`], for a thread that is running a lightweight
    /// task.
    ///
    /// The wait is announced to the scheduler through
    /// [`Host::enter_blocking`] and [`Host::exit_blocking`], so other tasks
    /// can move to another worker meanwhile. Calling this from the root
    /// context is fatal, see [`Fatal::OnRoot`].
    ///
    /// [`timed_wait`]: Note::timed_wait
    /// [`Host::enter_blocking`]: crate::host::Host::enter_blocking
    /// [`Host::exit_blocking`]: crate::host::Host::exit_blocking
    pub fn timed_wait_from_task(&self, timeout: Option<Duration>) -> bool {
        ThreadContext::with(|cx| {
            if cx.is_root() {
                fatal(Fatal::OnRoot { op: "timed_wait_from_task" });
            }
            host().enter_blocking(cx);
            let signaled = self.timed_wait_in(cx, timeout);
            host().exit_blocking(cx);
            signaled
        })
    }

    /// Registers `cx` as this session's waiter.
    ///
    /// Returns `false` if the signal already fired, in which case there is
    /// nothing to wait for.
    fn register(&self, cx: &ThreadContext, op: &'static str) -> bool {
        match self.state.compare_exchange(EMPTY, cx.as_ptr().expose_provenance(), AcqRel, Acquire) {
            Ok(_) => true,
            Err(WOKEN) => false,
            Err(_) => fatal(Fatal::NoteOutOfSync { op }),
        }
    }

    fn timed_wait_in(&self, cx: &ThreadContext, timeout: Option<Duration>) -> bool {
        cx.parking();
        if !self.register(cx, "timed_wait") {
            return true;
        }
        let deadline = timeout.and_then(|timeout| Some((Instant::now().checked_add(timeout)?, timeout)));
        let Some((deadline, mut remaining)) = deadline else {
            cx.park_blocked(None);
            return true;
        };
        loop {
            if cx.park_blocked(Some(remaining)).is_acquired() {
                // The signal unregistered us when it granted the count.
                return true;
            }
            remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
        }
        self.cancel(cx)
    }

    /// Unregisters `cx` after its deadline passed.
    ///
    /// Returns `true` if a signal won the race against the deadline.
    fn cancel(&self, cx: &ThreadContext) -> bool {
        let me = cx.as_ptr().expose_provenance();
        loop {
            match self.state.load(Acquire) {
                v if v == me => {
                    if self.state.compare_exchange(me, EMPTY, AcqRel, Acquire).is_ok() {
                        log::debug!("thread {}: note wait timed out", cx.id());
                        return false;
                    }
                }
                WOKEN => {
                    // The count is granted, or about to be. Take it so the
                    // semaphore does not carry it into the next session.
                    if !cx.park_blocked(None).is_acquired() {
                        fatal(Fatal::SemaphoreOutOfSync);
                    }
                    log::debug!("thread {}: note signaled at the deadline", cx.id());
                    return true;
                }
                _ => fatal(Fatal::NoteOutOfSync { op: "timed_wait" }),
            }
        }
    }
}

/// Turns a registered state word back into the waiter's context.
///
/// `register` exposed the context's provenance when storing its address.
///
/// # Safety
///
/// `word` must be the address of a live [`ThreadContext`] stored by
/// `register`.
unsafe fn context<'a>(word: usize) -> &'a ThreadContext {
    let cx = ptr::with_exposed_provenance_mut::<ThreadContext>(word);
    // SAFETY: Caller guaranteed that `word` is the address of a live context,
    // which is never null.
    unsafe { NonNull::new_unchecked(cx).as_ref() }
}

impl Default for Note {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Note {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Acquire) {
            EMPTY => "empty",
            WOKEN => "signaled",
            _ => "waiting",
        };
        f.debug_struct("Note").field("state", &format_args!("{state}")).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use proptest::prelude::*;

    use super::{Note, EMPTY, WOKEN};
    use crate::context::ThreadContext;
    use crate::host::Fatal;
    use crate::test::{blocking_calls, fatal_of, install_host, wait_until};

    #[test]
    fn signal_then_wait_returns_immediately() {
        let note = Note::new();
        note.clear();
        note.signal();
        assert!(note.is_signaled());
        note.wait();
        ThreadContext::with(|cx| assert!(!cx.is_blocked()));
    }

    #[test]
    fn wait_then_signal_wakes_once() {
        let note = Arc::new(Note::new());
        let c_note = Arc::clone(&note);
        let (tx, rx) = channel();
        let waiter = thread::spawn(move || {
            c_note.wait();
            tx.send(ThreadContext::with(|cx| cx.parking().available())).unwrap();
        });
        wait_until(|| note.state.load(core::sync::atomic::Ordering::Acquire) != EMPTY);
        note.signal();
        waiter.join().unwrap();
        assert_eq!(rx.recv().unwrap(), 0);
        assert!(note.is_signaled());
    }

    // Each waiter thread exits, freeing its context, right after it is woken.
    #[test]
    fn woken_waiter_thread_exits_immediately() {
        for _ in 0..200 {
            let note = Arc::new(Note::new());
            let c_note = Arc::clone(&note);
            let waiter = thread::spawn(move || c_note.wait());
            let c_note = Arc::clone(&note);
            let signaler = thread::spawn(move || c_note.signal());
            waiter.join().unwrap();
            signaler.join().unwrap();
            assert!(note.is_signaled());
        }
    }

    #[test]
    fn waiter_is_flagged_blocked() {
        let note = Arc::new(Note::new());
        let c_note = Arc::clone(&note);
        let (tx, rx) = channel();
        let waiter = thread::spawn(move || {
            ThreadContext::with(|cx| tx.send(cx.as_ptr().expose_provenance()).unwrap());
            c_note.wait();
        });
        let cx = rx.recv().unwrap();
        wait_until(|| note.state.load(core::sync::atomic::Ordering::Acquire) == cx);
        // SAFETY: The waiter thread is parked and its context is alive.
        wait_until(|| unsafe { super::context(cx) }.is_blocked());
        note.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn double_signal_is_fatal() {
        let fatal = fatal_of(|| {
            let note = Note::new();
            note.clear();
            note.signal();
            note.signal();
        });
        assert_eq!(fatal, Fatal::DoubleWakeup);
    }

    #[test]
    fn clear_allows_next_signal() {
        let note = Note::new();
        note.signal();
        note.clear();
        assert!(!note.is_signaled());
        note.signal();
        assert!(note.timed_wait(Some(Duration::ZERO)));
    }

    #[test]
    fn timed_wait_times_out_and_note_is_reusable() {
        let note = Note::new();
        let timeout = Duration::from_millis(30);
        let start = Instant::now();
        assert!(!note.timed_wait(Some(timeout)));
        assert!(start.elapsed() >= timeout);
        assert_eq!(note.state.load(core::sync::atomic::Ordering::Acquire), EMPTY);
        ThreadContext::with(|cx| assert_eq!(cx.parking().available(), 0));

        note.clear();
        note.signal();
        note.wait();
        assert!(note.is_signaled());
    }

    #[test]
    fn timed_wait_is_woken_before_deadline() {
        let note = Arc::new(Note::new());
        let c_note = Arc::clone(&note);
        let waiter = thread::spawn(move || c_note.timed_wait(Some(Duration::from_secs(30))));
        wait_until(|| note.state.load(core::sync::atomic::Ordering::Acquire) != EMPTY);
        let start = Instant::now();
        note.signal();
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn unbounded_timed_wait() {
        let note = Arc::new(Note::new());
        let c_note = Arc::clone(&note);
        let waiter = thread::spawn(move || c_note.timed_wait(None));
        wait_until(|| note.state.load(core::sync::atomic::Ordering::Acquire) != EMPTY);
        note.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn signal_racing_cancellation_is_consumed() {
        let note = Note::new();
        ThreadContext::with(|cx| {
            assert!(note.register(cx, "timed_wait"));
            // Deadline passed, then the signal lands before unregistering.
            note.signal();
            assert_eq!(note.state.load(core::sync::atomic::Ordering::Acquire), WOKEN);
            assert_eq!(cx.parking().available(), 1);
            assert!(note.cancel(cx));
            assert_eq!(cx.parking().available(), 0);
        });
    }

    #[test]
    fn cancellation_without_signal_unregisters() {
        let note = Note::new();
        ThreadContext::with(|cx| {
            assert!(note.register(cx, "timed_wait"));
            assert!(!note.cancel(cx));
            assert_eq!(note.state.load(core::sync::atomic::Ordering::Acquire), EMPTY);
        });
        note.signal();
        ThreadContext::with(|cx| assert_eq!(cx.parking().available(), 0));
    }

    #[test]
    fn wait_from_task_is_fatal() {
        let fatal = fatal_of(|| {
            let _task = ThreadContext::enter_task();
            Note::new().wait();
        });
        assert_eq!(fatal, Fatal::NotOnRoot { op: "wait" });
    }

    #[test]
    fn timed_wait_from_task_on_root_is_fatal() {
        let fatal = fatal_of(|| {
            Note::new().timed_wait_from_task(Some(Duration::ZERO));
        });
        assert_eq!(fatal, Fatal::OnRoot { op: "timed_wait_from_task" });
    }

    #[test]
    fn wait_on_note_held_by_other_waiter_is_fatal() {
        let note = Arc::new(Note::new());
        let c_note = Arc::clone(&note);
        let first = thread::spawn(move || c_note.wait());
        wait_until(|| note.state.load(core::sync::atomic::Ordering::Acquire) != EMPTY);
        let c_note = Arc::clone(&note);
        let fatal = fatal_of(move || c_note.wait());
        assert_eq!(fatal, Fatal::NoteOutOfSync { op: "wait" });
        note.signal();
        first.join().unwrap();
    }

    #[test]
    fn timed_wait_from_task_enters_blocking_region() {
        install_host();
        thread::spawn(|| {
            let note = Note::new();
            let _task = ThreadContext::enter_task();
            assert!(!note.timed_wait_from_task(Some(Duration::from_millis(5))));
            assert_eq!(blocking_calls(), (1, 1));
            note.clear();
            note.signal();
            assert!(note.timed_wait_from_task(None));
            assert_eq!(blocking_calls(), (2, 2));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn debug_shows_state() {
        let note = Note::new();
        assert_eq!(format!("{note:?}"), "Note { state: empty }");
        note.signal();
        assert_eq!(format!("{note:?}"), "Note { state: signaled }");
    }

    // A single long lived waiter runs every session, so a count left behind
    // on its semaphore by one session shows up in the next.
    #[test]
    fn repeated_deadline_races_keep_semaphore_in_sync() {
        const SESSIONS: u64 = 200;
        let note = Arc::new(Note::new());
        let (go_tx, go_rx) = channel::<()>();
        let (done_tx, done_rx) = channel();
        let c_note = Arc::clone(&note);
        let waiter = thread::spawn(move || {
            for _ in go_rx.iter() {
                let signaled = c_note.timed_wait(Some(Duration::from_micros(500)));
                let leftover = ThreadContext::with(|cx| cx.parking().available());
                done_tx.send((signaled, leftover)).unwrap();
            }
        });
        for session in 0..SESSIONS {
            note.clear();
            go_tx.send(()).unwrap();
            thread::sleep(Duration::from_micros(session * 37 % 1000));
            note.signal();
            let (signaled, leftover) = done_rx.recv().unwrap();
            assert_eq!(leftover, 0, "session {session} left a count behind");
            // Whichever side won, the signal is recorded for the session.
            assert!(note.is_signaled(), "session {session}: {signaled}");
        }
        drop(go_tx);
        waiter.join().unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn deadline_race_has_exactly_one_outcome(jitter_us in 0u64..3000) {
            let note = Arc::new(Note::new());
            let c_note = Arc::clone(&note);
            let waiter = thread::spawn(move || {
                let signaled = c_note.timed_wait(Some(Duration::from_millis(1)));
                let leftover = ThreadContext::with(|cx| cx.parking().available());
                (signaled, leftover)
            });
            thread::sleep(Duration::from_micros(jitter_us));
            note.signal();
            let (signaled, leftover) = waiter.join().unwrap();
            prop_assert_eq!(leftover, 0);
            prop_assert!(note.is_signaled());
            if !signaled {
                // The waiter unregistered before the signal, which then found
                // the note empty and delivered nothing.
                prop_assert_eq!(note.state.load(core::sync::atomic::Ordering::Acquire), WOKEN);
            }
        }
    }
}
