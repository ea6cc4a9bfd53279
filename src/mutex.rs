//! A data guarding mutex built on [`RawMutex`].
//!
//! [`Mutex`] pairs a runtime mutex with the value it protects and hands out
//! RAII guards, the same way [`std::sync::Mutex`] does. There is no
//! poisoning: a thread that panics while holding the guard releases the lock
//! during unwinding and the data stays accessible.
//!
//! Guards are not [`Send`]. Lock counts are kept per worker thread, so a
//! guard must be dropped by the thread that created it.
//!
//! [`RawMutex`]: crate::raw::RawMutex

use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::raw::RawMutex;
use crate::relax::Relax;

#[cfg(test)]
use crate::test::{LockData, LockNew, LockThen};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::sync::mpsc::channel;
///
/// use semalock::mutex::spins::Mutex;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically), and
/// // let the main thread know once all increments are done.
/// let data = Arc::new(Mutex::new(0));
///
/// let (tx, rx) = channel();
/// for _ in 0..N {
///     let (data, tx) = (data.clone(), tx.clone());
///     thread::spawn(move || {
///         // The shared state can only be accessed once the lock is held.
///         let mut data = data.lock();
///         *data += 1;
///         if *data == N {
///             tx.send(()).unwrap();
///         }
///         // the lock is unlocked here when `data` goes out of scope.
///     });
/// }
///
/// rx.recv().unwrap();
/// ```
pub struct Mutex<T: ?Sized, R> {
    raw: RawMutex<R>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: ?Sized + Send, R> Send for Mutex<T, R> {}
unsafe impl<T: ?Sized + Send, R> Sync for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Creates a new mutex in an unlocked state ready for use (const).
    ///
    /// # Examples
    ///
    /// ```
    /// use semalock::mutex::spins::Mutex;
    ///
    /// static COUNTER: Mutex<u64> = Mutex::new(0);
    /// *COUNTER.lock() += 1;
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { raw: RawMutex::new(), data: UnsafeCell::new(value) }
    }

    /// Creates a new mutex in an unlocked state ready for use (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    pub fn new(value: T) -> Self {
        Self { raw: RawMutex::new(), data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, R: Relax> Mutex<T, R> {
    /// Acquires this mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// An RAII guard is returned to allow scoped unlock of the lock. When the
    /// guard goes out of scope, the mutex will be unlocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use semalock::mutex::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     *c_mutex.lock() = 10;
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(*mutex.lock(), 10);
    /// ```
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        MutexGuard::new(self)
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// # Examples
    ///
    /// ```
    /// use semalock::mutex::spins::Mutex;
    ///
    /// let mutex = Mutex::new(1);
    /// let value = mutex.lock_then(|mut guard| {
    ///     *guard += 1;
    ///     *guard
    /// });
    /// assert_eq!(value, 2);
    /// ```
    #[inline]
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, R>) -> Ret,
    {
        f(self.lock())
    }
}

impl<T: ?Sized, R> Mutex<T, R> {
    /// Attempts to acquire this mutex without blocking.
    ///
    /// # Examples
    ///
    /// ```
    /// use semalock::mutex::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// let guard = mutex.try_lock().unwrap();
    /// assert!(mutex.try_lock().is_none());
    /// drop(guard);
    /// assert!(mutex.try_lock().is_some());
    /// ```
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.try_lock().then(|| MutexGuard::new(self))
    }

    /// Returns `true` if some thread holds this mutex.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place - the mutable borrow statically guarantees no locks exist.
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default, R> Default for Mutex<T, R> {
    /// Creates a `Mutex<T, R>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, R> From<T> for Mutex<T, R> {
    /// Creates a `Mutex<T, R>` from a instance of `T`.
    #[inline]
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug, R> Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

#[cfg(test)]
impl<T: ?Sized, R> LockNew for Mutex<T, R> {
    type Target = T;

    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized,
    {
        Self::new(value)
    }
}

#[cfg(test)]
impl<T: ?Sized, R: Relax> LockThen for Mutex<T, R> {
    type Guard<'a>
        = MutexGuard<'a, Self::Target, R>
    where
        Self: 'a,
        Self::Target: 'a;

    fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, R>) -> Ret,
    {
        self.lock_then(f)
    }
}

#[cfg(test)]
impl<T: ?Sized, R> LockData for Mutex<T, R> {
    fn get_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be access through this guard via its
/// [`Deref`] and [`DerefMut`] implementations.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, R> {
    lock: &'a Mutex<T, R>,
    // The lock count belongs to the thread that acquired the lock.
    marker: PhantomData<*const ()>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
unsafe impl<T: ?Sized + Sync, R> Sync for MutexGuard<'_, T, R> {}

impl<'a, T: ?Sized, R> MutexGuard<'a, T, R> {
    const fn new(lock: &'a Mutex<T, R>) -> Self {
        Self { lock, marker: PhantomData }
    }
}

impl<T: ?Sized, R> Drop for MutexGuard<'_, T, R> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: A guard instance holds the lock, and it is dropped by the
        // thread that acquired it.
        unsafe { self.lock.raw.unlock() }
    }
}

impl<T: ?Sized, R> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized, R> DerefMut for MutexGuard<'_, T, R> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + Debug, R> Debug for MutexGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: ?Sized + Display, R> Display for MutexGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// A [`Mutex`] that implements the [`Spin`] relax strategy.
///
/// [`Spin`]: crate::relax::Spin
pub mod spins {
    use crate::relax::Spin;

    /// A [`mutex::Mutex`] that implements the [`Spin`] relax strategy.
    ///
    /// [`mutex::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Spin>;

    /// A [`mutex::MutexGuard`] that implements the [`Spin`] relax strategy.
    ///
    /// [`mutex::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Spin>;
}

/// A [`Mutex`] that implements the [`Yield`] relax strategy.
///
/// [`Yield`]: crate::relax::Yield
pub mod yields {
    use crate::relax::Yield;

    /// A [`mutex::Mutex`] that implements the [`Yield`] relax strategy.
    ///
    /// [`mutex::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Yield>;

    /// A [`mutex::MutexGuard`] that implements the [`Yield`] relax strategy.
    ///
    /// [`mutex::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Yield>;
}

/// A [`Mutex`] that implements the [`Loop`] relax strategy.
///
/// [`Loop`]: crate::relax::Loop
pub mod loops {
    use crate::relax::Loop;

    /// A [`mutex::Mutex`] that implements the [`Loop`] relax strategy.
    ///
    /// [`mutex::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Loop>;

    /// A [`mutex::MutexGuard`] that implements the [`Loop`] relax strategy.
    ///
    /// [`mutex::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Loop>;
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::mutex::spins::Mutex;
    use crate::mutex::yields::Mutex as YieldMutex;
    use crate::test::tests;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Mutex<_>>();
    }

    #[test]
    fn lots_and_lots_lock_yields() {
        tests::lots_and_lots_lock::<YieldMutex<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<Mutex<_>>();
    }

    #[test]
    fn test_lock_count_balanced() {
        tests::test_lock_count_balanced::<Mutex<_>>();
    }

    #[test]
    fn test_guard_debug_display() {
        tests::test_guard_debug_display::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_from() {
        tests::test_mutex_from::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_default() {
        tests::test_mutex_default::<Mutex<_>>();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<Mutex<_>, Mutex<_>>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<Mutex<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<Mutex<_>>();
    }

    #[test]
    fn debug_shows_locked() {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert_eq!(format!("{mutex:?}"), "Mutex { data: <locked> }");
        drop(guard);
        assert_eq!(format!("{mutex:?}"), "Mutex { data: 1 }");
    }

    #[test]
    fn into_inner_returns_data() {
        let mutex = Mutex::new(String::from("note"));
        mutex.lock().push('s');
        assert_eq!(mutex.into_inner(), "notes");
    }
}
