use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use loom::cell::{ConstPtr, MutPtr, UnsafeCell};

use crate::raw::RawMutex;
use crate::relax::Relax;

/// A trait for guard types that hold exclusive access to the underlying data
/// behind Loom's [`UnsafeCell`].
///
/// # Safety
///
/// Must guarantee that an instance of the guard holds exclusive access to its
/// underlying data through all its lifetime.
pub unsafe trait Guard: Sized {
    /// The target type after dereferencing [`GuardDeref`] or [`GuardDerefMut`].
    type Target: ?Sized;

    /// Returns a shared reference to the underlying [`UnsafeCell`].
    fn get(&self) -> &UnsafeCell<Self::Target>;

    /// Get a Loom immutable pointer bounded by this guard lifetime.
    fn deref(&self) -> GuardDeref<'_, Self> {
        GuardDeref::new(self)
    }

    /// Get a Loom mutable pointer bounded by this guard lifetime.
    fn deref_mut(&self) -> GuardDerefMut<'_, Self> {
        GuardDerefMut::new(self)
    }
}

/// A Loom immutable pointer borrowed from a guard instance.
pub struct GuardDeref<'a, G: Guard> {
    ptr: ConstPtr<G::Target>,
    marker: PhantomData<(&'a G::Target, &'a G)>,
}

impl<G: Guard> GuardDeref<'_, G> {
    fn new(guard: &G) -> Self {
        let ptr = guard.get().get();
        Self { ptr, marker: PhantomData }
    }
}

impl<G: Guard> Deref for GuardDeref<'_, G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

/// A Loom mutable pointer borrowed from a guard instance.
pub struct GuardDerefMut<'a, G: Guard> {
    ptr: MutPtr<G::Target>,
    marker: PhantomData<(&'a G::Target, &'a G)>,
}

impl<G: Guard> GuardDerefMut<'_, G> {
    fn new(guard: &G) -> Self {
        let ptr = guard.get().get_mut();
        Self { ptr, marker: PhantomData }
    }
}

impl<G: Guard> Deref for GuardDerefMut<'_, G> {
    type Target = G::Target;

    fn deref(&self) -> &Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

impl<G: Guard> DerefMut for GuardDerefMut<'_, G> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: Our lifetime is bounded by the guard borrow.
        unsafe { self.ptr.deref() }
    }
}

/// A [`RawMutex`] paired with data behind Loom's [`UnsafeCell`], so that the
/// models can check the mutex actually serializes accesses.
pub struct Guarded<T, R> {
    raw: RawMutex<R>,
    data: UnsafeCell<T>,
}

impl<T, R> Guarded<T, R> {
    pub fn new(value: T) -> Self {
        Self { raw: RawMutex::new(), data: UnsafeCell::new(value) }
    }
}

impl<T, R: Relax> Guarded<T, R> {
    /// Runs `f` with the raw mutex held.
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&Held<'_, T, R>) -> Ret,
    {
        self.raw.lock();
        let held = Held { lock: self };
        f(&held)
    }
}

/// Exclusive access to a [`Guarded`] value, released on drop.
pub struct Held<'a, T, R> {
    lock: &'a Guarded<T, R>,
}

impl<T, R> Drop for Held<'_, T, R> {
    fn drop(&mut self) {
        // SAFETY: A `Held` only exists while this thread holds the lock.
        unsafe { self.lock.raw.unlock() }
    }
}

// SAFETY: A `Held` instance holds the raw lock until it is dropped.
unsafe impl<T, R> Guard for Held<'_, T, R> {
    type Target = T;

    fn get(&self) -> &UnsafeCell<Self::Target> {
        &self.lock.data
    }
}

pub mod models {
    use core::array;
    use core::time::Duration;

    use loom::sync::atomic::AtomicUsize;
    use loom::sync::atomic::Ordering::Relaxed;
    use loom::sync::Arc;
    use loom::{model, thread};

    use super::{Guard, Guarded};
    use crate::context::ThreadContext;
    use crate::note::Note;
    use crate::relax::Relax;

    type Int = usize;
    const LOCKS: Int = 3;

    /// Increments a shared integer.
    fn inc<R: Relax>(lock: &Guarded<Int, R>) {
        lock.lock_then(|guard| *guard.deref_mut() += 1);
    }

    /// Get the shared integer.
    fn get<R: Relax>(lock: &Guarded<Int, R>) -> Int {
        lock.lock_then(|guard| *guard.deref())
    }

    /// Evaluates that concurrent `lock` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn lock_join<R: Relax + 'static>() {
        model(|| {
            const RUNS: Int = LOCKS;
            let data = Arc::new(Guarded::<Int, R>::new(0));
            let handles: [_; RUNS] = array::from_fn(|_| {
                let data = Arc::clone(&data);
                thread::spawn(move || inc(&data))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let data = get(&data);
            assert_eq!(RUNS, data);
        });
    }

    /// Evaluates that the waiter always observes the write that preceded the
    /// signal, in whichever order the two threads arrive.
    pub fn note_wait_signal() {
        model(|| {
            let note = Arc::new(Note::new());
            let data = Arc::new(AtomicUsize::new(0));
            let c_note = Arc::clone(&note);
            let c_data = Arc::clone(&data);
            let signaler = thread::spawn(move || {
                c_data.store(1, Relaxed);
                c_note.signal();
            });
            note.wait();
            assert_eq!(data.load(Relaxed), 1);
            signaler.join().unwrap();
        });
    }

    /// Evaluates that a bounded wait racing with the signal ends with exactly
    /// one outcome, and leaves no count behind on the waiter's semaphore.
    pub fn note_deadline_race() {
        model(|| {
            let note = Arc::new(Note::new());
            let c_note = Arc::clone(&note);
            let signaler = thread::spawn(move || c_note.signal());
            note.timed_wait(Some(Duration::ZERO));
            signaler.join().unwrap();
            assert!(note.is_signaled());
            ThreadContext::with(|cx| assert_eq!(cx.parking().available(), 0));
        });
    }
}

#[cfg(test)]
mod test {
    use super::models;
    use crate::relax::{Spin, Yield};

    #[test]
    fn lock_join_spins() {
        models::lock_join::<Spin>();
    }

    #[test]
    fn lock_join_yields() {
        models::lock_join::<Yield>();
    }

    #[test]
    fn note_wait_signal() {
        models::note_wait_signal();
    }

    #[test]
    fn note_deadline_race() {
        models::note_deadline_race();
    }
}
