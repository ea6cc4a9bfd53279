//! Switch point between the `std` primitives and their Loom counterparts.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;
}

/// Number of processors available to the process, cached after the first
/// call.
///
/// Loom models always report a single processor, which removes the active
/// spin phase from every explored execution.
#[cfg(not(all(loom, test)))]
pub fn ncpu() -> usize {
    use std::sync::OnceLock;

    static NCPU: OnceLock<usize> = OnceLock::new();
    *NCPU.get_or_init(|| std::thread::available_parallelism().map_or(1, usize::from))
}

#[cfg(all(loom, test))]
pub fn ncpu() -> usize {
    1
}
