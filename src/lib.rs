//! Blocking primitives for the worker threads of a user-space scheduler.
//!
//! This crate provides the two synchronization building blocks a runtime
//! needs underneath its own scheduler, where neither the scheduler's queues
//! nor a futex-like facility can be assumed:
//!
//! - a [`RawMutex`] that spins briefly under contention and then parks the
//!   calling OS thread on a per thread semaphore; and
//! - a one-shot [`Note`] that lets one thread sleep, optionally with a
//!   timeout, until another thread signals it.
//!
//! Both primitives are a single machine word and never allocate. The only
//! per thread resource is a lazily created semaphore held by the calling
//! thread's [`ThreadContext`], which also serves as the node of the mutex
//! wait queue and as the registered waiter of a note.
//!
//! ## Mutex
//!
//! Lock acquisition first tries a single compare and swap. Under contention
//! the thread actively spins for a few rounds on multi processor machines,
//! then yields its time slice, and finally pushes itself on the mutex's wait
//! stack and parks. Unlocking pops the most recently queued waiter and wakes
//! it; the woken thread competes for the lock again, so acquisition is not
//! fair.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! // Spins with a CPU hint before parking.
//! use semalock::mutex::spins::Mutex;
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let c_mutex = Arc::clone(&mutex);
//!
//! thread::spawn(move || {
//!     *c_mutex.lock() = 10;
//! })
//! .join().expect("thread::spawn failed");
//!
//! assert_eq!(*mutex.lock(), 10);
//! ```
//!
//! ## Notes
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use semalock::Note;
//!
//! let note = Arc::new(Note::new());
//! let c_note = Arc::clone(&note);
//!
//! let waiter = thread::spawn(move || c_note.timed_wait(Some(Duration::from_secs(5))));
//! note.signal();
//! assert!(waiter.join().expect("thread::spawn failed"));
//! ```
//!
//! ## Host integration
//!
//! The surrounding runtime plugs in through the [`Host`] trait: it reports
//! the processor count, gets notified when a task enters or leaves a
//! blocking wait, and decides what happens on a fatal misuse such as
//! unlocking an unlocked mutex. The default host aborts the process after
//! logging the error. See the [`host`] module.
//!
//! [`RawMutex`]: raw::RawMutex
//! [`Host`]: host::Host

#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod host;
pub mod mutex;
pub mod raw;
pub mod relax;
pub mod sema;

mod cfg;
mod context;
mod note;

pub use context::{TaskGuard, ThreadContext};
pub use note::Note;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
