// Modified version of relax.rs from spin-rs, reduced to the strategies used
// by the active spin phase of the runtime mutex.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine the behaviour of locks when encountering
//! contention, and the spin budget that precedes parking.

use crate::cfg::{hint, thread};

/// Number of active spin rounds attempted on multi-worker systems.
pub const ACTIVE_SPIN: u32 = 4;

/// Number of [`Relax::relax`] calls performed by each active spin round.
pub const ACTIVE_SPIN_CNT: u32 = 30;

/// Number of OS yields attempted once active spinning is exhausted.
pub const PASSIVE_SPIN: u32 = 1;

/// A trait implemented by spinning relax strategies.
///
/// # Example
///
/// ```
/// use semalock::relax::Relax;
///
/// struct Spin;
///
/// impl Relax for Spin {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {
///         core::hint::spin_loop();
///     }
/// }
/// ```
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// This is the processor level yield used by the runtime mutex while the
/// holder is expected to release the lock shortly.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A strategy that yields the current time slice to the scheduler in favour of
/// other threads or processes.
///
/// Every active spin iteration turns into a system call, so this is only
/// useful on heavily oversubscribed machines.
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// A strategy that rapidly spins, without telling the CPU to do any powering down.
///
/// You almost certainly do not want to use this. Use [`Spin`] instead. It exists
/// for completeness and for targets that, for some reason, miscompile or do not
/// support spin hint intrinsics despite attempting to generate code for them
/// (i.e: this is a workaround for possible compiler bugs).
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

/// What a contended locker should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Busy-wait for one active spin round.
    Spin,
    /// Give up the time slice to the OS scheduler.
    Yield,
    /// Spin budget is exhausted; queue up and park.
    Park,
}

/// Spin budget of a single contended acquisition.
///
/// The round counter is reset whenever the locker loses a race for an
/// unlocked mutex or is woken from its semaphore.
pub(crate) struct Contention<R> {
    round: u32,
    active: u32,
    relax: R,
}

impl<R: Relax> Contention<R> {
    /// Creates the budget for a system with `ncpu` workers.
    ///
    /// A single worker gets no active spin: nobody else can release the lock
    /// while this thread is running.
    pub fn new(ncpu: usize) -> Self {
        let active = if ncpu > 1 { ACTIVE_SPIN } else { 0 };
        Self { round: 0, active, relax: R::new() }
    }

    /// Returns the action for the current round without consuming it.
    pub fn step(&self) -> Step {
        if self.round < self.active {
            Step::Spin
        } else if self.round < self.active + PASSIVE_SPIN {
            Step::Yield
        } else {
            Step::Park
        }
    }

    /// Performs the current round's spinning action and advances the round.
    ///
    /// Returns `false` once the budget is exhausted, without doing anything.
    pub fn spin(&mut self) -> bool {
        match self.step() {
            Step::Spin => {
                for _ in 0..ACTIVE_SPIN_CNT {
                    self.relax.relax();
                }
            }
            Step::Yield => thread::yield_now(),
            Step::Park => return false,
        }
        self.round += 1;
        true
    }

    /// Restarts the budget from the first round.
    pub fn reset(&mut self) {
        self.round = 0;
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Contention, Relax, Spin, Step, ACTIVE_SPIN, PASSIVE_SPIN};

    fn returns<R: Relax>() {
        let mut relax = R::new();
        for _ in 0..100 {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin>();
    }

    #[test]
    fn yields() {
        returns::<super::Yield>();
    }

    #[test]
    fn loops() {
        returns::<super::Loop>();
    }

    #[test]
    fn multi_worker_spins_then_yields_then_parks() {
        let mut budget = Contention::<Spin>::new(4);
        for _ in 0..ACTIVE_SPIN {
            assert_eq!(budget.step(), Step::Spin);
            assert!(budget.spin());
        }
        for _ in 0..PASSIVE_SPIN {
            assert_eq!(budget.step(), Step::Yield);
            assert!(budget.spin());
        }
        assert_eq!(budget.step(), Step::Park);
        assert!(!budget.spin());
        assert_eq!(budget.step(), Step::Park);
    }

    #[test]
    fn single_worker_skips_active_spin() {
        let mut budget = Contention::<Spin>::new(1);
        assert_eq!(budget.step(), Step::Yield);
        assert!(budget.spin());
        assert_eq!(budget.step(), Step::Park);
    }

    #[test]
    fn reset_restarts_budget() {
        let mut budget = Contention::<Spin>::new(2);
        while budget.spin() {}
        budget.reset();
        assert_eq!(budget.step(), Step::Spin);
    }
}
