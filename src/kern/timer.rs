//! Kernel Timer - tick handling, sleep and preemption control
//!
//! The HAL calls [`Kernel::tick`] at `Config::tick_hz`. Each tick advances
//! the tick counter, wakes sleepers whose deadline arrived and, when
//! preemption is enabled, rotates the running task once it has used up its
//! quantum. Rotation is the same queue operation as a voluntary yield.
//!
//! ## Wake order
//!
//! Sleepers whose deadlines fall on the same tick join the ready queue tail
//! together, ordered by priority and then by task id.

use core::sync::atomic::Ordering;

use crate::arch::Hal;
use crate::error::{KernError, KernResult};
use crate::kern::sched_prim::Kernel;
use crate::kern::task::{TaskState, WaitReason};
use crate::types::Tick;

/// Longest sleep; deadlines further out would read as already passed
pub const MAX_SLEEP_TICKS: u32 = i32::MAX as u32;

/// Wake deadline for a sleep of `ticks` starting at `now`
pub(crate) const fn sleep_deadline(now: Tick, ticks: u32) -> Tick {
    let ticks = if ticks > MAX_SLEEP_TICKS {
        MAX_SLEEP_TICKS
    } else {
        ticks
    };
    now.after(ticks)
}

impl<H: Hal> Kernel<H> {
    /// Timer interrupt body
    pub fn tick(&self) {
        self.masked(|| {
            let mut st = self.sched.lock();
            st.now = st.now.after(1);
            self.counters.ticks.inc();

            let now = st.now;
            for id in st.tasks.due_sleepers(now) {
                st.make_ready(id);
            }

            let Some(cur) = st.current else {
                return;
            };
            st.slice = st.slice.saturating_add(1);
            let expired = self.config().preemption
                && st.slice >= self.config().quantum_ticks
                && self.preempt_off.load(Ordering::Acquire) == 0
                && !st.ready.is_empty();
            if expired {
                log::trace!("preempt {} at tick {}", cur, now.0);
                st.tcb(cur).state = TaskState::Ready;
                st.ready.push(cur);
                self.switch_from(st, cur);
            }
        });
    }

    /// Block the running task for `ticks` timer ticks
    ///
    /// The task becomes ready again on the tick its deadline is reached and
    /// queues behind tasks that were already ready. `sleep(0)` is a yield;
    /// sleeps longer than [`MAX_SLEEP_TICKS`] are cut to it.
    pub fn sleep(&self, ticks: u32) -> KernResult<()> {
        if ticks == 0 {
            self.yield_now();
            return Ok(());
        }
        self.masked(|| {
            let mut st = self.sched.lock();
            let cur = st.current.ok_or(KernError::NoCurrentTask)?;
            let deadline = sleep_deadline(st.now, ticks);
            st.block(cur, WaitReason::Sleep(deadline));
            self.switch_from(st, cur);
            Ok(())
        })
    }

    /// Enter a section the timer must not preempt; nests
    pub fn preempt_disable(&self) {
        self.preempt_off.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a section entered with [`Kernel::preempt_disable`]
    pub fn preempt_enable(&self) {
        let prev = self.preempt_off.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "preempt_enable without preempt_disable");
    }

    /// Whether the timer may preempt right now
    pub fn preemptible(&self) -> bool {
        self.preempt_off.load(Ordering::Acquire) == 0
    }

    /// Non-preemptible section for the lifetime of the guard
    pub fn no_preempt(&self) -> NoPreempt<'_, H> {
        self.preempt_disable();
        NoPreempt { kernel: self }
    }
}

/// Guard returned by [`Kernel::no_preempt`]
pub struct NoPreempt<'a, H: Hal> {
    kernel: &'a Kernel<H>,
}

impl<H: Hal> Drop for NoPreempt<'_, H> {
    fn drop(&mut self) {
        self.kernel.preempt_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostHal;
    use crate::config::Config;
    use crate::testing::{boot, boot_with, stack, Trace};
    use crate::types::{Priority, TaskId};

    type K = Kernel<HostHal>;

    #[test]
    fn test_long_sleep_is_clamped() {
        for now in [Tick(0), Tick(5), Tick(u32::MAX - 3)] {
            let deadline = sleep_deadline(now, u32::MAX);
            assert_eq!(deadline, now.after(MAX_SLEEP_TICKS));
            assert!(!now.after(1).reached(deadline));
            assert!(!now.after(MAX_SLEEP_TICKS - 1).reached(deadline));
            assert!(now.after(MAX_SLEEP_TICKS).reached(deadline));
        }
        assert_eq!(sleep_deadline(Tick(7), 3), Tick(10));
    }

    static WAKE: Trace = Trace::new();

    fn sleeper(k: &'static K, _: usize) {
        WAKE.record(100);
        k.sleep(3).unwrap();
        WAKE.record(100 + k.now().0 as usize);
    }

    fn busy(k: &'static K, n: usize) {
        for _ in 0..4 {
            WAKE.record(n);
            // Task 1 doubles as the timer
            if n == 1 {
                k.hal().fire_tick();
            }
            k.yield_now();
        }
    }

    #[test]
    fn test_sleep_wakes_in_fifo_position() {
        let k = boot();
        k.spawn(sleeper, 0, Priority::NORMAL, stack()).unwrap();
        k.spawn(busy, 1, Priority::NORMAL, stack()).unwrap();
        k.spawn(busy, 2, Priority::NORMAL, stack()).unwrap();
        k.run();

        // Tick 3 fires while task 1 runs its third round; the sleeper queues
        // behind task 2 and ahead of task 1.
        assert_eq!(WAKE.take(), [100, 1, 2, 1, 2, 1, 2, 103, 1, 2]);
    }

    static IDLE_WAKE: Trace = Trace::new();

    fn nap(k: &'static K, n: usize) {
        k.sleep(n as u32).unwrap();
        IDLE_WAKE.record(n);
    }

    #[test]
    fn test_idle_drives_sleepers() {
        let k = boot();
        k.spawn(nap, 5, Priority::NORMAL, stack()).unwrap();
        k.spawn(nap, 2, Priority::NORMAL, stack()).unwrap();
        let summary = k.run();

        assert_eq!(IDLE_WAKE.take(), [2, 5]);
        assert_eq!(summary.now, Tick(5));
        assert_eq!(k.stats().ticks, 5);
    }

    static SAME_TICK: Trace = Trace::new();

    fn nap_three(k: &'static K, n: usize) {
        k.sleep(3).unwrap();
        SAME_TICK.record(n);
    }

    #[test]
    fn test_same_tick_wake_by_priority_then_id() {
        let k = boot();
        k.spawn(nap_three, 0, Priority(20), stack()).unwrap();
        k.spawn(nap_three, 1, Priority(5), stack()).unwrap();
        k.spawn(nap_three, 2, Priority(20), stack()).unwrap();
        k.run();

        assert_eq!(SAME_TICK.take(), [1, 0, 2]);
    }

    static SPIN: Trace = Trace::new();

    fn spinner(k: &'static K, n: usize) {
        for round in 0..2 {
            SPIN.record(n * 10 + round);
            // Never yields; only the timer moves it
            for _ in 0..2 {
                k.hal().fire_tick();
            }
        }
    }

    #[test]
    fn test_preemption_rotates_after_quantum() {
        let k = boot_with(Config::DEFAULT.preemptive(2));
        k.spawn(spinner, 1, Priority::NORMAL, stack()).unwrap();
        k.spawn(spinner, 2, Priority::NORMAL, stack()).unwrap();
        k.run();

        assert_eq!(SPIN.take(), [10, 20, 11, 21]);
    }

    static PINNED: Trace = Trace::new();

    fn pinned(k: &'static K, n: usize) {
        let guard = k.no_preempt();
        assert!(!k.preemptible());
        for round in 0..3 {
            PINNED.record(n * 10 + round);
            k.hal().fire_tick();
            k.hal().fire_tick();
        }
        drop(guard);
        assert!(k.preemptible());
    }

    #[test]
    fn test_no_preempt_section_is_not_rotated() {
        let k = boot_with(Config::DEFAULT.preemptive(1));
        k.spawn(pinned, 1, Priority::NORMAL, stack()).unwrap();
        k.spawn(pinned, 2, Priority::NORMAL, stack()).unwrap();
        k.run();

        assert_eq!(PINNED.take(), [10, 11, 12, 20, 21, 22]);
    }

    #[test]
    fn test_sleep_outside_task() {
        let k = boot();
        assert_eq!(k.sleep(1), Err(KernError::NoCurrentTask));
        assert_eq!(k.current_id(), None::<TaskId>);
    }
}
