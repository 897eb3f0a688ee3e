//! Queueing and sleep locks (tiers 3 and 4)
//!
//! Both keep a FIFO of blocked waiters next to the lock word. Release hands
//! ownership straight to the head waiter, so the lock never looks free while
//! someone is queued and a newcomer cannot overtake the queue.
//!
//! They differ only in what a contender does first: a [`QueueLock`] polls the
//! word `Config::qlock_spin` times in case the holder is about to finish (an
//! interrupt handler or a preempting tick may release it), a [`SleepLock`]
//! queues immediately.

use core::sync::atomic::{AtomicU16, Ordering};

use heapless::Deque;
use spin::Mutex;

use crate::arch::Hal;
use crate::config::MAX_TASKS;
use crate::kern::lock::{check_release, owner_tag, Lock, LockSched, RawLock, Tier};
use crate::kern::lockword::LockWord;
use crate::types::TaskId;

/// Lock word plus FIFO of waiting tasks
#[derive(Debug)]
pub struct WaitQueueLock {
    word: AtomicU16,
    waiters: Mutex<Deque<TaskId, MAX_TASKS>>,
}

impl WaitQueueLock {
    /// Create an unlocked lock with no waiters
    pub const fn new() -> Self {
        Self {
            word: AtomicU16::new(LockWord::UNLOCKED),
            waiters: Mutex::new(Deque::new()),
        }
    }

    /// Decoded lock word
    pub fn word(&self) -> LockWord {
        LockWord::decode(self.word.load(Ordering::Acquire))
    }

    /// Queued tasks, head first
    pub fn waiters(&self) -> heapless::Vec<TaskId, MAX_TASKS> {
        self.waiters.lock().iter().copied().collect()
    }

    fn attempt<S: LockSched>(&self, sched: &S) -> bool {
        let held = LockWord::held_by(owner_tag(sched)).encode();
        sched
            .hal()
            .compare_exchange_u16(&self.word, LockWord::UNLOCKED, held)
            .is_ok()
    }

    fn owned_by(&self, id: TaskId) -> bool {
        let word = self.word();
        word.locked && word.owner == id.0
    }

    fn acquire<S: LockSched>(&self, sched: &S, tier: Tier, spin: u32) {
        sched.check_order(tier);
        if self.attempt(sched) {
            sched.note_acquire(tier);
            return;
        }
        for _ in 0..spin {
            core::hint::spin_loop();
            if self.attempt(sched) {
                sched.note_acquire(tier);
                return;
            }
        }
        sched.note_contention();

        let Some(me) = sched.current() else {
            // Boot code has no task to queue; poll until free
            while !self.attempt(sched) {
                core::hint::spin_loop();
            }
            sched.note_acquire(tier);
            return;
        };

        let hal = sched.hal();
        let irq = hal.irq_save();
        let queued = if self.attempt(sched) {
            false
        } else {
            let mut waiters = self.waiters.lock();
            let pushed = waiters.push_back(me);
            debug_assert!(pushed.is_ok(), "{me} queued twice");
            let mut word = self.word();
            word.waiters = waiters.len() as u8;
            hal.swap_u16(&self.word, word.encode());
            true
        };
        hal.irq_restore(irq);

        if queued {
            log::trace!("{} queued on {:?} lock", me, tier);
            while !self.owned_by(me) {
                sched.park();
            }
        }
        sched.note_acquire(tier);
    }

    fn release<S: LockSched>(&self, sched: &S, tier: Tier) {
        if !check_release(sched, tier, self.word.load(Ordering::Acquire)) {
            return;
        }

        let hal = sched.hal();
        let irq = hal.irq_save();
        let next = {
            let mut waiters = self.waiters.lock();
            let next = waiters.pop_front();
            let word = match next {
                Some(id) => LockWord {
                    locked: true,
                    waiters: waiters.len() as u8,
                    owner: id.0,
                }
                .encode(),
                None => LockWord::UNLOCKED,
            };
            hal.swap_u16(&self.word, word);
            next
        };
        hal.irq_restore(irq);

        sched.note_release(tier);
        if let Some(id) = next {
            log::trace!("{:?} lock handed to {}", tier, id);
            sched.unpark(id);
        }
    }
}

impl Default for WaitQueueLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Tier 3 lock state: short poll, then FIFO blocking
#[derive(Debug, Default)]
pub struct RawQueue(WaitQueueLock);

/// Tier 4 lock state: FIFO blocking without polling
#[derive(Debug, Default)]
pub struct RawSleep(WaitQueueLock);

impl RawQueue {
    /// Lock word and waiters
    pub fn inner(&self) -> &WaitQueueLock {
        &self.0
    }
}

impl RawSleep {
    /// Lock word and waiters
    pub fn inner(&self) -> &WaitQueueLock {
        &self.0
    }
}

impl RawLock for RawQueue {
    const TIER: Tier = Tier::Queue;
    #[allow(clippy::declare_interior_mutable_const)]
    const UNLOCKED: Self = RawQueue(WaitQueueLock::new());

    fn acquire<S: LockSched>(&self, sched: &S) {
        self.0.acquire(sched, Self::TIER, sched.config().qlock_spin);
    }

    fn try_acquire<S: LockSched>(&self, sched: &S) -> bool {
        if !self.0.attempt(sched) {
            return false;
        }
        sched.check_order(Self::TIER);
        sched.note_acquire(Self::TIER);
        true
    }

    fn release<S: LockSched>(&self, sched: &S) {
        self.0.release(sched, Self::TIER);
    }

    fn is_locked(&self) -> bool {
        self.0.word().locked
    }
}

impl RawLock for RawSleep {
    const TIER: Tier = Tier::Sleep;
    #[allow(clippy::declare_interior_mutable_const)]
    const UNLOCKED: Self = RawSleep(WaitQueueLock::new());

    fn acquire<S: LockSched>(&self, sched: &S) {
        self.0.acquire(sched, Self::TIER, 0);
    }

    fn try_acquire<S: LockSched>(&self, sched: &S) -> bool {
        if !self.0.attempt(sched) {
            return false;
        }
        sched.check_order(Self::TIER);
        sched.note_acquire(Self::TIER);
        true
    }

    fn release<S: LockSched>(&self, sched: &S) {
        self.0.release(sched, Self::TIER);
    }

    fn is_locked(&self) -> bool {
        self.0.word().locked
    }
}

/// Tier 3 lock around data
pub type QueueLock<T> = Lock<RawQueue, T>;

/// Tier 4 lock around data
pub type SleepLock<T> = Lock<RawSleep, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostHal;
    use crate::error::KernError;
    use crate::kern::lock::FastLock;
    use crate::kern::sched_prim::Kernel;
    use crate::kern::task::{TaskState, WaitReason};
    use crate::testing::{boot, hammer, stack, Trace};
    use crate::types::Priority;
    use std::sync::Arc;

    type K = Kernel<HostHal>;

    static FIFO: Trace = Trace::new();
    static FIFO_LOCK: QueueLock<u32> = QueueLock::new(0);

    fn contender(k: &'static K, n: usize) {
        let mut guard = FIFO_LOCK.lock(k);
        FIFO.record(n);
        *guard += 1;
        // Hold across a yield so the others queue up behind us
        k.yield_now();
    }

    #[test]
    fn test_qlock_fifo_handoff() {
        let k = boot();
        for n in 0..3 {
            k.spawn(contender, n, Priority::NORMAL, stack()).unwrap();
        }
        k.run();

        assert_eq!(FIFO.take(), [0, 1, 2]);
        assert!(!FIFO_LOCK.is_locked());
        assert_eq!(*FIFO_LOCK.lock(k), 3);
        assert_eq!(k.stats().lock_contended, 2);
    }

    static LATE: Trace = Trace::new();
    static LATE_LOCK: SleepLock<()> = SleepLock::new(());

    fn holder(k: &'static K, _: usize) {
        let guard = LATE_LOCK.lock(k);
        LATE.record(0);
        k.yield_now(); // task 1 queues, task 2 yields back
        assert_eq!(LATE_LOCK.raw().inner().waiters().as_slice(), &[TaskId(1)]);
        assert_eq!(LATE_LOCK.raw().inner().word().waiters, 1);
        drop(guard);
        LATE.record(0);
    }

    fn queued(k: &'static K, n: usize) {
        let _guard = LATE_LOCK.lock(k);
        LATE.record(n);
    }

    fn newcomer(k: &'static K, n: usize) {
        k.yield_now();
        // Released, but already handed to task 1
        assert_eq!(LATE_LOCK.raw().inner().word().owner, 1);
        assert_eq!(LATE_LOCK.try_lock(k).err(), Some(KernError::WouldBlock));
        LATE.record(n);
    }

    #[test]
    fn test_slock_blocks_and_hands_off() {
        let k = boot();
        k.spawn(holder, 0, Priority::NORMAL, stack()).unwrap();
        k.spawn(queued, 1, Priority::NORMAL, stack()).unwrap();
        k.spawn(newcomer, 2, Priority::NORMAL, stack()).unwrap();
        k.run();

        assert_eq!(LATE.take(), [0, 0, 2, 1]);
        assert_eq!(k.task(TaskId(1)).unwrap().state(), TaskState::Zombie);
    }

    static FLOCK: FastLock<()> = FastLock::new(());
    static FLOCK_TRACE: Trace = Trace::new();

    fn flock_first(k: &'static K, _: usize) {
        let guard = FLOCK.lock(k);
        FLOCK_TRACE.record(1);
        k.yield_now();
        FLOCK_TRACE.record(2);
        drop(guard);
    }

    fn flock_second(k: &'static K, _: usize) {
        assert_eq!(FLOCK.try_lock(k).err(), Some(KernError::WouldBlock));
        FLOCK_TRACE.record(10);
        let _guard = FLOCK.lock(k);
        FLOCK_TRACE.record(11);
    }

    #[test]
    fn test_flock_contender_waits_for_release() {
        let k = boot();
        k.spawn(flock_first, 0, Priority::NORMAL, stack()).unwrap();
        k.spawn(flock_second, 1, Priority::NORMAL, stack()).unwrap();
        k.run();

        assert_eq!(FLOCK_TRACE.take(), [1, 10, 2, 11]);
    }

    static ORDER_LOCK: SleepLock<()> = SleepLock::new(());
    static ORDER_INNER: QueueLock<()> = QueueLock::new(());

    fn backwards(k: &'static K, _: usize) {
        let _outer = ORDER_LOCK.lock(k);
        let _inner = ORDER_INNER.lock(k);
    }

    #[test]
    #[should_panic(expected = "acquiring Queue lock while holding Sleep lock")]
    fn test_tier_order_checked_by_kernel() {
        let k = boot();
        k.spawn(backwards, 0, Priority::NORMAL, stack()).unwrap();
        k.run();
    }

    static HELD: QueueLock<()> = QueueLock::new(());
    static HELD_TRACE: Trace = Trace::new();

    fn grab(k: &'static K, n: usize) {
        let _guard = HELD.lock(k);
        HELD_TRACE.record(n);
        k.yield_now();
    }

    fn watch(k: &'static K, n: usize) {
        let waiter = k.task(TaskId(1)).unwrap();
        assert_eq!(waiter.state(), TaskState::Blocked);
        assert_eq!(waiter.wait_reason(), WaitReason::Lock);
        assert_eq!(HELD.raw().inner().word().owner, 0);
        HELD_TRACE.record(n);
    }

    #[test]
    fn test_blocked_waiter_reason() {
        let k = boot();
        k.spawn(grab, 0, Priority::NORMAL, stack()).unwrap();
        k.spawn(grab, 1, Priority::NORMAL, stack()).unwrap();
        k.spawn(watch, 2, Priority::NORMAL, stack()).unwrap();
        let summary = k.run();

        assert_eq!(HELD_TRACE.take(), [0, 2, 1]);
        assert_eq!(summary.live, 0);
        assert!(!HELD.is_locked());
    }

    #[test]
    fn test_qlock_mutual_exclusion() {
        hammer(Arc::new(QueueLock::new(0)));
    }

    #[test]
    fn test_slock_mutual_exclusion() {
        hammer(Arc::new(SleepLock::new(0)));
    }
}
