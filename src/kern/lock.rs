//! Locking Primitives
//!
//! Four lock tiers, ordered by how long they may be held and what a
//! contender does while it waits:
//!
//! | Tier | Type                                   | Contender            |
//! |------|----------------------------------------|----------------------|
//! | 1    | [`SpinLock`]                           | busy-waits           |
//! | 2    | [`FastLock`]                           | spins, then yields   |
//! | 3    | [`QueueLock`](super::qlock::QueueLock) | polls, then blocks   |
//! | 4    | [`SleepLock`](super::qlock::SleepLock) | blocks at once       |
//!
//! A task acquires tiers in non-decreasing order: while it holds a lock of
//! some tier it must not take a lock of a lower tier. The scheduler tracks
//! held tiers per task and reports a [`Violation::TierOrder`] otherwise.
//!
//! Every lock is generic over a [`LockSched`], the scheduler seam that names
//! the running task, yields, and parks/unparks waiters. `Kernel` implements
//! it; the tier 1 lock can also be used from interrupt handlers through
//! [`RawSpin::spin_lock`], which only needs the HAL.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use crate::arch::Hal;
use crate::config::Config;
use crate::error::{violation, KernError, KernResult, Violation};
use crate::kern::lockword::{LockWord, ANONYMOUS};
use crate::types::TaskId;

// ============================================================================
// Tiers and the scheduler seam
// ============================================================================

/// Lock tier, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tier {
    Spin = 1,
    Fast = 2,
    Queue = 3,
    Sleep = 4,
}

impl Tier {
    /// All tiers in acquisition order
    pub const ALL: [Tier; 4] = [Tier::Spin, Tier::Fast, Tier::Queue, Tier::Sleep];

    /// Zero-based index for per-tier tables
    pub const fn index(self) -> usize {
        self as usize - 1
    }
}

/// What locks need from the scheduler
pub trait LockSched {
    type Hal: Hal;

    /// Hardware primitives
    fn hal(&self) -> &Self::Hal;

    /// Spin budgets
    fn config(&self) -> &Config;

    /// Task executing right now, `None` in boot code or interrupts
    fn current(&self) -> Option<TaskId>;

    /// Let other ready tasks run
    fn yield_now(&self);

    /// Block the current task until [`LockSched::unpark`]
    ///
    /// Returns at once if an unpark arrived since the last park.
    fn park(&self);

    /// Make a parked task ready, or leave it a wake token
    fn unpark(&self, id: TaskId);

    /// Report a violation if taking `tier` breaks the tier order
    fn check_order(&self, tier: Tier);

    /// Record that the current task now holds a `tier` lock
    fn note_acquire(&self, tier: Tier);

    /// Record that the current task released a `tier` lock
    fn note_release(&self, tier: Tier);

    /// Count a contended acquisition
    fn note_contention(&self) {}

    /// Report a protocol violation
    fn report(&self, v: Violation) {
        violation(v);
    }
}

/// Owner tag for the lock word: the running task id or [`ANONYMOUS`]
pub fn owner_tag<S: LockSched + ?Sized>(sched: &S) -> u8 {
    sched.current().map_or(ANONYMOUS, |id| id.0)
}

/// Lock state machine of one tier, without the protected data
pub trait RawLock {
    /// Tier of this lock kind
    const TIER: Tier;

    /// A free lock
    const UNLOCKED: Self;

    /// Acquire, waiting as long as needed
    fn acquire<S: LockSched>(&self, sched: &S);

    /// Acquire only if free
    fn try_acquire<S: LockSched>(&self, sched: &S) -> bool;

    /// Release a lock held by the current task
    ///
    /// Releasing a free lock or someone else's lock is a violation and
    /// leaves the lock unchanged.
    fn release<S: LockSched>(&self, sched: &S);

    /// Whether someone holds the lock
    fn is_locked(&self) -> bool;
}

/// Release check shared by the word-based tiers
///
/// Returns `true` when the current task may release a lock whose word is
/// `raw`; otherwise reports the violation.
pub(crate) fn check_release<S: LockSched>(sched: &S, tier: Tier, raw: u16) -> bool {
    let word = LockWord::decode(raw);
    if !word.locked {
        sched.report(Violation::NotLocked(tier));
        return false;
    }
    if word.owner != owner_tag(sched) {
        sched.report(Violation::NotOwner(tier));
        return false;
    }
    true
}

// ============================================================================
// Lock with data
// ============================================================================

/// Data guarded by a lock of tier `R::TIER`
pub struct Lock<R: RawLock, T: ?Sized> {
    raw: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock + Sync, T: ?Sized + Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock + Send, T: ?Sized + Send> Send for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    /// Create an unlocked lock around `value`
    pub const fn new(value: T) -> Self {
        Self {
            raw: R::UNLOCKED,
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<R: RawLock, T: ?Sized> Lock<R, T> {
    /// Acquire the lock, waiting according to its tier
    pub fn lock<'a, S: LockSched>(&'a self, sched: &'a S) -> LockGuard<'a, R, T, S> {
        self.raw.acquire(sched);
        LockGuard {
            lock: self,
            sched,
            _not_send: PhantomData,
        }
    }

    /// Acquire the lock if it is free
    pub fn try_lock<'a, S: LockSched>(&'a self, sched: &'a S) -> KernResult<LockGuard<'a, R, T, S>> {
        if self.raw.try_acquire(sched) {
            Ok(LockGuard {
                lock: self,
                sched,
                _not_send: PhantomData,
            })
        } else {
            Err(KernError::WouldBlock)
        }
    }

    /// Whether the lock is held
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// The underlying lock state
    pub fn raw(&self) -> &R {
        &self.raw
    }

    /// Access the data through a unique reference
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<R: RawLock, T: ?Sized> fmt::Debug for Lock<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("tier", &R::TIER)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard; releases the lock on drop
pub struct LockGuard<'a, R: RawLock, T: ?Sized, S: LockSched> {
    lock: &'a Lock<R, T>,
    sched: &'a S,
    // The owner is a task; the guard must stay with it
    _not_send: PhantomData<*const ()>,
}

impl<R: RawLock, T: ?Sized, S: LockSched> Deref for LockGuard<'_, R, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T: ?Sized, S: LockSched> DerefMut for LockGuard<'_, R, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T: ?Sized, S: LockSched> Drop for LockGuard<'_, R, T, S> {
    fn drop(&mut self) {
        self.lock.raw.release(self.sched);
    }
}

// ============================================================================
// Tier 1: raw spinlock
// ============================================================================

/// Single test-and-set bit; busy-waits and never suspends
#[derive(Debug)]
pub struct RawSpin {
    flag: AtomicU8,
}

impl RawSpin {
    /// Create an unlocked spinlock
    pub const fn new() -> Self {
        Self {
            flag: AtomicU8::new(0),
        }
    }

    /// Spin until the bit is ours; safe in interrupt handlers
    pub fn spin_lock<H: Hal>(&self, hal: &H) {
        while hal.test_and_set(&self.flag) {
            while self.flag.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    /// Take the bit if it is clear
    pub fn spin_try_lock<H: Hal>(&self, hal: &H) -> bool {
        !hal.test_and_set(&self.flag)
    }

    /// Clear the bit, returning whether it was set
    pub fn spin_unlock<H: Hal>(&self, hal: &H) -> bool {
        hal.swap_u8(&self.flag, 0) != 0
    }
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for RawSpin {
    const TIER: Tier = Tier::Spin;
    #[allow(clippy::declare_interior_mutable_const)]
    const UNLOCKED: Self = RawSpin::new();

    fn acquire<S: LockSched>(&self, sched: &S) {
        sched.check_order(Self::TIER);
        if !self.spin_try_lock(sched.hal()) {
            sched.note_contention();
            self.spin_lock(sched.hal());
        }
        sched.note_acquire(Self::TIER);
    }

    fn try_acquire<S: LockSched>(&self, sched: &S) -> bool {
        if !self.spin_try_lock(sched.hal()) {
            return false;
        }
        sched.check_order(Self::TIER);
        sched.note_acquire(Self::TIER);
        true
    }

    fn release<S: LockSched>(&self, sched: &S) {
        if self.spin_unlock(sched.hal()) {
            sched.note_release(Self::TIER);
        } else {
            sched.report(Violation::NotLocked(Self::TIER));
        }
    }

    fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed) != 0
    }
}

// ============================================================================
// Tier 2: fast lock
// ============================================================================

/// Spinlock that yields the processor after a bounded number of attempts
#[derive(Debug)]
pub struct RawFast {
    word: AtomicU16,
}

impl RawFast {
    /// Create an unlocked fast lock
    pub const fn new() -> Self {
        Self {
            word: AtomicU16::new(LockWord::UNLOCKED),
        }
    }

    /// Decoded lock word
    pub fn word(&self) -> LockWord {
        LockWord::decode(self.word.load(Ordering::Acquire))
    }

    fn attempt<S: LockSched>(&self, sched: &S) -> bool {
        let held = LockWord::held_by(owner_tag(sched)).encode();
        sched
            .hal()
            .compare_exchange_u16(&self.word, LockWord::UNLOCKED, held)
            .is_ok()
    }
}

impl Default for RawFast {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for RawFast {
    const TIER: Tier = Tier::Fast;
    #[allow(clippy::declare_interior_mutable_const)]
    const UNLOCKED: Self = RawFast::new();

    fn acquire<S: LockSched>(&self, sched: &S) {
        sched.check_order(Self::TIER);
        let mut contended = false;
        loop {
            for _ in 0..sched.config().flock_spin.max(1) {
                if self.attempt(sched) {
                    sched.note_acquire(Self::TIER);
                    return;
                }
                core::hint::spin_loop();
            }
            if !contended {
                contended = true;
                sched.note_contention();
            }
            sched.yield_now();
        }
    }

    fn try_acquire<S: LockSched>(&self, sched: &S) -> bool {
        if !self.attempt(sched) {
            return false;
        }
        sched.check_order(Self::TIER);
        sched.note_acquire(Self::TIER);
        true
    }

    fn release<S: LockSched>(&self, sched: &S) {
        if check_release(sched, Self::TIER, self.word.load(Ordering::Acquire)) {
            sched.hal().swap_u16(&self.word, LockWord::UNLOCKED);
            sched.note_release(Self::TIER);
        }
    }

    fn is_locked(&self) -> bool {
        self.word().locked
    }
}

/// Tier 1 lock around data
pub type SpinLock<T> = Lock<RawSpin, T>;

/// Tier 2 lock around data
pub type FastLock<T> = Lock<RawFast, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hammer, ThreadSched};
    use std::sync::Arc;

    #[test]
    fn test_spinlock_mutual_exclusion() {
        hammer(Arc::new(SpinLock::new(0)));
    }

    #[test]
    fn test_fastlock_mutual_exclusion() {
        hammer(Arc::new(FastLock::new(0)));
    }

    #[test]
    fn test_try_lock_reports_busy() {
        let a = ThreadSched::new(0);
        let b = ThreadSched::new(1);
        let lock = FastLock::new(5u8);

        let guard = lock.try_lock(&a).unwrap();
        assert_eq!(lock.raw().word(), LockWord::held_by(0));
        assert_eq!(lock.try_lock(&b).err(), Some(KernError::WouldBlock));
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock(&b).unwrap(), 5);
    }

    #[test]
    fn test_isr_spin_path() {
        let sched = ThreadSched::new(0);
        let raw = RawSpin::new();
        assert!(raw.spin_try_lock(sched.hal()));
        assert!(!raw.spin_try_lock(sched.hal()));
        assert!(raw.spin_unlock(sched.hal()));
        assert!(!raw.spin_unlock(sched.hal()));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_release_by_non_owner() {
        let owner = ThreadSched::new(0);
        let other = ThreadSched::new(1);
        let raw = RawFast::new();
        raw.acquire(&owner);
        raw.release(&other);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_release_unlocked() {
        RawFast::new().release(&ThreadSched::new(0));
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_tier_order_enforced() {
        let sched = ThreadSched::new(0);
        let outer = FastLock::new(());
        let inner = SpinLock::new(());
        let _fast = outer.lock(&sched);
        let _spin = inner.lock(&sched);
    }

    #[test]
    fn test_tier_order_ascending_ok() {
        let sched = ThreadSched::new(0);
        let a = SpinLock::new(1);
        let b = FastLock::new(2);
        let c = FastLock::new(3);
        let ga = a.lock(&sched);
        let gb = b.lock(&sched);
        let gc = c.lock(&sched);
        assert_eq!(*ga + *gb + *gc, 6);
        assert_eq!(sched.held(Tier::Fast), 2);
        drop(gc);
        drop(gb);
        drop(ga);
        assert_eq!(sched.held(Tier::Spin), 0);
    }
}
