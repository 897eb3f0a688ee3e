//! Common types used across doorkern
//!
//! This module defines shared types to avoid circular dependencies.

use crate::config::{MAX_PRIORITY, MAX_TASKS};

/// Task identifier
///
/// Doubles as the index into the task table and as the owner tag stored in
/// lock words and door descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u8);

impl TaskId {
    /// Table index of this task
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether the id can name a slot of the task table
    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_TASKS
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Scheduling priority
///
/// Lower values are more urgent. Priority never gates preemption; it only
/// orders tasks that become ready in the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent priority
    pub const HIGHEST: Priority = Priority(0);
    /// Least urgent priority
    pub const LOWEST: Priority = Priority(MAX_PRIORITY);
    /// Priority given to tasks that do not care
    pub const NORMAL: Priority = Priority(MAX_PRIORITY / 2);

    /// Whether the value is inside `0..=MAX_PRIORITY`
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 <= MAX_PRIORITY
    }
}

/// Scheduler time in timer ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(pub u32);

impl Tick {
    /// Deadline `n` ticks after `self`
    #[inline]
    pub const fn after(self, n: u32) -> Tick {
        Tick(self.0.wrapping_add(n))
    }

    /// Whether `self` has reached `deadline`, tolerating counter wrap
    #[inline]
    pub const fn reached(self, deadline: Tick) -> bool {
        (self.0.wrapping_sub(deadline.0) as i32) >= 0
    }
}

/// Non-owning view of a task stack
///
/// The scheduler only looks at the bounds (overlap checks at creation and
/// the optional guard canary at the low end); register state lives in the
/// HAL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    base: usize,
    len: usize,
}

impl StackRegion {
    /// View over a statically allocated stack
    pub fn new(stack: &'static mut [u8]) -> Self {
        Self {
            base: stack.as_mut_ptr() as usize,
            len: stack.len(),
        }
    }

    /// View over a caller-provided region
    ///
    /// # Safety
    ///
    /// `base..base + len` must be writable memory reserved for exactly one
    /// task for as long as that task exists.
    pub const unsafe fn from_raw(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Lowest address of the region
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Size in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the highest address
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    /// Whether two regions share at least one byte
    pub const fn overlaps(&self, other: &StackRegion) -> bool {
        !self.is_empty() && !other.is_empty() && self.base < other.end() && other.base < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_overlap() {
        let a = unsafe { StackRegion::from_raw(0x1000, 0x100) };
        let b = unsafe { StackRegion::from_raw(0x10ff, 0x10) };
        let c = unsafe { StackRegion::from_raw(0x1100, 0x100) };

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn test_tick_wraps() {
        let near_end = Tick(u32::MAX - 1);
        let deadline = near_end.after(3);
        assert_eq!(deadline, Tick(1));
        assert!(!near_end.reached(deadline));
        assert!(Tick(1).reached(deadline));
        assert!(Tick(2).reached(deadline));
    }

    #[test]
    fn test_priority_range() {
        assert!(Priority::HIGHEST.is_valid());
        assert!(Priority::LOWEST.is_valid());
        assert!(!Priority(MAX_PRIORITY + 1).is_valid());
        assert!(TaskId(0).is_valid());
        assert!(!TaskId(MAX_TASKS as u8).is_valid());
    }
}
