//! Hardware abstraction layer contract
//!
//! Every target supplies one [`Hal`] implementation. The kernel never looks
//! inside a saved context: it hands the HAL opaque [`Hal::Context`] slots and
//! stack bounds, and asks it to switch between them.
//!
//! ## Atomics
//!
//! Locks and the door in-flight flag are built on the 8/16/32-bit exchange and
//! compare-exchange helpers provided here. Widths the target executes natively
//! use `core` atomics; the others are emulated inside an interrupt-disabled
//! window (see [`atomic`]).
//!
//! ## Host
//!
//! [`host::HostHal`] runs each task on its own OS thread and passes a baton
//! between them, so only one task executes at a time, as on a single core.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8};

use crate::types::StackRegion;

pub mod atomic;

#[cfg(any(test, feature = "std"))]
pub mod host;

/// Saved interrupt-enable state returned by [`Hal::irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub u32);

/// Why the processor last came out of reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Power was applied; RAM content is garbage
    PowerOn,
    /// External reset pin or software reset; RAM retained
    Warm,
    /// Watchdog expiry; RAM retained
    Watchdog,
    /// Supply dipped below the brown-out threshold
    Brownout,
    /// The HAL could not tell
    Unknown,
}

impl ResetReason {
    /// Whether the persistent region survived this reset
    pub const fn preserves_ram(self) -> bool {
        matches!(self, ResetReason::Warm | ResetReason::Watchdog)
    }
}

/// Per-target primitives consumed by the kernel
pub trait Hal: Sync + 'static {
    /// Saved register/stack-pointer state of one task
    ///
    /// The kernel owns one slot per task and never reads it; the HAL mutates
    /// it through interior mutability during switches.
    type Context: Default + Sync;

    /// Prepare `ctx` so that switching to it calls `entry(arg)` on `stack`
    ///
    /// # Safety
    ///
    /// `ctx` must stay at the same address for as long as it can be switched
    /// to, and `stack` must be reserved for this context.
    unsafe fn context_init(
        &self,
        ctx: &Self::Context,
        entry: fn(usize),
        arg: usize,
        stack: &StackRegion,
    );

    /// Save the running state into `from` and resume `to`
    ///
    /// Returns only when some later switch targets `from` again.
    ///
    /// # Safety
    ///
    /// `from` must describe the code currently executing and `to` must have
    /// been initialized or saved earlier.
    unsafe fn context_switch(&self, from: &Self::Context, to: &Self::Context);

    /// Unmask interrupts
    fn irq_enable(&self);

    /// Mask interrupts
    fn irq_disable(&self);

    /// Mask interrupts and return the previous state
    fn irq_save(&self) -> IrqState;

    /// Restore a state returned by [`Hal::irq_save`]
    fn irq_restore(&self, state: IrqState);

    /// Full memory barrier
    fn memory_barrier(&self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Start the periodic timer; every tick calls `handler(arg)`
    fn timer_init(&self, hz: u32, handler: fn(usize), arg: usize);

    /// Wait for the next interrupt
    fn idle(&self);

    /// Cause of the last reset
    fn reset_reason(&self) -> ResetReason;

    /// Atomically replace an 8-bit value
    fn swap_u8(&self, cell: &AtomicU8, value: u8) -> u8 {
        atomic::swap_u8(self, cell, value)
    }

    /// Atomically replace `current` with `new` in an 8-bit cell
    fn compare_exchange_u8(&self, cell: &AtomicU8, current: u8, new: u8) -> Result<u8, u8> {
        atomic::compare_exchange_u8(self, cell, current, new)
    }

    /// Atomically replace a 16-bit value
    fn swap_u16(&self, cell: &AtomicU16, value: u16) -> u16 {
        atomic::swap_u16(self, cell, value)
    }

    /// Atomically replace `current` with `new` in a 16-bit cell
    fn compare_exchange_u16(&self, cell: &AtomicU16, current: u16, new: u16) -> Result<u16, u16> {
        atomic::compare_exchange_u16(self, cell, current, new)
    }

    /// Atomically replace a 32-bit value
    fn swap_u32(&self, cell: &AtomicU32, value: u32) -> u32 {
        atomic::swap_u32(self, cell, value)
    }

    /// Atomically replace `current` with `new` in a 32-bit cell
    fn compare_exchange_u32(&self, cell: &AtomicU32, current: u32, new: u32) -> Result<u32, u32> {
        atomic::compare_exchange_u32(self, cell, current, new)
    }

    /// Set a flag byte, returning whether it was already set
    fn test_and_set(&self, flag: &AtomicU8) -> bool {
        self.swap_u8(flag, 1) != 0
    }
}
