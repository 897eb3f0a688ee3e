//! doorkern - a small kernel for microcontrollers
//!
//! Round-robin tasks, a four-tier lock hierarchy and synchronous door RPC
//! over direct context switches. The kernel runs on anything that implements
//! [`arch::Hal`]; hosted builds (`std` feature, and all tests) add a
//! thread-backed HAL so the whole kernel runs on a desktop.
//!
//! ```ignore
//! doorkern::noinit_static!(static DOORS: DoorArea = DoorArea::new(););
//! static KERNEL: spin::Once<Kernel<Board>> = spin::Once::new();
//!
//! let k = KERNEL.call_once(|| Kernel::new(Board::take(), &DOORS));
//! k.spawn(server, 0, Priority::NORMAL, StackRegion::new(stack))?;
//! k.run();
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Lock and door constants are interior-mutable by nature
#![allow(clippy::declare_interior_mutable_const)]
// Kernel types have const constructors used in statics
#![allow(clippy::new_without_default)]

// Core types
pub mod config;
pub mod error;
pub mod types;

pub mod arch;
pub mod console;
pub mod ipc;
pub mod kern;
pub mod persist;

#[cfg(test)]
mod testing;

pub use arch::{Hal, IrqState, ResetReason};
pub use config::Config;
pub use error::{KernError, KernResult, Violation};
pub use ipc::{DoorArea, DoorDescriptor, DoorFlags, DoorMessage, InterruptedCall};
pub use kern::{
    FastLock, Kernel, QueueLock, RunSummary, SleepLock, SpinLock, TaskState, Tier, WaitReason,
};
pub use persist::{NoInit, Restored};
pub use types::{Priority, StackRegion, TaskId, Tick};
