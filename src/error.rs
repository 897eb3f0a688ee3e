//! Kernel error types using thiserror
//!
//! Two kinds of failure leave the kernel:
//!
//! - [`KernError`]: configuration mistakes and resource exhaustion. These are
//!   returned as status codes and leave the addressed object untouched.
//! - [`Violation`]: broken call protocols (releasing a lock that is not held,
//!   replying to a door call that does not exist, nesting lock tiers
//!   backwards). These are programming errors. Debug builds panic on them;
//!   release builds log them and skip the offending operation.

use thiserror::Error;

use crate::kern::lock::Tier;
use crate::types::TaskId;

/// Kernel result type
pub type KernResult<T> = Result<T, KernError>;

/// Recoverable kernel errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    #[error("task table is full")]
    NoFreeSlot,

    #[error("priority out of range")]
    InvalidPriority,

    #[error("stack smaller than the minimum task stack")]
    StackTooSmall,

    #[error("stack overlaps task {0}")]
    StackOverlap(TaskId),

    #[error("door slot out of range")]
    InvalidSlot,

    #[error("door slot is not registered")]
    EmptySlot,

    #[error("door message size does not fit the slab")]
    InvalidDoorSize,

    #[error("invalid target task")]
    InvalidTarget,

    #[error("buffer holds {len} bytes, door needs {need}")]
    BufferTooSmall { len: usize, need: usize },

    #[error("another door call is in flight")]
    DoorBusy,

    #[error("target task is not waiting on its door")]
    TargetNotWaiting,

    #[error("no door call is pending")]
    NoPendingCall,

    #[error("operation requires a running task")]
    NoCurrentTask,

    #[error("no such task")]
    UnknownTask,

    #[error("lock is busy")]
    WouldBlock,
}

impl KernError {
    /// Stable negative status code for C-style callers
    pub const fn code(self) -> i8 {
        match self {
            KernError::NoFreeSlot => -1,
            KernError::InvalidPriority => -2,
            KernError::StackTooSmall => -3,
            KernError::StackOverlap(_) => -4,
            KernError::InvalidSlot => -5,
            KernError::EmptySlot => -6,
            KernError::InvalidDoorSize => -7,
            KernError::InvalidTarget => -8,
            KernError::BufferTooSmall { .. } => -9,
            KernError::DoorBusy => -10,
            KernError::TargetNotWaiting => -11,
            KernError::NoPendingCall => -12,
            KernError::NoCurrentTask => -13,
            KernError::UnknownTask => -14,
            KernError::WouldBlock => -15,
        }
    }
}

/// Protocol violations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("released {0:?} lock that is not held")]
    NotLocked(Tier),

    #[error("{0:?} lock released by a task that does not own it")]
    NotOwner(Tier),

    #[error("acquiring {wanted:?} lock while holding {held:?} lock")]
    TierOrder { held: Tier, wanted: Tier },

    #[error("door call entered while another call is in flight")]
    DoorReentered,

    #[error("door return without a pending call")]
    NoPendingCall,

    #[error("door return while the message is still borrowed")]
    MessageHeld,

    #[error("stack guard of task {0} overwritten")]
    StackOverflow(TaskId),
}

/// Report a protocol violation
///
/// Panics when debug assertions are enabled; otherwise only logs.
#[track_caller]
pub fn violation(v: Violation) {
    log::error!("protocol violation: {}", v);
    if cfg!(debug_assertions) {
        panic!("protocol violation: {}", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            KernError::NoFreeSlot,
            KernError::InvalidPriority,
            KernError::StackTooSmall,
            KernError::StackOverlap(TaskId(0)),
            KernError::InvalidSlot,
            KernError::EmptySlot,
            KernError::InvalidDoorSize,
            KernError::InvalidTarget,
            KernError::BufferTooSmall { len: 0, need: 8 },
            KernError::DoorBusy,
            KernError::TargetNotWaiting,
            KernError::NoPendingCall,
            KernError::NoCurrentTask,
            KernError::UnknownTask,
            KernError::WouldBlock,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn test_violation_panics_in_debug() {
        violation(Violation::NoPendingCall);
    }
}
