//! Kern subsystem - scheduler, tasks and the lock hierarchy
//!
//! Everything here runs on one core. Task state changes happen with
//! interrupts masked and the scheduler lock held; the HAL does the actual
//! register swap.

pub mod counters;
pub mod lock;
pub mod lockword;
pub mod qlock;
pub mod runq;
pub mod sched_prim;
pub mod task;
pub mod timer;

pub use counters::{CounterSnapshot, KernCounter, KernelCounters};
pub use lock::{FastLock, Lock, LockGuard, LockSched, RawFast, RawLock, RawSpin, SpinLock, Tier};
pub use lockword::LockWord;
pub use qlock::{QueueLock, RawQueue, RawSleep, SleepLock, WaitQueueLock};
pub use runq::ReadyQueue;
pub use sched_prim::{Kernel, RunSummary, TaskFn, STACK_CANARY};
pub use task::{TaskState, TaskTable, Tcb, WaitReason};
pub use timer::{NoPreempt, MAX_SLEEP_TICKS};
