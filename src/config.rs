//! Kernel configuration
//!
//! Capacities are compile-time constants because every kernel table is a
//! fixed array. Behavioral knobs live in [`Config`], whose defaults follow
//! the enabled cargo features:
//!
//! - `preempt`: rotate the running task every `quantum_ticks` timer ticks.
//! - `stack-guard`: keep a canary at the low end of each task stack and
//!   check it whenever the task is switched out.

/// Task table capacity
pub const MAX_TASKS: usize = 8;

/// Door descriptor slots per task
pub const DOOR_SLOTS: usize = 4;

/// Shared door slab size in bytes
pub const DOOR_SLAB_SIZE: usize = 128;

/// Size of one door payload word
pub const DOOR_WORD_BYTES: usize = 8;

/// Largest word count a descriptor nibble can hold
pub const DOOR_MAX_WORDS: u8 = 15;

/// Numerically largest (least urgent) priority
pub const MAX_PRIORITY: u8 = 63;

/// Smallest stack a task may be created with
pub const MIN_STACK: usize = 64;

const _: () = assert!(DOOR_SLAB_SIZE % DOOR_WORD_BYTES == 0);
const _: () = assert!(DOOR_SLOTS <= 15);
const _: () = assert!(MAX_TASKS <= 0x7f);

/// Runtime scheduling and locking parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Timer interrupt rate requested from the HAL
    pub tick_hz: u32,
    /// Ticks a task may run before preemption rotates it
    pub quantum_ticks: u32,
    /// Whether timer ticks rotate the running task
    pub preemption: bool,
    /// Whether stack canaries are written and checked
    pub stack_guard: bool,
    /// Test-and-set attempts before a fast lock yields
    pub flock_spin: u32,
    /// Polls before a queueing lock blocks the caller
    pub qlock_spin: u32,
}

impl Config {
    /// Configuration selected by the enabled features
    pub const DEFAULT: Config = Config {
        tick_hz: 1000,
        quantum_ticks: 10,
        preemption: cfg!(feature = "preempt"),
        stack_guard: cfg!(feature = "stack-guard"),
        flock_spin: 64,
        qlock_spin: 16,
    };

    /// Same configuration with timer preemption after `quantum` ticks
    pub const fn preemptive(self, quantum: u32) -> Self {
        Self {
            preemption: true,
            quantum_ticks: quantum,
            ..self
        }
    }

    /// Same configuration with preemption turned off
    pub const fn cooperative(self) -> Self {
        Self {
            preemption: false,
            ..self
        }
    }

    /// Same configuration with stack canaries on or off
    pub const fn with_stack_guard(self, on: bool) -> Self {
        Self {
            stack_guard: on,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
