//! Kernel Event Counters
//!
//! Relaxed atomic counters for switches, ticks, door traffic and lock
//! contention. They exist for debugging and tests; nothing in the kernel
//! makes decisions based on them.

use core::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Event counter
#[derive(Debug)]
pub struct KernCounter {
    value: AtomicU32,
}

impl KernCounter {
    /// Create a new counter
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u32 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Kernel Statistics
// ============================================================================

/// Counters kept by one kernel instance
#[derive(Debug)]
pub struct KernelCounters {
    pub context_switches: KernCounter,
    pub ticks: KernCounter,
    pub door_calls: KernCounter,
    pub door_checksums: KernCounter,
    pub lock_contended: KernCounter,
    pub violations: KernCounter,
}

impl KernelCounters {
    pub const fn new() -> Self {
        Self {
            context_switches: KernCounter::new(),
            ticks: KernCounter::new(),
            door_calls: KernCounter::new(),
            door_checksums: KernCounter::new(),
            lock_contended: KernCounter::new(),
            violations: KernCounter::new(),
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            context_switches: self.context_switches.get(),
            ticks: self.ticks.get(),
            door_calls: self.door_calls.get(),
            door_checksums: self.door_checksums.get(),
            lock_contended: self.lock_contended.get(),
            violations: self.violations.get(),
        }
    }
}

impl Default for KernelCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of kernel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub context_switches: u32,
    pub ticks: u32,
    pub door_calls: u32,
    pub door_checksums: u32,
    pub lock_contended: u32,
    pub violations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = KernCounter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_snapshot() {
        let counters = KernelCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
        counters.door_calls.inc();
        counters.ticks.inc();
        counters.ticks.inc();

        let snap = counters.snapshot();
        assert_eq!(snap.door_calls, 1);
        assert_eq!(snap.ticks, 2);
        assert_eq!(snap.violations, 0);
    }
}
