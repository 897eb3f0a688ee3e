//! Test fixtures: host kernels, stacks, traces and a thread-backed lock seam

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::arch::host::HostHal;
use crate::config::Config;
use crate::error::Violation;
use crate::ipc::slab::DoorArea;
use crate::kern::lock::{Lock, LockSched, RawLock, Tier};
use crate::kern::sched_prim::Kernel;
use crate::persist::NoInit;
use crate::types::{StackRegion, TaskId};

const STACK_BYTES: usize = 256;

/// Fresh door area, as if placed in its own persistent region
pub fn doors() -> &'static NoInit<DoorArea> {
    Box::leak(Box::new(NoInit::new(DoorArea::new())))
}

/// Cooperative kernel on a fresh HAL and door area
pub fn boot() -> &'static Kernel<HostHal> {
    boot_with(Config::DEFAULT.cooperative())
}

/// Kernel with an explicit configuration
pub fn boot_with(config: Config) -> &'static Kernel<HostHal> {
    Box::leak(Box::new(Kernel::with_config(HostHal::new(), config, doors())))
}

/// Cooperative kernel over an existing door area
pub fn boot_on(hal: HostHal, doors: &'static NoInit<DoorArea>) -> &'static Kernel<HostHal> {
    Box::leak(Box::new(Kernel::with_config(
        hal,
        Config::DEFAULT.cooperative(),
        doors,
    )))
}

/// Stack memory for one task; host tasks run on their own threads, so this
/// only has to be unique
pub fn stack() -> StackRegion {
    StackRegion::new(Box::leak(vec![0u8; STACK_BYTES].into_boxed_slice()))
}

/// Ordered record of events across tasks
pub struct Trace(spin::Mutex<heapless::Vec<usize, 64>>);

impl Trace {
    pub const fn new() -> Self {
        Self(spin::Mutex::new(heapless::Vec::new()))
    }

    pub fn record(&self, event: usize) {
        let pushed = self.0.lock().push(event);
        assert!(pushed.is_ok(), "trace full");
    }

    /// Drain the trace
    pub fn take(&self) -> Vec<usize> {
        let mut events = self.0.lock();
        let out = events.iter().copied().collect();
        events.clear();
        out
    }
}

/// Lock seam for plain OS threads; each thread poses as task `id`
pub struct ThreadSched {
    id: TaskId,
    hal: HostHal,
    config: Config,
    held: [Cell<u8>; 4],
}

impl ThreadSched {
    pub fn new(id: u8) -> Self {
        Self {
            id: TaskId(id),
            hal: HostHal::new(),
            config: Config::DEFAULT,
            held: Default::default(),
        }
    }

    /// Locks of `tier` currently held
    pub fn held(&self, tier: Tier) -> u8 {
        self.held[tier.index()].get()
    }
}

impl LockSched for ThreadSched {
    type Hal = HostHal;

    fn hal(&self) -> &HostHal {
        &self.hal
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn current(&self) -> Option<TaskId> {
        Some(self.id)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn park(&self) {
        std::thread::yield_now();
    }

    fn unpark(&self, _id: TaskId) {}

    fn check_order(&self, tier: Tier) {
        let held = Tier::ALL
            .into_iter()
            .rev()
            .find(|t| self.held(*t) > 0);
        if let Some(held) = held {
            if held > tier {
                self.report(Violation::TierOrder { held, wanted: tier });
            }
        }
    }

    fn note_acquire(&self, tier: Tier) {
        let count = &self.held[tier.index()];
        count.set(count.get() + 1);
    }

    fn note_release(&self, tier: Tier) {
        let count = &self.held[tier.index()];
        count.set(count.get().saturating_sub(1));
    }
}

/// Four threads bump a shared counter 500 times each through `lock`
pub fn hammer<R: RawLock + Send + Sync + 'static>(lock: Arc<Lock<R, u32>>) {
    let inside = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..4u8)
        .map(|n| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            std::thread::spawn(move || {
                let sched = ThreadSched::new(n);
                for _ in 0..500 {
                    let mut guard = lock.lock(&sched);
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders");
                    *guard += 1;
                    inside.store(false, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*lock.lock(&ThreadSched::new(9)), 2000);
}
