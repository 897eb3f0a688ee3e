//! Host HAL
//!
//! Runs kernel tasks on a desktop OS so the scheduler, locks and doors can be
//! exercised without hardware. Each task context owns an OS thread; a switch
//! hands a baton to the target context and parks the current thread until its
//! own baton comes back, so exactly one task executes at any time.
//!
//! The thread that performs the first switch without being a task thread
//! (normally the one calling `Kernel::run`) becomes the root context. A panic
//! inside a task thread is handed to the root and re-raised there.
//!
//! Timer interrupts are emulated: `idle()` delivers one tick, and tests can
//! inject ticks from task code with [`HostHal::fire_tick`].

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use super::{Hal, IrqState, ResetReason};
use crate::types::StackRegion;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TASK_THREAD: Cell<bool> = const { Cell::new(false) };
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Baton {
    /// Incarnation of the context; bumped by every `context_init`
    generation: u64,
    /// Generation the baton was handed to, if any
    holder: Option<u64>,
}

/// Task context backed by an OS thread
#[derive(Debug, Default)]
pub struct HostContext {
    baton: Mutex<Baton>,
    wake: Condvar,
}

impl HostContext {
    fn generation(&self) -> u64 {
        lock(&self.baton).generation
    }

    fn give(&self) {
        let mut baton = lock(&self.baton);
        baton.holder = Some(baton.generation);
        self.wake.notify_all();
    }

    fn take(&self, generation: u64) {
        let mut baton = lock(&self.baton);
        while baton.holder != Some(generation) {
            baton = self
                .wake
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
        baton.holder = None;
    }
}

type TimerHandler = (fn(usize), usize);

/// HAL for hosted builds and unit tests
pub struct HostHal {
    irq_on: AtomicBool,
    timer: Mutex<Option<TimerHandler>>,
    root: AtomicPtr<HostContext>,
    failure: Mutex<Option<Box<dyn Any + Send>>>,
    reset: ResetReason,
    ticks: AtomicU64,
}

impl HostHal {
    /// HAL reporting a power-on reset
    pub fn new() -> Self {
        Self::with_reset(ResetReason::PowerOn)
    }

    /// HAL reporting `reset` as the cause of the last reset
    pub fn with_reset(reset: ResetReason) -> Self {
        Self {
            irq_on: AtomicBool::new(false),
            timer: Mutex::new(None),
            root: AtomicPtr::new(ptr::null_mut()),
            failure: Mutex::new(None),
            reset,
            ticks: AtomicU64::new(0),
        }
    }

    /// Whether emulated interrupts are unmasked
    pub fn irq_enabled(&self) -> bool {
        self.irq_on.load(Ordering::SeqCst)
    }

    /// Deliver one timer interrupt to the registered handler
    ///
    /// Returns `false` without calling anything when interrupts are masked or
    /// no timer is running.
    pub fn fire_tick(&self) -> bool {
        if !self.irq_enabled() {
            return false;
        }
        let handler = *lock(&self.timer);
        match handler {
            Some((handler, arg)) => {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                handler(arg);
                true
            }
            None => false,
        }
    }

    /// Number of timer interrupts delivered so far
    pub fn ticks_delivered(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Hand a task panic to the root context and end the task thread
    fn fail(&self, payload: Box<dyn Any + Send>) {
        *lock(&self.failure) = Some(payload);
        let root = self.root.load(Ordering::SeqCst);
        if !root.is_null() {
            // SAFETY: the root context is the kernel's idle slot, which lives
            // as long as the kernel.
            unsafe { (*root).give() };
        }
    }
}

impl Default for HostHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for HostHal {
    type Context = HostContext;

    unsafe fn context_init(
        &self,
        ctx: &HostContext,
        entry: fn(usize),
        arg: usize,
        _stack: &StackRegion,
    ) {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        {
            let mut baton = lock(&ctx.baton);
            baton.generation = generation;
            baton.holder = None;
        }

        // Raw addresses: the caller guarantees both outlive the thread
        let ctx_addr = ctx as *const HostContext as usize;
        let hal_addr = self as *const HostHal as usize;
        thread::Builder::new()
            .name(format!("task-{generation}"))
            .spawn(move || {
                // SAFETY: see `Hal::context_init`
                let ctx = unsafe { &*(ctx_addr as *const HostContext) };
                let hal = unsafe { &*(hal_addr as *const HostHal) };
                TASK_THREAD.with(|t| t.set(true));
                ctx.take(generation);
                match panic::catch_unwind(AssertUnwindSafe(|| entry(arg))) {
                    Ok(()) => hal.fail(Box::new("task entry returned")),
                    Err(payload) => hal.fail(payload),
                }
            })
            .expect("failed to spawn host task thread");
    }

    unsafe fn context_switch(&self, from: &HostContext, to: &HostContext) {
        let is_task = TASK_THREAD.with(Cell::get);
        if !is_task {
            let from_ptr = from as *const HostContext as *mut HostContext;
            let _ = self.root.compare_exchange(
                ptr::null_mut(),
                from_ptr,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        let generation = from.generation();
        to.give();
        from.take(generation);

        if !is_task {
            if let Some(payload) = lock(&self.failure).take() {
                panic::resume_unwind(payload);
            }
        }
    }

    fn irq_enable(&self) {
        self.irq_on.store(true, Ordering::SeqCst);
    }

    fn irq_disable(&self) {
        self.irq_on.store(false, Ordering::SeqCst);
    }

    fn irq_save(&self) -> IrqState {
        IrqState(self.irq_on.swap(false, Ordering::SeqCst) as u32)
    }

    fn irq_restore(&self, state: IrqState) {
        self.irq_on.store(state.0 != 0, Ordering::SeqCst);
    }

    fn timer_init(&self, _hz: u32, handler: fn(usize), arg: usize) {
        *lock(&self.timer) = Some((handler, arg));
    }

    fn idle(&self) {
        if !self.fire_tick() {
            thread::yield_now();
        }
    }

    fn reset_reason(&self) -> ResetReason {
        self.reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_tick(step: usize) {
        HITS.fetch_add(step, Ordering::SeqCst);
    }

    #[test]
    fn test_ticks_respect_irq_mask() {
        let hal = HostHal::new();
        hal.timer_init(1000, count_tick, 5);

        assert!(!hal.fire_tick());
        hal.irq_enable();
        assert!(hal.fire_tick());

        let saved = hal.irq_save();
        assert!(!hal.fire_tick());
        hal.irq_restore(saved);
        assert!(hal.fire_tick());

        assert_eq!(hal.ticks_delivered(), 2);
        assert_eq!(HITS.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_reset_reason() {
        assert!(!HostHal::new().reset_reason().preserves_ram());
        assert!(HostHal::with_reset(ResetReason::Watchdog)
            .reset_reason()
            .preserves_ram());
    }
}
