//! Scheduling Primitives - dispatch, yield, block and wakeup
//!
//! The [`Kernel`] owns the task table, the ready queue and one HAL context
//! per task slot. Scheduling is strict round-robin: the ready queue is a FIFO
//! and a yielding task goes to its tail. Priority only orders tasks that
//! wake on the same tick (see [`super::timer`]).
//!
//! ## Switching
//!
//! Every state change happens with interrupts masked and the scheduler lock
//! held. The lock is dropped right before the HAL switch; the masked window
//! covers the switch itself and ends when the switched-out task resumes and
//! restores its own saved state. When no task is ready the processor goes
//! back to the idle context, i.e. the loop in [`Kernel::run`].
//!
//! Door calls bypass the ready queue through [`Kernel::handoff`], which
//! switches straight to a named task.

use core::ptr;
use core::sync::atomic::AtomicU8;

use spin::{Mutex, MutexGuard};

use crate::arch::Hal;
use crate::config::{Config, MAX_TASKS};
use crate::error::{violation, KernError, KernResult, Violation};
use crate::ipc::slab::{DoorArea, InterruptedCall};
use crate::kern::counters::{CounterSnapshot, KernelCounters};
use crate::kern::lock::{LockSched, Tier};
use crate::kern::runq::ReadyQueue;
use crate::kern::task::{TaskState, TaskTable, Tcb, WaitReason};
use crate::persist::{NoInit, Restored};
use crate::types::{Priority, StackRegion, TaskId, Tick};

/// Task entry point; receives the kernel and the argument given to `spawn`
pub type TaskFn<H> = fn(&'static Kernel<H>, usize);

/// Canary kept at the low end of every task stack
pub const STACK_CANARY: u32 = 0xDEAD_BEEF;

struct Start<H: Hal + 'static> {
    entry: TaskFn<H>,
    arg: usize,
}

impl<H: Hal> Clone for Start<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hal> Copy for Start<H> {}

// ============================================================================
// Scheduler state
// ============================================================================

/// Everything guarded by the scheduler lock
#[derive(Debug)]
pub(crate) struct SchedState {
    pub(crate) tasks: TaskTable,
    pub(crate) ready: ReadyQueue,
    pub(crate) current: Option<TaskId>,
    pub(crate) now: Tick,
    /// Ticks the current task has run since it was dispatched
    pub(crate) slice: u32,
}

impl SchedState {
    const fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            ready: ReadyQueue::new(),
            current: None,
            now: Tick(0),
            slice: 0,
        }
    }

    pub(crate) fn tcb(&mut self, id: TaskId) -> &mut Tcb {
        // Ids handed around by the kernel always index the table
        self.tasks
            .get_mut(id)
            .unwrap_or_else(|| unreachable!("task id {id} out of range"))
    }

    /// Make `id` the running task
    pub(crate) fn dispatch(&mut self, id: TaskId) {
        let tcb = self.tcb(id);
        tcb.state = TaskState::Running;
        tcb.wait = WaitReason::None;
        self.current = Some(id);
        self.slice = 0;
    }

    /// Move a blocked task to the tail of the ready queue
    pub(crate) fn make_ready(&mut self, id: TaskId) {
        let tcb = self.tcb(id);
        if tcb.state == TaskState::Blocked {
            tcb.state = TaskState::Ready;
            tcb.wait = WaitReason::None;
            self.ready.push(id);
        }
    }

    /// Mark the running task blocked
    pub(crate) fn block(&mut self, id: TaskId, reason: WaitReason) {
        let tcb = self.tcb(id);
        tcb.state = TaskState::Blocked;
        tcb.wait = reason;
    }

    pub(crate) fn is_waiting(&self, id: TaskId, reason: WaitReason) -> bool {
        self.tasks
            .get(id)
            .is_some_and(|t| t.state == TaskState::Blocked && t.wait == reason)
    }
}

/// State of the system when [`Kernel::run`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Tick counter at exit
    pub now: Tick,
    /// Tasks that have not exited (all blocked)
    pub live: usize,
    /// Exited tasks nobody joined
    pub zombies: usize,
    /// Context switches performed so far
    pub switches: u32,
}

// ============================================================================
// Kernel
// ============================================================================

/// One kernel instance: tasks, scheduler, locks seam and doors
pub struct Kernel<H: Hal> {
    hal: H,
    config: Config,
    pub(crate) sched: Mutex<SchedState>,
    starts: Mutex<[Option<Start<H>>; MAX_TASKS]>,
    contexts: [H::Context; MAX_TASKS],
    idle: H::Context,
    pub(crate) doors: &'static NoInit<DoorArea>,
    interrupted: Option<InterruptedCall>,
    pub(crate) preempt_off: AtomicU8,
    pub(crate) counters: KernelCounters,
}

impl<H: Hal> Kernel<H> {
    /// Kernel with the feature-selected [`Config::DEFAULT`]
    pub fn new(hal: H, doors: &'static NoInit<DoorArea>) -> Self {
        Self::with_config(hal, Config::DEFAULT, doors)
    }

    /// Kernel with an explicit configuration
    ///
    /// Restores the door area according to the HAL reset reason. A call that
    /// was in flight when a warm reset hit is kept for
    /// [`Kernel::interrupted_call`] and the door protocol state is reset.
    pub fn with_config(hal: H, config: Config, doors: &'static NoInit<DoorArea>) -> Self {
        let reset = hal.reset_reason();
        let interrupted = match doors.restore(reset) {
            Restored::Warm => doors.take_interrupted(),
            Restored::Cold => None,
        };
        if let Some(call) = interrupted {
            log::warn!(
                "door call {} -> {} interrupted by {:?} reset",
                call.caller,
                call.callee,
                reset
            );
        }
        log::debug!("kernel init: {:?} reset, {:?}", reset, config);

        Self {
            hal,
            config,
            sched: Mutex::new(SchedState::new()),
            starts: Mutex::new([None; MAX_TASKS]),
            contexts: core::array::from_fn(|_| H::Context::default()),
            idle: H::Context::default(),
            doors,
            interrupted,
            preempt_off: AtomicU8::new(0),
            counters: KernelCounters::new(),
        }
    }

    /// Hardware primitives
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Door call that a warm reset interrupted, if any
    pub fn interrupted_call(&self) -> Option<InterruptedCall> {
        self.interrupted
    }

    /// Event counters
    pub fn stats(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Run `f` with interrupts masked
    pub(crate) fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        let irq = self.hal.irq_save();
        let result = f();
        self.hal.irq_restore(irq);
        result
    }

    /// Run `f` on the scheduler state with interrupts masked
    pub(crate) fn with_sched<R>(&self, f: impl FnOnce(&mut SchedState) -> R) -> R {
        self.masked(|| f(&mut self.sched.lock()))
    }

    /// Id of the running task (`None` in boot code and in idle)
    pub fn current_id(&self) -> Option<TaskId> {
        self.with_sched(|st| st.current)
    }

    /// Snapshot of a task slot
    pub fn task(&self, id: TaskId) -> Option<Tcb> {
        self.with_sched(|st| st.tasks.get(id).copied())
    }

    /// Tasks in the ready queue, head first
    pub fn ready_tasks(&self) -> heapless::Vec<TaskId, MAX_TASKS> {
        self.with_sched(|st| st.ready.iter().collect())
    }

    /// Current tick count
    pub fn now(&self) -> Tick {
        self.with_sched(|st| st.now)
    }

    pub(crate) fn report(&self, v: Violation) {
        self.counters.violations.inc();
        violation(v);
    }

    // ========================================================================
    // Task lifecycle
    // ========================================================================

    /// Create a task that will start at `entry(kernel, arg)`
    ///
    /// The task is queued READY and does not run until the scheduler picks
    /// it. The stack must not overlap another live task's stack.
    pub fn spawn(
        &'static self,
        entry: TaskFn<H>,
        arg: usize,
        priority: Priority,
        stack: StackRegion,
    ) -> KernResult<TaskId> {
        let result = self.with_sched(|st| {
            let slot = st.tasks.allocate(priority, stack)?;
            let id = slot.id;

            self.starts.lock()[id.index()] = Some(Start { entry, arg });
            if slot.recycled {
                self.doors.clear_row(id);
            }
            if self.config.stack_guard {
                write_canary(&stack);
            }
            // SAFETY: the context lives in a 'static kernel and the stack
            // was checked against every live task.
            unsafe {
                self.hal.context_init(
                    &self.contexts[id.index()],
                    task_entry::<H>,
                    self as *const Self as usize,
                    &stack,
                );
            }
            st.ready.push(id);
            Ok(id)
        });

        match result {
            Ok(id) => log::debug!("spawned {} at priority {}", id, priority.0),
            Err(err) => log::warn!("spawn rejected: {}", err),
        }
        result
    }

    /// Give up the processor to the next ready task
    ///
    /// The caller goes to the tail of the ready queue; if it is the only
    /// ready task it keeps running.
    pub fn yield_now(&self) {
        self.masked(|| {
            let mut st = self.sched.lock();
            if let Some(cur) = st.current {
                st.tcb(cur).state = TaskState::Ready;
                st.ready.push(cur);
                self.switch_from(st, cur);
            }
        });
    }

    /// Terminate the running task with `status`
    ///
    /// The slot turns ZOMBIE; a task blocked in [`Kernel::join`] on it gets
    /// the status and the slot is freed.
    pub fn exit(&self, status: i32) -> ! {
        let _irq = self.hal.irq_save();
        let mut st = self.sched.lock();
        let Some(cur) = st.current else {
            drop(st);
            panic!("exit called outside of a task");
        };

        if st.tcb(cur).holds_locks() {
            log::warn!("{} exits while holding locks", cur);
        }
        st.tasks.mark_zombie(cur, status);

        let joiners: heapless::Vec<TaskId, MAX_TASKS> = st
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Blocked && t.wait == WaitReason::Join(cur))
            .map(Tcb::id)
            .collect();
        for &joiner in &joiners {
            st.tcb(joiner).join_status = Some(status);
            st.make_ready(joiner);
        }
        if !joiners.is_empty() {
            st.tasks.reap(cur);
        }
        log::debug!("{} exited with status {}", cur, status);

        self.switch_from(st, cur);
        unreachable!("exited task {cur} was resumed");
    }

    /// Wait for task `id` to exit and return its exit status
    ///
    /// Joining frees the zombie slot.
    pub fn join(&self, id: TaskId) -> KernResult<i32> {
        self.masked(|| {
            let mut st = self.sched.lock();
            let cur = st.current.ok_or(KernError::NoCurrentTask)?;
            if !id.is_valid() || id == cur {
                return Err(KernError::InvalidTarget);
            }
            let state = st.tcb(id).state;
            match state {
                TaskState::Free => Err(KernError::UnknownTask),
                TaskState::Zombie => st.tasks.reap(id).ok_or(KernError::UnknownTask),
                _ => {
                    st.tcb(cur).join_status = None;
                    st.block(cur, WaitReason::Join(id));
                    self.switch_from(st, cur);
                    self.sched
                        .lock()
                        .tcb(cur)
                        .join_status
                        .take()
                        .ok_or(KernError::UnknownTask)
                }
            }
        })
    }

    /// Block until `count` more dependency signals have arrived
    ///
    /// Signals sent before the wait are counted, so a dependency that
    /// finishes first does not get lost.
    pub fn wait_deps(&self, count: u8) -> KernResult<()> {
        self.masked(|| {
            let mut st = self.sched.lock();
            let cur = st.current.ok_or(KernError::NoCurrentTask)?;
            let tcb = st.tcb(cur);
            tcb.deps = tcb.deps.saturating_sub(count as i16);
            if tcb.deps < 0 {
                st.block(cur, WaitReason::Deps);
                self.switch_from(st, cur);
            }
            Ok(())
        })
    }

    /// Deliver one dependency signal to task `id`
    ///
    /// Usable from interrupt handlers.
    pub fn signal(&self, id: TaskId) -> KernResult<()> {
        self.with_sched(|st| {
            if !id.is_valid() || !st.tcb(id).state.is_live() {
                return Err(KernError::UnknownTask);
            }
            let tcb = st.tcb(id);
            tcb.deps = tcb.deps.saturating_add(1);
            if tcb.deps >= 0 && st.is_waiting(id, WaitReason::Deps) {
                st.make_ready(id);
            }
            Ok(())
        })
    }

    // ========================================================================
    // Boot loop
    // ========================================================================

    /// Start the timer and schedule tasks until none can make progress
    ///
    /// The calling context becomes the idle context. While any task waits on a
    /// deadline, a dependency signal or a lock, the processor idles for the
    /// next interrupt. Returns once no task is ready and every blocked task
    /// waits on a door or a join, which only another task could end.
    pub fn run(&'static self) -> RunSummary {
        self.hal.timer_init(
            self.config.tick_hz,
            tick_entry::<H>,
            self as *const Self as usize,
        );
        self.hal.irq_enable();
        log::info!("scheduler running");

        loop {
            let irq = self.hal.irq_save();
            let mut st = self.sched.lock();
            if let Some(next) = st.ready.pop() {
                st.dispatch(next);
                drop(st);
                self.counters.context_switches.inc();
                // SAFETY: the idle context is the one executing here
                unsafe {
                    self.hal
                        .context_switch(&self.idle, &self.contexts[next.index()]);
                }
                self.hal.irq_restore(irq);
                continue;
            }
            let waiting = st.tasks.any_awaiting_interrupt();
            drop(st);
            self.hal.irq_restore(irq);

            if !waiting {
                break;
            }
            self.hal.idle();
        }

        let summary = self.with_sched(|st| RunSummary {
            now: st.now,
            live: st.tasks.live_count(),
            zombies: st.tasks.zombie_count(),
            switches: self.counters.context_switches.get(),
        });
        log::info!("scheduler idle: {:?}", summary);
        summary
    }

    // ========================================================================
    // Switching
    // ========================================================================

    /// Leave `from`, whose new state the caller has already set
    ///
    /// Runs the head of the ready queue, or the idle context if the queue is
    /// empty. Must be called with interrupts masked; returns when `from` is
    /// dispatched again.
    pub(crate) fn switch_from(&self, mut st: MutexGuard<'_, SchedState>, from: TaskId) {
        let next = st.ready.pop();
        if next == Some(from) {
            st.dispatch(from);
            return;
        }
        let to = match next {
            Some(id) => {
                st.dispatch(id);
                &self.contexts[id.index()]
            }
            None => {
                st.current = None;
                &self.idle
            }
        };
        let guard_ok = self.guard_intact(&st, from);
        drop(st);

        if !guard_ok {
            self.report(Violation::StackOverflow(from));
        }
        self.counters.context_switches.inc();
        log::trace!("switch {} -> {:?}", from, next);
        // SAFETY: `from` is the running task's context
        unsafe { self.hal.context_switch(&self.contexts[from.index()], to) };
    }

    /// Switch straight from `from` to the blocked task `to`
    ///
    /// The ready queue is left alone. The caller has already blocked `from`.
    pub(crate) fn handoff(&self, mut st: MutexGuard<'_, SchedState>, from: TaskId, to: TaskId) {
        st.dispatch(to);
        let guard_ok = self.guard_intact(&st, from);
        drop(st);

        if !guard_ok {
            self.report(Violation::StackOverflow(from));
        }
        self.counters.context_switches.inc();
        log::trace!("handoff {} -> {}", from, to);
        // SAFETY: `from` is the running task's context
        unsafe {
            self.hal
                .context_switch(&self.contexts[from.index()], &self.contexts[to.index()]);
        }
    }

    fn guard_intact(&self, st: &SchedState, id: TaskId) -> bool {
        !self.config.stack_guard || st.tasks.get(id).map_or(true, |t| canary_intact(&t.stack))
    }
}

// ============================================================================
// Lock seam
// ============================================================================

impl<H: Hal> LockSched for Kernel<H> {
    type Hal = H;

    fn hal(&self) -> &H {
        &self.hal
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn current(&self) -> Option<TaskId> {
        self.current_id()
    }

    fn yield_now(&self) {
        Kernel::yield_now(self);
    }

    fn park(&self) {
        self.masked(|| {
            let mut st = self.sched.lock();
            let Some(cur) = st.current else {
                drop(st);
                core::hint::spin_loop();
                return;
            };
            let tcb = st.tcb(cur);
            if tcb.wake_token {
                tcb.wake_token = false;
                return;
            }
            st.block(cur, WaitReason::Lock);
            self.switch_from(st, cur);
        });
    }

    fn unpark(&self, id: TaskId) {
        self.with_sched(|st| {
            if st.is_waiting(id, WaitReason::Lock) {
                st.make_ready(id);
            } else {
                st.tcb(id).wake_token = true;
            }
        });
    }

    fn check_order(&self, tier: Tier) {
        let held = self.with_sched(|st| {
            st.current
                .and_then(|cur| st.tasks.get(cur))
                .and_then(Tcb::highest_held)
        });
        if let Some(held) = held {
            if held > tier {
                self.report(Violation::TierOrder { held, wanted: tier });
            }
        }
    }

    fn note_acquire(&self, tier: Tier) {
        self.with_sched(|st| {
            if let Some(cur) = st.current {
                let count = &mut st.tcb(cur).held[tier.index()];
                *count = count.saturating_add(1);
            }
        });
    }

    fn note_release(&self, tier: Tier) {
        self.with_sched(|st| {
            if let Some(cur) = st.current {
                let count = &mut st.tcb(cur).held[tier.index()];
                *count = count.saturating_sub(1);
            }
        });
    }

    fn note_contention(&self) {
        self.counters.lock_contended.inc();
    }

    fn report(&self, v: Violation) {
        Kernel::report(self, v);
    }
}

// ============================================================================
// Entry points handed to the HAL
// ============================================================================

/// First code run by every task context
fn task_entry<H: Hal>(kernel_addr: usize) {
    // SAFETY: `spawn` passes the address of a 'static kernel
    let kernel: &'static Kernel<H> = unsafe { &*(kernel_addr as *const Kernel<H>) };
    kernel.hal.irq_enable();

    let start = kernel
        .current_id()
        .and_then(|id| kernel.starts.lock()[id.index()]);
    if let Some(start) = start {
        (start.entry)(kernel, start.arg);
    }
    kernel.exit(0);
}

/// Timer interrupt handler
fn tick_entry<H: Hal>(kernel_addr: usize) {
    // SAFETY: `run` passes the address of a 'static kernel
    let kernel: &Kernel<H> = unsafe { &*(kernel_addr as *const Kernel<H>) };
    kernel.tick();
}

fn write_canary(stack: &StackRegion) {
    if stack.len() >= 4 {
        // SAFETY: the region is writable task stack memory
        unsafe { ptr::write_volatile(stack.base() as *mut [u8; 4], STACK_CANARY.to_le_bytes()) };
    }
}

fn canary_intact(stack: &StackRegion) -> bool {
    if stack.len() < 4 {
        return true;
    }
    // SAFETY: the region is task stack memory written by `write_canary`
    let bytes = unsafe { ptr::read_volatile(stack.base() as *const [u8; 4]) };
    u32::from_le_bytes(bytes) == STACK_CANARY
}
