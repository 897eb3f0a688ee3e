//! Task Control Blocks
//!
//! The task table is a fixed array of [`Tcb`]s indexed by [`TaskId`]. Slots
//! are never freed back to an allocator; an exited task stays a zombie until
//! it is joined or its slot is recycled for a new task.
//!
//! ## State machine
//!
//! ```text
//! Ready --dispatch--> Running --block--> Blocked --wake--> Ready
//!                        |
//!                        +--exit--> Zombie --join/recycle--> Free
//! ```

use crate::config::{MAX_TASKS, MIN_STACK};
use crate::error::{KernError, KernResult};
use crate::kern::lock::Tier;
use crate::types::{Priority, StackRegion, TaskId, Tick};

// ============================================================================
// Task State
// ============================================================================

/// Scheduler state of a task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot never used, or its zombie was joined
    Free,
    /// Waiting in the ready queue
    Ready,
    /// Owns the processor
    Running,
    /// Waiting for the condition in its [`WaitReason`]
    Blocked,
    /// Exited; holds the exit status until joined or recycled
    Zombie,
}

impl TaskState {
    /// Whether the task has not exited
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            TaskState::Ready | TaskState::Running | TaskState::Blocked
        )
    }
}

/// What a blocked task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None,
    /// Sleeping until the tick counter reaches the deadline
    Sleep(Tick),
    /// Queued on a tier 3/4 lock
    Lock,
    /// Door server waiting for the next call
    DoorServe,
    /// Door caller waiting for the reply
    DoorReply,
    /// Waiting for a task to exit
    Join(TaskId),
    /// Waiting for outstanding dependency signals
    Deps,
}

// ============================================================================
// Task Control Block
// ============================================================================

/// Per-task scheduler record
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    pub(crate) priority: Priority,
    pub(crate) stack: StackRegion,
    pub(crate) wait: WaitReason,
    pub(crate) exit_status: i32,
    /// Exit status delivered to a joiner
    pub(crate) join_status: Option<i32>,
    /// Dependency signals received minus signals awaited
    pub(crate) deps: i16,
    /// Unpark that arrived before the task parked
    pub(crate) wake_token: bool,
    /// Count of held locks per tier
    pub(crate) held: [u8; 4],
    /// Number of times the slot was handed out since boot
    pub(crate) generation: u8,
}

impl Tcb {
    const fn empty(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Free,
            priority: Priority::NORMAL,
            // SAFETY: an empty region is never dereferenced
            stack: unsafe { StackRegion::from_raw(0, 0) },
            wait: WaitReason::None,
            exit_status: 0,
            join_status: None,
            deps: 0,
            wake_token: false,
            held: [0; 4],
            generation: 0,
        }
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Scheduling priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Stack bounds
    pub fn stack(&self) -> StackRegion {
        self.stack
    }

    /// Blocking reason (`None` unless blocked)
    pub fn wait_reason(&self) -> WaitReason {
        self.wait
    }

    /// Exit status, meaningful once the task is a zombie
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Highest tier among the locks the task holds
    pub(crate) fn highest_held(&self) -> Option<Tier> {
        Tier::ALL
            .iter()
            .rev()
            .copied()
            .find(|tier| self.held[tier.index()] > 0)
    }

    pub(crate) fn holds_locks(&self) -> bool {
        self.held.iter().any(|&n| n > 0)
    }
}

/// Result of a successful [`TaskTable::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocated {
    pub id: TaskId,
    /// The slot was used earlier in this boot
    pub recycled: bool,
}

// ============================================================================
// Task Table
// ============================================================================

/// Fixed-capacity TCB arena
#[derive(Debug)]
pub struct TaskTable {
    slots: [Tcb; MAX_TASKS],
}

impl TaskTable {
    /// Table with every slot free
    pub const fn new() -> Self {
        let mut slots = [Tcb::empty(TaskId(0)); MAX_TASKS];
        let mut i = 0;
        while i < MAX_TASKS {
            slots[i].id = TaskId(i as u8);
            i += 1;
        }
        Self { slots }
    }

    /// Claim a slot for a new task and mark it ready
    ///
    /// Free slots are used first; otherwise the lowest-numbered zombie is
    /// recycled. Validation failures leave the table untouched.
    pub fn allocate(&mut self, priority: Priority, stack: StackRegion) -> KernResult<Allocated> {
        if !priority.is_valid() {
            return Err(KernError::InvalidPriority);
        }
        if stack.len() < MIN_STACK {
            return Err(KernError::StackTooSmall);
        }
        if let Some(other) = self
            .slots
            .iter()
            .find(|t| t.state.is_live() && t.stack.overlaps(&stack))
        {
            return Err(KernError::StackOverlap(other.id));
        }

        let slot = self
            .slots
            .iter()
            .position(|t| t.state == TaskState::Free)
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|t| t.state == TaskState::Zombie)
            })
            .ok_or(KernError::NoFreeSlot)?;

        let tcb = &mut self.slots[slot];
        let recycled = tcb.generation > 0;
        *tcb = Tcb {
            state: TaskState::Ready,
            priority,
            stack,
            generation: tcb.generation.wrapping_add(1).max(1),
            ..Tcb::empty(tcb.id)
        };
        Ok(Allocated {
            id: tcb.id,
            recycled,
        })
    }

    /// Look up a slot
    pub fn get(&self, id: TaskId) -> Option<&Tcb> {
        self.slots.get(id.index())
    }

    /// Look up a slot mutably
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.index())
    }

    /// All slots in id order
    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter()
    }

    /// Number of tasks that have not exited
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|t| t.state.is_live()).count()
    }

    /// Number of exited tasks not yet reaped
    pub fn zombie_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|t| t.state == TaskState::Zombie)
            .count()
    }

    /// Whether any task waits on something an interrupt handler can end
    ///
    /// Sleep deadlines, dependency signals and lock releases can all come
    /// from an ISR. Door and join waits only end through another task.
    pub fn any_awaiting_interrupt(&self) -> bool {
        self.slots.iter().any(|t| {
            t.state == TaskState::Blocked
                && matches!(t.wait, WaitReason::Sleep(_) | WaitReason::Deps | WaitReason::Lock)
        })
    }

    /// Sleepers whose deadline `now` has reached, in wake order
    ///
    /// Tasks waking on the same tick are ordered by priority, then by id.
    pub fn due_sleepers(&self, now: Tick) -> heapless::Vec<TaskId, MAX_TASKS> {
        let mut due: heapless::Vec<(Priority, TaskId), MAX_TASKS> = self
            .slots
            .iter()
            .filter(|t| t.state == TaskState::Blocked)
            .filter_map(|t| match t.wait {
                WaitReason::Sleep(deadline) if now.reached(deadline) => Some((t.priority, t.id)),
                _ => None,
            })
            .collect();
        due.sort_unstable();
        due.iter().map(|&(_, id)| id).collect()
    }

    /// Turn a live task into a zombie
    pub fn mark_zombie(&mut self, id: TaskId, status: i32) {
        if let Some(tcb) = self.get_mut(id) {
            tcb.state = TaskState::Zombie;
            tcb.wait = WaitReason::None;
            tcb.exit_status = status;
        }
    }

    /// Free a zombie slot, returning its exit status
    pub fn reap(&mut self, id: TaskId) -> Option<i32> {
        let tcb = self.get_mut(id)?;
        if tcb.state != TaskState::Zombie {
            return None;
        }
        tcb.state = TaskState::Free;
        Some(tcb.exit_status)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn region(n: usize) -> StackRegion {
        unsafe { StackRegion::from_raw(0x1_0000 + n * 0x100, 0x100) }
    }

    #[test]
    fn test_allocate_validation() {
        let mut table = TaskTable::new();

        assert_eq!(
            table.allocate(Priority(64), region(0)),
            Err(KernError::InvalidPriority)
        );
        let tiny = unsafe { StackRegion::from_raw(0x1000, MIN_STACK - 1) };
        assert_eq!(
            table.allocate(Priority::NORMAL, tiny),
            Err(KernError::StackTooSmall)
        );

        let first = table.allocate(Priority::NORMAL, region(0)).unwrap();
        assert_eq!(first, Allocated { id: TaskId(0), recycled: false });

        let overlapping = unsafe { StackRegion::from_raw(0x1_0080, 0x100) };
        assert_eq!(
            table.allocate(Priority::NORMAL, overlapping),
            Err(KernError::StackOverlap(TaskId(0)))
        );
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_zombie_recycled_after_free_slots() {
        let mut table = TaskTable::new();
        for n in 0..MAX_TASKS {
            table.allocate(Priority::NORMAL, region(n)).unwrap();
        }
        assert_eq!(
            table.allocate(Priority::NORMAL, region(MAX_TASKS)),
            Err(KernError::NoFreeSlot)
        );

        table.mark_zombie(TaskId(5), 1);
        table.mark_zombie(TaskId(2), 2);

        // The zombie's stack no longer counts as in use
        let again = table.allocate(Priority::NORMAL, region(2)).unwrap();
        assert_eq!(again, Allocated { id: TaskId(2), recycled: true });
        assert_eq!(table.get(TaskId(5)).unwrap().state(), TaskState::Zombie);
        assert_eq!(table.reap(TaskId(5)), Some(1));
        assert_eq!(table.reap(TaskId(5)), None);
    }

    #[test]
    fn test_awaiting_interrupt() {
        let mut table = TaskTable::new();
        let id = table.allocate(Priority::NORMAL, region(0)).unwrap().id;
        assert!(!table.any_awaiting_interrupt());

        table.get_mut(id).unwrap().state = TaskState::Blocked;
        for (wait, expected) in [
            (WaitReason::Deps, true),
            (WaitReason::Lock, true),
            (WaitReason::Sleep(Tick(3)), true),
            (WaitReason::DoorServe, false),
            (WaitReason::DoorReply, false),
            (WaitReason::Join(TaskId(1)), false),
        ] {
            table.get_mut(id).unwrap().wait = wait;
            assert_eq!(table.any_awaiting_interrupt(), expected, "{:?}", wait);
        }
    }

    #[test]
    fn test_due_sleepers_order() {
        let mut table = TaskTable::new();
        for (n, prio) in [(0, 9), (1, 3), (2, 3), (3, 1)] {
            let id = table.allocate(Priority(prio), region(n)).unwrap().id;
            let tcb = table.get_mut(id).unwrap();
            tcb.state = TaskState::Blocked;
            tcb.wait = WaitReason::Sleep(Tick(if n == 3 { 8 } else { 4 }));
        }

        assert!(table.any_awaiting_interrupt());
        assert!(table.due_sleepers(Tick(3)).is_empty());
        assert_eq!(
            table.due_sleepers(Tick(4)).as_slice(),
            &[TaskId(1), TaskId(2), TaskId(0)]
        );
        assert_eq!(
            table.due_sleepers(Tick(9)).as_slice(),
            &[TaskId(3), TaskId(1), TaskId(2), TaskId(0)]
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create(u8),
        Exit(u8),
        Join(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..70).prop_map(Op::Create),
            (0u8..MAX_TASKS as u8).prop_map(Op::Exit),
            (0u8..MAX_TASKS as u8).prop_map(Op::Join),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_live_tasks_bounded(ops in prop::collection::vec(op(), 0..64)) {
            let mut table = TaskTable::new();
            let mut next_stack = 0usize;

            for op in ops {
                match op {
                    Op::Create(prio) => {
                        let before = table.live_count();
                        let full = table.iter().all(|t| t.state().is_live());
                        match table.allocate(Priority(prio), region(next_stack)) {
                            Ok(done) => {
                                prop_assert!(prio <= 63);
                                prop_assert_eq!(table.live_count(), before + 1);
                                prop_assert_eq!(table.get(done.id).unwrap().state(), TaskState::Ready);
                            }
                            Err(KernError::InvalidPriority) => prop_assert!(prio > 63),
                            Err(KernError::NoFreeSlot) => prop_assert!(full),
                            Err(e) => prop_assert!(false, "unexpected {:?}", e),
                        }
                        next_stack += 1;
                    }
                    Op::Exit(id) => {
                        if table.get(TaskId(id)).unwrap().state().is_live() {
                            table.mark_zombie(TaskId(id), id as i32);
                        }
                    }
                    Op::Join(id) => {
                        let was_zombie = table.get(TaskId(id)).unwrap().state() == TaskState::Zombie;
                        prop_assert_eq!(table.reap(TaskId(id)).is_some(), was_zombie);
                    }
                }
                prop_assert!(table.live_count() <= MAX_TASKS);
            }
        }
    }
}
