//! Door calls
//!
//! A call copies the caller's buffer into the slab and switches straight to
//! the callee, which must be parked in [`Kernel::door_wait`] or
//! [`Kernel::door_return`]. The callee reads and overwrites the slab in
//! place through [`Kernel::door_message`], then `door_return` switches back
//! to the caller, which copies the reply out. Neither switch goes through the
//! ready queue.
//!
//! ```text
//! caller                         callee
//! door_call ──copy in──┐         door_wait / door_return (Blocked)
//!   Blocked(DoorReply) └──────▶  running: door_message()
//!                       ┌──────  door_return
//!   copy out ◀──────────┘        Blocked(DoorServe)
//! ```

use crate::arch::Hal;
use crate::config::{DOOR_MAX_WORDS, DOOR_SLAB_SIZE, DOOR_SLOTS};
use crate::error::{KernError, KernResult, Violation};
use crate::ipc::door::{DoorDescriptor, DoorFlags};
use crate::ipc::slab::{DoorMessage, Phase};
use crate::kern::sched_prim::Kernel;
use crate::kern::task::WaitReason;
use crate::types::TaskId;

fn check_door(slot: usize, target: TaskId, words: u8, flags: DoorFlags) -> KernResult<()> {
    if slot >= DOOR_SLOTS {
        return Err(KernError::InvalidSlot);
    }
    if words == 0 || words > DOOR_MAX_WORDS {
        return Err(KernError::InvalidDoorSize);
    }
    let desc = DoorDescriptor::new(target, words, flags);
    if desc.slab_len() > DOOR_SLAB_SIZE {
        return Err(KernError::InvalidDoorSize);
    }
    if !target.is_valid() {
        return Err(KernError::InvalidTarget);
    }
    Ok(())
}

impl<H: Hal> Kernel<H> {
    /// Install a door in slot `slot` of the running task's table
    ///
    /// Overwrites whatever the slot held. A rejected request leaves the slot
    /// unchanged.
    pub fn door_register(
        &self,
        slot: usize,
        target: TaskId,
        words: u8,
        flags: DoorFlags,
    ) -> KernResult<()> {
        let owner = self.current_id().ok_or(KernError::NoCurrentTask)?;
        if let Err(err) = check_door(slot, target, words, flags) {
            log::warn!("{} door {} rejected: {}", owner, slot, err);
            return Err(err);
        }
        self.doors
            .set_descriptor(owner, slot, DoorDescriptor::new(target, words, flags));
        log::debug!("{} door {} -> {} ({} words)", owner, slot, target, words);
        Ok(())
    }

    /// Descriptor in slot `slot` of the running task's table
    pub fn door_descriptor(&self, slot: usize) -> Option<DoorDescriptor> {
        let owner = self.current_id()?;
        self.doors.descriptor(owner, slot)
    }

    /// Call the door in `slot` with `buf` as payload and reply buffer
    ///
    /// The first `words * 8` bytes of `buf` are sent; on return they hold the
    /// callee's reply. Blocks until the callee returns.
    pub fn door_call(&self, slot: usize, buf: &mut [u8]) -> KernResult<()> {
        let cur = self.current_id().ok_or(KernError::NoCurrentTask)?;
        let desc = self
            .doors
            .descriptor(cur, slot)
            .ok_or(KernError::InvalidSlot)?;
        if desc.is_empty() {
            return Err(KernError::EmptySlot);
        }
        let need = desc.payload_len();
        if buf.len() < need {
            return Err(KernError::BufferTooSmall {
                len: buf.len(),
                need,
            });
        }
        let target = desc.target();
        if target == cur || !target.is_valid() {
            return Err(KernError::InvalidTarget);
        }

        self.masked(|| {
            let mut st = self.sched.lock();
            let claimed = self
                .hal()
                .compare_exchange_u8(&self.doors.phase, Phase::Idle as u8, Phase::Calling as u8)
                .is_ok();
            if !claimed {
                drop(st);
                self.report(Violation::DoorReentered);
                return Err(KernError::DoorBusy);
            }
            if !st.is_waiting(target, WaitReason::DoorServe) {
                self.doors.set_phase(Phase::Idle);
                return Err(KernError::TargetNotWaiting);
            }

            // SAFETY: the phase claim above makes this the only slab user
            let len = unsafe { self.doors.fill(&buf[..need], desc.flags()) };
            self.doors.record_call(cur, desc, len);
            self.counters.door_calls.inc();
            if len > need {
                self.counters.door_checksums.inc();
            }

            self.hal().memory_barrier();
            st.block(cur, WaitReason::DoorReply);
            self.handoff(st, cur, target);

            self.hal().memory_barrier();
            // SAFETY: the callee has returned; the slab is ours until Idle
            unsafe { self.doors.drain(&mut buf[..need]) };
            self.doors.set_phase(Phase::Idle);
            Ok(())
        })
    }

    /// Park the running task until a door call targets it
    pub fn door_wait(&self) -> KernResult<()> {
        self.masked(|| {
            let mut st = self.sched.lock();
            let cur = st.current.ok_or(KernError::NoCurrentTask)?;
            st.block(cur, WaitReason::DoorServe);
            self.switch_from(st, cur);
            Ok(())
        })
    }

    /// Reply to the pending call and park until the next one
    ///
    /// The reply is whatever the slab holds. Must be called exactly once per
    /// inbound call, with no [`DoorMessage`] alive.
    pub fn door_return(&self) -> KernResult<()> {
        self.masked(|| {
            let mut st = self.sched.lock();
            let cur = st.current.ok_or(KernError::NoCurrentTask)?;
            let caller = self.doors.caller();
            let pending = self.doors.phase() == Phase::Calling
                && self.doors.callee() == cur
                && st.is_waiting(caller, WaitReason::DoorReply);
            if !pending {
                drop(st);
                self.report(Violation::NoPendingCall);
                return Err(KernError::NoPendingCall);
            }
            if self.doors.is_borrowed() {
                drop(st);
                self.report(Violation::MessageHeld);
                return Err(KernError::DoorBusy);
            }

            self.hal().memory_barrier();
            self.doors.set_phase(Phase::Replied);
            st.block(cur, WaitReason::DoorServe);
            self.handoff(st, cur, caller);
            Ok(())
        })
    }

    fn serving(&self) -> bool {
        self.doors.phase() == Phase::Calling && self.current_id() == Some(self.doors.callee())
    }

    /// In-flight message, for the callee of the pending call
    ///
    /// `None` for any other task, or while a previous guard is alive.
    pub fn door_message(&self) -> Option<DoorMessage<'_>> {
        if !self.serving() {
            return None;
        }
        self.doors.borrow()
    }

    /// Caller of the pending call
    pub fn door_caller(&self) -> Option<TaskId> {
        self.serving().then(|| self.doors.caller())
    }

    /// Payload size of the pending call, in words
    pub fn door_words(&self) -> Option<u8> {
        self.serving().then(|| self.doors.words())
    }

    /// Flags of the pending call
    pub fn door_flags(&self) -> Option<DoorFlags> {
        self.serving().then(|| self.doors.flags())
    }
}
