//! Door area: message slab, descriptor tables and call scratch
//!
//! All door traffic goes through one slab shared by every task. At most one
//! call is in flight kernel-wide, which is what makes the shared buffer safe
//! without a lock: the phase byte moves `Idle -> Calling` when a caller
//! claims the slab, `Calling -> Replied` when the callee returns, and back to
//! `Idle` once the caller has copied the reply out.
//!
//! The area lives in a [`NoInit`](crate::persist::NoInit) cell. After a warm
//! reset a phase other than `Idle` means a call was cut short; the scratch
//! bytes still say who called whom.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::{DOOR_SLAB_SIZE, DOOR_SLOTS, DOOR_WORD_BYTES, MAX_TASKS};
use crate::ipc::crc8;
use crate::ipc::door::{DoorCell, DoorDescriptor, DoorFlags};
use crate::persist::Persist;
use crate::types::TaskId;

/// Call progress, stored as a byte in the persistent area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// No call in flight
    Idle = 0,
    /// Payload copied in, callee running
    Calling = 1,
    /// Reply in the slab, caller not yet resumed
    Replied = 2,
}

impl Phase {
    /// Decode a stored byte; garbage reads as an unfinished call
    pub const fn from_u8(raw: u8) -> Phase {
        match raw {
            0 => Phase::Idle,
            2 => Phase::Replied,
            _ => Phase::Calling,
        }
    }
}

/// Call found in flight when the kernel came up after a warm reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptedCall {
    pub caller: TaskId,
    pub callee: TaskId,
    pub words: u8,
    pub flags: DoorFlags,
    /// The callee had already returned
    pub replied: bool,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_CELL: DoorCell = DoorCell::new();
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_ROW: [DoorCell; DOOR_SLOTS] = [EMPTY_CELL; DOOR_SLOTS];

/// Persistent door state
#[repr(C)]
pub struct DoorArea {
    slab: UnsafeCell<[u8; DOOR_SLAB_SIZE]>,
    table: [[DoorCell; DOOR_SLOTS]; MAX_TASKS],
    pub(crate) phase: AtomicU8,
    caller: AtomicU8,
    callee: AtomicU8,
    words: AtomicU8,
    flags: AtomicU8,
    /// Bytes of the slab in use, trailer included
    len: AtomicU8,
    /// Nonzero while a `DoorMessage` is alive
    borrowed: AtomicU8,
}

// SAFETY: the slab is only touched by the task that owns the current phase
// (the caller while claiming and after the reply, the callee in between),
// and only one task runs at a time.
unsafe impl Sync for DoorArea {}

impl DoorArea {
    pub const fn new() -> Self {
        Self {
            slab: UnsafeCell::new([0; DOOR_SLAB_SIZE]),
            table: [EMPTY_ROW; MAX_TASKS],
            phase: AtomicU8::new(Phase::Idle as u8),
            caller: AtomicU8::new(0),
            callee: AtomicU8::new(0),
            words: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            len: AtomicU8::new(0),
            borrowed: AtomicU8::new(0),
        }
    }

    /// Descriptor at (`owner`, `slot`); `None` if either is out of range
    pub fn descriptor(&self, owner: TaskId, slot: usize) -> Option<DoorDescriptor> {
        self.cell(owner, slot).map(DoorCell::load)
    }

    pub(crate) fn set_descriptor(&self, owner: TaskId, slot: usize, desc: DoorDescriptor) {
        if let Some(cell) = self.cell(owner, slot) {
            cell.store(desc);
        }
    }

    /// Forget every descriptor of `owner`
    pub(crate) fn clear_row(&self, owner: TaskId) {
        if let Some(row) = self.table.get(owner.index()) {
            row.iter().for_each(|cell| cell.store(DoorDescriptor::EMPTY));
        }
    }

    fn cell(&self, owner: TaskId, slot: usize) -> Option<&DoorCell> {
        self.table.get(owner.index())?.get(slot)
    }

    /// Current call phase
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Fill the call scratch for a call that has claimed the slab
    pub(crate) fn record_call(&self, caller: TaskId, desc: DoorDescriptor, len: usize) {
        self.caller.store(caller.0, Ordering::Relaxed);
        self.callee.store(desc.target().0, Ordering::Relaxed);
        self.words.store(desc.words(), Ordering::Relaxed);
        self.flags.store(desc.flags().bits(), Ordering::Relaxed);
        self.len.store(len as u8, Ordering::Relaxed);
        self.borrowed.store(0, Ordering::Relaxed);
    }

    pub fn caller(&self) -> TaskId {
        TaskId(self.caller.load(Ordering::Acquire))
    }

    pub fn callee(&self) -> TaskId {
        TaskId(self.callee.load(Ordering::Acquire))
    }

    pub fn words(&self) -> u8 {
        self.words.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> DoorFlags {
        DoorFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    fn len(&self) -> usize {
        usize::from(self.len.load(Ordering::Acquire)).min(DOOR_SLAB_SIZE)
    }

    pub(crate) fn is_borrowed(&self) -> bool {
        self.borrowed.load(Ordering::Acquire) != 0
    }

    /// Copy `payload` into the slab, appending a CRC if `flags` ask for it
    ///
    /// Returns the number of slab bytes used.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the slab by moving the phase to
    /// `Calling`, and `payload` must fit with its trailer.
    pub(crate) unsafe fn fill(&self, payload: &[u8], flags: DoorFlags) -> usize {
        // SAFETY: exclusive per the contract above
        let slab = unsafe { &mut *self.slab.get() };
        slab[..payload.len()].copy_from_slice(payload);
        if flags.contains(DoorFlags::CHECKSUM) {
            slab[payload.len()] = crc8::checksum(payload);
            payload.len() + 1
        } else {
            payload.len()
        }
    }

    /// Copy the first `out.len()` slab bytes into `out`
    ///
    /// # Safety
    ///
    /// Only the caller of the current call may drain, after it resumed.
    pub(crate) unsafe fn drain(&self, out: &mut [u8]) {
        // SAFETY: exclusive per the contract above
        let slab = unsafe { &*self.slab.get() };
        out.copy_from_slice(&slab[..out.len()]);
    }

    /// Borrow the in-flight message; `None` while another guard exists
    pub(crate) fn borrow(&self) -> Option<DoorMessage<'_>> {
        if self.borrowed.swap(1, Ordering::AcqRel) != 0 {
            return None;
        }
        Some(DoorMessage {
            area: self,
            len: self.len(),
        })
    }

    /// Take the record of an unfinished call and reset the call scratch
    pub fn take_interrupted(&self) -> Option<InterruptedCall> {
        let phase = self.phase();
        self.borrowed.store(0, Ordering::Release);
        if phase == Phase::Idle {
            return None;
        }
        let call = InterruptedCall {
            caller: self.caller(),
            callee: self.callee(),
            words: self.words(),
            flags: self.flags(),
            replied: phase == Phase::Replied,
        };
        self.set_phase(Phase::Idle);
        Some(call)
    }
}

impl Default for DoorArea {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist for DoorArea {
    fn clear(&self) {
        for id in 0..MAX_TASKS as u8 {
            self.clear_row(TaskId(id));
        }
        self.set_phase(Phase::Idle);
        self.record_call(TaskId(0), DoorDescriptor::EMPTY, 0);
        // SAFETY: restore runs before any task exists
        unsafe { (&mut *self.slab.get()).fill(0) };
    }
}

/// Callee's view of the in-flight message
///
/// Covers the payload and, for checksummed doors, the trailer byte. The
/// reply is written in place.
pub struct DoorMessage<'a> {
    area: &'a DoorArea,
    len: usize,
}

impl DoorMessage<'_> {
    /// Whether the checksum trailer matches the payload
    ///
    /// Always true for doors without [`DoorFlags::CHECKSUM`].
    pub fn verify(&self) -> bool {
        if !self.area.flags().contains(DoorFlags::CHECKSUM) {
            return true;
        }
        match self.split_last() {
            Some((trailer, payload)) => crc8::verify(payload, *trailer),
            None => false,
        }
    }

    /// Payload without the checksum trailer
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = self.area.words() as usize * DOOR_WORD_BYTES;
        let end = end.min(self.len);
        &mut self[..end]
    }
}

impl Deref for DoorMessage<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the guard is unique and only handed to the current callee
        unsafe { &(&*self.area.slab.get())[..self.len] }
    }
}

impl DerefMut for DoorMessage<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above
        unsafe { &mut (&mut *self.area.slab.get())[..self.len] }
    }
}

impl Drop for DoorMessage<'_> {
    fn drop(&mut self) {
        self.area.borrowed.store(0, Ordering::Release);
    }
}
