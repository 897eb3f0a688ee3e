//! Door descriptors
//!
//! A descriptor says where a task's door slot leads and how big its message
//! is. It is packed into exactly two bytes so the per-task tables fit the
//! persistent region of small parts:
//!
//! | Byte | Bits | Field                                    |
//! |------|------|------------------------------------------|
//! | 0    | 0-7  | target task id                           |
//! | 1    | 0-3  | message words (8 bytes each), 0 = unused |
//! | 1    | 4-7  | [`DoorFlags`]                            |

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::config::{DOOR_MAX_WORDS, DOOR_WORD_BYTES};
use crate::types::TaskId;

bitflags! {
    /// Per-door protocol options (4 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoorFlags: u8 {
        /// Append a CRC-8 of the payload to the slab
        const CHECKSUM = 0b0001;
    }
}

const WORDS_MASK: u8 = 0x0f;
const FLAGS_SHIFT: u8 = 4;

/// Packed two-byte door descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct DoorDescriptor {
    target: u8,
    meta: u8,
}

const _: () = assert!(core::mem::size_of::<DoorDescriptor>() == 2);

impl DoorDescriptor {
    /// Unused slot
    pub const EMPTY: DoorDescriptor = DoorDescriptor { target: 0, meta: 0 };

    /// Pack a descriptor; `words` and `flags` are cut to four bits
    pub const fn new(target: TaskId, words: u8, flags: DoorFlags) -> Self {
        Self {
            target: target.0,
            meta: (words & WORDS_MASK) | ((flags.bits() & WORDS_MASK) << FLAGS_SHIFT),
        }
    }

    /// Callee task
    pub const fn target(&self) -> TaskId {
        TaskId(self.target)
    }

    /// Payload length in words
    pub const fn words(&self) -> u8 {
        self.meta & WORDS_MASK
    }

    /// Protocol flags
    pub const fn flags(&self) -> DoorFlags {
        DoorFlags::from_bits_retain(self.meta >> FLAGS_SHIFT)
    }

    /// Whether the slot is unused
    pub const fn is_empty(&self) -> bool {
        self.words() == 0
    }

    /// Payload length in bytes
    pub const fn payload_len(&self) -> usize {
        self.words() as usize * DOOR_WORD_BYTES
    }

    /// Bytes the payload occupies in the slab, checksum included
    pub const fn slab_len(&self) -> usize {
        let trailer = if self.flags().contains(DoorFlags::CHECKSUM) {
            1
        } else {
            0
        };
        self.payload_len() + trailer
    }

    /// In-memory byte layout
    pub const fn to_bytes(self) -> [u8; 2] {
        [self.target, self.meta]
    }

    /// Descriptor from its byte layout
    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self {
            target: bytes[0],
            meta: bytes[1],
        }
    }
}

/// One descriptor slot in the persistent table
///
/// Only the owning task writes its row, so the two bytes never tear in a
/// way another task could observe mid-call.
#[derive(Debug)]
#[repr(C)]
pub struct DoorCell {
    bytes: [AtomicU8; 2],
}

impl DoorCell {
    pub const fn new() -> Self {
        Self {
            bytes: [AtomicU8::new(0), AtomicU8::new(0)],
        }
    }

    pub fn load(&self) -> DoorDescriptor {
        DoorDescriptor::from_bytes([
            self.bytes[0].load(Ordering::Acquire),
            self.bytes[1].load(Ordering::Acquire),
        ])
    }

    pub fn store(&self, desc: DoorDescriptor) {
        let [target, meta] = desc.to_bytes();
        // Clear the size first so a half-written slot reads as empty
        self.bytes[1].store(0, Ordering::Release);
        self.bytes[0].store(target, Ordering::Release);
        self.bytes[1].store(meta, Ordering::Release);
    }
}

impl Default for DoorCell {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(DOOR_MAX_WORDS == WORDS_MASK);
