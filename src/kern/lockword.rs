//! Packed lock word
//!
//! Fast, queueing and sleep locks keep their whole state in one 16-bit word
//! stored next to the data they guard:
//!
//! ```text
//!  15   14        8 7         0
//! +---+------------+-----------+
//! | L |  waiters   |  owner    |
//! +---+------------+-----------+
//! ```
//!
//! `L` is the locked bit, `waiters` counts tasks queued on the lock (always
//! zero for fast locks) and `owner` is the holder's task id, or
//! [`ANONYMOUS`] when the lock was taken outside of any task.

/// Owner tag used by boot code and interrupt handlers
pub const ANONYMOUS: u8 = 0xff;

const LOCKED: u16 = 1 << 15;
const WAITER_SHIFT: u16 = 8;
const WAITER_MASK: u16 = 0x7f;
const OWNER_MASK: u16 = 0xff;

/// Decoded lock word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockWord {
    pub locked: bool,
    pub waiters: u8,
    pub owner: u8,
}

impl LockWord {
    /// Value of a free lock
    pub const UNLOCKED: u16 = 0;

    /// Word of a lock held by `owner` with no waiters
    pub const fn held_by(owner: u8) -> Self {
        Self {
            locked: true,
            waiters: 0,
            owner,
        }
    }

    /// Pack into the in-memory representation
    pub const fn encode(self) -> u16 {
        let locked = if self.locked { LOCKED } else { 0 };
        locked
            | (((self.waiters as u16) & WAITER_MASK) << WAITER_SHIFT)
            | (self.owner as u16 & OWNER_MASK)
    }

    /// Unpack an in-memory word
    pub const fn decode(raw: u16) -> Self {
        Self {
            locked: raw & LOCKED != 0,
            waiters: ((raw >> WAITER_SHIFT) & WAITER_MASK) as u8,
            owner: (raw & OWNER_MASK) as u8,
        }
    }
}
