//! Memory that survives a warm reset
//!
//! State placed in a [`NoInit`] cell has its own lifecycle: it is cleared
//! only when the reset cause says RAM was lost (or the magic word shows it
//! was never initialized), and left alone after a warm or watchdog reset so
//! that a call interrupted by the reset can be inspected afterwards.
//!
//! On bare-metal targets [`noinit_static!`] places the cell in the `.noinit`
//! linker section, which the startup code does not zero. Anything stored
//! there must be valid for every bit pattern, so the kernel only keeps
//! integer atomics and byte buffers in it.

use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::ResetReason;

/// Marker written once the contents have been initialized
const MAGIC: u32 = 0xD00B_5AFE;

/// State that knows how to reset itself to its cold-start value
pub trait Persist {
    /// Return every field to its power-on value
    fn clear(&self);
}

/// Outcome of [`NoInit::restore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restored {
    /// Contents were zeroed
    Cold,
    /// Contents survive from before the reset
    Warm,
}

/// Storage class for reset-surviving state
#[repr(C)]
pub struct NoInit<T: Persist> {
    magic: AtomicU32,
    value: T,
}

impl<T: Persist> NoInit<T> {
    /// Wrap a value; the initializer only matters on hosted builds
    pub const fn new(value: T) -> Self {
        Self {
            magic: AtomicU32::new(0),
            value,
        }
    }

    /// Decide whether the contents survive `reset`
    pub fn restore(&self, reset: ResetReason) -> Restored {
        if reset.preserves_ram() && self.magic.load(Ordering::Acquire) == MAGIC {
            return Restored::Warm;
        }
        self.value.clear();
        self.magic.store(MAGIC, Ordering::Release);
        Restored::Cold
    }

    /// Forget the contents at the next restore
    pub fn invalidate(&self) {
        self.magic.store(0, Ordering::Release);
    }
}

impl<T: Persist> Deref for NoInit<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Declare a static in the reset-surviving region
///
/// ```ignore
/// doorkern::noinit_static!(static DOORS: DoorArea = DoorArea::new(););
/// ```
#[macro_export]
macro_rules! noinit_static {
    ($vis:vis static $name:ident: $ty:ty = $init:expr;) => {
        #[cfg_attr(target_os = "none", link_section = ".noinit")]
        $vis static $name: $crate::persist::NoInit<$ty> = $crate::persist::NoInit::new($init);
    };
}
