//! Atomic helpers behind the [`Hal`] provided methods
//!
//! Widths with native read-modify-write support use the `core` atomics
//! directly. On parts without them (AVR, Cortex-M0) only plain loads and
//! stores exist, so the read-modify-write runs with interrupts masked. That
//! is enough on a single core: nothing else can observe the cell between the
//! load and the store.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use super::Hal;

/// Interrupt-masked read-modify-write, usable on every target
pub mod emulated {
    use super::*;

    macro_rules! emulated_ops {
        ($swap:ident, $cas:ident, $atomic:ty, $int:ty) => {
            /// Exchange with interrupts masked
            pub fn $swap<H: Hal + ?Sized>(hal: &H, cell: &$atomic, value: $int) -> $int {
                let state = hal.irq_save();
                let old = cell.load(Ordering::Relaxed);
                cell.store(value, Ordering::Relaxed);
                hal.irq_restore(state);
                hal.memory_barrier();
                old
            }

            /// Compare-exchange with interrupts masked
            pub fn $cas<H: Hal + ?Sized>(
                hal: &H,
                cell: &$atomic,
                current: $int,
                new: $int,
            ) -> Result<$int, $int> {
                let state = hal.irq_save();
                let old = cell.load(Ordering::Relaxed);
                if old == current {
                    cell.store(new, Ordering::Relaxed);
                }
                hal.irq_restore(state);
                hal.memory_barrier();
                if old == current {
                    Ok(old)
                } else {
                    Err(old)
                }
            }
        };
    }

    emulated_ops!(swap_u8, compare_exchange_u8, AtomicU8, u8);
    emulated_ops!(swap_u16, compare_exchange_u16, AtomicU16, u16);
    emulated_ops!(swap_u32, compare_exchange_u32, AtomicU32, u32);
}

macro_rules! dispatch_ops {
    ($width:literal, $swap:ident, $cas:ident, $atomic:ty, $int:ty) => {
        /// Exchange, native where the target supports it
        #[inline]
        pub fn $swap<H: Hal + ?Sized>(hal: &H, cell: &$atomic, value: $int) -> $int {
            #[cfg(target_has_atomic = $width)]
            {
                let _ = hal;
                cell.swap(value, Ordering::AcqRel)
            }
            #[cfg(not(target_has_atomic = $width))]
            {
                emulated::$swap(hal, cell, value)
            }
        }

        /// Compare-exchange, native where the target supports it
        #[inline]
        pub fn $cas<H: Hal + ?Sized>(
            hal: &H,
            cell: &$atomic,
            current: $int,
            new: $int,
        ) -> Result<$int, $int> {
            #[cfg(target_has_atomic = $width)]
            {
                let _ = hal;
                cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            }
            #[cfg(not(target_has_atomic = $width))]
            {
                emulated::$cas(hal, cell, current, new)
            }
        }
    };
}

dispatch_ops!("8", swap_u8, compare_exchange_u8, AtomicU8, u8);
dispatch_ops!("16", swap_u16, compare_exchange_u16, AtomicU16, u16);
dispatch_ops!("32", swap_u32, compare_exchange_u32, AtomicU32, u32);
