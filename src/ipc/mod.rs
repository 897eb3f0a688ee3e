//! Door RPC
//!
//! Synchronous, zero-copy calls between tasks. Each task owns a small table
//! of door descriptors; a call copies its payload into the one shared slab
//! and switches directly to the target task, which replies in place.

pub mod call;
pub mod crc8;
pub mod door;
pub mod slab;

pub use door::{DoorDescriptor, DoorFlags};
pub use slab::{DoorArea, DoorMessage, InterruptedCall, Phase};
