//! Compile-time layout of the kernel
//!
//! The 32-bit address space is split in half: user below `USER_END`, kernel
//! above. A fixed window inside the kernel half (the temporary area) is
//! reserved for scratch mappings of foreign physical pages.

use crate::mm::VirtualAddress;

/// Lowest user-space address.
pub const USER_START: u32 = 0x0000_0000;

/// First address above user space, start of the kernel half.
pub const USER_END: u32 = 0x8000_0000;

/// Start of the kernel half.
pub const KERNEL_START: u32 = 0x8000_0000;

/// Start of the temporary mapping window inside the kernel half.
pub const TEMPORARY_AREA_START: VirtualAddress = VirtualAddress::new(0xF100_0000);

/// Size of the reserved temporary window.
pub const TEMPORARY_AREA_SIZE: usize = 0x0100_0000;

/// Thread stack size, a multiple of the page size.
pub const STACK_SIZE: usize = 0x4000;

/// Bottom of the per-process region thread stacks are carved from.
pub const THREAD_STACK_AREA_START: u32 = 0x7000_0000;

/// Top of the per-process thread stack region (exclusive).
pub const THREAD_STACK_AREA_END: u32 = 0x8000_0000;

/// Longest accepted process name or RPC identifier, including terminator.
pub const MAX_NAME_LENGTH: usize = 256;
