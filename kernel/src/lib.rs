//! ObsidianOS kernel library
//!
//! Core of a 32-bit ARMv7 microkernel: short-descriptor virtual memory,
//! priority scheduling, per-process message queues and a synchronous RPC
//! engine that redirects user threads by patching their instruction stream.
//! The library exports everything needed for host-side testing.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// On bare-metal targets use the kernel heap; on the host (unit tests,
// coverage) delegate to the system allocator so test code using Vec/String
// compiles and runs under the standard harness.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;

/// Hand the bare-metal allocator its heap region.
///
/// # Safety
///
/// `start..start + size` must be mapped, writable and unused by anything
/// else for the lifetime of the kernel.
#[cfg(target_os = "none")]
pub unsafe fn init_heap(start: usize, size: usize) {
    // SAFETY: forwarded contract, see above.
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) }
}

#[cfg(all(target_os = "none", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    loop {
        crate::arch::wait_for_interrupt();
    }
}

pub mod arch;
pub mod collection;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kernel;
pub mod mm;
pub mod syscall;
pub mod task;

#[cfg(all(test, not(target_os = "none")))]
mod integration_tests;

pub use kernel::Kernel;
pub use mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
pub use task::{ProcessId, ThreadId};
