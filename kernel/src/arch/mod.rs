//! Architecture support
//!
//! Only ARMv7-A in short-descriptor mode is supported. The cp15 accessors
//! compile to real instructions on `target_arch = "arm"` and to no-ops on
//! the host, which keeps every subsystem unit-testable.

pub mod armv7;

pub use armv7::context::{RegisterContext, CPSR_MODE_MASK, CPSR_MODE_USER, CPSR_THUMB};

/// Idle the CPU until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "arm")]
    // SAFETY: wfi has no operands and no side effects beyond sleeping
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }
    #[cfg(not(target_arch = "arm"))]
    core::hint::spin_loop();
}
