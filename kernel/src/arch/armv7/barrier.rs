//! Memory barriers

/// Data memory barrier.
#[inline]
pub fn data_memory() {
    #[cfg(target_arch = "arm")]
    // SAFETY: barrier instruction, no operands
    unsafe {
        core::arch::asm!("dmb", options(nostack));
    }
}

/// Data synchronization barrier.
#[inline]
pub fn data_sync() {
    #[cfg(target_arch = "arm")]
    // SAFETY: barrier instruction, no operands
    unsafe {
        core::arch::asm!("dsb", options(nostack));
    }
}

/// Instruction synchronization barrier.
#[inline]
pub fn instruction_sync() {
    #[cfg(target_arch = "arm")]
    // SAFETY: barrier instruction, no operands
    unsafe {
        core::arch::asm!("isb", options(nostack));
    }
}
