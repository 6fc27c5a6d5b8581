//! Cache maintenance
//!
//! Used after self-modifying writes to user pages and around context
//! switches. The invalidate order required before returning to a patched
//! instruction is: data memory barrier, instruction cache, data cache,
//! prefetch buffer.

/// Invalidate the entire instruction cache.
#[inline]
pub fn invalidate_instruction_cache() {
    #[cfg(target_arch = "arm")]
    // SAFETY: ICIALLU takes an ignored register operand
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c7, c5, 0", in(reg) 0u32, options(nostack));
    }
}

/// Invalidate the data cache.
#[inline]
pub fn invalidate_data_cache() {
    #[cfg(target_arch = "arm")]
    // SAFETY: cache maintenance write, ignored operand
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c7, c6, 0", in(reg) 0u32, options(nostack));
    }
}

/// Invalidate the prefetch buffer (branch predictor).
#[inline]
pub fn invalidate_prefetch_buffer() {
    #[cfg(target_arch = "arm")]
    // SAFETY: BPIALL takes an ignored register operand
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c7, c5, 6", in(reg) 0u32, options(nostack));
    }
}
