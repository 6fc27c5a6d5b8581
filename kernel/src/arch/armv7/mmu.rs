//! cp15 side of the short-descriptor MMU
//!
//! TTBR0 carries the active user translation table, TTBR1 the kernel one;
//! TTBCR is set to the 2 GiB/2 GiB split during bringup.

/// Install a user first-level table (TTBR0).
#[inline]
pub fn set_ttbr0(table: u32) {
    #[cfg(target_arch = "arm")]
    // SAFETY: writes the translation table base register
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c2, c0, 0", in(reg) table, options(nostack));
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = table;
}

/// Install the kernel first-level table (TTBR1).
#[inline]
pub fn set_ttbr1(table: u32) {
    #[cfg(target_arch = "arm")]
    // SAFETY: writes the translation table base register
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c2, c0, 1", in(reg) table, options(nostack));
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = table;
}

/// Invalidate the entire unified TLB.
#[inline]
pub fn invalidate_tlb() {
    #[cfg(target_arch = "arm")]
    // SAFETY: TLBIALL takes an ignored register operand
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c8, c7, 0", in(reg) 0u32, options(nostack));
    }
}

/// Invalidate the TLB entry covering one virtual address.
#[inline]
pub fn invalidate_tlb_address(virt: u32) {
    #[cfg(target_arch = "arm")]
    // SAFETY: TLBIMVA with the address to drop
    unsafe {
        core::arch::asm!("mcr p15, 0, {0}, c8, c7, 1", in(reg) virt, options(nostack));
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = virt;
}
