//! Memory management
//!
//! Short-descriptor virtual memory for ARMv7: page-table construction,
//! per-process address-space contexts, the temporary window used to reach
//! foreign physical pages, and shared-memory areas on top of it. Physical
//! frames come from an external allocator behind [`FrameBacking`].

pub mod phys;
pub mod shared;
pub mod short;
pub mod table_pool;
pub mod temporary;
pub mod virt;

pub use phys::{FrameBacking, PageFrame};
pub use virt::{ContextKind, VirtContext, VirtError, VirtualMemory};

/// Size of one page and one physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Physical address. The bus is wider than the 32-bit virtual space, so
/// physical addresses are carried as 64-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn align_down_page(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }
}

/// Virtual address in the 32-bit address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn align_down_page(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u32)
    }

    pub const fn align_up_page(self) -> Self {
        Self((self.0 + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1))
    }
}

/// Round a byte count up to whole pages.
pub const fn round_up_to_page(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Memory type of a mapping, selecting cacheability and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Normal memory, cacheable and bufferable.
    Normal,
    /// Normal memory with caching disabled.
    NormalNonCacheable,
    /// Device memory.
    Device,
    /// Strongly-ordered memory.
    StronglyOrdered,
}

bitflags::bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_address_alignment() {
        let addr = VirtualAddress::new(0x1234_5678);
        assert_eq!(addr.align_down_page().as_u32(), 0x1234_5000);
        assert_eq!(addr.page_offset(), 0x678);
        assert_eq!(addr.align_up_page().as_u32(), 0x1234_6000);
    }

    #[test]
    fn test_physical_address_alignment() {
        let addr = PhysicalAddress::new(0x4000_1abc);
        assert_eq!(addr.align_down_page().as_u64(), 0x4000_1000);
        assert_eq!(addr.page_offset(), 0xabc);
        assert!(!addr.is_page_aligned());
    }

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
