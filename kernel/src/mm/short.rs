//! ARMv7 short-descriptor formats
//!
//! First-level entries are either invalid, a section, or a pointer to a
//! 1 KiB second-level table of 256 small-page descriptors. Only table and
//! small-page descriptors are produced here; sections exist solely in the
//! boot bringup, which is outside this crate.

use bitfield_struct::bitfield;

use super::{ContextKind, MemoryType, PageFlags, PhysicalAddress, PAGE_SIZE};

/// First-level descriptor type for a page-table pointer.
pub const FIRST_LEVEL_TYPE_TABLE: u8 = 0b01;
/// Second-level descriptor type bit for a small page.
pub const SECOND_LEVEL_TYPE_SMALL: bool = true;

/// Size of a second-level table in bytes.
pub const SECOND_LEVEL_SIZE: usize = 1024;
/// Descriptors per second-level table.
pub const SECOND_LEVEL_ENTRIES: usize = 256;
/// How many second-level tables one frame is carved into.
pub const TABLES_PER_FRAME: usize = PAGE_SIZE / SECOND_LEVEL_SIZE;

/// Kernel first-level table: 4 GiB of space, 4096 entries.
pub const FIRST_LEVEL_SIZE_KERNEL: usize = 16 * 1024;
pub const FIRST_LEVEL_ALIGN_KERNEL: usize = 16 * 1024;
pub const FIRST_LEVEL_ENTRIES_KERNEL: usize = 4096;

/// User first-level table: 2 GiB of space, 2048 entries.
pub const FIRST_LEVEL_SIZE_USER: usize = 8 * 1024;
pub const FIRST_LEVEL_ALIGN_USER: usize = 8 * 1024;
pub const FIRST_LEVEL_ENTRIES_USER: usize = 2048;

/// All mappings use domain 0, configured as client in the DACR.
pub const DOMAIN_CLIENT: u8 = 0;

/// Mask isolating the second-level table base in a first-level descriptor.
pub const FIRST_LEVEL_BASE_MASK: u32 = 0xFFFF_FC00;
/// Mask isolating the frame base in a small-page descriptor.
pub const SECOND_LEVEL_BASE_MASK: u32 = 0xFFFF_F000;

/// Index of the first-level slot covering `virt` (one per MiB).
pub const fn first_level_index(virt: u32) -> usize {
    (virt >> 20) as usize
}

/// Index of the page descriptor inside its second-level table.
pub const fn second_level_index(virt: u32) -> usize {
    ((virt >> 12) & 0xFF) as usize
}

/// First-level descriptor pointing at a second-level table.
#[bitfield(u32)]
pub struct TableDescriptor {
    #[bits(2)]
    pub kind: u8,
    pub privileged_execute_never: bool,
    pub non_secure: bool,
    pub sbz: bool,
    #[bits(4)]
    pub domain: u8,
    pub implementation_defined: bool,
    #[bits(22)]
    pub base: u32,
}

impl TableDescriptor {
    /// Descriptor for a fresh table. The non-secure bit is set for user
    /// contexts only.
    pub fn for_table(table: PhysicalAddress, non_secure: bool) -> Self {
        Self::new()
            .with_kind(FIRST_LEVEL_TYPE_TABLE)
            .with_domain(DOMAIN_CLIENT)
            .with_non_secure(non_secure)
            .with_base((table.as_u64() as u32) >> 10)
    }

    pub fn table_address(self) -> PhysicalAddress {
        PhysicalAddress::new((u32::from(self) & FIRST_LEVEL_BASE_MASK) as u64)
    }
}

/// Second-level small-page descriptor.
#[bitfield(u32)]
pub struct SmallPageDescriptor {
    pub execute_never: bool,
    pub small_page: bool,
    pub bufferable: bool,
    pub cacheable: bool,
    #[bits(2)]
    pub access_permission: u8,
    #[bits(3)]
    pub tex: u8,
    pub access_permission_extended: bool,
    pub shareable: bool,
    pub not_global: bool,
    #[bits(20)]
    pub base: u32,
}

impl SmallPageDescriptor {
    pub fn page_address(self) -> PhysicalAddress {
        PhysicalAddress::new((u32::from(self) & SECOND_LEVEL_BASE_MASK) as u64)
    }
}

/// Access-permission classes of the classic (AFE = 0) encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPermission {
    NoAccess,
    PrivilegedRw,
    FullRw,
    PrivilegedRo,
    UserRo,
}

impl AccessPermission {
    const fn ap(self) -> u8 {
        match self {
            Self::NoAccess => 0b00,
            Self::PrivilegedRw => 0b01,
            Self::FullRw => 0b11,
            Self::PrivilegedRo => 0b01,
            Self::UserRo => 0b10,
        }
    }

    const fn apx(self) -> bool {
        matches!(self, Self::PrivilegedRo)
    }
}

/// Build the descriptor for one mapped page.
///
/// Readability selects the read-only class for the context kind, a write
/// request upgrades it to the read-write class. Device and strongly-ordered
/// memory force execute-never regardless of the requested flags.
pub fn leaf_descriptor(
    phys: PhysicalAddress,
    memory: MemoryType,
    flags: PageFlags,
    kind: ContextKind,
) -> SmallPageDescriptor {
    let kernel = kind == ContextKind::Kernel;
    let mut permission = AccessPermission::NoAccess;
    if flags.contains(PageFlags::READ) {
        permission = if kernel {
            AccessPermission::PrivilegedRo
        } else {
            AccessPermission::UserRo
        };
    }
    if flags.contains(PageFlags::WRITE) {
        permission = if kernel {
            AccessPermission::PrivilegedRw
        } else {
            AccessPermission::FullRw
        };
    }

    let mut descriptor = SmallPageDescriptor::new()
        .with_small_page(SECOND_LEVEL_TYPE_SMALL)
        .with_execute_never(!flags.contains(PageFlags::EXECUTABLE))
        .with_access_permission(permission.ap())
        .with_access_permission_extended(permission.apx())
        .with_base((phys.as_u64() as u32) >> 12);

    descriptor = match memory {
        MemoryType::Device => descriptor
            .with_cacheable(false)
            .with_bufferable(false)
            .with_tex(2)
            .with_execute_never(true),
        MemoryType::StronglyOrdered => descriptor
            .with_cacheable(false)
            .with_bufferable(false)
            .with_tex(0)
            .with_execute_never(true),
        MemoryType::Normal => descriptor
            .with_cacheable(true)
            .with_bufferable(true)
            .with_tex(1),
        MemoryType::NormalNonCacheable => descriptor
            .with_cacheable(false)
            .with_bufferable(false)
            .with_tex(1),
    };
    descriptor
}
