//! Virtual-memory manager
//!
//! Owns the table pool, the temporary window and the active-context
//! records. Every access to a table or page of a non-active context goes
//! through a temporary-window lease; there is no other path to foreign
//! physical pages. Until the manager is initialized (early bringup), the
//! window degrades to identity addressing.

use alloc::{boxed::Box, vec::Vec};

use super::{
    phys::FrameBacking,
    short::{self, SmallPageDescriptor, TableDescriptor},
    table_pool::TablePool,
    temporary::TemporaryArea,
    MemoryType, PageFlags, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};
use crate::{
    arch::armv7::{barrier, cache, mmu},
    config::{KERNEL_START, TEMPORARY_AREA_START, USER_END, USER_START},
    error,
};

/// Kind of an address-space context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Covers the whole 4 GiB space; mapped via TTBR1.
    Kernel,
    /// Covers the lower 2 GiB; mapped via TTBR0.
    User,
}

/// One address space: the physical address of its first-level table plus
/// its kind. Identity is the table address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtContext {
    pub table: PhysicalAddress,
    pub kind: ContextKind,
}

/// Failure kinds of the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtError {
    /// Physical or virtual allocation failed.
    OutOfMemory,
    /// The target page descriptor is already populated.
    AlreadyMapped,
    /// Walk or window resolution hit an unmapped location.
    UnmappedTarget,
    /// Operation applied to the wrong context kind.
    WrongContextKind,
    /// Refusing to destroy the active context.
    ContextActive,
    /// Address outside the context's range.
    OutOfRange,
    /// No free span in the temporary window.
    NoTemporarySpace,
}

impl VirtError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfMemory => "out of memory",
            Self::AlreadyMapped => "already mapped",
            Self::UnmappedTarget => "unmapped target",
            Self::WrongContextKind => "wrong context kind",
            Self::ContextActive => "context is active",
            Self::OutOfRange => "address out of range",
            Self::NoTemporarySpace => "temporary window exhausted",
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            Self::OutOfMemory => error::ENOMEM,
            Self::AlreadyMapped => error::EADDRINUSE,
            _ => error::EIO,
        }
    }
}

impl core::fmt::Display for VirtError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_level_size(kind: ContextKind) -> usize {
    match kind {
        ContextKind::Kernel => short::FIRST_LEVEL_SIZE_KERNEL,
        ContextKind::User => short::FIRST_LEVEL_SIZE_USER,
    }
}

fn first_level_align(kind: ContextKind) -> usize {
    match kind {
        ContextKind::Kernel => short::FIRST_LEVEL_ALIGN_KERNEL,
        ContextKind::User => short::FIRST_LEVEL_ALIGN_USER,
    }
}

fn first_level_entries(kind: ContextKind) -> usize {
    match kind {
        ContextKind::Kernel => short::FIRST_LEVEL_ENTRIES_KERNEL,
        ContextKind::User => short::FIRST_LEVEL_ENTRIES_USER,
    }
}

/// Half-open address range a context kind covers.
pub fn context_range(kind: ContextKind) -> (u64, u64) {
    match kind {
        ContextKind::User => (USER_START as u64, USER_END as u64),
        ContextKind::Kernel => (KERNEL_START as u64, 1 << 32),
    }
}

/// Lowest address of a context kind.
pub fn min_address(kind: ContextKind) -> VirtualAddress {
    VirtualAddress::new(context_range(kind).0 as u32)
}

/// Whether `[addr, addr + len)` lies inside the context's range.
pub fn context_contains(kind: ContextKind, addr: VirtualAddress, len: usize) -> bool {
    let (start, end) = context_range(kind);
    let base = addr.as_u32() as u64;
    base >= start && base + len as u64 <= end
}

/// The virtual-memory manager.
pub struct VirtualMemory {
    backing: Box<dyn FrameBacking + Send>,
    pool: TablePool,
    temporary: TemporaryArea,
    active_kernel: Option<VirtContext>,
    active_user: Option<VirtContext>,
    initialized: bool,
}

impl VirtualMemory {
    /// Bring the manager up: create the kernel context, reserve the
    /// temporary window inside it, activate it and flush.
    pub fn new(
        backing: Box<dyn FrameBacking + Send>,
    ) -> Result<(Self, VirtContext), VirtError> {
        let mut vm = Self {
            backing,
            pool: TablePool::new(),
            temporary: TemporaryArea::empty(),
            active_kernel: None,
            active_user: None,
            initialized: false,
        };
        let kernel = vm.create_context(ContextKind::Kernel)?;
        vm.prepare_temporary(kernel)?;
        vm.initialized = true;
        vm.set_context(kernel);
        vm.flush_complete();
        Ok((vm, kernel))
    }

    pub fn active_kernel(&self) -> Option<VirtContext> {
        self.active_kernel
    }

    pub fn active_user(&self) -> Option<VirtContext> {
        self.active_user
    }

    // ---- physical allocator passthrough ------------------------------

    pub fn allocate_frames(&mut self, size: usize) -> Option<PhysicalAddress> {
        self.backing.allocate(size)
    }

    pub fn allocate_frames_aligned(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Option<PhysicalAddress> {
        self.backing.allocate_aligned(alignment, size)
    }

    pub fn release_frames(&mut self, phys: PhysicalAddress, size: usize) {
        self.backing.release(phys, size);
    }

    pub fn phys_range_used(&self, phys: PhysicalAddress, size: usize) -> bool {
        self.backing.is_range_used(phys, size)
    }

    // ---- temporary window --------------------------------------------

    /// Map `size` bytes starting at `phys` into the temporary window. The
    /// returned address preserves the low-page offset of `phys`. Before
    /// initialization the window is the identity mapping.
    pub fn map_temporary(
        &mut self,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<VirtualAddress, VirtError> {
        if !self.initialized {
            return Ok(VirtualAddress::new(phys.as_u64() as u32));
        }
        let offset = phys.page_offset();
        let base = phys.align_down_page();
        let pages = pages_for(offset, size);
        let slot = self.temporary.find_span(pages).ok_or_else(|| {
            log::warn!("temporary window exhausted ({} pages wanted)", pages);
            VirtError::NoTemporarySpace
        })?;
        for index in 0..pages {
            let page = base.offset(index * PAGE_SIZE);
            self.temporary.lease(slot + index, page);
            let descriptor = short::leaf_descriptor(
                page,
                MemoryType::NormalNonCacheable,
                PageFlags::READ | PageFlags::WRITE,
                ContextKind::Kernel,
            );
            let table_frame = self.temporary.table_frame();
            self.backing
                .frame(TEMPORARY_AREA_START, table_frame)
                .write_u32(
                    TemporaryArea::descriptor_offset(slot + index),
                    descriptor.into(),
                );
            self.flush_active_address(TemporaryArea::slot_address(slot + index));
        }
        Ok(TemporaryArea::slot_address(slot).offset(offset))
    }

    /// Undo a temporary mapping.
    pub fn unmap_temporary(&mut self, virt: VirtualAddress, size: usize) {
        if !self.initialized || !self.temporary.contains(virt) {
            return;
        }
        let offset = virt.page_offset();
        let pages = pages_for(offset, size);
        let base_slot = (virt.align_down_page().as_u32() - TEMPORARY_AREA_START.as_u32())
            as usize
            / PAGE_SIZE;
        for index in 0..pages {
            let slot = base_slot + index;
            if slot == 0 {
                continue;
            }
            self.temporary.release(slot);
            let table_frame = self.temporary.table_frame();
            self.backing
                .frame(TEMPORARY_AREA_START, table_frame)
                .write_u32(TemporaryArea::descriptor_offset(slot), 0);
            self.flush_active_address(TemporaryArea::slot_address(slot));
        }
    }

    /// Resolve a window address to the physical page it leases.
    fn resolve_window(
        &self,
        virt: VirtualAddress,
    ) -> Result<(PhysicalAddress, usize), VirtError> {
        if !self.initialized {
            let phys = PhysicalAddress::new(virt.as_u32() as u64);
            return Ok((phys.align_down_page(), virt.page_offset()));
        }
        self.temporary.resolve(virt).ok_or_else(|| {
            log::error!("access outside temporary lease at {:#x}", virt.as_u32());
            VirtError::UnmappedTarget
        })
    }

    pub(crate) fn window_read_u32(&mut self, virt: VirtualAddress) -> Result<u32, VirtError> {
        let (page, offset) = self.resolve_window(virt)?;
        Ok(self.backing.frame(virt.align_down_page(), page).read_u32(offset))
    }

    pub(crate) fn window_write_u32(
        &mut self,
        virt: VirtualAddress,
        value: u32,
    ) -> Result<(), VirtError> {
        let (page, offset) = self.resolve_window(virt)?;
        self.backing
            .frame(virt.align_down_page(), page)
            .write_u32(offset, value);
        Ok(())
    }

    pub(crate) fn window_write_u16(
        &mut self,
        virt: VirtualAddress,
        value: u16,
    ) -> Result<(), VirtError> {
        let (page, offset) = self.resolve_window(virt)?;
        self.backing
            .frame(virt.align_down_page(), page)
            .write_u16(offset, value);
        Ok(())
    }

    pub(crate) fn window_read(
        &mut self,
        virt: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), VirtError> {
        let mut done = 0;
        while done < buf.len() {
            let cursor = virt.offset(done);
            let (page, offset) = self.resolve_window(cursor)?;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let frame = self.backing.frame(cursor.align_down_page(), page);
            buf[done..done + chunk].copy_from_slice(&frame.bytes()[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub(crate) fn window_write(
        &mut self,
        virt: VirtualAddress,
        data: &[u8],
    ) -> Result<(), VirtError> {
        let mut done = 0;
        while done < data.len() {
            let cursor = virt.offset(done);
            let (page, offset) = self.resolve_window(cursor)?;
            let chunk = (PAGE_SIZE - offset).min(data.len() - done);
            let frame = self.backing.frame(cursor.align_down_page(), page);
            frame.bytes_mut()[offset..offset + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub(crate) fn window_fill(
        &mut self,
        virt: VirtualAddress,
        len: usize,
        byte: u8,
    ) -> Result<(), VirtError> {
        let mut done = 0;
        while done < len {
            let cursor = virt.offset(done);
            let (page, offset) = self.resolve_window(cursor)?;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let frame = self.backing.frame(cursor.align_down_page(), page);
            frame.bytes_mut()[offset..offset + chunk].fill(byte);
            done += chunk;
        }
        Ok(())
    }

    pub(crate) fn window_copy(
        &mut self,
        dst: VirtualAddress,
        src: VirtualAddress,
        len: usize,
    ) -> Result<(), VirtError> {
        let mut buf = [0u8; 512];
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(buf.len());
            self.window_read(src.offset(done), &mut buf[..chunk])?;
            self.window_write(dst.offset(done), &buf[..chunk])?;
            done += chunk;
        }
        Ok(())
    }

    // ---- tables ------------------------------------------------------

    /// Take a table from the pool, carving a fresh frame when empty.
    fn allocate_table(&mut self) -> Result<PhysicalAddress, VirtError> {
        if self.pool.is_empty() {
            let frame = self
                .backing
                .allocate(PAGE_SIZE)
                .ok_or(VirtError::OutOfMemory)?;
            let window = self.map_temporary(frame, PAGE_SIZE)?;
            self.window_fill(window, PAGE_SIZE, 0)?;
            self.unmap_temporary(window, PAGE_SIZE);
            self.pool.refill(frame);
        }
        self.pool.pop().ok_or(VirtError::OutOfMemory)
    }

    /// Find the second-level table for `virt`, installing one when the
    /// first-level slot is empty. `preset` forces a specific table address
    /// (used while reserving the temporary window).
    fn ensure_table(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        preset: Option<PhysicalAddress>,
    ) -> Result<PhysicalAddress, VirtError> {
        let index = short::first_level_index(virt.as_u32());
        if index >= first_level_entries(ctx.kind) {
            return Err(VirtError::OutOfRange);
        }
        let size = first_level_size(ctx.kind);
        let window = self.map_temporary(ctx.table, size)?;
        let slot = window.offset(index * 4);
        let raw = match self.window_read_u32(slot) {
            Ok(raw) => raw,
            Err(err) => {
                self.unmap_temporary(window, size);
                return Err(err);
            }
        };
        if raw != 0 {
            self.unmap_temporary(window, size);
            return Ok(PhysicalAddress::new((raw & short::FIRST_LEVEL_BASE_MASK) as u64));
        }
        let table = match preset {
            Some(table) => table,
            None => match self.allocate_table() {
                Ok(table) => table,
                Err(err) => {
                    self.unmap_temporary(window, size);
                    return Err(err);
                }
            },
        };
        let descriptor =
            TableDescriptor::for_table(table, ctx.kind == ContextKind::User);
        let result = self.window_write_u32(slot, descriptor.into());
        self.unmap_temporary(window, size);
        result?;
        Ok(table)
    }

    /// Read-only walk to the leaf descriptor covering `virt`.
    fn walk(&mut self, ctx: VirtContext, virt: VirtualAddress) -> Option<SmallPageDescriptor> {
        let index = short::first_level_index(virt.as_u32());
        if index >= first_level_entries(ctx.kind) {
            return None;
        }
        let size = first_level_size(ctx.kind);
        let window = self.map_temporary(ctx.table, size).ok()?;
        let raw = self.window_read_u32(window.offset(index * 4)).ok();
        self.unmap_temporary(window, size);
        let raw = raw?;
        if raw == 0 {
            return None;
        }
        let table = PhysicalAddress::new((raw & short::FIRST_LEVEL_BASE_MASK) as u64);
        let window = self.map_temporary(table, short::SECOND_LEVEL_SIZE).ok()?;
        let leaf = self
            .window_read_u32(window.offset(short::second_level_index(virt.as_u32()) * 4))
            .ok();
        self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
        match leaf? {
            0 => None,
            raw => Some(SmallPageDescriptor::from(raw)),
        }
    }

    // ---- mapping -----------------------------------------------------

    /// Map one page. Fails when the descriptor is already populated.
    pub fn map(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        memory: MemoryType,
        flags: PageFlags,
    ) -> Result<(), VirtError> {
        let table = self.ensure_table(ctx, virt, None)?;
        let window = self.map_temporary(table, short::SECOND_LEVEL_SIZE)?;
        let slot = window.offset(short::second_level_index(virt.as_u32()) * 4);
        let existing = match self.window_read_u32(slot) {
            Ok(raw) => raw,
            Err(err) => {
                self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
                return Err(err);
            }
        };
        if existing != 0 {
            self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
            log::debug!("map: {:#x} already mapped", virt.as_u32());
            return Err(VirtError::AlreadyMapped);
        }
        let descriptor =
            short::leaf_descriptor(phys.align_down_page(), memory, flags, ctx.kind);
        let result = self.window_write_u32(slot, descriptor.into());
        self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
        result?;
        barrier::data_memory();
        self.flush_address(ctx, virt);
        Ok(())
    }

    /// Map one page backed by a freshly allocated frame.
    pub fn map_random(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        memory: MemoryType,
        flags: PageFlags,
    ) -> Result<(), VirtError> {
        let phys = self
            .backing
            .allocate(PAGE_SIZE)
            .ok_or(VirtError::OutOfMemory)?;
        match self.map(ctx, virt, phys, memory, flags) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.backing.release(phys, PAGE_SIZE);
                Err(err)
            }
        }
    }

    /// Map a contiguous physical range; failures undo already mapped pages.
    pub fn map_range(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        memory: MemoryType,
        flags: PageFlags,
    ) -> Result<(), VirtError> {
        let pages = size.div_ceil(PAGE_SIZE);
        for index in 0..pages {
            let page_virt = virt.offset(index * PAGE_SIZE);
            let page_phys = phys.offset(index * PAGE_SIZE);
            if let Err(err) = self.map(ctx, page_virt, page_phys, memory, flags) {
                for undo in 0..index {
                    let _ = self.unmap(ctx, virt.offset(undo * PAGE_SIZE), false);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Map a range backed by freshly allocated frames; failures release
    /// every acquired frame again.
    pub fn map_range_random(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        size: usize,
        memory: MemoryType,
        flags: PageFlags,
    ) -> Result<(), VirtError> {
        let pages = size.div_ceil(PAGE_SIZE);
        for index in 0..pages {
            let page_virt = virt.offset(index * PAGE_SIZE);
            if let Err(err) = self.map_random(ctx, page_virt, memory, flags) {
                for undo in 0..index {
                    let _ = self.unmap(ctx, virt.offset(undo * PAGE_SIZE), true);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmap one page. Unmapped targets succeed; `free_phys` returns the
    /// frame to the allocator.
    pub fn unmap(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        free_phys: bool,
    ) -> Result<(), VirtError> {
        let index = short::first_level_index(virt.as_u32());
        if index >= first_level_entries(ctx.kind) {
            return Err(VirtError::OutOfRange);
        }
        let size = first_level_size(ctx.kind);
        let window = self.map_temporary(ctx.table, size)?;
        let raw = self.window_read_u32(window.offset(index * 4));
        self.unmap_temporary(window, size);
        let raw = raw?;
        if raw == 0 {
            return Ok(());
        }
        let table = PhysicalAddress::new((raw & short::FIRST_LEVEL_BASE_MASK) as u64);
        let window = self.map_temporary(table, short::SECOND_LEVEL_SIZE)?;
        let slot = window.offset(short::second_level_index(virt.as_u32()) * 4);
        let leaf = match self.window_read_u32(slot) {
            Ok(leaf) => leaf,
            Err(err) => {
                self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
                return Err(err);
            }
        };
        if leaf == 0 {
            self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
            return Ok(());
        }
        let page = PhysicalAddress::new((leaf & short::SECOND_LEVEL_BASE_MASK) as u64);
        let result = self.window_write_u32(slot, 0);
        self.unmap_temporary(window, short::SECOND_LEVEL_SIZE);
        result?;
        if free_phys {
            self.backing.release(page, PAGE_SIZE);
        }
        self.flush_address(ctx, virt);
        Ok(())
    }

    /// Unmap a range page-wise.
    pub fn unmap_range(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        size: usize,
        free_phys: bool,
    ) -> Result<(), VirtError> {
        let pages = size.div_ceil(PAGE_SIZE);
        for index in 0..pages {
            self.unmap(ctx, virt.offset(index * PAGE_SIZE), free_phys)?;
        }
        Ok(())
    }

    // ---- queries -----------------------------------------------------

    pub fn is_mapped_in_context(&mut self, ctx: VirtContext, virt: VirtualAddress) -> bool {
        self.walk(ctx, virt).is_some()
    }

    pub fn is_range_mapped_in_context(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
        size: usize,
    ) -> bool {
        let pages = size.div_ceil(PAGE_SIZE);
        (0..pages).all(|index| self.is_mapped_in_context(ctx, virt.offset(index * PAGE_SIZE)))
    }

    /// Physical page base a virtual page maps to.
    pub fn get_mapped_address_in_context(
        &mut self,
        ctx: VirtContext,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        self.walk(ctx, virt).map(SmallPageDescriptor::page_address)
    }

    /// Probe for an unmapped run of `size` bytes starting no lower than
    /// `start_hint`, page-aligned. Returns `None` on exhaustion.
    pub fn find_free_range(
        &mut self,
        ctx: VirtContext,
        size: usize,
        start_hint: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let wanted = size.div_ceil(PAGE_SIZE).max(1);
        let (range_start, range_end) = context_range(ctx.kind);
        let mut cursor = (range_start.max(start_hint.align_up_page().as_u32() as u64)
            + PAGE_SIZE as u64
            - 1)
            & !(PAGE_SIZE as u64 - 1);
        let mut run = 0usize;
        let mut base = VirtualAddress::new(0);
        while cursor + PAGE_SIZE as u64 <= range_end {
            let virt = VirtualAddress::new(cursor as u32);
            if self.is_mapped_in_context(ctx, virt) {
                run = 0;
            } else {
                if run == 0 {
                    base = virt;
                }
                run += 1;
                if run == wanted {
                    return Some(base);
                }
            }
            cursor += PAGE_SIZE as u64;
        }
        None
    }

    // ---- context lifecycle -------------------------------------------

    /// Create a blank context of the given kind.
    pub fn create_context(&mut self, kind: ContextKind) -> Result<VirtContext, VirtError> {
        let size = first_level_size(kind);
        let table = self
            .backing
            .allocate_aligned(first_level_align(kind), size)
            .ok_or(VirtError::OutOfMemory)?;
        let window = match self.map_temporary(table, size) {
            Ok(window) => window,
            Err(err) => {
                self.backing.release(table, size);
                return Err(err);
            }
        };
        let result = self.window_fill(window, size, 0);
        self.unmap_temporary(window, size);
        if let Err(err) = result {
            self.backing.release(table, size);
            return Err(err);
        }
        Ok(VirtContext { table, kind })
    }

    /// Deep-copy a user context: fresh tables, fresh frames, identical
    /// content and attributes. Failures unwind via destroy.
    pub fn fork_context(&mut self, ctx: VirtContext) -> Result<VirtContext, VirtError> {
        if ctx.kind != ContextKind::User {
            return Err(VirtError::WrongContextKind);
        }
        let forked = self.create_context(ContextKind::User)?;
        match self.fork_into(ctx, forked) {
            Ok(()) => Ok(forked),
            Err(err) => {
                log::warn!("fork failed: {}", err);
                let _ = self.destroy_context(forked, false);
                Err(err)
            }
        }
    }

    fn fork_into(&mut self, src: VirtContext, dst: VirtContext) -> Result<(), VirtError> {
        let size = first_level_size(ContextKind::User);
        let window = self.map_temporary(src.table, size)?;
        let first_level = self.read_words(window, first_level_entries(ContextKind::User));
        self.unmap_temporary(window, size);
        let first_level = first_level?;

        for (index, raw) in first_level.iter().enumerate() {
            if *raw == 0 {
                continue;
            }
            let src_table =
                PhysicalAddress::new((*raw & short::FIRST_LEVEL_BASE_MASK) as u64);
            let dst_table = self.allocate_table()?;

            let src_window = self.map_temporary(src_table, short::SECOND_LEVEL_SIZE)?;
            let leaves = self.read_words(src_window, short::SECOND_LEVEL_ENTRIES);
            self.unmap_temporary(src_window, short::SECOND_LEVEL_SIZE);
            let leaves = leaves?;

            let dst_window = self.map_temporary(dst_table, short::SECOND_LEVEL_SIZE)?;
            let mut result = self.window_fill(dst_window, short::SECOND_LEVEL_SIZE, 0);
            if result.is_ok() {
                result = self.fork_leaves(&leaves, dst_window);
            }
            self.unmap_temporary(dst_window, short::SECOND_LEVEL_SIZE);
            result?;

            // first-level attributes carry over, only the base changes
            let descriptor = (*raw & !short::FIRST_LEVEL_BASE_MASK)
                | (dst_table.as_u64() as u32 & short::FIRST_LEVEL_BASE_MASK);
            let window = self.map_temporary(dst.table, size)?;
            let write = self.window_write_u32(window.offset(index * 4), descriptor);
            self.unmap_temporary(window, size);
            write?;
        }
        Ok(())
    }

    fn fork_leaves(
        &mut self,
        leaves: &[u32],
        dst_window: VirtualAddress,
    ) -> Result<(), VirtError> {
        for (index, leaf) in leaves.iter().enumerate() {
            if *leaf == 0 {
                continue;
            }
            let src_page =
                PhysicalAddress::new((*leaf & short::SECOND_LEVEL_BASE_MASK) as u64);
            let dst_page = self
                .backing
                .allocate(PAGE_SIZE)
                .ok_or(VirtError::OutOfMemory)?;

            let src_map = self.map_temporary(src_page, PAGE_SIZE)?;
            let dst_map = match self.map_temporary(dst_page, PAGE_SIZE) {
                Ok(map) => map,
                Err(err) => {
                    self.unmap_temporary(src_map, PAGE_SIZE);
                    self.backing.release(dst_page, PAGE_SIZE);
                    return Err(err);
                }
            };
            let copy = self.window_copy(dst_map, src_map, PAGE_SIZE);
            self.unmap_temporary(src_map, PAGE_SIZE);
            self.unmap_temporary(dst_map, PAGE_SIZE);
            copy?;

            // attributes carry over, only the frame changes
            let descriptor = (*leaf & !short::SECOND_LEVEL_BASE_MASK)
                | (dst_page.as_u64() as u32 & short::SECOND_LEVEL_BASE_MASK);
            self.window_write_u32(dst_window.offset(index * 4), descriptor)?;
        }
        Ok(())
    }

    /// Tear a context down: free every mapped frame, return the tables to
    /// the pool and, unless `unmap_only`, free the first-level table too.
    /// The active contexts are only destroyable with `unmap_only`.
    pub fn destroy_context(
        &mut self,
        ctx: VirtContext,
        unmap_only: bool,
    ) -> Result<(), VirtError> {
        let active = self.active_kernel == Some(ctx) || self.active_user == Some(ctx);
        if active && !unmap_only {
            return Err(VirtError::ContextActive);
        }
        let size = first_level_size(ctx.kind);
        let window = self.map_temporary(ctx.table, size)?;
        let first_level = self.read_words(window, first_level_entries(ctx.kind));
        self.unmap_temporary(window, size);
        let first_level = first_level?;

        for (index, raw) in first_level.iter().enumerate() {
            if *raw == 0 {
                continue;
            }
            let table = PhysicalAddress::new((*raw & short::FIRST_LEVEL_BASE_MASK) as u64);
            let table_window = self.map_temporary(table, short::SECOND_LEVEL_SIZE)?;
            let leaves = self.read_words(table_window, short::SECOND_LEVEL_ENTRIES);
            let mut cleared = leaves.is_ok();
            if let Ok(leaves) = &leaves {
                for (slot, leaf) in leaves.iter().enumerate() {
                    if *leaf == 0 {
                        continue;
                    }
                    let page =
                        PhysicalAddress::new((*leaf & short::SECOND_LEVEL_BASE_MASK) as u64);
                    self.backing.release(page, PAGE_SIZE);
                    if self
                        .window_write_u32(table_window.offset(slot * 4), 0)
                        .is_err()
                    {
                        cleared = false;
                    }
                }
            }
            self.unmap_temporary(table_window, short::SECOND_LEVEL_SIZE);
            leaves?;
            if !cleared {
                return Err(VirtError::UnmappedTarget);
            }
            self.pool.push(table);
            let window = self.map_temporary(ctx.table, size)?;
            let write = self.window_write_u32(window.offset(index * 4), 0);
            self.unmap_temporary(window, size);
            write?;
        }

        if unmap_only {
            self.flush_complete();
        } else {
            self.backing.release(ctx.table, size);
        }
        Ok(())
    }

    fn read_words(
        &mut self,
        window: VirtualAddress,
        count: usize,
    ) -> Result<Vec<u32>, VirtError> {
        let mut words = Vec::with_capacity(count);
        for index in 0..count {
            words.push(self.window_read_u32(window.offset(index * 4))?);
        }
        Ok(words)
    }

    // ---- activation and flushing -------------------------------------

    /// Install a context in its TTBR. A context that is already active is
    /// left untouched.
    pub fn set_context(&mut self, ctx: VirtContext) {
        match ctx.kind {
            ContextKind::User => {
                if self.active_user == Some(ctx) {
                    return;
                }
                mmu::set_ttbr0(ctx.table.as_u64() as u32);
                self.active_user = Some(ctx);
            }
            ContextKind::Kernel => {
                if self.active_kernel == Some(ctx) {
                    return;
                }
                mmu::set_ttbr1(ctx.table.as_u64() as u32);
                self.active_kernel = Some(ctx);
            }
        }
    }

    /// Invalidate caches, prefetch buffer and the whole TLB.
    pub fn flush_complete(&mut self) {
        cache::invalidate_instruction_cache();
        cache::invalidate_data_cache();
        cache::invalidate_prefetch_buffer();
        mmu::invalidate_tlb();
        barrier::instruction_sync();
        barrier::data_sync();
    }

    /// Invalidate one address of an active context; no-op for inactive
    /// contexts.
    pub fn flush_address(&mut self, ctx: VirtContext, virt: VirtualAddress) {
        if self.active_kernel != Some(ctx) && self.active_user != Some(ctx) {
            return;
        }
        self.flush_active_address(virt);
    }

    fn flush_active_address(&mut self, virt: VirtualAddress) {
        cache::invalidate_instruction_cache();
        cache::invalidate_data_cache();
        cache::invalidate_prefetch_buffer();
        mmu::invalidate_tlb_address(virt.as_u32());
        barrier::instruction_sync();
        barrier::data_sync();
    }

    // ---- bringup -----------------------------------------------------

    /// Reserve the temporary window in the kernel context: one frame of
    /// second-level tables, installed over the window's first-level slots,
    /// with the frame itself mapped at the window base.
    fn prepare_temporary(&mut self, ctx: VirtContext) -> Result<(), VirtError> {
        if ctx.kind != ContextKind::Kernel {
            return Err(VirtError::WrongContextKind);
        }
        let frame = self
            .backing
            .allocate(PAGE_SIZE)
            .ok_or(VirtError::OutOfMemory)?;
        let window = self.map_temporary(frame, PAGE_SIZE)?;
        self.window_fill(window, PAGE_SIZE, 0)?;
        self.unmap_temporary(window, PAGE_SIZE);
        for index in 0..short::TABLES_PER_FRAME {
            let covered = TEMPORARY_AREA_START
                .offset(index * short::SECOND_LEVEL_ENTRIES * PAGE_SIZE);
            self.ensure_table(
                ctx,
                covered,
                Some(frame.offset(index * short::SECOND_LEVEL_SIZE)),
            )?;
        }
        self.temporary = TemporaryArea::new(frame);
        self.map(
            ctx,
            TEMPORARY_AREA_START,
            frame,
            MemoryType::NormalNonCacheable,
            PageFlags::READ | PageFlags::WRITE,
        )
    }
}

fn pages_for(offset: usize, size: usize) -> usize {
    (offset + size).div_ceil(PAGE_SIZE).max(1)
}
