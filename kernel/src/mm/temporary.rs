//! Bookkeeping for the temporary mapping window
//!
//! A fixed 16 MiB region inside the kernel half is reserved for scratch
//! mappings of foreign physical pages. Its first frame holds the
//! second-level tables covering the window, which bounds the leasable part
//! to `TABLES_PER_FRAME` MiB; the first window page maps that table frame
//! itself and is never handed out.

use alloc::vec;
use alloc::vec::Vec;

use super::{
    short::{SECOND_LEVEL_ENTRIES, TABLES_PER_FRAME},
    PhysicalAddress, VirtualAddress, PAGE_SIZE,
};
use crate::config::TEMPORARY_AREA_START;

/// Window pages backed by the table frame.
pub const WINDOW_PAGES: usize = TABLES_PER_FRAME * SECOND_LEVEL_ENTRIES;

/// Lease state of the temporary window.
pub struct TemporaryArea {
    table_frame: PhysicalAddress,
    slots: Vec<Option<PhysicalAddress>>,
}

impl TemporaryArea {
    /// State before the window exists; every resolve fails.
    pub const fn empty() -> Self {
        Self {
            table_frame: PhysicalAddress::new(0),
            slots: Vec::new(),
        }
    }

    /// Window backed by `table_frame`. Slot 0 maps the table frame and
    /// stays leased forever.
    pub fn new(table_frame: PhysicalAddress) -> Self {
        let mut slots = vec![None; WINDOW_PAGES];
        slots[0] = Some(table_frame);
        Self { table_frame, slots }
    }

    pub fn table_frame(&self) -> PhysicalAddress {
        self.table_frame
    }

    /// Virtual address of a window page.
    pub fn slot_address(slot: usize) -> VirtualAddress {
        TEMPORARY_AREA_START.offset(slot * PAGE_SIZE)
    }

    /// Byte offset of a slot's descriptor inside the table frame.
    pub fn descriptor_offset(slot: usize) -> usize {
        slot * 4
    }

    pub fn contains(&self, virt: VirtualAddress) -> bool {
        let start = TEMPORARY_AREA_START.as_u32();
        let end = start + (WINDOW_PAGES * PAGE_SIZE) as u32;
        !self.slots.is_empty() && virt.as_u32() >= start && virt.as_u32() < end
    }

    /// First-fit search for `pages` contiguous free slots. Occupied slots
    /// reset the running span.
    pub fn find_span(&self, pages: usize) -> Option<usize> {
        if pages == 0 || pages > WINDOW_PAGES {
            return None;
        }
        let mut found = 0;
        let mut start = 0;
        for (slot, lease) in self.slots.iter().enumerate().skip(1) {
            if lease.is_some() {
                found = 0;
                continue;
            }
            if found == 0 {
                start = slot;
            }
            found += 1;
            if found == pages {
                return Some(start);
            }
        }
        None
    }

    pub fn lease(&mut self, slot: usize, phys: PhysicalAddress) {
        self.slots[slot] = Some(phys);
    }

    /// Drop a lease. Slot 0 carries the window's own tables and is not
    /// releasable.
    pub fn release(&mut self, slot: usize) {
        if slot != 0 {
            self.slots[slot] = None;
        }
    }

    /// Physical page and in-page offset a window address currently maps.
    pub fn resolve(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, usize)> {
        if !self.contains(virt) {
            return None;
        }
        let slot = (virt.as_u32() - TEMPORARY_AREA_START.as_u32()) as usize / PAGE_SIZE;
        self.slots[slot].map(|phys| (phys, virt.page_offset()))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_reserved() {
        let area = TemporaryArea::new(PhysicalAddress::new(0x4000_0000));
        assert_eq!(area.find_span(1), Some(1));
        assert_eq!(
            area.resolve(TEMPORARY_AREA_START),
            Some((PhysicalAddress::new(0x4000_0000), 0))
        );
    }

    #[test]
    fn test_first_fit_resets_on_occupied() {
        let mut area = TemporaryArea::new(PhysicalAddress::new(0x4000_0000));
        area.lease(3, PhysicalAddress::new(0x5000_0000));
        // slots 1..2 free but too small for 3 pages; span restarts after 3
        assert_eq!(area.find_span(3), Some(4));
        assert_eq!(area.find_span(2), Some(1));
    }

    #[test]
    fn test_release_frees_span() {
        let mut area = TemporaryArea::new(PhysicalAddress::new(0x4000_0000));
        area.lease(1, PhysicalAddress::new(0x5000_0000));
        area.lease(2, PhysicalAddress::new(0x5000_1000));
        assert_eq!(area.find_span(2), Some(3));
        area.release(1);
        area.release(2);
        assert_eq!(area.find_span(2), Some(1));
        area.release(0);
        assert!(area.resolve(TEMPORARY_AREA_START).is_some());
    }

    #[test]
    fn test_resolve_preserves_offset() {
        let mut area = TemporaryArea::new(PhysicalAddress::new(0x4000_0000));
        area.lease(2, PhysicalAddress::new(0x5000_2000));
        let virt = TemporaryArea::slot_address(2).offset(0x123);
        assert_eq!(
            area.resolve(virt),
            Some((PhysicalAddress::new(0x5000_2000), 0x123))
        );
    }

    #[test]
    fn test_outside_window_unresolved() {
        let area = TemporaryArea::new(PhysicalAddress::new(0x4000_0000));
        assert_eq!(area.resolve(VirtualAddress::new(0x1000)), None);
        let empty = TemporaryArea::empty();
        assert_eq!(empty.resolve(TEMPORARY_AREA_START), None);
    }
}
