//! Shared-memory areas
//!
//! An area is a set of frames allocated at creation and mapped into any
//! number of process contexts. Detaching unmaps without freeing; the
//! frames go back to the allocator when the last attachment leaves. Fork
//! rewires the child's private copies of attached ranges back onto the
//! shared frames.

use alloc::vec::Vec;

use super::{
    MemoryType, PageFlags, PhysicalAddress, VirtContext, VirtError, VirtualAddress,
    VirtualMemory, PAGE_SIZE,
};
use crate::{
    collection::{AvlTree, List},
    error,
    task::{ProcessId, TaskManager},
};

/// Failure kinds of the shared-memory layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedError {
    InvalidArgument,
    NoSuchEntry,
    NoSuchProcess,
    OutOfMemory,
    Virt(VirtError),
}

impl SharedError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument => error::EINVAL,
            Self::NoSuchEntry => error::EIO,
            Self::NoSuchProcess => error::ESRCH,
            Self::OutOfMemory => error::ENOMEM,
            Self::Virt(err) => err.errno(),
        }
    }
}

impl From<VirtError> for SharedError {
    fn from(err: VirtError) -> Self {
        Self::Virt(err)
    }
}

struct Attachment {
    process: ProcessId,
    address: VirtualAddress,
}

struct SharedEntry {
    size: usize,
    frames: Vec<PhysicalAddress>,
    attachments: List<Attachment>,
}

/// All shared-memory areas, keyed by id.
pub struct SharedMemory {
    entries: AvlTree<usize, SharedEntry>,
    next_id: usize,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self {
            entries: AvlTree::new(),
            next_id: 0,
        }
    }

    /// Create an area of `len` bytes (page-rounded). Frames are acquired
    /// eagerly; ids are monotonic and never zero.
    pub fn create(&mut self, vm: &mut VirtualMemory, len: usize) -> Result<usize, SharedError> {
        if len == 0 {
            return Err(SharedError::InvalidArgument);
        }
        let size = super::round_up_to_page(len);
        let pages = size / PAGE_SIZE;
        let mut frames = Vec::with_capacity(pages);
        for _ in 0..pages {
            match vm.allocate_frames(PAGE_SIZE) {
                Some(frame) => frames.push(frame),
                None => {
                    for frame in frames {
                        vm.release_frames(frame, PAGE_SIZE);
                    }
                    return Err(SharedError::OutOfMemory);
                }
            }
        }
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            SharedEntry {
                size,
                frames,
                attachments: List::new(),
            },
        );
        Ok(id)
    }

    /// Map the area into `pid`'s context. A repeated attach returns the
    /// existing address; otherwise placement starts at `hint`.
    pub fn attach(
        &mut self,
        vm: &mut VirtualMemory,
        tasks: &TaskManager,
        pid: ProcessId,
        id: usize,
        hint: VirtualAddress,
    ) -> Result<VirtualAddress, SharedError> {
        let context = tasks
            .process(pid)
            .and_then(|process| process.virtual_context)
            .ok_or(SharedError::NoSuchProcess)?;
        let (size, frames) = {
            let entry = self.entries.find(&id).ok_or(SharedError::NoSuchEntry)?;
            if let Some(existing) = entry
                .attachments
                .lookup(|attachment| attachment.process == pid)
            {
                return Ok(existing.address);
            }
            (entry.size, entry.frames.clone())
        };
        let address = vm
            .find_free_range(context, size, hint)
            .ok_or(SharedError::OutOfMemory)?;
        for (index, frame) in frames.iter().enumerate() {
            if let Err(err) = vm.map(
                context,
                address.offset(index * PAGE_SIZE),
                *frame,
                MemoryType::Normal,
                PageFlags::READ | PageFlags::WRITE,
            ) {
                for undo in 0..index {
                    let _ = vm.unmap(context, address.offset(undo * PAGE_SIZE), false);
                }
                return Err(err.into());
            }
        }
        if let Some(entry) = self.entries.find_mut(&id) {
            entry.attachments.push_back(Attachment { process: pid, address });
        }
        Ok(address)
    }

    /// Unmap the area from `pid`'s context without touching the frames.
    /// The entry dies with its last attachment.
    pub fn detach(
        &mut self,
        vm: &mut VirtualMemory,
        tasks: &TaskManager,
        pid: ProcessId,
        id: usize,
    ) -> Result<(), SharedError> {
        let context = tasks
            .process(pid)
            .and_then(|process| process.virtual_context)
            .ok_or(SharedError::NoSuchProcess)?;
        self.detach_in_context(vm, pid, id, context)
    }

    fn detach_in_context(
        &mut self,
        vm: &mut VirtualMemory,
        pid: ProcessId,
        id: usize,
        context: VirtContext,
    ) -> Result<(), SharedError> {
        let (address, size, emptied) = {
            let entry = self.entries.find_mut(&id).ok_or(SharedError::NoSuchEntry)?;
            let attachment = entry
                .attachments
                .remove_first_match(|attachment| attachment.process == pid)
                .ok_or(SharedError::NoSuchEntry)?;
            (attachment.address, entry.size, entry.attachments.is_empty())
        };
        vm.unmap_range(context, address, size, false)?;
        if emptied {
            if let Some(entry) = self.entries.remove(&id) {
                for frame in entry.frames {
                    vm.release_frames(frame, PAGE_SIZE);
                }
            }
        }
        Ok(())
    }

    /// Whether any attachment of `pid` overlaps `[addr, addr + len)`.
    pub fn is_shared(&self, pid: ProcessId, addr: VirtualAddress, len: usize) -> bool {
        let start = addr.as_u32() as u64;
        let end = start + len as u64;
        self.entries.iter().any(|(_, entry)| {
            entry
                .attachments
                .lookup(|attachment| {
                    if attachment.process != pid {
                        return false;
                    }
                    let base = attachment.address.as_u32() as u64;
                    base < end && start < base + entry.size as u64
                })
                .is_some()
        })
    }

    /// Duplicate `from`'s attachments into the freshly forked `to`: the
    /// fork copied the pages privately, so the copies are dropped and the
    /// shared frames mapped in their place.
    pub fn fork(
        &mut self,
        vm: &mut VirtualMemory,
        tasks: &TaskManager,
        from: ProcessId,
        to: ProcessId,
    ) -> Result<(), SharedError> {
        let context = tasks
            .process(to)
            .and_then(|process| process.virtual_context)
            .ok_or(SharedError::NoSuchProcess)?;
        let inherited: Vec<(usize, VirtualAddress, Vec<PhysicalAddress>)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .attachments
                    .lookup(|attachment| attachment.process == from)
                    .map(|attachment| (*id, attachment.address, entry.frames.clone()))
            })
            .collect();
        for (id, address, frames) in inherited {
            for (index, frame) in frames.iter().enumerate() {
                let page = address.offset(index * PAGE_SIZE);
                vm.unmap(context, page, true)?;
                vm.map(context, page, *frame, MemoryType::Normal, PageFlags::READ | PageFlags::WRITE)?;
            }
            if let Some(entry) = self.entries.find_mut(&id) {
                entry.attachments.push_back(Attachment { process: to, address });
            }
        }
        Ok(())
    }

    /// Drop every attachment of a dying process, unmapping through its
    /// context before the context itself is destroyed.
    pub fn cleanup_process(
        &mut self,
        vm: &mut VirtualMemory,
        pid: ProcessId,
        context: VirtContext,
    ) {
        let attached: Vec<usize> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .attachments
                    .lookup(|attachment| attachment.process == pid)
                    .map(|_| *id)
            })
            .collect();
        for id in attached {
            if let Err(err) = self.detach_in_context(vm, pid, id, context) {
                log::warn!("shared cleanup of {} in {} failed: {:?}", id, pid, err);
            }
        }
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SparseBacking;
    use alloc::boxed::Box;

    struct Rig {
        shared: SharedMemory,
        tasks: TaskManager,
        vm: VirtualMemory,
    }

    impl Rig {
        fn new() -> Self {
            let (vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
            Self {
                shared: SharedMemory::new(),
                tasks: TaskManager::new(),
                vm,
            }
        }

        fn spawn(&mut self, name: &str) -> ProcessId {
            self.tasks
                .create_process(&mut self.vm, 5, ProcessId(0), name)
                .unwrap()
        }
    }

    #[test]
    fn test_create_attach_detach() {
        let mut rig = Rig::new();
        let pid = rig.spawn("a");
        let id = rig.shared.create(&mut rig.vm, 2 * PAGE_SIZE).unwrap();
        assert!(id > 0);
        let address = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, pid, id, VirtualAddress::new(0))
            .unwrap();
        let context = rig.tasks.process(pid).unwrap().virtual_context.unwrap();
        assert!(rig.vm.is_range_mapped_in_context(context, address, 2 * PAGE_SIZE));
        // repeated attach yields the same placement
        let again = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, pid, id, VirtualAddress::new(0))
            .unwrap();
        assert_eq!(again, address);
        rig.shared.detach(&mut rig.vm, &rig.tasks, pid, id).unwrap();
        assert!(!rig.vm.is_mapped_in_context(context, address));
        // entry died with its last attachment
        assert!(rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, pid, id, VirtualAddress::new(0))
            .is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut rig = Rig::new();
        assert_eq!(
            rig.shared.create(&mut rig.vm, 0).unwrap_err(),
            SharedError::InvalidArgument
        );
    }

    #[test]
    fn test_two_processes_share_frames() {
        let mut rig = Rig::new();
        let a = rig.spawn("a");
        let b = rig.spawn("b");
        let id = rig.shared.create(&mut rig.vm, PAGE_SIZE).unwrap();
        let addr_a = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, a, id, VirtualAddress::new(0))
            .unwrap();
        let addr_b = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, b, id, VirtualAddress::new(0))
            .unwrap();
        let ctx_a = rig.tasks.process(a).unwrap().virtual_context.unwrap();
        let ctx_b = rig.tasks.process(b).unwrap().virtual_context.unwrap();
        let phys_a = rig.vm.get_mapped_address_in_context(ctx_a, addr_a).unwrap();
        let phys_b = rig.vm.get_mapped_address_in_context(ctx_b, addr_b).unwrap();
        assert_eq!(phys_a, phys_b);
    }

    #[test]
    fn test_is_shared_ranges() {
        let mut rig = Rig::new();
        let pid = rig.spawn("a");
        let id = rig.shared.create(&mut rig.vm, 2 * PAGE_SIZE).unwrap();
        let address = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, pid, id, VirtualAddress::new(0))
            .unwrap();
        assert!(rig.shared.is_shared(pid, address, PAGE_SIZE));
        assert!(rig.shared.is_shared(pid, address.offset(PAGE_SIZE), PAGE_SIZE));
        assert!(!rig.shared.is_shared(pid, address.offset(2 * PAGE_SIZE), PAGE_SIZE));
        assert!(!rig.shared.is_shared(ProcessId(999), address, PAGE_SIZE));
    }

    #[test]
    fn test_cleanup_process_releases_attachments() {
        let mut rig = Rig::new();
        let a = rig.spawn("a");
        let b = rig.spawn("b");
        let id = rig.shared.create(&mut rig.vm, PAGE_SIZE).unwrap();
        let addr_a = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, a, id, VirtualAddress::new(0))
            .unwrap();
        let addr_b = rig
            .shared
            .attach(&mut rig.vm, &rig.tasks, b, id, VirtualAddress::new(0))
            .unwrap();
        let ctx_a = rig.tasks.process(a).unwrap().virtual_context.unwrap();
        rig.shared.cleanup_process(&mut rig.vm, a, ctx_a);
        assert!(!rig.vm.is_mapped_in_context(ctx_a, addr_a));
        assert!(!rig.shared.is_shared(a, addr_a, PAGE_SIZE));
        // b's attachment survives
        assert!(rig.shared.is_shared(b, addr_b, PAGE_SIZE));
    }
}
