//! Memory syscalls
//!
//! Acquire and release of anonymous or physically backed ranges, the
//! shared-memory operations and virtual-to-physical translation, all
//! against the calling process's context.

use super::SyscallResult;
use crate::{
    error,
    kernel::Kernel,
    mm::{round_up_to_page, virt, MemoryType, PageFlags, PhysicalAddress, VirtualAddress},
};

const PROTECTION_READ: u32 = 0x1;
const PROTECTION_WRITE: u32 = 0x2;
const PROTECTION_EXECUTABLE: u32 = 0x4;

const FLAG_PHYS: u32 = 0x1;
const FLAG_DEVICE: u32 = 0x2;

pub(super) fn sys_memory_acquire(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let mut addr = frame.r[0];
    let len = frame.r[1] as usize;
    let protection = frame.r[2];
    let flags = frame.r[3];
    if len == 0 {
        return Err(error::EINVAL);
    }
    let len = round_up_to_page(len);
    let context = kernel
        .tasks
        .process(caller.process)
        .and_then(|process| process.virtual_context)
        .ok_or(error::ESRCH)?;

    // physical mappings take the argument as the target frame address and
    // pick their own virtual placement
    let mut phys = PhysicalAddress::new(0);
    if flags & FLAG_PHYS != 0 {
        phys = PhysicalAddress::new(addr as u64).align_down_page();
        addr = 0;
        if kernel.vm.phys_range_used(phys, len) {
            log::debug!("memory acquire: {:#x} already in use", phys.as_u64());
            return Err(error::EADDRINUSE);
        }
    }

    let start = if addr != 0 {
        let wanted = VirtualAddress::new(addr);
        if !virt::context_contains(context.kind, wanted, len) {
            return Err(error::ENOMEM);
        }
        wanted
    } else {
        let hint = kernel
            .tasks
            .thread(caller)
            .map(|thread| thread.entry.align_up_page())
            .unwrap_or(VirtualAddress::new(0));
        kernel
            .vm
            .find_free_range(context, len, hint)
            .ok_or(error::ENOMEM)?
    };

    let mut map_flags = PageFlags::empty();
    if protection & PROTECTION_READ != 0 {
        map_flags |= PageFlags::READ;
    }
    if protection & PROTECTION_WRITE != 0 {
        map_flags |= PageFlags::WRITE;
    }
    if protection & PROTECTION_EXECUTABLE != 0 {
        map_flags |= PageFlags::EXECUTABLE;
    }
    let map_type = if flags & FLAG_DEVICE != 0 {
        MemoryType::Device
    } else {
        MemoryType::Normal
    };

    let mapped = if flags & FLAG_PHYS != 0 {
        kernel
            .vm
            .map_range(context, start, phys, len, map_type, map_flags)
    } else {
        kernel
            .vm
            .map_range_random(context, start, len, map_type, map_flags)
    };
    if let Err(err) = mapped {
        log::debug!("memory acquire failed: {}", err);
        return Err(error::EIO);
    }
    Ok(start.as_u32())
}

pub(super) fn sys_memory_release(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let addr = VirtualAddress::new(frame.r[0]);
    let len = frame.r[1] as usize;
    if len == 0 {
        return Err(error::EINVAL);
    }
    let len = round_up_to_page(len);
    let context = kernel
        .tasks
        .process(caller.process)
        .and_then(|process| process.virtual_context)
        .ok_or(error::ESRCH)?;
    if !virt::context_contains(context.kind, addr, len) {
        return Err(error::EINVAL);
    }
    // shared areas go through detach, not release
    if kernel.shared.is_shared(caller.process, addr, len) {
        return Err(error::EADDRNOTAVAIL);
    }
    if !kernel.vm.is_range_mapped_in_context(context, addr, len) {
        return Ok(0);
    }
    kernel
        .vm
        .unmap_range(context, addr, len, true)
        .map_err(|_| error::EIO)?;
    Ok(0)
}

pub(super) fn sys_memory_shared_create(kernel: &mut Kernel) -> SyscallResult {
    let (_, frame) = super::caller(kernel)?;
    let len = frame.r[0] as usize;
    if len == 0 {
        return Err(error::EINVAL);
    }
    let id = kernel
        .shared
        .create(&mut kernel.vm, len)
        .map_err(|err| err.errno())?;
    Ok(id as u32)
}

pub(super) fn sys_memory_shared_attach(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let id = frame.r[0] as usize;
    let hint = VirtualAddress::new(frame.r[1]);
    let Kernel { vm, tasks, shared, .. } = kernel;
    let addr = shared
        .attach(vm, tasks, caller.process, id, hint)
        .map_err(|_| error::ENOMEM)?;
    Ok(addr.as_u32())
}

pub(super) fn sys_memory_shared_detach(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let id = frame.r[0] as usize;
    let Kernel { vm, tasks, shared, .. } = kernel;
    shared
        .detach(vm, tasks, caller.process, id)
        .map_err(|_| error::EIO)?;
    Ok(0)
}

pub(super) fn sys_memory_translate_physical(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let addr = VirtualAddress::new(frame.r[0]);
    let context = kernel
        .tasks
        .process(caller.process)
        .and_then(|process| process.virtual_context)
        .ok_or(error::ESRCH)?;
    if !virt::context_contains(context.kind, addr, core::mem::size_of::<u32>()) {
        return Err(error::EINVAL);
    }
    let phys = kernel
        .vm
        .get_mapped_address_in_context(context, addr)
        .ok_or(error::EINVAL)?;
    Ok(phys.as_u64() as u32)
}
