//! RPC syscalls

use alloc::vec;

use super::SyscallResult;
use crate::{
    error,
    ipc::rpc,
    kernel::Kernel,
    mm::VirtualAddress,
    task::ProcessId,
};

pub(super) fn sys_rpc_register_handler(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let identifier = super::read_user_string(kernel, caller, VirtualAddress::new(frame.r[0]))?;
    let handler = VirtualAddress::new(frame.r[1]);
    kernel
        .rpc
        .register(&identifier, caller.process, handler)
        .map_err(|err| err.errno())?;
    Ok(0)
}

pub(super) fn sys_rpc_unregister_handler(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let identifier = super::read_user_string(kernel, caller, VirtualAddress::new(frame.r[0]))?;
    let handler = VirtualAddress::new(frame.r[1]);
    let Kernel { tasks, rpc: registry, .. } = kernel;
    registry
        .unregister(tasks, &identifier, caller.process, handler)
        .map_err(|err| err.errno())?;
    Ok(0)
}

pub(super) fn sys_rpc_raise(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let identifier = super::read_user_string(kernel, caller, VirtualAddress::new(frame.r[0]))?;
    let target = ProcessId(frame.r[1]);
    let data = VirtualAddress::new(frame.r[2]);
    let len = frame.r[3] as usize;

    let mut payload = vec![0u8; len];
    if len > 0 {
        super::copy_from_user(kernel, caller, data, &mut payload)?;
    }
    let Kernel { vm, tasks, rpc: registry, .. } = kernel;
    rpc::raise(registry, tasks, vm, &identifier, caller, target, &payload)
        .map_err(|err| err.errno())?;
    // the victim may sit in another process; give it a chance to run
    kernel.tasks.request_reschedule();
    Ok(0)
}

pub(super) fn sys_rpc_set_ready(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let ready = frame.r[0] != 0;
    let process = kernel
        .tasks
        .process_mut(caller.process)
        .ok_or(error::ESRCH)?;
    process.rpc_ready = ready;
    Ok(0)
}
