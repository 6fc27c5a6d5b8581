//! Process and thread syscalls

use super::SyscallResult;
use crate::{error, kernel::Kernel};

pub(super) fn sys_process_id(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    Ok(caller.process.0)
}

pub(super) fn sys_process_parent_id(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    let parent = kernel
        .tasks
        .process(caller.process)
        .ok_or(error::ESRCH)?
        .parent;
    Ok(parent.0)
}

pub(super) fn sys_process_exit(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let code = frame.r[0];
    log::debug!("process {} exits with {}", caller.process, code as i32);
    kernel.tasks.prepare_kill(caller.process);
    Ok(0)
}

pub(super) fn sys_process_fork(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    let child = kernel
        .tasks
        .fork_process(&mut kernel.vm, caller)
        .map_err(|err| err.errno())?;
    // shared attachments follow the fork; private copies are replaced by
    // the shared frames again
    if let Err(err) = kernel
        .shared
        .fork(&mut kernel.vm, &kernel.tasks, caller.process, child)
    {
        kernel.tasks.prepare_kill(child);
        return Err(err.errno());
    }
    kernel.tasks.request_reschedule();
    Ok(child.0)
}

pub(super) fn sys_process_replace(_kernel: &mut Kernel) -> SyscallResult {
    // image replacement is the loader's concern and not wired up here
    Err(error::ENOSYS)
}

pub(super) fn sys_thread_id(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    Ok(caller.thread.0)
}

pub(super) fn sys_thread_exit(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    kernel.tasks.prepare_thread_kill(caller);
    Ok(0)
}
