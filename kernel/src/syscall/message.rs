//! Message syscalls

use alloc::vec;

use super::SyscallResult;
use crate::{
    error,
    ipc::message,
    kernel::Kernel,
    mm::VirtualAddress,
};

pub(super) fn sys_message_create(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    message::setup(&mut kernel.tasks, caller.process).map_err(|_| error::EIO)?;
    Ok(0)
}

pub(super) fn sys_message_destroy(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    message::destroy(&mut kernel.tasks, caller.process);
    Ok(0)
}

pub(super) fn sys_message_send_by_pid(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let target = crate::task::ProcessId(frame.r[0]);
    let mtype = frame.r[1] as usize;
    let data = VirtualAddress::new(frame.r[2]);
    let len = frame.r[3] as usize;
    let request = super::argument(kernel, caller, &frame, 4)? as u64;

    let mut payload = vec![0u8; len];
    if len > 0 {
        super::copy_from_user(kernel, caller, data, &mut payload)?;
    }
    let id = message::send_by_pid(
        &mut kernel.tasks,
        target,
        caller.process,
        mtype,
        &payload,
        request,
    )
    .map_err(|err| err.errno())?;
    Ok(id as u32)
}

pub(super) fn sys_message_send_by_name(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let name = super::read_user_string(kernel, caller, VirtualAddress::new(frame.r[0]))?;
    let mtype = frame.r[1] as usize;
    let data = VirtualAddress::new(frame.r[2]);
    let len = frame.r[3] as usize;
    let request = super::argument(kernel, caller, &frame, 4)? as u64;

    let mut payload = vec![0u8; len];
    if len > 0 {
        super::copy_from_user(kernel, caller, data, &mut payload)?;
    }
    let id = message::send_by_name(
        &mut kernel.tasks,
        &name,
        caller.process,
        mtype,
        &payload,
        request,
    )
    .map_err(|err| err.errno())?;
    Ok(id as u32)
}

pub(super) fn sys_message_receive(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let target = VirtualAddress::new(frame.r[0]);
    let len = frame.r[1] as usize;
    let sender_out = VirtualAddress::new(frame.r[2]);
    let id_out = VirtualAddress::new(frame.r[3]);
    if len == 0 || target.as_u32() == 0 {
        return Err(error::EINVAL);
    }
    let received = message::receive(&mut kernel.tasks, caller.process, len)
        .map_err(|err| err.errno())?;
    super::copy_to_user(kernel, caller, target, &received.data)?;
    if sender_out.as_u32() != 0 {
        super::put_user_u32(kernel, caller, sender_out, received.sender.0)?;
    }
    if id_out.as_u32() != 0 {
        super::put_user_u32(kernel, caller, id_out, received.id as u32)?;
    }
    Ok(0)
}

pub(super) fn sys_message_receive_type(kernel: &mut Kernel) -> SyscallResult {
    let (caller, _) = super::caller(kernel)?;
    let mtype = message::peek_type(&mut kernel.tasks, caller.process)
        .map_err(|err| err.errno())?;
    Ok(mtype as u32)
}

pub(super) fn sys_message_wait_for_response(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let target = VirtualAddress::new(frame.r[0]);
    let len = frame.r[1] as usize;
    let request = frame.r[2] as u64;
    if len == 0 || target.as_u32() == 0 {
        return Err(error::EINVAL);
    }
    // a miss parks the caller on the request id and schedules away; the
    // error still reaches r0 so a woken retry goes through this path again
    let payload = message::wait_for_response(&mut kernel.tasks, caller, len, request)
        .map_err(|err| err.errno())?;
    super::copy_to_user(kernel, caller, target, &payload)?;
    Ok(0)
}

pub(super) fn sys_message_wait_for_response_type(_kernel: &mut Kernel) -> SyscallResult {
    Err(error::ENOSYS)
}

pub(super) fn sys_message_has_by_name(kernel: &mut Kernel) -> SyscallResult {
    let (caller, frame) = super::caller(kernel)?;
    let name = super::read_user_string(kernel, caller, VirtualAddress::new(frame.r[0]))?;
    message::has_by_name(&kernel.tasks, &name, caller.process)
        .map_err(|err| err.errno())?;
    Ok(0)
}
