//! Syscall gateway
//!
//! A fixed table maps syscall numbers onto the subsystem operations. The
//! first four arguments arrive in r0..r3, overflow words sit on the user
//! stack; the result goes into the saved r0, negative errno on failure.
//! Handlers operate on the *saved* frame of the current thread (the trap
//! entry stores the live registers there first), so a reschedule can
//! freely install another thread before the trap returns.

pub mod memory;
pub mod message;
pub mod process;
pub mod rpc;

use alloc::{string::String, vec, vec::Vec};

use crate::{
    arch::RegisterContext,
    config::MAX_NAME_LENGTH,
    error,
    kernel::Kernel,
    mm::{virt, VirtualAddress, PAGE_SIZE},
    task::ThreadRef,
};

/// Syscall numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    // process management
    ProcessId = 1,
    ProcessParentId = 2,
    ProcessExit = 3,
    ProcessFork = 4,
    ProcessReplace = 5,
    ThreadId = 6,
    ThreadExit = 7,

    // memory management
    MemoryAcquire = 10,
    MemoryRelease = 11,
    MemorySharedCreate = 12,
    MemorySharedAttach = 13,
    MemorySharedDetach = 14,
    MemoryTranslatePhysical = 15,

    // messaging
    MessageCreate = 20,
    MessageDestroy = 21,
    MessageSendByPid = 22,
    MessageSendByName = 23,
    MessageReceive = 24,
    MessageReceiveType = 25,
    MessageWaitForResponse = 26,
    MessageWaitForResponseType = 27,
    MessageHasByName = 28,

    // rpc
    RpcRegisterHandler = 30,
    RpcUnregisterHandler = 31,
    RpcRaise = 32,
    RpcSetReady = 33,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ProcessId),
            2 => Ok(Self::ProcessParentId),
            3 => Ok(Self::ProcessExit),
            4 => Ok(Self::ProcessFork),
            5 => Ok(Self::ProcessReplace),
            6 => Ok(Self::ThreadId),
            7 => Ok(Self::ThreadExit),
            10 => Ok(Self::MemoryAcquire),
            11 => Ok(Self::MemoryRelease),
            12 => Ok(Self::MemorySharedCreate),
            13 => Ok(Self::MemorySharedAttach),
            14 => Ok(Self::MemorySharedDetach),
            15 => Ok(Self::MemoryTranslatePhysical),
            20 => Ok(Self::MessageCreate),
            21 => Ok(Self::MessageDestroy),
            22 => Ok(Self::MessageSendByPid),
            23 => Ok(Self::MessageSendByName),
            24 => Ok(Self::MessageReceive),
            25 => Ok(Self::MessageReceiveType),
            26 => Ok(Self::MessageWaitForResponse),
            27 => Ok(Self::MessageWaitForResponseType),
            28 => Ok(Self::MessageHasByName),
            30 => Ok(Self::RpcRegisterHandler),
            31 => Ok(Self::RpcUnregisterHandler),
            32 => Ok(Self::RpcRaise),
            33 => Ok(Self::RpcSetReady),
            _ => Err(()),
        }
    }
}

/// Result of one handler: success payload for r0, or a positive errno the
/// gateway encodes negatively.
pub type SyscallResult = Result<u32, i32>;

/// Dispatch one trap. The caller's saved frame already holds the live
/// registers; the result lands in its r0.
pub(crate) fn dispatch(kernel: &mut Kernel, number: usize) {
    let Some(caller) = kernel.tasks.current() else {
        log::warn!("syscall {} without a current thread", number);
        return;
    };
    let result = match Syscall::try_from(number) {
        Ok(syscall) => {
            log::trace!("syscall {:?} from {}", syscall, caller.process);
            handle(kernel, syscall)
        }
        Err(()) => Err(error::ENOSYS),
    };
    if let Some(thread) = kernel.tasks.thread_mut(caller) {
        thread.context.r[0] = match result {
            Ok(value) => value,
            Err(errno) => error::encode(errno),
        };
    }
}

fn handle(kernel: &mut Kernel, syscall: Syscall) -> SyscallResult {
    match syscall {
        Syscall::ProcessId => process::sys_process_id(kernel),
        Syscall::ProcessParentId => process::sys_process_parent_id(kernel),
        Syscall::ProcessExit => process::sys_process_exit(kernel),
        Syscall::ProcessFork => process::sys_process_fork(kernel),
        Syscall::ProcessReplace => process::sys_process_replace(kernel),
        Syscall::ThreadId => process::sys_thread_id(kernel),
        Syscall::ThreadExit => process::sys_thread_exit(kernel),

        Syscall::MemoryAcquire => memory::sys_memory_acquire(kernel),
        Syscall::MemoryRelease => memory::sys_memory_release(kernel),
        Syscall::MemorySharedCreate => memory::sys_memory_shared_create(kernel),
        Syscall::MemorySharedAttach => memory::sys_memory_shared_attach(kernel),
        Syscall::MemorySharedDetach => memory::sys_memory_shared_detach(kernel),
        Syscall::MemoryTranslatePhysical => memory::sys_memory_translate_physical(kernel),

        Syscall::MessageCreate => message::sys_message_create(kernel),
        Syscall::MessageDestroy => message::sys_message_destroy(kernel),
        Syscall::MessageSendByPid => message::sys_message_send_by_pid(kernel),
        Syscall::MessageSendByName => message::sys_message_send_by_name(kernel),
        Syscall::MessageReceive => message::sys_message_receive(kernel),
        Syscall::MessageReceiveType => message::sys_message_receive_type(kernel),
        Syscall::MessageWaitForResponse => message::sys_message_wait_for_response(kernel),
        Syscall::MessageWaitForResponseType => {
            message::sys_message_wait_for_response_type(kernel)
        }
        Syscall::MessageHasByName => message::sys_message_has_by_name(kernel),

        Syscall::RpcRegisterHandler => rpc::sys_rpc_register_handler(kernel),
        Syscall::RpcUnregisterHandler => rpc::sys_rpc_unregister_handler(kernel),
        Syscall::RpcRaise => rpc::sys_rpc_raise(kernel),
        Syscall::RpcSetReady => rpc::sys_rpc_set_ready(kernel),
    }
}

/// Current thread plus a copy of its saved frame.
pub(crate) fn caller(kernel: &Kernel) -> Result<(ThreadRef, RegisterContext), i32> {
    let reference = kernel.tasks.current().ok_or(error::ESRCH)?;
    let frame = kernel
        .tasks
        .thread(reference)
        .ok_or(error::ESRCH)?
        .context;
    Ok((reference, frame))
}

/// Argument `index` of the invocation: r0..r3, then the user stack.
pub(crate) fn argument(
    kernel: &mut Kernel,
    caller: ThreadRef,
    frame: &RegisterContext,
    index: usize,
) -> Result<u32, i32> {
    if index < 4 {
        return Ok(frame.r[index]);
    }
    let slot = VirtualAddress::new(frame.sp).offset((index - 4) * core::mem::size_of::<u32>());
    let mut word = [0u8; 4];
    copy_from_user(kernel, caller, slot, &mut word)?;
    Ok(u32::from_le_bytes(word))
}

fn user_context(kernel: &Kernel, caller: ThreadRef) -> Result<crate::mm::VirtContext, i32> {
    kernel
        .tasks
        .process(caller.process)
        .and_then(|process| process.virtual_context)
        .ok_or(error::ESRCH)
}

/// Copy bytes out of the caller's address space through the temporary
/// window.
pub(crate) fn copy_from_user(
    kernel: &mut Kernel,
    caller: ThreadRef,
    addr: VirtualAddress,
    buf: &mut [u8],
) -> Result<(), i32> {
    let context = user_context(kernel, caller)?;
    if !virt::context_contains(context.kind, addr, buf.len()) {
        return Err(error::EINVAL);
    }
    let mut done = 0;
    while done < buf.len() {
        let cursor = addr.offset(done);
        let chunk = (PAGE_SIZE - cursor.page_offset()).min(buf.len() - done);
        let phys = kernel
            .vm
            .get_mapped_address_in_context(context, cursor.align_down_page())
            .ok_or(error::EINVAL)?;
        let window = kernel
            .vm
            .map_temporary(phys, PAGE_SIZE)
            .map_err(|err| err.errno())?;
        let read = kernel.vm.window_read(
            window.offset(cursor.page_offset()),
            &mut buf[done..done + chunk],
        );
        kernel.vm.unmap_temporary(window, PAGE_SIZE);
        read.map_err(|err| err.errno())?;
        done += chunk;
    }
    Ok(())
}

/// Copy bytes into the caller's address space through the temporary
/// window.
pub(crate) fn copy_to_user(
    kernel: &mut Kernel,
    caller: ThreadRef,
    addr: VirtualAddress,
    data: &[u8],
) -> Result<(), i32> {
    let context = user_context(kernel, caller)?;
    if !virt::context_contains(context.kind, addr, data.len()) {
        return Err(error::EINVAL);
    }
    let mut done = 0;
    while done < data.len() {
        let cursor = addr.offset(done);
        let chunk = (PAGE_SIZE - cursor.page_offset()).min(data.len() - done);
        let phys = kernel
            .vm
            .get_mapped_address_in_context(context, cursor.align_down_page())
            .ok_or(error::EINVAL)?;
        let window = kernel
            .vm
            .map_temporary(phys, PAGE_SIZE)
            .map_err(|err| err.errno())?;
        let write = kernel.vm.window_write(
            window.offset(cursor.page_offset()),
            &data[done..done + chunk],
        );
        kernel.vm.unmap_temporary(window, PAGE_SIZE);
        write.map_err(|err| err.errno())?;
        done += chunk;
    }
    Ok(())
}

/// Write one little-endian word into the caller's address space.
pub(crate) fn put_user_u32(
    kernel: &mut Kernel,
    caller: ThreadRef,
    addr: VirtualAddress,
    value: u32,
) -> Result<(), i32> {
    copy_to_user(kernel, caller, addr, &value.to_le_bytes())
}

/// Read a NUL-terminated string of at most `MAX_NAME_LENGTH` bytes.
pub(crate) fn read_user_string(
    kernel: &mut Kernel,
    caller: ThreadRef,
    addr: VirtualAddress,
) -> Result<String, i32> {
    if addr.as_u32() == 0 {
        return Err(error::EINVAL);
    }
    let mut collected: Vec<u8> = Vec::new();
    let mut cursor = addr;
    while collected.len() < MAX_NAME_LENGTH {
        let chunk = (PAGE_SIZE - cursor.page_offset())
            .min(MAX_NAME_LENGTH - collected.len());
        let mut buf = vec![0u8; chunk];
        copy_from_user(kernel, caller, cursor, &mut buf)?;
        if let Some(nul) = buf.iter().position(|byte| *byte == 0) {
            collected.extend_from_slice(&buf[..nul]);
            let parsed = core::str::from_utf8(&collected).map_err(|_| error::EINVAL)?;
            return Ok(String::from(parsed));
        }
        collected.extend_from_slice(&buf);
        cursor = cursor.offset(chunk);
    }
    Err(error::EINVAL)
}
