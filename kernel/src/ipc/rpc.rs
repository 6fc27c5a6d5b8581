//! Synchronous RPC by instruction patching
//!
//! A raise saves the target thread's execution point, replaces the word at
//! its PC with the permanently undefined instruction and redirects the
//! thread into the registered handler. Returning to the saved PC traps, and
//! the restore path writes the original word back and reinstates the saved
//! register frame. Stacked raises against the same thread reuse the first
//! backup's saved word, so the page is patched exactly once.
//!
//! Registry shape: containers keyed by identifier string, one entry per
//! registered process, one FIFO of in-flight backups per entry.

use alloc::string::String;

use super::message::{self, MessageError};
use crate::{
    arch::armv7::{barrier, cache},
    collection::List,
    error,
    mm::{PhysicalAddress, VirtError, VirtualAddress, VirtualMemory, PAGE_SIZE},
    task::{Process, ProcessId, ProcessState, TaskManager, ThreadId, ThreadRef, ThreadState},
};

/// ARM "permanently undefined" encoding.
pub const UNDEFINED_INSTRUCTION_ARM: u32 = 0xE7F0_00F0;
/// Thumb undefined encoding.
pub const UNDEFINED_INSTRUCTION_THUMB: u16 = 0xDEFF;
/// Message type tag used for RPC payload shipments.
pub const RPC_MESSAGE_TYPE: usize = 0;

/// Picks the thread of a target process that will run the handler.
pub type ThreadSelector = fn(&Process) -> Option<ThreadId>;

fn first_thread_selector(process: &Process) -> Option<ThreadId> {
    process.first_live_thread()
}

/// Failure kinds of the RPC engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// No container under the identifier.
    UnknownIdentifier,
    /// The target process has no entry in the container.
    NoHandler,
    /// The (identifier, process) pair is already registered.
    AlreadyRegistered,
    /// Unregister with a handler address that does not match.
    HandlerMismatch,
    /// The target process is gone.
    NoSuchProcess,
    /// No usable thread in the target process.
    NoThread,
    /// Restore attempted outside the rpc-active states.
    InvalidState,
    /// No active backup matched the faulting address.
    NoActiveBackup,
    /// Not enough room on the user stack for the two parameter words.
    StackSpace,
    /// Reading or patching the target page failed.
    BackupFailed,
    Message(MessageError),
    Virt(VirtError),
}

impl RpcError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::UnknownIdentifier | Self::NoHandler => error::ENOENT,
            Self::NoSuchProcess | Self::NoThread => error::ESRCH,
            Self::AlreadyRegistered => error::EEXIST,
            Self::HandlerMismatch | Self::InvalidState | Self::NoActiveBackup => error::EINVAL,
            Self::StackSpace => error::ENOMEM,
            Self::BackupFailed => error::EIO,
            Self::Message(err) => err.errno(),
            Self::Virt(err) => err.errno(),
        }
    }
}

impl From<VirtError> for RpcError {
    fn from(err: VirtError) -> Self {
        Self::Virt(err)
    }
}

/// One in-flight invocation: everything needed to put the target thread
/// back where it was.
pub struct RpcBackup {
    pub thread: ThreadRef,
    pub source: ThreadRef,
    /// Register frame captured before the hijack.
    pub context: crate::arch::RegisterContext,
    /// Exact address the saved word came from.
    pub instruction_address: VirtualAddress,
    /// The 32-bit word replaced by the patch.
    pub instruction_backup: u32,
    /// Message carrying the payload, zero for none.
    pub message_id: u64,
    pub prepared: bool,
    pub active: bool,
}

/// A `(process, handler)` binding with its in-flight backups.
pub struct RpcEntry {
    pub process: ProcessId,
    pub handler: VirtualAddress,
    pub queue: List<RpcBackup>,
}

struct RpcContainer {
    identifier: String,
    handlers: List<RpcEntry>,
}

/// Registry of all RPC bindings.
pub struct RpcRegistry {
    containers: List<RpcContainer>,
    selector: ThreadSelector,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self {
            containers: List::new(),
            selector: first_thread_selector,
        }
    }

    /// Replace the victim-thread selection policy.
    pub fn set_thread_selector(&mut self, selector: ThreadSelector) {
        self.selector = selector;
    }

    /// Bind `handler` of `process` under `identifier`.
    pub fn register(
        &mut self,
        identifier: &str,
        process: ProcessId,
        handler: VirtualAddress,
    ) -> Result<(), RpcError> {
        if self
            .containers
            .lookup(|container| container.identifier == identifier)
            .is_none()
        {
            self.containers.push_back(RpcContainer {
                identifier: String::from(identifier),
                handlers: List::new(),
            });
        }
        let container = self
            .containers
            .lookup_mut(|container| container.identifier == identifier)
            .ok_or(RpcError::UnknownIdentifier)?;
        if container
            .handlers
            .lookup(|entry| entry.process == process)
            .is_some()
        {
            log::debug!(
                "process {} already registered handler for {}",
                process,
                identifier
            );
            return Err(RpcError::AlreadyRegistered);
        }
        container.handlers.push_back(RpcEntry {
            process,
            handler,
            queue: List::new(),
        });
        Ok(())
    }

    /// Remove the binding. Unknown identifiers and unbound processes are
    /// not an error; a mismatched handler address is.
    pub fn unregister(
        &mut self,
        tasks: &mut TaskManager,
        identifier: &str,
        process: ProcessId,
        handler: VirtualAddress,
    ) -> Result<(), RpcError> {
        let Some(container) = self
            .containers
            .lookup_mut(|container| container.identifier == identifier)
        else {
            return Ok(());
        };
        let Some(entry) = container.handlers.lookup(|entry| entry.process == process) else {
            return Ok(());
        };
        if entry.handler != handler {
            return Err(RpcError::HandlerMismatch);
        }
        if let Some(entry) = container
            .handlers
            .remove_first_match(|entry| entry.process == process)
        {
            release_entry(tasks, entry);
        }
        Ok(())
    }
}

impl Default for RpcRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop an entry's backups, removing any still-carried payload messages.
fn release_entry(tasks: &mut TaskManager, mut entry: RpcEntry) {
    while let Some(backup) = entry.queue.pop_front() {
        if backup.message_id != 0 {
            message::remove(tasks, backup.thread.process, backup.message_id);
        }
    }
}

/// Drop every binding of a dying process. Its queues die with it, so the
/// carried messages need no separate removal.
pub fn remove_process(rpc: &mut RpcRegistry, pid: ProcessId) {
    let mut current = rpc.containers.iter_mut();
    for container in &mut current {
        let _ = container
            .handlers
            .remove_first_match(|entry| entry.process == pid);
    }
}

/// First active backup of a thread anywhere in the registry, copied out.
fn find_active_backup(
    rpc: &RpcRegistry,
    victim: ThreadRef,
) -> Option<(crate::arch::RegisterContext, u32, VirtualAddress)> {
    for container in rpc.containers.iter() {
        let Some(entry) = container
            .handlers
            .lookup(|entry| entry.process == victim.process)
        else {
            continue;
        };
        for backup in entry.queue.iter() {
            if backup.active && backup.thread == victim {
                return Some((
                    backup.context,
                    backup.instruction_backup,
                    backup.instruction_address,
                ));
            }
        }
    }
    None
}

/// Active backup of a thread that currently runs a handler.
pub fn get_active<'a>(
    rpc: &'a RpcRegistry,
    tasks: &TaskManager,
    thread: ThreadRef,
) -> Option<&'a RpcBackup> {
    let state = tasks.thread(thread)?.state;
    let process_state = tasks.process(thread.process)?.state;
    if state != ThreadState::RpcActive || process_state != ProcessState::RpcActive {
        return None;
    }
    for container in rpc.containers.iter() {
        if let Some(entry) = container
            .handlers
            .lookup(|entry| entry.process == thread.process)
        {
            if let Some(backup) = entry.queue.lookup(|backup| backup.active) {
                return Some(backup);
            }
        }
    }
    None
}

/// Raise `identifier` in `target` on behalf of `source`, shipping `data`
/// as a message when non-empty.
pub fn raise(
    rpc: &mut RpcRegistry,
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
    identifier: &str,
    source: ThreadRef,
    target: ProcessId,
    data: &[u8],
) -> Result<(), RpcError> {
    let handler = {
        let container = rpc
            .containers
            .lookup(|container| container.identifier == identifier)
            .ok_or(RpcError::UnknownIdentifier)?;
        container
            .handlers
            .lookup(|entry| entry.process == target)
            .ok_or(RpcError::NoHandler)?
            .handler
    };

    // --- create the backup ---
    let victim = {
        let process = tasks.process(target).ok_or(RpcError::NoSuchProcess)?;
        let tid = (rpc.selector)(process).ok_or(RpcError::NoThread)?;
        ThreadRef {
            process: target,
            thread: tid,
        }
    };

    // a stacked raise reuses the active backup's frame and saved word so
    // the already-patched page is not re-read or re-corrupted
    let (context, instruction_backup, instruction_address) =
        match find_active_backup(rpc, victim) {
            Some(existing) => existing,
            None => {
                let frame = tasks.thread(victim).ok_or(RpcError::NoThread)?.context;
                let pc = VirtualAddress::new(frame.pc);
                let word = read_instruction(tasks, vm, victim, pc)?;
                (frame, word, pc)
            }
        };

    // --- ship the payload ---
    let message_id = if data.is_empty() {
        0
    } else {
        message::send_by_pid(tasks, target, source.process, RPC_MESSAGE_TYPE, data, 0)
            .map_err(RpcError::Message)?
    };

    let backup = RpcBackup {
        thread: victim,
        source,
        context,
        instruction_address,
        instruction_backup,
        message_id,
        prepared: false,
        active: false,
    };

    // --- prepare the invoke on the queued backup ---
    {
        let entry = entry_mut(rpc, identifier, target).ok_or(RpcError::NoHandler)?;
        entry.queue.push_back(backup);
    }
    let result = {
        let entry = entry_mut(rpc, identifier, target).ok_or(RpcError::NoHandler)?;
        let backup = entry.queue.peek_back_mut().ok_or(RpcError::NoHandler)?;
        prepare_invoke(backup, handler, tasks, vm)
    };
    if let Err(err) = result {
        if let Some(entry) = entry_mut(rpc, identifier, target) {
            if let Some(bad) = entry.queue.pop_back() {
                if bad.message_id != 0 {
                    message::remove(tasks, target, bad.message_id);
                }
            }
        }
        return Err(err);
    }
    Ok(())
}

fn entry_mut<'a>(
    rpc: &'a mut RpcRegistry,
    identifier: &str,
    process: ProcessId,
) -> Option<&'a mut RpcEntry> {
    rpc.containers
        .lookup_mut(|container| container.identifier == identifier)?
        .handlers
        .lookup_mut(|entry| entry.process == process)
}

/// Read the word at `pc` in the victim's context through the window.
fn read_instruction(
    tasks: &TaskManager,
    vm: &mut VirtualMemory,
    victim: ThreadRef,
    pc: VirtualAddress,
) -> Result<u32, RpcError> {
    let context = tasks
        .process(victim.process)
        .and_then(|process| process.virtual_context)
        .ok_or(RpcError::NoSuchProcess)?;
    let phys = vm
        .get_mapped_address_in_context(context, pc.align_down_page())
        .ok_or(RpcError::BackupFailed)?;
    let window = vm.map_temporary(phys, PAGE_SIZE)?;
    let word = vm.window_read_u32(window.offset(pc.page_offset()));
    vm.unmap_temporary(window, PAGE_SIZE);
    Ok(word?)
}

/// Write `word` (or its Thumb half) at `address` in the victim's context
/// and make it visible to the instruction stream.
fn patch_instruction(
    tasks: &TaskManager,
    vm: &mut VirtualMemory,
    victim: ThreadRef,
    address: VirtualAddress,
    thumb: bool,
) -> Result<(), RpcError> {
    let context = tasks
        .process(victim.process)
        .and_then(|process| process.virtual_context)
        .ok_or(RpcError::NoSuchProcess)?;
    let phys: PhysicalAddress = vm
        .get_mapped_address_in_context(context, address.align_down_page())
        .ok_or(RpcError::BackupFailed)?;
    let window = vm.map_temporary(phys, PAGE_SIZE)?;
    let write = if thumb {
        vm.window_write_u16(window.offset(address.page_offset()), UNDEFINED_INSTRUCTION_THUMB)
    } else {
        vm.window_write_u32(window.offset(address.page_offset()), UNDEFINED_INSTRUCTION_ARM)
    };
    // the patched word must reach the instruction fetcher before the trap
    // returns to user mode
    barrier::data_memory();
    cache::invalidate_instruction_cache();
    cache::invalidate_data_cache();
    cache::invalidate_prefetch_buffer();
    vm.unmap_temporary(window, PAGE_SIZE);
    write?;
    Ok(())
}

/// Arm a queued backup: parameters into r0/r1, undefined instruction at
/// the PC, LR/PC redirected into the handler, states switched. A backup
/// whose thread is already inside an RPC stays queued untouched, and an
/// already-prepared backup is left alone.
fn prepare_invoke(
    backup: &mut RpcBackup,
    handler: VirtualAddress,
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
) -> Result<(), RpcError> {
    if backup.prepared {
        return Ok(());
    }
    let victim = backup.thread;
    let state = tasks.thread(victim).ok_or(RpcError::NoThread)?.state;
    if state.in_rpc() {
        // handler already running; the backup waits its turn in the FIFO
        return Ok(());
    }

    let (pc, thumb) = {
        let thread = tasks.thread_mut(victim).ok_or(RpcError::NoThread)?;
        // room for a pid and a message id on the user stack
        let span = VirtualAddress::new(thread.context.sp).page_offset();
        if span < 2 * core::mem::size_of::<u32>() {
            log::warn!("rpc: stack extension required for thread {}", victim.thread);
            return Err(RpcError::StackSpace);
        }
        thread.context.r[0] = backup.source.process.0;
        thread.context.r[1] = backup.message_id as u32;
        (VirtualAddress::new(thread.context.pc), thread.context.thumb())
    };

    patch_instruction(tasks, vm, victim, pc, thumb)?;

    {
        let thread = tasks.thread_mut(victim).ok_or(RpcError::NoThread)?;
        thread.context.lr = thread.context.pc;
        thread.context.pc = handler.as_u32();
    }

    let is_current = tasks.current() == Some(victim);
    if let Some(thread) = tasks.thread_mut(victim) {
        thread.state = if is_current {
            ThreadState::RpcActive
        } else {
            ThreadState::RpcQueued
        };
    }
    if let Some(process) = tasks.process_mut(victim.process) {
        process.state = if is_current {
            ProcessState::RpcActive
        } else {
            ProcessState::RpcQueued
        };
    }
    backup.prepared = true;
    backup.active = true;
    Ok(())
}

/// Restore a thread that re-executed its patched instruction: write the
/// saved word back, reinstate the saved frame, drop the backup and chain
/// the next queued one with the just-restored frame as its pristine
/// context.
pub fn restore_thread(
    rpc: &mut RpcRegistry,
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
    victim: ThreadRef,
) -> Result<(), RpcError> {
    let thread_state = tasks.thread(victim).ok_or(RpcError::NoThread)?.state;
    let process_state = tasks
        .process(victim.process)
        .ok_or(RpcError::NoSuchProcess)?
        .state;
    if thread_state != ThreadState::RpcActive || process_state != ProcessState::RpcActive {
        return Err(RpcError::InvalidState);
    }
    let pc = tasks.thread(victim).ok_or(RpcError::NoThread)?.context.pc;

    // scan every entry of this process: the active backup matching the
    // faulting address is the one to restore, everything else still queued
    // means more RPCs are pending
    let mut matched: Option<(crate::arch::RegisterContext, u32, VirtualAddress, u64)> = None;
    let mut pending = false;
    for container in rpc.containers.iter() {
        let Some(entry) = container
            .handlers
            .lookup(|entry| entry.process == victim.process)
        else {
            continue;
        };
        for backup in entry.queue.iter() {
            if matched.is_none()
                && backup.active
                && backup.instruction_address.as_u32() == pc
            {
                matched = Some((
                    backup.context,
                    backup.instruction_backup,
                    backup.instruction_address,
                    backup.message_id,
                ));
            } else {
                pending = true;
            }
        }
    }
    let (saved_frame, saved_word, address, message_id) =
        matched.ok_or(RpcError::NoActiveBackup)?;

    // put the original word back
    let context = tasks
        .process(victim.process)
        .and_then(|process| process.virtual_context)
        .ok_or(RpcError::NoSuchProcess)?;
    let phys = vm
        .get_mapped_address_in_context(context, address.align_down_page())
        .ok_or(RpcError::BackupFailed)?;
    let window = vm.map_temporary(phys, PAGE_SIZE)?;
    let write = vm.window_write_u32(window.offset(address.page_offset()), saved_word);
    vm.unmap_temporary(window, PAGE_SIZE);
    write?;
    barrier::data_memory();

    // reinstate the saved frame and drop back to plain active
    if let Some(thread) = tasks.thread_mut(victim) {
        thread.context = saved_frame;
        thread.state = ThreadState::Active;
        thread.state_data = None;
    }
    if let Some(process) = tasks.process_mut(victim.process) {
        process.state = ProcessState::Active;
    }

    // remove the restored backup and its payload message
    let mut removed = false;
    for container in rpc.containers.iter_mut() {
        if removed {
            break;
        }
        if let Some(entry) = container
            .handlers
            .lookup_mut(|entry| entry.process == victim.process)
        {
            removed = entry
                .queue
                .remove_first_match(|backup| {
                    backup.active && backup.instruction_address == address
                })
                .is_some();
        }
    }
    if removed && message_id != 0 {
        message::remove(tasks, victim.process, message_id);
    }

    // chain the next queued rpc, re-entering with the restored frame
    if pending {
        let restored = tasks.thread(victim).ok_or(RpcError::NoThread)?.context;
        let mut chained: Option<RpcError> = None;
        for container in rpc.containers.iter_mut() {
            let Some(entry) = container
                .handlers
                .lookup_mut(|entry| entry.process == victim.process)
            else {
                continue;
            };
            let handler = entry.handler;
            if let Some(next) = entry.queue.peek_front_mut() {
                next.context = restored;
                if let Err(err) = prepare_invoke(next, handler, tasks, vm) {
                    chained = Some(err);
                }
                break;
            }
        }
        if let Some(err) = chained {
            return Err(err);
        }
    }
    Ok(())
}
