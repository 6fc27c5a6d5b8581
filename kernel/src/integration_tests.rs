//! End-to-end scenarios across the whole substrate
//!
//! Each test boots a kernel on the sparse frame backing, spawns user
//! processes with one thread each and drives them through the syscall
//! gateway the way the trap stubs would.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::{
    error,
    ipc::rpc::UNDEFINED_INSTRUCTION_ARM,
    kernel::Kernel,
    mm::{
        phys::SparseBacking, ContextKind, MemoryType, PageFlags, PhysicalAddress,
        VirtualAddress, PAGE_SIZE,
    },
    syscall::Syscall,
    task::{ProcessId, ThreadRef, ThreadState},
};

/// mov r0, r0
const ORIGINAL_WORD: u32 = 0xE1A0_0000;
const CODE_PAGE: u32 = 0x0005_0000;
const TICK_HANDLER: u32 = 0x0001_0000;
const TOCK_HANDLER: u32 = 0x0001_0800;

fn boot() -> Kernel {
    Kernel::new(Box::new(SparseBacking::new())).expect("bringup")
}

/// Process with one thread sitting at a mapped, executable code page.
fn spawn(kernel: &mut Kernel, name: &str) -> ThreadRef {
    let pid = kernel
        .tasks
        .create_process(&mut kernel.vm, 5, ProcessId(0), name)
        .unwrap();
    let tid = kernel
        .tasks
        .create_thread(&mut kernel.vm, pid, VirtualAddress::new(CODE_PAGE), 5)
        .unwrap();
    let context = kernel.tasks.process(pid).unwrap().virtual_context.unwrap();
    kernel
        .vm
        .map_random(
            context,
            VirtualAddress::new(CODE_PAGE),
            MemoryType::Normal,
            PageFlags::READ | PageFlags::EXECUTABLE,
        )
        .unwrap();
    let reference = ThreadRef { process: pid, thread: tid };
    poke(kernel, pid, VirtualAddress::new(CODE_PAGE), &ORIGINAL_WORD.to_le_bytes());
    reference
}

fn poke(kernel: &mut Kernel, pid: ProcessId, addr: VirtualAddress, bytes: &[u8]) {
    let context = kernel.tasks.process(pid).unwrap().virtual_context.unwrap();
    let phys = kernel
        .vm
        .get_mapped_address_in_context(context, addr.align_down_page())
        .unwrap();
    let window = kernel.vm.map_temporary(phys, PAGE_SIZE).unwrap();
    kernel
        .vm
        .window_write(window.offset(addr.page_offset()), bytes)
        .unwrap();
    kernel.vm.unmap_temporary(window, PAGE_SIZE);
}

fn peek(kernel: &mut Kernel, pid: ProcessId, addr: VirtualAddress, len: usize) -> Vec<u8> {
    let context = kernel.tasks.process(pid).unwrap().virtual_context.unwrap();
    let phys = kernel
        .vm
        .get_mapped_address_in_context(context, addr.align_down_page())
        .unwrap();
    let window = kernel.vm.map_temporary(phys, PAGE_SIZE).unwrap();
    let mut buf = vec![0u8; len];
    kernel
        .vm
        .window_read(window.offset(addr.page_offset()), &mut buf)
        .unwrap();
    kernel.vm.unmap_temporary(window, PAGE_SIZE);
    buf
}

fn code_word(kernel: &mut Kernel, pid: ProcessId) -> u32 {
    let bytes = peek(kernel, pid, VirtualAddress::new(CODE_PAGE), 4);
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Issue a syscall as `caller`, the way the svc stub would: make it
/// current, push overflow arguments onto its stack, trap, and read the
/// result from its saved r0.
fn syscall(kernel: &mut Kernel, caller: ThreadRef, number: Syscall, args: &[u32]) -> u32 {
    let priority = kernel.tasks.thread(caller).unwrap().priority;
    kernel.tasks.set_current(caller, priority);
    let mut frame = kernel.tasks.thread(caller).unwrap().context;
    for (index, value) in args.iter().enumerate().take(4) {
        frame.r[index] = *value;
    }
    if args.len() > 4 {
        let overflow = &args[4..];
        frame.sp -= (overflow.len() * 4) as u32;
        for (index, value) in overflow.iter().enumerate() {
            poke(
                kernel,
                caller.process,
                VirtualAddress::new(frame.sp + (index * 4) as u32),
                &value.to_le_bytes(),
            );
        }
    }
    kernel.handle_syscall(number as usize, &mut frame);
    kernel.tasks.thread(caller).unwrap().context.r[0]
}

fn errno_of(raw: u32) -> i32 {
    -(raw as i32)
}

/// User-space scratch buffer obtained through memory_acquire.
fn user_buffer(kernel: &mut Kernel, caller: ThreadRef, len: usize) -> VirtualAddress {
    let addr = syscall(
        kernel,
        caller,
        Syscall::MemoryAcquire,
        &[0, len as u32, 0x1 | 0x2, 0],
    );
    assert!(!error::is_error(addr), "memory acquire failed: {}", addr as i32);
    VirtualAddress::new(addr)
}

// ---- scenario 1: map, unmap, remap with literal addresses -------------

#[test]
fn test_map_unmap_remap_scenario() {
    let mut kernel = boot();
    // a second kernel context, so the literal window address is free
    let context = kernel.vm.create_context(ContextKind::Kernel).unwrap();
    let virt = VirtualAddress::new(0xF100_0000);

    kernel
        .vm
        .map(
            context,
            virt,
            PhysicalAddress::new(0x4000_0000),
            MemoryType::NormalNonCacheable,
            PageFlags::READ | PageFlags::WRITE,
        )
        .unwrap();
    assert!(kernel.vm.is_mapped_in_context(context, virt));
    kernel.vm.unmap(context, virt, false).unwrap();
    assert!(!kernel.vm.is_mapped_in_context(context, virt));
    kernel
        .vm
        .map(
            context,
            virt,
            PhysicalAddress::new(0x4000_1000),
            MemoryType::NormalNonCacheable,
            PageFlags::READ | PageFlags::WRITE,
        )
        .unwrap();
    assert_eq!(
        kernel.vm.get_mapped_address_in_context(context, virt),
        Some(PhysicalAddress::new(0x4000_1000))
    );
}

// ---- scenario 2: message round trip -----------------------------------

#[test]
fn test_message_round_trip_scenario() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");
    assert_eq!(syscall(&mut kernel, a, Syscall::MessageCreate, &[]), 0);
    assert_eq!(syscall(&mut kernel, b, Syscall::MessageCreate, &[]), 0);

    let payload = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, payload, b"hi");
    let message_id = syscall(
        &mut kernel,
        a,
        Syscall::MessageSendByPid,
        &[b.process.0, 7, payload.as_u32(), 2, 0],
    );
    assert!(!error::is_error(message_id) && message_id > 0);

    let buffer = user_buffer(&mut kernel, b, PAGE_SIZE);
    let sender_out = buffer.offset(0x100);
    let id_out = buffer.offset(0x104);
    assert_eq!(
        syscall(
            &mut kernel,
            b,
            Syscall::MessageReceive,
            &[buffer.as_u32(), 16, sender_out.as_u32(), id_out.as_u32()],
        ),
        0
    );
    assert_eq!(peek(&mut kernel, b.process, buffer, 2), b"hi");
    let sender = peek(&mut kernel, b.process, sender_out, 4);
    assert_eq!(
        u32::from_le_bytes([sender[0], sender[1], sender[2], sender[3]]),
        a.process.0
    );
    let id = peek(&mut kernel, b.process, id_out, 4);
    assert_eq!(
        u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
        message_id
    );
}

// ---- scenario 3: response matching ------------------------------------

#[test]
fn test_response_matching_scenario() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");
    assert_eq!(syscall(&mut kernel, a, Syscall::MessageCreate, &[]), 0);
    assert_eq!(syscall(&mut kernel, b, Syscall::MessageCreate, &[]), 0);

    let out_a = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, out_a, b"req");
    let request_id = syscall(
        &mut kernel,
        a,
        Syscall::MessageSendByPid,
        &[b.process.0, 1, out_a.as_u32(), 3, 0],
    );
    assert!(!error::is_error(request_id) && request_id > 0);

    // b answers, tagging the response with the request id
    let out_b = user_buffer(&mut kernel, b, PAGE_SIZE);
    poke(&mut kernel, b.process, out_b, b"resp");
    let response = syscall(
        &mut kernel,
        b,
        Syscall::MessageSendByPid,
        &[a.process.0, 1, out_b.as_u32(), 4, request_id],
    );
    assert!(!error::is_error(response) && response > 0);

    let in_a = user_buffer(&mut kernel, a, PAGE_SIZE);
    assert_eq!(
        syscall(
            &mut kernel,
            a,
            Syscall::MessageWaitForResponse,
            &[in_a.as_u32(), 16, request_id],
        ),
        0
    );
    assert_eq!(peek(&mut kernel, a.process, in_a, 4), b"resp");

    // nothing left matching: the caller blocks and reports no message
    let raw = syscall(
        &mut kernel,
        a,
        Syscall::MessageWaitForResponse,
        &[in_a.as_u32(), 16, request_id],
    );
    assert_eq!(errno_of(raw), error::ENOMSG);
    assert_eq!(
        kernel.tasks.thread(a).unwrap().state,
        ThreadState::WaitingForMessage
    );
}

// ---- scenario 4: rpc raise and restore --------------------------------

#[test]
fn test_rpc_raise_and_restore_scenario() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");
    assert_eq!(syscall(&mut kernel, a, Syscall::MessageCreate, &[]), 0);
    assert_eq!(syscall(&mut kernel, b, Syscall::MessageCreate, &[]), 0);

    let identifier = user_buffer(&mut kernel, b, PAGE_SIZE);
    poke(&mut kernel, b.process, identifier, b"tick\0");
    assert_eq!(
        syscall(
            &mut kernel,
            b,
            Syscall::RpcRegisterHandler,
            &[identifier.as_u32(), TICK_HANDLER],
        ),
        0
    );

    let original_frame = kernel.tasks.thread(b).unwrap().context;
    let identifier_a = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, identifier_a, b"tick\0");
    let payload = identifier_a.offset(0x40);
    poke(&mut kernel, a.process, payload, &[1, 2, 3, 4]);
    assert_eq!(
        syscall(
            &mut kernel,
            a,
            Syscall::RpcRaise,
            &[identifier_a.as_u32(), b.process.0, payload.as_u32(), 4],
        ),
        0
    );

    // the target page now carries the undefined instruction and the
    // thread is redirected into the handler
    assert_eq!(code_word(&mut kernel, b.process), UNDEFINED_INSTRUCTION_ARM);
    let hijacked = kernel.tasks.thread(b).unwrap();
    assert_eq!(hijacked.context.pc, TICK_HANDLER);
    assert_eq!(hijacked.context.lr, CODE_PAGE);
    assert_eq!(hijacked.context.r[0], a.process.0);
    assert_eq!(hijacked.state, ThreadState::RpcQueued);
    let carried = hijacked.context.r[1];
    assert!(carried > 0);

    // the next tick hands the CPU to the prepared thread
    let mut frame = kernel.tasks.thread(a).unwrap().context;
    kernel.handle_timer(&mut frame);
    assert_eq!(kernel.tasks.current(), Some(b));
    assert_eq!(kernel.tasks.thread(b).unwrap().state, ThreadState::RpcActive);

    // handler finishes and falls back to the saved pc; the fetch of the
    // undefined instruction traps
    frame.pc = CODE_PAGE;
    assert!(kernel.handle_undefined_instruction(&mut frame));

    assert_eq!(code_word(&mut kernel, b.process), ORIGINAL_WORD);
    let restored = kernel.tasks.thread(b).unwrap();
    assert_eq!(restored.context, original_frame);
    assert_eq!(restored.state, ThreadState::Active);
    assert_eq!(frame, original_frame);
}

// ---- scenario 5: fork -------------------------------------------------

#[test]
fn test_fork_scenario() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    assert_eq!(syscall(&mut kernel, a, Syscall::MessageCreate, &[]), 0);
    poke(
        &mut kernel,
        a.process,
        VirtualAddress::new(CODE_PAGE + 0x10),
        b"inherited",
    );

    let child_raw = syscall(&mut kernel, a, Syscall::ProcessFork, &[]);
    assert!(!error::is_error(child_raw));
    let child = ProcessId(child_raw);
    assert_ne!(child, a.process);

    let record = kernel.tasks.process(child).unwrap();
    assert_eq!(record.forked_from, Some(a.process));
    assert!(record.message_queue.is_some());
    let (_, forked_thread) = record.threads.iter().next().unwrap();
    assert_eq!(forked_thread.context.r[0], 0);

    // contents came along, but the backing frames are private
    assert_eq!(
        peek(&mut kernel, child, VirtualAddress::new(CODE_PAGE + 0x10), 9),
        b"inherited"
    );
    poke(&mut kernel, child, VirtualAddress::new(CODE_PAGE + 0x10), b"CHANGED!!");
    assert_eq!(
        peek(&mut kernel, a.process, VirtualAddress::new(CODE_PAGE + 0x10), 9),
        b"inherited"
    );
}

// ---- scenario 6: stacked rpc ------------------------------------------

#[test]
fn test_stacked_rpc_scenario() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");
    assert_eq!(syscall(&mut kernel, a, Syscall::MessageCreate, &[]), 0);
    assert_eq!(syscall(&mut kernel, b, Syscall::MessageCreate, &[]), 0);

    for (identifier, handler) in [(b"tick\0".as_slice(), TICK_HANDLER), (b"tock\0", TOCK_HANDLER)] {
        let name = user_buffer(&mut kernel, b, PAGE_SIZE);
        poke(&mut kernel, b.process, name, identifier);
        assert_eq!(
            syscall(
                &mut kernel,
                b,
                Syscall::RpcRegisterHandler,
                &[name.as_u32(), handler],
            ),
            0
        );
    }

    let tick = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, tick, b"tick\0");
    assert_eq!(
        syscall(&mut kernel, a, Syscall::RpcRaise, &[tick.as_u32(), b.process.0, 0, 0]),
        0
    );
    assert_eq!(code_word(&mut kernel, b.process), UNDEFINED_INSTRUCTION_ARM);

    // the tick handler starts running in b
    let mut frame = kernel.tasks.thread(a).unwrap().context;
    kernel.handle_timer(&mut frame);
    assert_eq!(kernel.tasks.current(), Some(b));
    assert_eq!(kernel.tasks.thread(b).unwrap().state, ThreadState::RpcActive);

    // second raise while the first handler runs: the word at the patched
    // page is left alone and the backup only queues up
    let tock = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, tock, b"tock\0");
    assert_eq!(
        syscall(&mut kernel, a, Syscall::RpcRaise, &[tock.as_u32(), b.process.0, 0, 0]),
        0
    );
    assert_eq!(code_word(&mut kernel, b.process), UNDEFINED_INSTRUCTION_ARM);
    assert_eq!(kernel.tasks.thread(b).unwrap().context.pc, TICK_HANDLER);
    assert_eq!(kernel.tasks.thread(b).unwrap().state, ThreadState::RpcActive);

    // first return restores tick and immediately prepares tock on the
    // just-restored frame
    let priority = kernel.tasks.thread(b).unwrap().priority;
    kernel.tasks.set_current(b, priority);
    let mut frame = kernel.tasks.thread(b).unwrap().context;
    frame.pc = CODE_PAGE;
    assert!(kernel.handle_undefined_instruction(&mut frame));
    assert_eq!(code_word(&mut kernel, b.process), UNDEFINED_INSTRUCTION_ARM);
    assert_eq!(kernel.tasks.thread(b).unwrap().context.pc, TOCK_HANDLER);

    // second return puts the original word back
    let mut frame = kernel.tasks.thread(b).unwrap().context;
    frame.pc = CODE_PAGE;
    assert!(kernel.handle_undefined_instruction(&mut frame));
    assert_eq!(code_word(&mut kernel, b.process), ORIGINAL_WORD);
    assert_eq!(kernel.tasks.thread(b).unwrap().state, ThreadState::Active);
}

// ---- gateway odds and ends --------------------------------------------

#[test]
fn test_unknown_syscall_returns_enosys() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let priority = kernel.tasks.thread(a).unwrap().priority;
    kernel.tasks.set_current(a, priority);
    let mut frame = kernel.tasks.thread(a).unwrap().context;
    kernel.handle_syscall(999, &mut frame);
    assert_eq!(
        errno_of(kernel.tasks.thread(a).unwrap().context.r[0]),
        error::ENOSYS
    );
}

#[test]
fn test_process_identity_syscalls() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    assert_eq!(syscall(&mut kernel, a, Syscall::ProcessId, &[]), a.process.0);
    assert_eq!(syscall(&mut kernel, a, Syscall::ProcessParentId, &[]), 0);
    assert_eq!(syscall(&mut kernel, a, Syscall::ThreadId, &[]), a.thread.0);
    assert_eq!(
        errno_of(syscall(&mut kernel, a, Syscall::ProcessReplace, &[])),
        error::ENOSYS
    );
}

#[test]
fn test_memory_acquire_release_translate() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let buffer = user_buffer(&mut kernel, a, 2 * PAGE_SIZE);
    poke(&mut kernel, a.process, buffer, b"scratch");

    let phys = syscall(
        &mut kernel,
        a,
        Syscall::MemoryTranslatePhysical,
        &[buffer.as_u32()],
    );
    assert!(!error::is_error(phys));

    assert_eq!(
        syscall(
            &mut kernel,
            a,
            Syscall::MemoryRelease,
            &[buffer.as_u32(), 2 * PAGE_SIZE as u32],
        ),
        0
    );
    assert_eq!(
        errno_of(syscall(
            &mut kernel,
            a,
            Syscall::MemoryTranslatePhysical,
            &[buffer.as_u32()],
        )),
        error::EINVAL
    );
}

#[test]
fn test_shared_memory_syscalls() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");

    let id = syscall(&mut kernel, a, Syscall::MemorySharedCreate, &[PAGE_SIZE as u32]);
    assert!(id > 0 && !error::is_error(id));
    let addr_a = syscall(&mut kernel, a, Syscall::MemorySharedAttach, &[id, 0x0100_0000]);
    assert!(!error::is_error(addr_a) && addr_a != 0);
    let addr_b = syscall(&mut kernel, b, Syscall::MemorySharedAttach, &[id, 0x0100_0000]);
    assert!(!error::is_error(addr_b) && addr_b != 0);

    poke(&mut kernel, a.process, VirtualAddress::new(addr_a), b"between");
    assert_eq!(
        peek(&mut kernel, b.process, VirtualAddress::new(addr_b), 7),
        b"between"
    );

    // shared ranges refuse plain release
    assert_eq!(
        errno_of(syscall(
            &mut kernel,
            a,
            Syscall::MemoryRelease,
            &[addr_a, PAGE_SIZE as u32],
        )),
        error::EADDRNOTAVAIL
    );
    assert_eq!(syscall(&mut kernel, a, Syscall::MemorySharedDetach, &[id]), 0);
    assert_eq!(syscall(&mut kernel, b, Syscall::MemorySharedDetach, &[id]), 0);
}

#[test]
fn test_message_has_by_name_syscall() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let _b = spawn(&mut kernel, "beta");
    let name = user_buffer(&mut kernel, a, PAGE_SIZE);
    poke(&mut kernel, a.process, name, b"beta\0");
    assert_eq!(
        syscall(&mut kernel, a, Syscall::MessageHasByName, &[name.as_u32()]),
        0
    );
    poke(&mut kernel, a.process, name, b"alpha\0");
    assert_eq!(
        errno_of(syscall(&mut kernel, a, Syscall::MessageHasByName, &[name.as_u32()])),
        error::ESRCH
    );
}

#[test]
fn test_process_exit_sweeps_resources() {
    let mut kernel = boot();
    let a = spawn(&mut kernel, "alpha");
    let b = spawn(&mut kernel, "beta");
    assert_eq!(syscall(&mut kernel, b, Syscall::MessageCreate, &[]), 0);

    // b exits; the exit requests a reschedule which sweeps it away once
    // the scheduler has moved on
    syscall(&mut kernel, b, Syscall::ProcessExit, &[0]);
    assert!(kernel.tasks.process(b.process).is_none());
    assert!(kernel.tasks.process(a.process).is_some());
}
