//! Thread records and their lifecycle
//!
//! A thread is a scheduling unit inside a process: saved register frame,
//! stack placement and state. Stacks are zeroed through a temporary
//! mapping before they are mapped into the owning context.

use super::{process::TaskError, ProcessId, TaskManager, ThreadId, ThreadRef, ThreadState};
use crate::{
    arch::RegisterContext,
    config::STACK_SIZE,
    mm::{MemoryType, PageFlags, PhysicalAddress, VirtualAddress, VirtualMemory},
};

/// One thread.
pub struct Thread {
    pub id: ThreadId,
    pub process: ProcessId,
    pub priority: usize,
    pub state: ThreadState,
    /// Payload interpreted per state, e.g. the awaited request id while in
    /// `WaitingForMessage`.
    pub state_data: Option<u64>,
    pub context: RegisterContext,
    pub entry: VirtualAddress,
    pub stack_virtual: VirtualAddress,
    pub stack_physical: PhysicalAddress,
}

impl TaskManager {
    /// Create a thread of `pid` entering at `entry`. The stack is a fresh
    /// aligned physical range, zeroed through the temporary window and
    /// mapped into the process context; SP starts one word below the top.
    pub fn create_thread(
        &mut self,
        vm: &mut VirtualMemory,
        pid: ProcessId,
        entry: VirtualAddress,
        priority: usize,
    ) -> Result<ThreadId, TaskError> {
        let (context, stack_virtual) = {
            let process = self.process(pid).ok_or(TaskError::NoSuchProcess)?;
            (
                process.virtual_context.ok_or(TaskError::NoSuchProcess)?,
                process.stacks.next_free().ok_or(TaskError::NoStackSpace)?,
            )
        };
        let stack_physical = vm
            .allocate_frames_aligned(STACK_SIZE, STACK_SIZE)
            .ok_or(TaskError::OutOfMemory)?;

        let window = match vm.map_temporary(stack_physical, STACK_SIZE) {
            Ok(window) => window,
            Err(err) => {
                vm.release_frames(stack_physical, STACK_SIZE);
                return Err(err.into());
            }
        };
        let zeroed = vm.window_fill(window, STACK_SIZE, 0);
        vm.unmap_temporary(window, STACK_SIZE);
        if let Err(err) = zeroed {
            vm.release_frames(stack_physical, STACK_SIZE);
            return Err(err.into());
        }

        if let Err(err) = vm.map_range(
            context,
            stack_virtual,
            stack_physical,
            STACK_SIZE,
            MemoryType::Normal,
            PageFlags::READ | PageFlags::WRITE,
        ) {
            vm.release_frames(stack_physical, STACK_SIZE);
            return Err(err.into());
        }

        let tid = self.generate_thread_id();
        let frame = RegisterContext::new_user(
            entry.as_u32(),
            stack_virtual.as_u32() + STACK_SIZE as u32 - core::mem::size_of::<u32>() as u32,
        );
        let thread = Thread {
            id: tid,
            process: pid,
            priority,
            state: ThreadState::Ready,
            state_data: None,
            context: frame,
            entry,
            stack_virtual,
            stack_physical,
        };

        {
            let process = match self.process_mut(pid) {
                Some(process) => process,
                None => {
                    let _ = vm.unmap_range(context, stack_virtual, STACK_SIZE, true);
                    return Err(TaskError::NoSuchProcess);
                }
            };
            process.stacks.add(stack_virtual);
            process.threads.insert(tid, thread);
            if process.state == super::ProcessState::Init {
                process.state = super::ProcessState::Ready;
            }
        }
        self.enqueue_thread(priority, ThreadRef { process: pid, thread: tid });
        log::debug!("created thread {} in process {}", tid, pid);
        Ok(tid)
    }

    /// Park a thread in a waiting state with its state payload.
    pub fn block_thread(&mut self, reference: ThreadRef, state: ThreadState, data: u64) {
        if let Some(thread) = self.thread_mut(reference) {
            thread.state = state;
            thread.state_data = Some(data);
        }
    }

    /// Make a parked thread runnable again.
    pub fn unblock_thread(&mut self, reference: ThreadRef) {
        if let Some(thread) = self.thread_mut(reference) {
            thread.state = ThreadState::Ready;
            thread.state_data = None;
        }
    }

    /// Release one thread's kernel-side resources: stack mapping and
    /// frames, queue membership, stack-range entry, record.
    pub(crate) fn destroy_thread(&mut self, vm: &mut VirtualMemory, reference: ThreadRef) {
        let Some(process) = self.process_mut(reference.process) else {
            return;
        };
        let Some(thread) = process.threads.remove(&reference.thread) else {
            return;
        };
        process.stacks.remove(thread.stack_virtual);
        let context = process.virtual_context;
        if let Some(context) = context {
            let _ = vm.unmap_range(context, thread.stack_virtual, STACK_SIZE, true);
        }
        self.dequeue_thread(thread.priority, reference);
        if self.current() == Some(reference) {
            self.set_current_ref(None);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SparseBacking;
    use alloc::boxed::Box;

    fn setup() -> (TaskManager, VirtualMemory, ProcessId) {
        let (mut vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
        let mut tasks = TaskManager::new();
        let pid = tasks.create_process(&mut vm, 7, ProcessId(0), "worker").unwrap();
        (tasks, vm, pid)
    }

    #[test]
    fn test_create_thread_maps_stack() {
        let (mut tasks, mut vm, pid) = setup();
        let tid = tasks
            .create_thread(&mut vm, pid, VirtualAddress::new(0x1_0000), 7)
            .unwrap();
        let reference = ThreadRef { process: pid, thread: tid };
        let thread = tasks.thread(reference).unwrap();
        assert_eq!(thread.state, ThreadState::Ready);
        assert_eq!(thread.context.pc, 0x1_0000);
        assert_eq!(
            thread.context.sp,
            thread.stack_virtual.as_u32() + STACK_SIZE as u32 - 4
        );
        let context = tasks.process(pid).unwrap().virtual_context.unwrap();
        let stack_virtual = thread.stack_virtual;
        assert!(vm.is_range_mapped_in_context(context, stack_virtual, STACK_SIZE));
    }

    #[test]
    fn test_thumb_entry_selects_thumb_state() {
        let (mut tasks, mut vm, pid) = setup();
        let tid = tasks
            .create_thread(&mut vm, pid, VirtualAddress::new(0x1_0001), 7)
            .unwrap();
        let thread = tasks.thread(ThreadRef { process: pid, thread: tid }).unwrap();
        assert!(thread.context.thumb());
        assert_eq!(thread.context.pc, 0x1_0000);
    }

    #[test]
    fn test_block_and_unblock() {
        let (mut tasks, mut vm, pid) = setup();
        let tid = tasks
            .create_thread(&mut vm, pid, VirtualAddress::new(0x1_0000), 7)
            .unwrap();
        let reference = ThreadRef { process: pid, thread: tid };
        tasks.block_thread(reference, ThreadState::WaitingForMessage, 42);
        let thread = tasks.thread(reference).unwrap();
        assert_eq!(thread.state, ThreadState::WaitingForMessage);
        assert_eq!(thread.state_data, Some(42));
        assert!(!thread.state.runnable());
        tasks.unblock_thread(reference);
        assert_eq!(tasks.thread(reference).unwrap().state, ThreadState::Ready);
    }

    #[test]
    fn test_destroy_thread_releases_stack() {
        let (mut tasks, mut vm, pid) = setup();
        let tid = tasks
            .create_thread(&mut vm, pid, VirtualAddress::new(0x1_0000), 7)
            .unwrap();
        let reference = ThreadRef { process: pid, thread: tid };
        let (context, stack_virtual) = {
            let thread = tasks.thread(reference).unwrap();
            (
                tasks.process(pid).unwrap().virtual_context.unwrap(),
                thread.stack_virtual,
            )
        };
        tasks.destroy_thread(&mut vm, reference);
        assert!(tasks.thread(reference).is_none());
        assert!(!vm.is_mapped_in_context(context, stack_virtual));
        assert!(!tasks.process(pid).unwrap().stacks.contains(stack_virtual));
    }
}
