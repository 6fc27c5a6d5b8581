//! Process records and the task manager
//!
//! The manager owns every process (and through it every thread), the
//! priority queues, the name registry and the cleanup lists swept on
//! schedule events.

use alloc::{string::String, vec::Vec};

use super::{
    queue::PriorityQueue, stack::StackAllocator, thread::Thread, ProcessId, ProcessState,
    ThreadId, ThreadRef, ThreadState,
};
use crate::{
    collection::{AvlTree, List},
    error,
    ipc::message::Message,
    mm::{ContextKind, VirtContext, VirtError, VirtualMemory},
};

/// Failure kinds of the task layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    NoSuchProcess,
    NoSuchThread,
    OutOfMemory,
    NoStackSpace,
    Virt(VirtError),
}

impl From<VirtError> for TaskError {
    fn from(err: VirtError) -> Self {
        match err {
            VirtError::OutOfMemory => Self::OutOfMemory,
            other => Self::Virt(other),
        }
    }
}

impl TaskError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchProcess | Self::NoSuchThread => error::ESRCH,
            Self::OutOfMemory | Self::NoStackSpace => error::ENOMEM,
            Self::Virt(err) => err.errno(),
        }
    }
}

/// One process: resource owner for a virtual context, threads, stacks and
/// a message queue.
pub struct Process {
    pub id: ProcessId,
    pub parent: ProcessId,
    pub name: String,
    pub priority: usize,
    pub state: ProcessState,
    pub virtual_context: Option<VirtContext>,
    pub threads: AvlTree<ThreadId, Thread>,
    pub stacks: StackAllocator,
    pub message_queue: Option<List<Message>>,
    pub forked_from: Option<ProcessId>,
    pub rpc_ready: bool,
}

impl Process {
    /// Whether every thread has reached the kill state, making the record
    /// removable.
    pub fn all_threads_exiting(&self) -> bool {
        self.threads.iter().all(|(_, thread)| thread.state.exiting())
    }

    /// First thread that is not on its way out. This is the selection the
    /// RPC engine uses by default.
    pub fn first_live_thread(&self) -> Option<ThreadId> {
        self.threads
            .iter()
            .find(|(_, thread)| !thread.state.exiting())
            .map(|(id, _)| *id)
    }
}

/// Owner of all task state.
pub struct TaskManager {
    processes: AvlTree<ProcessId, Process>,
    names: AvlTree<String, List<ProcessId>>,
    pub(crate) queues: AvlTree<usize, PriorityQueue>,
    process_cleanup: List<ProcessId>,
    thread_cleanup: List<ThreadRef>,
    current: Option<ThreadRef>,
    next_process: u32,
    next_thread: u32,
    next_message: u64,
    reschedule_pending: bool,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            processes: AvlTree::new(),
            names: AvlTree::new(),
            queues: AvlTree::new(),
            process_cleanup: List::new(),
            thread_cleanup: List::new(),
            current: None,
            next_process: 0,
            next_thread: 0,
            next_message: 0,
            reschedule_pending: false,
        }
    }

    // ---- ids ---------------------------------------------------------

    pub(crate) fn generate_process_id(&mut self) -> ProcessId {
        self.next_process += 1;
        ProcessId(self.next_process)
    }

    pub(crate) fn generate_thread_id(&mut self) -> ThreadId {
        self.next_thread += 1;
        ThreadId(self.next_thread)
    }

    /// Fresh monotonic message id; never zero.
    pub(crate) fn generate_message_id(&mut self) -> u64 {
        self.next_message += 1;
        self.next_message
    }

    // ---- lookup ------------------------------------------------------

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.find(&pid)
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.find_mut(&pid)
    }

    pub fn thread(&self, reference: ThreadRef) -> Option<&Thread> {
        self.process(reference.process)?
            .threads
            .find(&reference.thread)
    }

    pub fn thread_mut(&mut self, reference: ThreadRef) -> Option<&mut Thread> {
        self.process_mut(reference.process)?
            .threads
            .find_mut(&reference.thread)
    }

    pub fn current(&self) -> Option<ThreadRef> {
        self.current
    }

    pub(crate) fn set_current_ref(&mut self, reference: Option<ThreadRef>) {
        self.current = reference;
    }

    /// Pids registered under a name, oldest first.
    pub fn processes_by_name(&self, name: &str) -> Vec<ProcessId> {
        self.names
            .find(name)
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|(pid, _)| *pid).collect()
    }

    // ---- reschedule requests -----------------------------------------

    pub fn request_reschedule(&mut self) {
        self.reschedule_pending = true;
    }

    pub fn take_reschedule_request(&mut self) -> bool {
        core::mem::replace(&mut self.reschedule_pending, false)
    }

    // ---- lifecycle ---------------------------------------------------

    /// Create a process with its own blank user context. No threads yet;
    /// the state stays `Init` until one is started.
    pub fn create_process(
        &mut self,
        vm: &mut VirtualMemory,
        priority: usize,
        parent: ProcessId,
        name: &str,
    ) -> Result<ProcessId, TaskError> {
        let context = vm.create_context(ContextKind::User)?;
        let pid = self.generate_process_id();
        let process = Process {
            id: pid,
            parent,
            name: String::from(name),
            priority,
            state: ProcessState::Init,
            virtual_context: Some(context),
            threads: AvlTree::new(),
            stacks: StackAllocator::new(),
            message_queue: None,
            forked_from: None,
            rpc_ready: false,
        };
        self.processes.insert(pid, process);
        self.register_name(name, pid);
        log::debug!("created process {} ({})", pid, name);
        Ok(pid)
    }

    /// Fork the calling thread's process: forked context, copied threads
    /// with r0 forced to zero, fresh message queue when the source had one.
    pub fn fork_process(
        &mut self,
        vm: &mut VirtualMemory,
        caller: ThreadRef,
    ) -> Result<ProcessId, TaskError> {
        let (name, priority, context, has_queue) = {
            let process = self
                .process(caller.process)
                .ok_or(TaskError::NoSuchProcess)?;
            (
                process.name.clone(),
                process.priority,
                process.virtual_context.ok_or(TaskError::NoSuchProcess)?,
                process.message_queue.is_some(),
            )
        };
        let threads: Vec<(usize, super::ThreadId, crate::arch::RegisterContext, crate::mm::VirtualAddress)> = self
            .process(caller.process)
            .ok_or(TaskError::NoSuchProcess)?
            .threads
            .iter()
            .map(|(id, thread)| (thread.priority, *id, thread.context, thread.stack_virtual))
            .collect();

        let forked_context = vm.fork_context(context)?;
        let pid = self.generate_process_id();
        let mut process = Process {
            id: pid,
            parent: caller.process,
            name: name.clone(),
            priority,
            state: ProcessState::Ready,
            virtual_context: Some(forked_context),
            threads: AvlTree::new(),
            stacks: StackAllocator::new(),
            message_queue: has_queue.then(List::new),
            forked_from: Some(caller.process),
            rpc_ready: false,
        };

        let mut queue_entries = Vec::new();
        for (thread_priority, _, source_context, stack_virtual) in threads {
            let stack_physical = match vm.get_mapped_address_in_context(forked_context, stack_virtual)
            {
                Some(phys) => phys,
                None => {
                    let _ = vm.destroy_context(forked_context, false);
                    return Err(TaskError::Virt(VirtError::UnmappedTarget));
                }
            };
            let tid = self.generate_thread_id();
            let mut thread_context = source_context;
            // the child observes a zero return from fork
            thread_context.r[0] = 0;
            process.stacks.add(stack_virtual);
            process.threads.insert(
                tid,
                Thread {
                    id: tid,
                    process: pid,
                    priority: thread_priority,
                    state: ThreadState::Ready,
                    state_data: None,
                    context: thread_context,
                    entry: crate::mm::VirtualAddress::new(source_context.pc),
                    stack_virtual,
                    stack_physical,
                },
            );
            queue_entries.push((thread_priority, ThreadRef { process: pid, thread: tid }));
        }

        self.processes.insert(pid, process);
        self.register_name(&name, pid);
        for (thread_priority, reference) in queue_entries {
            self.enqueue_thread(thread_priority, reference);
        }
        log::debug!("forked process {} into {}", caller.process, pid);
        Ok(pid)
    }

    /// Mark a process and all its threads for removal and ask for a
    /// reschedule. Actual destruction happens on the next schedule event.
    pub fn prepare_kill(&mut self, pid: ProcessId) {
        let Some(process) = self.process_mut(pid) else {
            return;
        };
        process.state = ProcessState::Kill;
        let thread_ids: Vec<ThreadId> =
            process.threads.iter().map(|(id, _)| *id).collect();
        for tid in thread_ids {
            if let Some(thread) = process.threads.find_mut(&tid) {
                thread.state = ThreadState::Kill;
            }
        }
        self.process_cleanup.push_back(pid);
        self.request_reschedule();
    }

    /// Mark one thread for removal. Killing the last live thread kills the
    /// whole process.
    pub fn prepare_thread_kill(&mut self, reference: ThreadRef) {
        if let Some(thread) = self.thread_mut(reference) {
            thread.state = ThreadState::Kill;
            self.thread_cleanup.push_back(reference);
        }
        if let Some(process) = self.process(reference.process) {
            if process.all_threads_exiting() && process.state != ProcessState::Kill {
                self.prepare_kill(reference.process);
                return;
            }
        }
        self.request_reschedule();
    }

    pub(crate) fn take_thread_cleanup(&mut self) -> Vec<ThreadRef> {
        let mut drained = Vec::new();
        while let Some(reference) = self.thread_cleanup.pop_front() {
            drained.push(reference);
        }
        drained
    }

    pub(crate) fn cleanup_candidates(&self) -> Vec<ProcessId> {
        self.process_cleanup.iter().copied().collect()
    }

    pub(crate) fn drop_cleanup_candidate(&mut self, pid: ProcessId) {
        let _ = self.process_cleanup.remove_first_match(|p| *p == pid);
    }

    pub(crate) fn remove_process_record(&mut self, pid: ProcessId) -> Option<Process> {
        let process = self.processes.remove(&pid)?;
        self.unregister_name(&process.name, pid);
        Some(process)
    }

    // ---- name registry -----------------------------------------------

    fn register_name(&mut self, name: &str, pid: ProcessId) {
        match self.names.find_mut(name) {
            Some(list) => list.push_back(pid),
            None => {
                let mut list = List::new();
                list.push_back(pid);
                self.names.insert(String::from(name), list);
            }
        }
    }

    fn unregister_name(&mut self, name: &str, pid: ProcessId) {
        let emptied = match self.names.find_mut(name) {
            Some(list) => {
                let _ = list.remove_first_match(|p| *p == pid);
                list.is_empty()
            }
            None => false,
        };
        if emptied {
            self.names.remove(name);
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
