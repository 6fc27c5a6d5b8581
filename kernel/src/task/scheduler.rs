//! Priority scheduler
//!
//! Selection walks populated priorities descending; inside one level a
//! round-robin cursor picks the next runnable thread whose process is not
//! being killed. Called from the return path of every trap with the saved
//! register frame of the interrupted thread; switching means copying the
//! chosen thread's frame over it.
//!
//! Cleanup of killed threads and processes rides on the same events: each
//! schedule sweep destroys entries whose owning processes have no live
//! threads left.

use alloc::vec::Vec;

use super::{ProcessState, TaskManager, ThreadRef, ThreadState};
use crate::{
    arch::RegisterContext,
    ipc::rpc::{self, RpcRegistry},
    mm::{shared::SharedMemory, VirtualMemory},
};

/// What a scheduling decision did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A different thread was installed into the frame.
    Switched(ThreadRef),
    /// The interrupted thread keeps running.
    Kept(ThreadRef),
    /// Nothing runnable; the trap handler idles with interrupts enabled.
    Idle,
    /// The trap interrupted kernel mode; no switching there.
    KernelInterrupted,
}

fn runnable(state: ThreadState) -> bool {
    // rpc-queued carries a prepared handler frame, rpc-active is mid
    // handler; both may take the CPU. rpc-waiting is blocked.
    state.runnable() || state == ThreadState::RpcActive
}

fn pick(tasks: &mut TaskManager) -> Option<ThreadRef> {
    let priorities: Vec<usize> = tasks.queues.iter().map(|(priority, _)| *priority).collect();
    for priority in priorities.iter().rev() {
        let (snapshot, last) = match tasks.queues.find(priority) {
            Some(queue) => (
                queue.threads.iter().copied().collect::<Vec<ThreadRef>>(),
                queue.last_handled,
            ),
            None => continue,
        };
        if snapshot.is_empty() {
            continue;
        }
        let start = last
            .and_then(|cursor| snapshot.iter().position(|r| *r == cursor))
            .map(|index| (index + 1) % snapshot.len())
            .unwrap_or(0);
        for offset in 0..snapshot.len() {
            let candidate = snapshot[(start + offset) % snapshot.len()];
            let Some(thread) = tasks.thread(candidate) else {
                continue;
            };
            if !runnable(thread.state) {
                continue;
            }
            match tasks.process(candidate.process) {
                Some(process) if process.state != ProcessState::Kill => {}
                _ => continue,
            }
            if let Some(queue) = tasks.queues.find_mut(priority) {
                queue.last_handled = Some(candidate);
            }
            return Some(candidate);
        }
    }
    None
}

/// Next runnable thread; a fruitless full descent clears all round-robin
/// cursors and retries once.
fn next_thread(tasks: &mut TaskManager) -> Option<ThreadRef> {
    if let Some(found) = pick(tasks) {
        return Some(found);
    }
    tasks.queue_reset();
    pick(tasks)
}

fn install(tasks: &mut TaskManager, next: ThreadRef, frame: &mut RegisterContext) -> Option<usize> {
    let (priority, context, in_rpc) = {
        let thread = tasks.thread_mut(next)?;
        let in_rpc = thread.state.in_rpc();
        thread.state = if in_rpc {
            ThreadState::RpcActive
        } else {
            ThreadState::Active
        };
        (thread.priority, thread.context, in_rpc)
    };
    *frame = context;
    if let Some(process) = tasks.process_mut(next.process) {
        process.state = if in_rpc {
            ProcessState::RpcActive
        } else {
            ProcessState::Active
        };
    }
    Some(priority)
}

/// Scheduling entry, called from the trap return path.
pub fn schedule(
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
    rpc: &mut RpcRegistry,
    shared: &mut SharedMemory,
    frame: &mut RegisterContext,
) -> ScheduleOutcome {
    if !frame.from_user_mode() {
        return ScheduleOutcome::KernelInterrupted;
    }

    let previous = tasks.current();
    if let Some(prev) = previous {
        if let Some(thread) = tasks.thread_mut(prev) {
            thread.context = *frame;
            if thread.state == ThreadState::Active {
                thread.state = ThreadState::HaltSwitch;
            }
        }
        if let Some(process) = tasks.process_mut(prev.process) {
            if process.state == ProcessState::Active {
                process.state = ProcessState::HaltSwitch;
            }
        }
    }

    let Some(next) = next_thread(tasks) else {
        sweep(tasks, vm, rpc, shared);
        return ScheduleOutcome::Idle;
    };

    // switch the address space only when it actually changes
    if let Some(context) = tasks.process(next.process).and_then(|p| p.virtual_context) {
        if vm.active_user() != Some(context) {
            vm.set_context(context);
            vm.flush_complete();
        }
    }

    let Some(priority) = install(tasks, next, frame) else {
        sweep(tasks, vm, rpc, shared);
        return ScheduleOutcome::Idle;
    };

    if let Some(prev) = previous {
        if prev != next {
            if let Some(thread) = tasks.thread_mut(prev) {
                if thread.state == ThreadState::HaltSwitch {
                    thread.state = ThreadState::Ready;
                }
            }
            if let Some(process) = tasks.process_mut(prev.process) {
                if process.state == ProcessState::HaltSwitch {
                    process.state = ProcessState::Ready;
                }
            }
        }
    }

    tasks.set_current(next, priority);
    sweep(tasks, vm, rpc, shared);

    if previous == Some(next) {
        ScheduleOutcome::Kept(next)
    } else {
        ScheduleOutcome::Switched(next)
    }
}

/// Bootstrap execution from the first ready thread, with no prior context
/// to save.
pub fn start(
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
    frame: &mut RegisterContext,
) -> ScheduleOutcome {
    let Some(next) = next_thread(tasks) else {
        return ScheduleOutcome::Idle;
    };
    if let Some(context) = tasks.process(next.process).and_then(|p| p.virtual_context) {
        vm.set_context(context);
        vm.flush_complete();
    }
    let Some(priority) = install(tasks, next, frame) else {
        return ScheduleOutcome::Idle;
    };
    tasks.set_current(next, priority);
    ScheduleOutcome::Switched(next)
}

/// Destroy killed threads, then killed processes whose threads are all
/// gone. A process whose context is still installed stays on the list
/// until the scheduler has moved away from it.
pub fn sweep(
    tasks: &mut TaskManager,
    vm: &mut VirtualMemory,
    rpc: &mut RpcRegistry,
    shared: &mut SharedMemory,
) {
    for reference in tasks.take_thread_cleanup() {
        let exiting = tasks
            .thread(reference)
            .map(|thread| thread.state.exiting())
            .unwrap_or(false);
        if exiting {
            tasks.destroy_thread(vm, reference);
        }
    }

    for pid in tasks.cleanup_candidates() {
        let removable = match tasks.process(pid) {
            None => {
                tasks.drop_cleanup_candidate(pid);
                continue;
            }
            Some(process) => process.all_threads_exiting(),
        };
        if !removable {
            log::debug!("cleanup: process {} still has live threads", pid);
            continue;
        }
        let context = tasks.process(pid).and_then(|p| p.virtual_context);
        if let Some(context) = context {
            if vm.active_user() == Some(context) {
                continue;
            }
        }

        rpc::remove_process(rpc, pid);
        if let Some(context) = context {
            shared.cleanup_process(vm, pid, context);
        }
        let references: Vec<ThreadRef> = tasks
            .process(pid)
            .map(|process| {
                process
                    .threads
                    .iter()
                    .map(|(tid, _)| ThreadRef { process: pid, thread: *tid })
                    .collect()
            })
            .unwrap_or_default();
        for reference in references {
            tasks.destroy_thread(vm, reference);
        }
        // dropping the record frees the message queue and its payloads
        let _ = tasks.remove_process_record(pid);
        if let Some(context) = context {
            if let Err(err) = vm.destroy_context(context, false) {
                log::warn!("cleanup: destroying context of {} failed: {}", pid, err);
            }
        }
        tasks.drop_cleanup_candidate(pid);
        log::debug!("cleanup: removed process {}", pid);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{mm::phys::SparseBacking, task::ProcessId};
    use alloc::boxed::Box;

    struct Rig {
        tasks: TaskManager,
        vm: VirtualMemory,
        rpc: RpcRegistry,
        shared: SharedMemory,
    }

    impl Rig {
        fn new() -> Self {
            let (vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
            Self {
                tasks: TaskManager::new(),
                vm,
                rpc: RpcRegistry::new(),
                shared: SharedMemory::new(),
            }
        }

        fn spawn(&mut self, name: &str, priority: usize) -> ThreadRef {
            let pid = self
                .tasks
                .create_process(&mut self.vm, priority, ProcessId(0), name)
                .unwrap();
            let tid = self
                .tasks
                .create_thread(&mut self.vm, pid, crate::mm::VirtualAddress::new(0x1_0000), priority)
                .unwrap();
            ThreadRef { process: pid, thread: tid }
        }

        fn schedule(&mut self, frame: &mut RegisterContext) -> ScheduleOutcome {
            schedule(
                &mut self.tasks,
                &mut self.vm,
                &mut self.rpc,
                &mut self.shared,
                frame,
            )
        }
    }

    fn user_frame() -> RegisterContext {
        RegisterContext::new_user(0x1_0000, 0x7FFF_FFFC)
    }

    #[test]
    fn test_kernel_interruption_is_ignored() {
        let mut rig = Rig::new();
        rig.spawn("a", 4);
        let mut frame = RegisterContext::default();
        frame.spsr = crate::arch::armv7::context::CPSR_MODE_SUPERVISOR;
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::KernelInterrupted);
    }

    #[test]
    fn test_round_robin_within_priority() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        let b = rig.spawn("b", 4);
        let c = rig.spawn("c", 4);
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(a));
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(b));
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(c));
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(a));
    }

    #[test]
    fn test_priority_preemption() {
        let mut rig = Rig::new();
        let low = rig.spawn("low", 2);
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(low));
        let high = rig.spawn("high", 9);
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(high));
        // low runs again only when high stops being runnable
        rig.tasks
            .block_thread(high, ThreadState::WaitingForMessage, 1);
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(low));
    }

    #[test]
    fn test_schedule_restores_frame_of_next_thread() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        let b = rig.spawn("b", 4);
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(a));
        frame.r[3] = 0x1234;
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(b));
        // a's saved frame kept the mutation
        assert_eq!(rig.tasks.thread(a).unwrap().context.r[3], 0x1234);
        assert_eq!(frame.r[3], 0);
    }

    #[test]
    fn test_idle_without_runnable_threads() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        rig.tasks.block_thread(a, ThreadState::WaitingForMessage, 7);
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Idle);
    }

    #[test]
    fn test_killed_process_is_skipped_and_swept() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        let b = rig.spawn("b", 4);
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(a));
        rig.tasks.prepare_kill(b.process);
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Kept(a));
        // swept once the scheduler ran
        assert!(rig.tasks.process(b.process).is_none());
        assert!(rig.tasks.thread(b).is_none());
    }

    #[test]
    fn test_start_bootstraps_first_thread() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        let mut frame = RegisterContext::default();
        assert_eq!(
            start(&mut rig.tasks, &mut rig.vm, &mut frame),
            ScheduleOutcome::Switched(a)
        );
        assert_eq!(frame.pc, 0x1_0000);
        assert_eq!(rig.tasks.current(), Some(a));
        assert_eq!(
            rig.tasks.thread(a).unwrap().state,
            ThreadState::Active
        );
    }

    #[test]
    fn test_rpc_queued_thread_promotes_to_rpc_active() {
        let mut rig = Rig::new();
        let a = rig.spawn("a", 4);
        if let Some(thread) = rig.tasks.thread_mut(a) {
            thread.state = ThreadState::RpcQueued;
        }
        let mut frame = user_frame();
        assert_eq!(rig.schedule(&mut frame), ScheduleOutcome::Switched(a));
        assert_eq!(rig.tasks.thread(a).unwrap().state, ThreadState::RpcActive);
        assert_eq!(
            rig.tasks.process(a.process).unwrap().state,
            ProcessState::RpcActive
        );
    }
}
