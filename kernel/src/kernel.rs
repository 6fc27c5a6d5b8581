//! The kernel value
//!
//! All process-wide state lives in one [`Kernel`]: the virtual-memory
//! manager, the task manager, the RPC registry and the shared-memory
//! areas. It is constructed once during bringup and threaded through every
//! operation; the trap stubs reach it through a single installed instance.
//!
//! Trap protocol: on entry the live registers of the interrupted user
//! thread are saved into that thread's record, handlers mutate saved
//! frames only, and on exit the (possibly different) current thread's
//! frame is copied back out.

use alloc::boxed::Box;

use spin::Mutex;

use crate::{
    arch::RegisterContext,
    ipc::rpc::{self, RpcRegistry},
    mm::{phys::FrameBacking, shared::SharedMemory, VirtContext, VirtError, VirtualMemory},
    syscall,
    task::{
        scheduler::{self, ScheduleOutcome},
        TaskManager,
    },
};

/// Everything the kernel owns.
pub struct Kernel {
    pub vm: VirtualMemory,
    pub tasks: TaskManager,
    pub rpc: RpcRegistry,
    pub shared: SharedMemory,
    pub kernel_context: VirtContext,
}

impl Kernel {
    /// Bring the substrate up on a physical-frame allocator.
    pub fn new(backing: Box<dyn FrameBacking + Send>) -> Result<Self, VirtError> {
        let (vm, kernel_context) = VirtualMemory::new(backing)?;
        Ok(Self {
            vm,
            tasks: TaskManager::new(),
            rpc: RpcRegistry::new(),
            shared: SharedMemory::new(),
            kernel_context,
        })
    }

    /// Syscall trap. `number` is decoded from the `svc` immediate by the
    /// exception stub; the saved frame is consumed and, after dispatch and
    /// a possible reschedule, refilled from whichever thread runs next.
    pub fn handle_syscall(
        &mut self,
        number: usize,
        frame: &mut RegisterContext,
    ) -> Option<ScheduleOutcome> {
        if !frame.from_user_mode() {
            log::warn!("syscall trap from kernel mode ignored");
            return None;
        }
        self.save_frame(frame);
        syscall::dispatch(self, number);
        let outcome = self.run_pending_schedule(frame);
        self.sync_frame(frame);
        outcome
    }

    /// Timer tick: plain preemption point.
    pub fn handle_timer(&mut self, frame: &mut RegisterContext) -> ScheduleOutcome {
        if !frame.from_user_mode() {
            return ScheduleOutcome::KernelInterrupted;
        }
        self.save_frame(frame);
        let _ = self.tasks.take_reschedule_request();
        let Kernel {
            vm,
            tasks,
            rpc,
            shared,
            ..
        } = self;
        scheduler::schedule(tasks, vm, rpc, shared, frame)
    }

    /// Undefined-instruction trap: the return path of an RPC handler. A
    /// miss means a genuinely broken instruction stream and kills the
    /// faulting process.
    pub fn handle_undefined_instruction(&mut self, frame: &mut RegisterContext) -> bool {
        if !frame.from_user_mode() {
            return false;
        }
        self.save_frame(frame);
        let Some(current) = self.tasks.current() else {
            return false;
        };
        let restore = {
            let Kernel {
                vm,
                tasks,
                rpc: registry,
                ..
            } = self;
            rpc::restore_thread(registry, tasks, vm, current)
        };
        match restore {
            Ok(()) => {
                self.sync_frame(frame);
                true
            }
            Err(err) => {
                log::warn!(
                    "undefined instruction in process {} not an rpc return ({:?})",
                    current.process,
                    err
                );
                self.tasks.prepare_kill(current.process);
                self.run_pending_schedule(frame);
                self.sync_frame(frame);
                true
            }
        }
    }

    /// One-shot bootstrap into the first ready thread.
    pub fn start(&mut self, frame: &mut RegisterContext) -> ScheduleOutcome {
        let Kernel { vm, tasks, .. } = self;
        scheduler::start(tasks, vm, frame)
    }

    fn run_pending_schedule(&mut self, frame: &mut RegisterContext) -> Option<ScheduleOutcome> {
        if !self.tasks.take_reschedule_request() {
            return None;
        }
        let Kernel {
            vm,
            tasks,
            rpc,
            shared,
            ..
        } = self;
        Some(scheduler::schedule(tasks, vm, rpc, shared, frame))
    }

    fn save_frame(&mut self, frame: &RegisterContext) {
        if let Some(current) = self.tasks.current() {
            if let Some(thread) = self.tasks.thread_mut(current) {
                thread.context = *frame;
            }
        }
    }

    fn sync_frame(&mut self, frame: &mut RegisterContext) {
        if let Some(current) = self.tasks.current() {
            if let Some(thread) = self.tasks.thread(current) {
                *frame = thread.context;
            }
        }
    }
}

lazy_static::lazy_static! {
    /// Installation point the exception stubs reach the kernel through.
    static ref KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);
}

/// Install the kernel instance after bringup.
pub fn install(kernel: Kernel) {
    *KERNEL.lock() = Some(kernel);
}

/// Run `f` against the installed kernel.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> Option<R> {
    let mut guard = KERNEL.lock();
    guard.as_mut().map(f)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::phys::SparseBacking;

    #[test]
    fn test_bringup_creates_kernel_context() {
        let kernel = Kernel::new(Box::new(SparseBacking::new())).unwrap();
        assert_eq!(kernel.vm.active_kernel(), Some(kernel.kernel_context));
        assert_eq!(
            kernel.kernel_context.kind,
            crate::mm::ContextKind::Kernel
        );
    }

    #[test]
    fn test_kernel_mode_traps_are_ignored() {
        let mut kernel = Kernel::new(Box::new(SparseBacking::new())).unwrap();
        let mut frame = RegisterContext::default();
        frame.spsr = crate::arch::armv7::context::CPSR_MODE_SUPERVISOR;
        assert_eq!(kernel.handle_syscall(1, &mut frame), None);
        assert_eq!(
            kernel.handle_timer(&mut frame),
            ScheduleOutcome::KernelInterrupted
        );
        assert!(!kernel.handle_undefined_instruction(&mut frame));
    }

    #[test]
    fn test_install_and_reach() {
        let kernel = Kernel::new(Box::new(SparseBacking::new())).unwrap();
        install(kernel);
        let reached = with_kernel(|kernel| kernel.tasks.current().is_none());
        assert_eq!(reached, Some(true));
    }
}
