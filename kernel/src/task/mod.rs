//! Process and thread management
//!
//! All process and thread records are owned by the [`TaskManager`]; every
//! cross-reference is a monotonic id resolved through it. Ids are never
//! reused for the life of the kernel, so a stale reference simply fails to
//! resolve instead of aliasing a newer object.

pub mod process;
pub mod queue;
pub mod scheduler;
pub mod stack;
pub mod thread;

pub use process::{Process, TaskError, TaskManager};
pub use queue::PriorityQueue;
pub use thread::Thread;

use core::fmt;

/// Process identifier, monotonic and never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, monotonic across all processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified thread reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    pub process: ProcessId,
    pub thread: ThreadId,
}

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Init,
    Ready,
    Active,
    HaltSwitch,
    RpcQueued,
    RpcActive,
    Kill,
    Dead,
}

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Active,
    HaltSwitch,
    RpcQueued,
    RpcActive,
    RpcWaiting,
    WaitingForMessage,
    Kill,
}

impl ThreadState {
    /// Whether the scheduler may hand the CPU to a thread in this state.
    /// An rpc-queued thread already carries a prepared handler frame.
    pub fn runnable(self) -> bool {
        matches!(self, Self::Ready | Self::HaltSwitch | Self::RpcQueued)
    }

    /// Whether the thread is on its way out.
    pub fn exiting(self) -> bool {
        matches!(self, Self::Kill)
    }

    /// Whether the thread sits in any RPC state.
    pub fn in_rpc(self) -> bool {
        matches!(self, Self::RpcQueued | Self::RpcActive | Self::RpcWaiting)
    }
}
