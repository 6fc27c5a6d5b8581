//! Per-process stack-range allocator
//!
//! Thread stacks live in a fixed region below the user/kernel split and are
//! handed out top-down in `STACK_SIZE` strides. The allocator only tracks
//! which bases are taken; mapping is the thread code's business.

use crate::{
    collection::AvlTree,
    config::{STACK_SIZE, THREAD_STACK_AREA_END, THREAD_STACK_AREA_START},
    mm::VirtualAddress,
};

/// Tracks the stack bases a process has in use.
pub struct StackAllocator {
    used: AvlTree<u32, ()>,
}

impl StackAllocator {
    pub const fn new() -> Self {
        Self {
            used: AvlTree::new(),
        }
    }

    /// Highest unused stack base, top-down.
    pub fn next_free(&self) -> Option<VirtualAddress> {
        let mut base = THREAD_STACK_AREA_END - STACK_SIZE as u32;
        while base >= THREAD_STACK_AREA_START {
            if !self.used.contains(&base) {
                return Some(VirtualAddress::new(base));
            }
            base -= STACK_SIZE as u32;
        }
        None
    }

    pub fn add(&mut self, base: VirtualAddress) {
        self.used.insert(base.as_u32(), ());
    }

    pub fn remove(&mut self, base: VirtualAddress) {
        self.used.remove(&base.as_u32());
    }

    pub fn contains(&self, base: VirtualAddress) -> bool {
        self.used.contains(&base.as_u32())
    }
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_top_down_allocation() {
        let mut stacks = StackAllocator::new();
        let first = stacks.next_free().unwrap();
        assert_eq!(first.as_u32(), THREAD_STACK_AREA_END - STACK_SIZE as u32);
        stacks.add(first);
        let second = stacks.next_free().unwrap();
        assert_eq!(second.as_u32(), first.as_u32() - STACK_SIZE as u32);
    }

    #[test]
    fn test_released_base_is_reused() {
        let mut stacks = StackAllocator::new();
        let first = stacks.next_free().unwrap();
        stacks.add(first);
        let second = stacks.next_free().unwrap();
        stacks.add(second);
        stacks.remove(first);
        assert_eq!(stacks.next_free(), Some(first));
    }
}
