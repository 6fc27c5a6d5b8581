//! Keyed and sequential containers used across the kernel
//!
//! Both containers predate the heap-rich parts of the kernel and are kept
//! dependency-free: an AVL map for everything looked up by id, name or
//! priority, and a doubly-linked list for FIFO queues and handler chains.

pub mod avl;
pub mod list;

pub use avl::AvlTree;
pub use list::List;
