//! Inter-process communication
//!
//! Message queues carry opaque payloads between processes in FIFO order;
//! the RPC engine rides on them to ship call payloads while it redirects a
//! target thread into a registered handler.

pub mod message;
pub mod rpc;

pub use message::{Message, MessageError};
pub use rpc::{RpcError, RpcRegistry};
