//! Per-process message queues
//!
//! Every process may own one FIFO of messages. Payloads are copied eagerly
//! on send and freed when the entry leaves its queue. Responses are matched
//! by request id; a sender waiting for one blocks with the awaited id in
//! its thread state data and is woken by the delivery that matches it.

use alloc::vec::Vec;

use crate::{
    error,
    task::{ProcessId, TaskManager, ThreadRef, ThreadState},
};

/// One queued message.
#[derive(Debug)]
pub struct Message {
    /// Monotonic id, never zero.
    pub id: u64,
    pub sender: ProcessId,
    /// Opaque type tag.
    pub mtype: usize,
    pub data: Vec<u8>,
    /// Id of the request this message answers, zero for none.
    pub request: u64,
}

/// Failure kinds of the message layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Destination process does not exist.
    NoSuchProcess,
    /// Destination or caller has no queue set up.
    NoQueue,
    /// Queue empty, or no entry matched the request id.
    NoMessage,
    /// Receiver buffer smaller than the queued payload.
    TooBig,
    /// Malformed arguments.
    InvalidArgument,
}

impl MessageError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuchProcess => "no such process",
            Self::NoQueue => "no message queue",
            Self::NoMessage => "no message",
            Self::TooBig => "message exceeds buffer",
            Self::InvalidArgument => "invalid argument",
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchProcess => error::ESRCH,
            Self::NoQueue | Self::InvalidArgument => error::EINVAL,
            Self::NoMessage => error::ENOMSG,
            Self::TooBig => error::EMSGSIZE,
        }
    }
}

impl core::fmt::Display for MessageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install an empty queue; repeated setup keeps the existing one.
pub fn setup(tasks: &mut TaskManager, pid: ProcessId) -> Result<(), MessageError> {
    let process = tasks
        .process_mut(pid)
        .ok_or(MessageError::NoSuchProcess)?;
    process
        .message_queue
        .get_or_insert_with(crate::collection::List::new);
    Ok(())
}

/// Drop the queue and every queued message.
pub fn destroy(tasks: &mut TaskManager, pid: ProcessId) {
    if let Some(process) = tasks.process_mut(pid) {
        process.message_queue = None;
    }
}

fn enqueue(tasks: &mut TaskManager, dst: ProcessId, message: Message) -> Result<(), MessageError> {
    let request = message.request;
    let woken = {
        let process = tasks.process_mut(dst).ok_or(MessageError::NoSuchProcess)?;
        let queue = process
            .message_queue
            .as_mut()
            .ok_or(MessageError::NoQueue)?;
        queue.push_back(message);
        // a thread blocked on exactly this request id becomes ready
        let mut woken = None;
        if request != 0 {
            for (tid, thread) in process.threads.iter() {
                if thread.state == ThreadState::WaitingForMessage
                    && thread.state_data == Some(request)
                {
                    woken = Some(*tid);
                    break;
                }
            }
            if let Some(tid) = woken {
                if let Some(thread) = process.threads.find_mut(&tid) {
                    thread.state = ThreadState::Ready;
                    thread.state_data = None;
                }
            }
        }
        woken.is_some()
    };
    if woken {
        tasks.request_reschedule();
    }
    Ok(())
}

/// Send `data` to `dst`. Returns the assigned message id.
pub fn send_by_pid(
    tasks: &mut TaskManager,
    dst: ProcessId,
    src: ProcessId,
    mtype: usize,
    data: &[u8],
    request: u64,
) -> Result<u64, MessageError> {
    {
        let process = tasks.process(dst).ok_or(MessageError::NoSuchProcess)?;
        process
            .message_queue
            .as_ref()
            .ok_or(MessageError::NoQueue)?;
    }
    let id = tasks.generate_message_id();
    enqueue(
        tasks,
        dst,
        Message {
            id,
            sender: src,
            mtype,
            data: data.to_vec(),
            request,
        },
    )?;
    log::trace!("message {} from {} to {}", id, src, dst);
    Ok(id)
}

/// Send to every process registered under `name`. All deliveries share the
/// id assigned on the first successful enqueue, so a fan-out client can
/// match every response against the same key.
pub fn send_by_name(
    tasks: &mut TaskManager,
    name: &str,
    src: ProcessId,
    mtype: usize,
    data: &[u8],
    request: u64,
) -> Result<u64, MessageError> {
    let pids = tasks.processes_by_name(name);
    if pids.is_empty() {
        return Err(MessageError::NoSuchProcess);
    }
    let mut assigned = None;
    for pid in pids {
        let deliverable = tasks
            .process(pid)
            .map(|process| process.message_queue.is_some())
            .unwrap_or(false);
        if !deliverable {
            continue;
        }
        let id = match assigned {
            Some(id) => id,
            None => tasks.generate_message_id(),
        };
        if enqueue(
            tasks,
            pid,
            Message {
                id,
                sender: src,
                mtype,
                data: data.to_vec(),
                request,
            },
        )
        .is_ok()
        {
            assigned = Some(id);
        }
    }
    assigned.ok_or(MessageError::NoQueue)
}

/// Dequeue the head of `pid`'s queue. A too-small buffer fails without
/// dequeuing.
pub fn receive(
    tasks: &mut TaskManager,
    pid: ProcessId,
    buffer_len: usize,
) -> Result<Message, MessageError> {
    let process = tasks.process_mut(pid).ok_or(MessageError::NoSuchProcess)?;
    let queue = process
        .message_queue
        .as_mut()
        .ok_or(MessageError::NoQueue)?;
    let length = queue
        .peek_front()
        .map(|message| message.data.len())
        .ok_or(MessageError::NoMessage)?;
    if length > buffer_len {
        return Err(MessageError::TooBig);
    }
    queue.pop_front().ok_or(MessageError::NoMessage)
}

/// Type tag of the head message without dequeuing it.
pub fn peek_type(tasks: &mut TaskManager, pid: ProcessId) -> Result<usize, MessageError> {
    let process = tasks.process(pid).ok_or(MessageError::NoSuchProcess)?;
    let queue = process
        .message_queue
        .as_ref()
        .ok_or(MessageError::NoQueue)?;
    queue
        .peek_front()
        .map(|message| message.mtype)
        .ok_or(MessageError::NoMessage)
}

/// Take the oldest message answering `request`, wherever it sits in the
/// queue. On a miss the calling thread is parked on the request id and a
/// reschedule is requested; the syscall still returns the no-message error.
pub fn wait_for_response(
    tasks: &mut TaskManager,
    caller: ThreadRef,
    buffer_len: usize,
    request: u64,
) -> Result<Vec<u8>, MessageError> {
    let found_length = {
        let process = tasks
            .process_mut(caller.process)
            .ok_or(MessageError::NoSuchProcess)?;
        let queue = process
            .message_queue
            .as_mut()
            .ok_or(MessageError::NoQueue)?;
        queue
            .lookup(|message| message.request == request)
            .map(|message| message.data.len())
    };
    match found_length {
        None => {
            tasks.block_thread(caller, ThreadState::WaitingForMessage, request);
            tasks.request_reschedule();
            Err(MessageError::NoMessage)
        }
        Some(length) if length > buffer_len => Err(MessageError::TooBig),
        Some(_) => {
            let process = tasks
                .process_mut(caller.process)
                .ok_or(MessageError::NoSuchProcess)?;
            let queue = process
                .message_queue
                .as_mut()
                .ok_or(MessageError::NoQueue)?;
            queue
                .remove_first_match(|message| message.request == request)
                .map(|message| message.data)
                .ok_or(MessageError::NoMessage)
        }
    }
}

/// Drop a queued message by id, e.g. when an undelivered RPC payload is
/// torn down with its backup.
pub fn remove(tasks: &mut TaskManager, pid: ProcessId, message_id: u64) {
    if let Some(process) = tasks.process_mut(pid) {
        if let Some(queue) = process.message_queue.as_mut() {
            let _ = queue.remove_first_match(|message| message.id == message_id);
        }
    }
}

/// Whether some other process carries `name`. The caller itself does not
/// count.
pub fn has_by_name(
    tasks: &TaskManager,
    name: &str,
    caller: ProcessId,
) -> Result<(), MessageError> {
    let pids = tasks.processes_by_name(name);
    if pids.is_empty() || pids.contains(&caller) {
        return Err(MessageError::NoSuchProcess);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{phys::SparseBacking, VirtualMemory};
    use alloc::boxed::Box;

    fn setup_pair() -> (TaskManager, ProcessId, ProcessId) {
        let (mut vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
        let mut tasks = TaskManager::new();
        let a = tasks.create_process(&mut vm, 5, ProcessId(0), "alpha").unwrap();
        let b = tasks.create_process(&mut vm, 5, ProcessId(0), "beta").unwrap();
        setup_queue(&mut tasks, a);
        setup_queue(&mut tasks, b);
        (tasks, a, b)
    }

    fn setup_queue(tasks: &mut TaskManager, pid: ProcessId) {
        setup(tasks, pid).unwrap();
    }

    #[test]
    fn test_fifo_delivery() {
        let (mut tasks, a, b) = setup_pair();
        for payload in [b"one".as_slice(), b"two", b"three"] {
            send_by_pid(&mut tasks, b, a, 7, payload, 0).unwrap();
        }
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"one");
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"two");
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"three");
        assert_eq!(receive(&mut tasks, b, 16).unwrap_err(), MessageError::NoMessage);
    }

    #[test]
    fn test_message_ids_are_monotonic_and_nonzero() {
        let (mut tasks, a, b) = setup_pair();
        let first = send_by_pid(&mut tasks, b, a, 1, b"x", 0).unwrap();
        let second = send_by_pid(&mut tasks, b, a, 1, b"y", 0).unwrap();
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn test_small_buffer_keeps_message_queued() {
        let (mut tasks, a, b) = setup_pair();
        send_by_pid(&mut tasks, b, a, 1, b"payload", 0).unwrap();
        assert_eq!(receive(&mut tasks, b, 3).unwrap_err(), MessageError::TooBig);
        // still queued, a larger buffer succeeds
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"payload");
    }

    #[test]
    fn test_send_without_queue_fails() {
        let (mut tasks, a, b) = setup_pair();
        destroy(&mut tasks, b);
        assert_eq!(
            send_by_pid(&mut tasks, b, a, 1, b"x", 0).unwrap_err(),
            MessageError::NoQueue
        );
    }

    #[test]
    fn test_response_routing_picks_oldest_match() {
        let (mut tasks, a, b) = setup_pair();
        let caller = ThreadRef {
            process: b,
            thread: crate::task::ThreadId(0),
        };
        for (payload, request) in
            [(b"ra".as_slice(), 10u64), (b"rb1", 20), (b"rc", 30), (b"rb2", 20)]
        {
            send_by_pid(&mut tasks, b, a, 1, payload, request).unwrap();
        }
        assert_eq!(wait_for_response(&mut tasks, caller, 16, 20).unwrap(), b"rb1");
        // remaining order: ra, rc, rb2
        assert_eq!(wait_for_response(&mut tasks, caller, 16, 20).unwrap(), b"rb2");
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"ra");
        assert_eq!(receive(&mut tasks, b, 16).unwrap().data, b"rc");
    }

    #[test]
    fn test_matching_response_wakes_waiter() {
        let (mut vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
        let mut tasks = TaskManager::new();
        let a = tasks.create_process(&mut vm, 5, ProcessId(0), "alpha").unwrap();
        let b = tasks.create_process(&mut vm, 5, ProcessId(0), "beta").unwrap();
        setup_queue(&mut tasks, a);
        setup_queue(&mut tasks, b);
        let tid = tasks
            .create_thread(&mut vm, b, crate::mm::VirtualAddress::new(0x1_0000), 5)
            .unwrap();
        let waiter = ThreadRef { process: b, thread: tid };

        // miss blocks the caller on the request id
        assert_eq!(
            wait_for_response(&mut tasks, waiter, 16, 77).unwrap_err(),
            MessageError::NoMessage
        );
        assert_eq!(
            tasks.thread(waiter).unwrap().state,
            ThreadState::WaitingForMessage
        );
        assert!(tasks.take_reschedule_request());

        // the delivery matching the awaited id wakes it up
        send_by_pid(&mut tasks, b, a, 1, b"answer", 77).unwrap();
        assert_eq!(tasks.thread(waiter).unwrap().state, ThreadState::Ready);
        assert!(tasks.take_reschedule_request());
        assert_eq!(wait_for_response(&mut tasks, waiter, 16, 77).unwrap(), b"answer");
    }

    #[test]
    fn test_send_by_name_shares_one_id() {
        let (mut vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
        let mut tasks = TaskManager::new();
        let src = tasks.create_process(&mut vm, 5, ProcessId(0), "client").unwrap();
        let s1 = tasks.create_process(&mut vm, 5, ProcessId(0), "server").unwrap();
        let s2 = tasks.create_process(&mut vm, 5, ProcessId(0), "server").unwrap();
        setup_queue(&mut tasks, s1);
        setup_queue(&mut tasks, s2);
        let id = send_by_name(&mut tasks, "server", src, 2, b"call", 0).unwrap();
        assert_eq!(receive(&mut tasks, s1, 16).unwrap().id, id);
        assert_eq!(receive(&mut tasks, s2, 16).unwrap().id, id);
    }

    #[test]
    fn test_send_by_name_unknown_fails() {
        let (mut tasks, a, _) = setup_pair();
        assert_eq!(
            send_by_name(&mut tasks, "nobody", a, 1, b"x", 0).unwrap_err(),
            MessageError::NoSuchProcess
        );
    }

    #[test]
    fn test_has_by_name_excludes_caller() {
        let (mut vm, _) = VirtualMemory::new(Box::new(SparseBacking::new())).unwrap();
        let mut tasks = TaskManager::new();
        let a = tasks.create_process(&mut vm, 5, ProcessId(0), "disk").unwrap();
        let b = tasks.create_process(&mut vm, 5, ProcessId(0), "console").unwrap();
        assert!(has_by_name(&tasks, "disk", b).is_ok());
        assert!(has_by_name(&tasks, "disk", a).is_err());
        assert!(has_by_name(&tasks, "printer", b).is_err());
    }

    #[test]
    fn test_peek_type() {
        let (mut tasks, a, b) = setup_pair();
        send_by_pid(&mut tasks, b, a, 42, b"x", 0).unwrap();
        assert_eq!(peek_type(&mut tasks, b).unwrap(), 42);
        // peeking does not dequeue
        assert_eq!(peek_type(&mut tasks, b).unwrap(), 42);
    }

    #[test]
    fn test_remove_by_id() {
        let (mut tasks, a, b) = setup_pair();
        let id = send_by_pid(&mut tasks, b, a, 1, b"x", 0).unwrap();
        remove(&mut tasks, b, id);
        assert_eq!(receive(&mut tasks, b, 16).unwrap_err(), MessageError::NoMessage);
    }
}
