//! Inter-process communication
//!
//! Pipes, message queues, shared memory segments and counting semaphores.
//! The tables here know nothing about processes beyond pids: an operation
//! that cannot finish answers [`Step::Block`], the kernel registers a wait
//! token and parks it on the object, and any completions an operation
//! produces are pushed to the caller's wakeup list.

pub mod mqueue;
pub mod pipe;
pub mod sem;
pub mod shm;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result, Uid};
use akern_memory_management::VirtAddr;

pub use self::mqueue::{Message, MessageQueue, QueueStats};
pub use self::pipe::{Pipe, PipeEnd, PipeStats, PipeWrite};
pub use self::sem::{SEM_VALUE_MAX, Semaphore, SemaphoreStats};
pub use self::shm::{SHM_KEY_BASE, SegmentStats, SharedSegment};

use crate::config::KernelConfig;
use crate::wait::{WaitChannel, WaitToken, Wakeup};

// ============================================================================
// Types
// ============================================================================

/// Outcome of an IPC step that may need the caller to wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Done(T),
    Block,
}

/// Key that always creates a fresh System V object
pub const IPC_PRIVATE: i64 = 0;

/// Limits applied to new objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcLimits {
    pub pipe_capacity: usize,
    pub mq_max_messages: usize,
    pub mq_max_message_size: usize,
}

impl From<&KernelConfig> for IpcLimits {
    fn from(config: &KernelConfig) -> Self {
        Self {
            pipe_capacity: config.pipe_capacity,
            mq_max_messages: config.mq_max_messages,
            mq_max_message_size: config.mq_max_message_size,
        }
    }
}

/// Object counts for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcCounts {
    pub pipes: usize,
    pub queues: usize,
    pub segments: usize,
    pub semaphores: usize,
}

/// A segment attachment dropped when its process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedAttachment {
    pub segment: u32,
    pub addr: VirtAddr,
    pub frame_key: u64,
    /// The segment was released with this detach
    pub released: bool,
}

// ============================================================================
// Manager
// ============================================================================

/// Every IPC object in the system
pub struct IpcManager {
    limits: IpcLimits,
    pipes: BTreeMap<u32, Pipe>,
    pipe_names: BTreeMap<String, u32>,
    queues: BTreeMap<u32, MessageQueue>,
    queue_names: BTreeMap<String, u32>,
    segments: BTreeMap<u32, SharedSegment>,
    segment_keys: BTreeMap<i64, u32>,
    semaphores: BTreeMap<u32, Semaphore>,
    semaphore_names: BTreeMap<String, u32>,
    next_id: u32,
}

fn missing(kind: &str, id: u32) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

impl IpcManager {
    pub fn new(limits: IpcLimits) -> Self {
        Self {
            limits,
            pipes: BTreeMap::new(),
            pipe_names: BTreeMap::new(),
            queues: BTreeMap::new(),
            queue_names: BTreeMap::new(),
            segments: BTreeMap::new(),
            segment_keys: BTreeMap::new(),
            semaphores: BTreeMap::new(),
            semaphore_names: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn limits(&self) -> IpcLimits {
        self.limits
    }

    fn alloc_id(&mut self) -> Result<u32> {
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| Error::ResourceExhausted("ipc identifiers".into()))?;
        Ok(id)
    }

    pub fn counts(&self) -> IpcCounts {
        IpcCounts {
            pipes: self.pipes.len(),
            queues: self.queues.len(),
            segments: self.segments.len(),
            semaphores: self.semaphores.len(),
        }
    }

    // ---- pipes ----

    /// Creates an anonymous pipe with one reference on each end
    pub fn create_pipe(&mut self, owner: Pid, now: Nanoseconds) -> Result<u32> {
        let id = self.alloc_id()?;
        self.pipes.insert(id, Pipe::new(id, self.limits.pipe_capacity, owner, now));
        Ok(id)
    }

    /// Creates a named pipe; it outlives its ends until unlinked
    pub fn create_named_pipe(&mut self, name: &str, owner: Pid, now: Nanoseconds) -> Result<u32> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("empty pipe name".into()));
        }
        if self.pipe_names.contains_key(name) {
            return Err(Error::AlreadyExists(format!("pipe {}", name)));
        }
        let id = self.alloc_id()?;
        let mut pipe = Pipe::new(id, self.limits.pipe_capacity, owner, now);
        pipe.name = Some(name.to_string());
        let mut sink = Vec::new();
        pipe.close(PipeEnd::Read, &mut sink)?;
        pipe.close(PipeEnd::Write, &mut sink)?;
        self.pipes.insert(id, pipe);
        self.pipe_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Opens one end of a named pipe
    pub fn open_named_pipe(&mut self, name: &str, end: PipeEnd) -> Result<u32> {
        let id = *self
            .pipe_names
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("pipe {}", name)))?;
        self.pipe_mut(id)?.add_ref(end);
        Ok(id)
    }

    /// Removes a named pipe's name; the pipe goes once both ends close
    pub fn unlink_named_pipe(&mut self, name: &str) -> Result<()> {
        let id = self
            .pipe_names
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("pipe {}", name)))?;
        if self.pipes.get(&id).is_some_and(Pipe::is_closed) {
            self.pipes.remove(&id);
        }
        Ok(())
    }

    pub fn pipe(&self, id: u32) -> Result<&Pipe> {
        self.pipes.get(&id).ok_or_else(|| missing("pipe", id))
    }

    pub fn pipe_mut(&mut self, id: u32) -> Result<&mut Pipe> {
        self.pipes.get_mut(&id).ok_or_else(|| missing("pipe", id))
    }

    pub fn pipe_write(&mut self, id: u32, data: &[u8], nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<PipeWrite> {
        self.pipe_mut(id)?.write(data, nonblock, wake)
    }

    pub fn pipe_read(&mut self, id: u32, max: usize, nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<Step<Vec<u8>>> {
        self.pipe_mut(id)?.read(max, nonblock, wake)
    }

    /// Drops one reference on an end; an unnamed pipe with both ends closed is released
    pub fn close_pipe_end(&mut self, id: u32, end: PipeEnd, wake: &mut Vec<Wakeup>) -> Result<()> {
        let pipe = self.pipe_mut(id)?;
        pipe.close(end, wake)?;
        let (closed, name) = (pipe.is_closed(), pipe.name.clone());
        if closed && !name.is_some_and(|n| self.pipe_names.contains_key(&n)) {
            self.pipes.remove(&id);
            log::trace!("pipe {} released", id);
        }
        Ok(())
    }

    pub fn pipe_stats(&self, id: u32) -> Result<PipeStats> {
        Ok(self.pipe(id)?.stats())
    }

    // ---- message queues ----

    /// Creates a queue, optionally under a name
    pub fn create_queue(&mut self, name: Option<&str>, owner: Pid, owner_uid: Uid) -> Result<u32> {
        if let Some(name) = name {
            if self.queue_names.contains_key(name) {
                return Err(Error::AlreadyExists(format!("message queue {}", name)));
            }
        }
        let id = self.alloc_id()?;
        let mut queue = MessageQueue::new(
            id,
            owner,
            owner_uid,
            self.limits.mq_max_messages,
            self.limits.mq_max_message_size,
        );
        if let Some(name) = name {
            queue.name = Some(name.to_string());
            self.queue_names.insert(name.to_string(), id);
        }
        self.queues.insert(id, queue);
        Ok(id)
    }

    /// Looks up a named queue
    pub fn queue_by_name(&self, name: &str) -> Result<u32> {
        self.queue_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("message queue {}", name)))
    }

    /// System V style lookup: `key` names the queue, `IPC_PRIVATE` always creates
    pub fn msgget(&mut self, key: i64, create: bool, owner: Pid, owner_uid: Uid) -> Result<u32> {
        if key == IPC_PRIVATE {
            return self.create_queue(None, owner, owner_uid);
        }
        let name = format!("key:{}", key);
        match self.queue_by_name(&name) {
            Ok(id) => Ok(id),
            Err(_) if create => self.create_queue(Some(&name), owner, owner_uid),
            Err(err) => Err(err),
        }
    }

    pub fn queue(&self, id: u32) -> Result<&MessageQueue> {
        self.queues.get(&id).ok_or_else(|| missing("message queue", id))
    }

    pub fn queue_mut(&mut self, id: u32) -> Result<&mut MessageQueue> {
        self.queues.get_mut(&id).ok_or_else(|| missing("message queue", id))
    }

    pub fn send_message(&mut self, id: u32, msg: Message, nonblock: bool, wake: &mut Vec<Wakeup>) -> Result<Step<()>> {
        self.queue_mut(id)?.send(msg, nonblock, wake)
    }

    pub fn receive_message(
        &mut self,
        id: u32,
        filter: i64,
        nonblock: bool,
        wake: &mut Vec<Wakeup>,
    ) -> Result<Step<Message>> {
        self.queue_mut(id)?.receive(filter, nonblock, wake)
    }

    /// Destroys a queue; only its owner or a privileged caller may
    pub fn destroy_queue(&mut self, id: u32, caller: Pid, privileged: bool, wake: &mut Vec<Wakeup>) -> Result<()> {
        let queue = self.queue_mut(id)?;
        if queue.owner != caller && !privileged {
            return Err(Error::PermissionDenied(format!(
                "pid {} does not own message queue {}",
                caller, id
            )));
        }
        queue.fail_waiters(wake);
        if let Some(name) = queue.name.take() {
            self.queue_names.remove(&name);
        }
        self.queues.remove(&id);
        Ok(())
    }

    pub fn queue_stats(&self, id: u32) -> Result<QueueStats> {
        Ok(self.queue(id)?.stats())
    }

    // ---- shared memory ----

    /// System V style segment lookup or creation
    pub fn shmget(&mut self, key: i64, size: u64, create: bool, owner: Pid, owner_uid: Uid, mode: u32) -> Result<u32> {
        if key != IPC_PRIVATE {
            if let Some(id) = self.segment_keys.get(&key).copied() {
                let seg = self.segment(id)?;
                if size > seg.size {
                    return Err(Error::InvalidArgument(format!(
                        "segment {} holds {} bytes, {} requested",
                        id, seg.size, size
                    )));
                }
                return Ok(id);
            }
            if !create {
                return Err(Error::NotFound(format!("shared memory key {}", key)));
            }
        }
        let id = self.alloc_id()?;
        let seg = SharedSegment::new(id, key, size, owner, owner_uid, mode)?;
        self.segments.insert(id, seg);
        if key != IPC_PRIVATE {
            self.segment_keys.insert(key, id);
        }
        Ok(id)
    }

    pub fn segment(&self, id: u32) -> Result<&SharedSegment> {
        self.segments.get(&id).ok_or_else(|| missing("shared memory segment", id))
    }

    pub fn segment_mut(&mut self, id: u32) -> Result<&mut SharedSegment> {
        self.segments.get_mut(&id).ok_or_else(|| missing("shared memory segment", id))
    }

    /// Forgets a segment whose frames were released
    pub fn remove_segment(&mut self, id: u32) -> Result<SharedSegment> {
        let seg = self.segments.remove(&id).ok_or_else(|| missing("shared memory segment", id))?;
        if self.segment_keys.get(&seg.key) == Some(&id) {
            self.segment_keys.remove(&seg.key);
        }
        Ok(seg)
    }

    /// Marks a segment for deletion; true when it was released at once
    pub fn destroy_segment(&mut self, id: u32, caller: Pid, privileged: bool) -> Result<bool> {
        let seg = self.segment_mut(id)?;
        if seg.owner != caller && !privileged {
            return Err(Error::PermissionDenied(format!(
                "pid {} does not own segment {}",
                caller, id
            )));
        }
        let key = seg.key;
        if seg.mark_for_deletion() {
            self.remove_segment(id)?;
            return Ok(true);
        }
        // a marked segment no longer answers to its key
        if self.segment_keys.get(&key) == Some(&id) {
            self.segment_keys.remove(&key);
        }
        Ok(false)
    }

    /// Drops every attachment of an exiting process
    pub fn detach_process(&mut self, pid: Pid, now: Nanoseconds) -> Vec<DroppedAttachment> {
        let mut dropped = Vec::new();
        for seg in self.segments.values_mut() {
            for addr in seg.detach_process(pid, now) {
                dropped.push(DroppedAttachment {
                    segment: seg.id,
                    addr,
                    frame_key: seg.frame_key(),
                    released: false,
                });
            }
        }
        for d in dropped.iter_mut() {
            let release = self
                .segments
                .get(&d.segment)
                .is_some_and(|s| s.is_marked() && s.attach_count() == 0);
            if release {
                self.segments.remove(&d.segment);
                d.released = true;
            }
        }
        dropped
    }

    pub fn segment_stats(&self, id: u32) -> Result<SegmentStats> {
        Ok(self.segment(id)?.stats())
    }

    // ---- semaphores ----

    pub fn create_semaphore(&mut self, name: Option<&str>, value: u32, owner: Pid) -> Result<u32> {
        if let Some(name) = name {
            if self.semaphore_names.contains_key(name) {
                return Err(Error::AlreadyExists(format!("semaphore {}", name)));
            }
        }
        let id = self.alloc_id()?;
        let mut sem = Semaphore::new(id, value, owner)?;
        if let Some(name) = name {
            sem.name = Some(name.to_string());
            self.semaphore_names.insert(name.to_string(), id);
        }
        self.semaphores.insert(id, sem);
        Ok(id)
    }

    pub fn semaphore_by_name(&self, name: &str) -> Result<u32> {
        self.semaphore_names
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("semaphore {}", name)))
    }

    /// System V style lookup by key
    pub fn semget(&mut self, key: i64, value: u32, create: bool, owner: Pid) -> Result<u32> {
        if key == IPC_PRIVATE {
            return self.create_semaphore(None, value, owner);
        }
        let name = format!("key:{}", key);
        match self.semaphore_by_name(&name) {
            Ok(id) => Ok(id),
            Err(_) if create => self.create_semaphore(Some(&name), value, owner),
            Err(err) => Err(err),
        }
    }

    pub fn semaphore(&self, id: u32) -> Result<&Semaphore> {
        self.semaphores.get(&id).ok_or_else(|| missing("semaphore", id))
    }

    pub fn semaphore_mut(&mut self, id: u32) -> Result<&mut Semaphore> {
        self.semaphores.get_mut(&id).ok_or_else(|| missing("semaphore", id))
    }

    pub fn destroy_semaphore(&mut self, id: u32, wake: &mut Vec<Wakeup>) -> Result<()> {
        let mut sem = self.semaphores.remove(&id).ok_or_else(|| missing("semaphore", id))?;
        sem.fail_waiters(wake);
        if let Some(name) = sem.name {
            self.semaphore_names.remove(&name);
        }
        Ok(())
    }

    // ---- waiters ----

    /// Unlinks a cancelled or expired waiter from whatever it waits on
    pub fn cancel(&mut self, token: WaitToken, channel: WaitChannel) -> bool {
        match channel {
            WaitChannel::PipeRead(id) | WaitChannel::PipeWrite(id) => {
                self.pipes.get_mut(&id).is_some_and(|p| p.cancel(token))
            }
            WaitChannel::MqSend(id) | WaitChannel::MqReceive(id) => {
                self.queues.get_mut(&id).is_some_and(|q| q.cancel(token))
            }
            WaitChannel::Semaphore(id) => self.semaphores.get_mut(&id).is_some_and(|s| s.cancel(token)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> IpcManager {
        IpcManager::new(IpcLimits {
            pipe_capacity: 8,
            mq_max_messages: 4,
            mq_max_message_size: 16,
        })
    }

    #[test]
    fn test_anonymous_pipe_released_when_closed() {
        let mut ipc = manager();
        let mut wake = Vec::new();
        let id = ipc.create_pipe(1, 0).unwrap();
        ipc.close_pipe_end(id, PipeEnd::Read, &mut wake).unwrap();
        assert!(ipc.pipe(id).is_ok());
        ipc.close_pipe_end(id, PipeEnd::Write, &mut wake).unwrap();
        assert!(ipc.pipe(id).is_err());
    }

    #[test]
    fn test_named_pipe_persists() {
        let mut ipc = manager();
        let mut wake = Vec::new();
        let id = ipc.create_named_pipe("fifo", 1, 0).unwrap();
        assert!(ipc.create_named_pipe("fifo", 1, 0).is_err());
        assert_eq!(ipc.open_named_pipe("fifo", PipeEnd::Write).unwrap(), id);
        assert_eq!(ipc.open_named_pipe("fifo", PipeEnd::Read).unwrap(), id);
        ipc.pipe_write(id, b"hi", false, &mut wake).unwrap();
        ipc.close_pipe_end(id, PipeEnd::Write, &mut wake).unwrap();
        ipc.close_pipe_end(id, PipeEnd::Read, &mut wake).unwrap();
        assert!(ipc.pipe(id).is_ok());
        ipc.unlink_named_pipe("fifo").unwrap();
        assert!(ipc.pipe(id).is_err());
    }

    #[test]
    fn test_msgget_by_key() {
        let mut ipc = manager();
        let a = ipc.msgget(77, true, 1, 0).unwrap();
        assert_eq!(ipc.msgget(77, false, 2, 0).unwrap(), a);
        assert_ne!(ipc.msgget(IPC_PRIVATE, true, 1, 0).unwrap(), a);
        assert!(ipc.msgget(78, false, 1, 0).is_err());
        let mut wake = Vec::new();
        assert!(matches!(ipc.destroy_queue(a, 2, false, &mut wake), Err(Error::PermissionDenied(_))));
        ipc.destroy_queue(a, 1, false, &mut wake).unwrap();
        assert!(ipc.msgget(77, false, 1, 0).is_err());
    }

    #[test]
    fn test_segment_released_on_last_detach_after_exit() {
        let mut ipc = manager();
        let id = ipc.shmget(5, 4096, true, 1, 0, 0o600).unwrap();
        ipc.segment_mut(id).unwrap().attach(2, 0x7000, 0).unwrap();
        assert!(!ipc.destroy_segment(id, 1, false).unwrap());
        assert!(ipc.shmget(5, 4096, false, 1, 0, 0).is_err());
        let dropped = ipc.detach_process(2, 1);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].released);
        assert!(ipc.segment(id).is_err());
    }

    #[test]
    fn test_cancel_unlinks_waiter() {
        let mut ipc = manager();
        let sem = ipc.create_semaphore(Some("s"), 0, 1).unwrap();
        ipc.semaphore_mut(sem).unwrap().park(WaitToken(3));
        assert!(ipc.cancel(WaitToken(3), WaitChannel::Semaphore(sem)));
        assert!(!ipc.cancel(WaitToken(3), WaitChannel::Semaphore(sem)));
        assert_eq!(ipc.semaphore(sem).unwrap().stats().waiting, 0);
    }
}
