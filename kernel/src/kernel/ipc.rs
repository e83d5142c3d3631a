//! IPC entry points
//!
//! A call that cannot finish registers the thread's wait with the process
//! table first and then parks the token on the object, both under the
//! process lock, so no wakeup can slip in between.

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Fd, Pid, Result, Tid};
use akern_memory_management::{MmapRequest, Protection, VirtAddr, VmaBacking};

use super::Kernel;
use crate::ipc::{
    IpcCounts, Message, PipeEnd, PipeStats, PipeWrite, QueueStats, SHM_KEY_BASE, SegmentStats, SemaphoreStats, Step,
};
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::process::signal::SIGPIPE;
use crate::vfs::OpenFlags;
use crate::wait::{Blocking, WaitChannel};

impl Kernel {
    fn ipc_owner(&self, pid: Pid) -> bool {
        self.security.lock().check_capability(pid, Capabilities::IPC_OWNER)
    }

    // ========================================================================
    // Pipes
    // ========================================================================

    /// Anonymous pipe owned by `pid`, one reference on each end
    pub fn create_pipe(&self, pid: Pid) -> Result<u32> {
        let now = self.now();
        {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
        }
        let id = self.ipc.lock().create_pipe(pid, now)?;
        self.klog(
            LogLevel::Debug,
            LogFacility::Ipc,
            format!("pid {} created pipe {}", pid, id),
            LogContext::pid(pid),
        );
        Ok(id)
    }

    /// Named pipe; it stays until unlinked even with no end open
    pub fn create_named_pipe(&self, pid: Pid, name: &str) -> Result<u32> {
        let now = self.now();
        {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
        }
        self.ipc.lock().create_named_pipe(name, pid, now)
    }

    /// Takes a reference on one end of a named pipe
    pub fn open_named_pipe(&self, name: &str, end: PipeEnd) -> Result<u32> {
        self.ipc.lock().open_named_pipe(name, end)
    }

    /// Opens one end of a named pipe as a descriptor of `pid`
    pub fn open_fifo(&self, pid: Pid, name: &str, end: PipeEnd, flags: OpenFlags) -> Result<Fd> {
        let id = self.open_named_pipe(name, end)?;
        let installed = self.vfs.lock().install_pipe(pid, id, end, flags);
        match installed {
            Ok(fd) => Ok(fd),
            Err(err) => {
                self.close_pipe(id, end)?;
                Err(err.into())
            }
        }
    }

    pub fn unlink_named_pipe(&self, name: &str) -> Result<()> {
        self.ipc.lock().unlink_named_pipe(name)
    }

    /// Drops one reference on a pipe end and wakes whoever that unblocks
    pub fn close_pipe(&self, id: u32, end: PipeEnd) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut wake = Vec::new();
        let closed = self.ipc.lock().close_pipe_end(id, end, &mut wake);
        Self::apply_wakeups(&mut pm, wake, now);
        closed
    }

    /// Reads up to `max` bytes; an empty result is end of file
    ///
    /// With `nonblock` an empty pipe with live writers fails with
    /// `WouldBlock`; otherwise the thread is suspended until data or end of
    /// file arrives and the outcome is [`WaitResult::Bytes`](crate::wait::WaitResult::Bytes).
    pub fn pipe_read(&self, tid: Tid, id: u32, max: usize, nonblock: bool) -> Result<Blocking<Vec<u8>>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let pid = pm.pid_of(tid)?;
        Self::live_process(&pm, pid)?;

        let mut wake = Vec::new();
        let result = (|| -> Result<Blocking<Vec<u8>>> {
            let mut ipc = self.ipc.lock();
            match ipc.pipe_read(id, max, nonblock, &mut wake)? {
                Step::Done(data) => Ok(Blocking::Ready(data)),
                Step::Block => {
                    let token = pm.block_thread(tid, WaitChannel::PipeRead(id), None)?;
                    ipc.pipe_mut(id)?.park_reader(token, max, &mut wake);
                    Ok(Blocking::Pending(token))
                }
            }
        })();
        Self::apply_wakeups(&mut pm, wake, now);
        result
    }

    /// Writes `data`, suspending until all of it went in
    ///
    /// A non-blocking write stores what fits and fails with `WouldBlock`
    /// only when nothing did. Writing with no reader left fails with
    /// `BrokenPipe` and raises `SIGPIPE` in the writer.
    pub fn pipe_write(&self, tid: Tid, id: u32, data: &[u8], nonblock: bool) -> Result<Blocking<usize>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let pid = pm.pid_of(tid)?;
        Self::live_process(&pm, pid)?;

        let mut wake = Vec::new();
        let result = (|| -> Result<Blocking<usize>> {
            let mut ipc = self.ipc.lock();
            match ipc.pipe_write(id, data, nonblock, &mut wake)? {
                PipeWrite::Done(n) => Ok(Blocking::Ready(n)),
                PipeWrite::Partial { written, rest } => {
                    let token = pm.block_thread(tid, WaitChannel::PipeWrite(id), None)?;
                    ipc.pipe_mut(id)?.park_writer(token, rest, written, &mut wake);
                    Ok(Blocking::Pending(token))
                }
            }
        })();
        Self::apply_wakeups(&mut pm, wake, now);
        if matches!(result, Err(Error::BrokenPipe)) {
            if let Err(err) = self.signal_locked(&mut pm, pid, SIGPIPE, now) {
                self.note_failure("SIGPIPE delivery", &err, LogContext::pid(pid));
            }
        }
        result
    }

    pub fn pipe_stats(&self, id: u32) -> Result<PipeStats> {
        self.ipc.lock().pipe_stats(id)
    }

    // ========================================================================
    // Message queues
    // ========================================================================

    pub fn create_message_queue(&self, pid: Pid, name: Option<&str>) -> Result<u32> {
        let uid = {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
            pm.table.get(pid)?.uid
        };
        let id = self.ipc.lock().create_queue(name, pid, uid)?;
        self.klog(
            LogLevel::Debug,
            LogFacility::Ipc,
            format!("pid {} created message queue {}", pid, id),
            LogContext::pid(pid),
        );
        Ok(id)
    }

    /// System V style queue lookup, creating it when asked
    pub fn msgget(&self, pid: Pid, key: i64, create: bool) -> Result<u32> {
        let uid = {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
            pm.table.get(pid)?.uid
        };
        self.ipc.lock().msgget(key, create, pid, uid)
    }

    pub fn message_queue_by_name(&self, name: &str) -> Result<u32> {
        self.ipc.lock().queue_by_name(name)
    }

    /// Queues a message, suspending while the queue is full
    pub fn send_message(
        &self,
        tid: Tid,
        id: u32,
        mtype: i64,
        priority: u32,
        data: Vec<u8>,
        nonblock: bool,
    ) -> Result<Blocking<()>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let pid = pm.pid_of(tid)?;
        Self::live_process(&pm, pid)?;
        let msg = Message::new(mtype, priority, data, pid, now);

        let mut wake = Vec::new();
        let result = (|| -> Result<Blocking<()>> {
            let mut ipc = self.ipc.lock();
            match ipc.send_message(id, msg.clone(), nonblock, &mut wake)? {
                Step::Done(()) => Ok(Blocking::Ready(())),
                Step::Block => {
                    let token = pm.block_thread(tid, WaitChannel::MqSend(id), None)?;
                    ipc.queue_mut(id)?.park_sender(token, msg, &mut wake);
                    Ok(Blocking::Pending(token))
                }
            }
        })();
        Self::apply_wakeups(&mut pm, wake, now);
        result
    }

    /// Takes a message matching `filter`
    ///
    /// Zero takes the first message, a positive type takes the first of
    /// that type and a negative one the lowest type not above its absolute
    /// value. Higher priority messages go first within a type.
    pub fn receive_message(&self, tid: Tid, id: u32, filter: i64, nonblock: bool) -> Result<Blocking<Message>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let pid = pm.pid_of(tid)?;
        Self::live_process(&pm, pid)?;

        let mut wake = Vec::new();
        let result = (|| -> Result<Blocking<Message>> {
            let mut ipc = self.ipc.lock();
            match ipc.receive_message(id, filter, nonblock, &mut wake)? {
                Step::Done(msg) => Ok(Blocking::Ready(msg)),
                Step::Block => {
                    let token = pm.block_thread(tid, WaitChannel::MqReceive(id), None)?;
                    ipc.queue_mut(id)?.park_receiver(token, filter);
                    Ok(Blocking::Pending(token))
                }
            }
        })();
        Self::apply_wakeups(&mut pm, wake, now);
        result
    }

    /// Removes a queue; waiters fail with `NotFound`
    pub fn destroy_message_queue(&self, pid: Pid, id: u32) -> Result<()> {
        let now = self.now();
        let privileged = self.ipc_owner(pid);
        let mut pm = self.procs.lock();
        let mut wake = Vec::new();
        let destroyed = self.ipc.lock().destroy_queue(id, pid, privileged, &mut wake);
        Self::apply_wakeups(&mut pm, wake, now);
        destroyed
    }

    pub fn queue_stats(&self, id: u32) -> Result<QueueStats> {
        self.ipc.lock().queue_stats(id)
    }

    // ========================================================================
    // Shared memory
    // ========================================================================

    pub fn shmget(&self, pid: Pid, key: i64, size: u64, create: bool, mode: u32) -> Result<u32> {
        let uid = {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
            pm.table.get(pid)?.uid
        };
        self.ipc.lock().shmget(key, size, create, pid, uid, mode)
    }

    /// Maps a segment into `pid` and returns where
    ///
    /// Every attachment of a segment shares the same frames.
    pub fn shm_attach(&self, pid: Pid, id: u32) -> Result<VirtAddr> {
        let now = self.now();
        let pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        let (size, key) = {
            let ipc = self.ipc.lock();
            let seg = ipc.segment(id)?;
            seg.check_attach()?;
            (seg.size, seg.frame_key())
        };

        let req = MmapRequest::anonymous(size, Protection::READ | Protection::WRITE).shared(key);
        let vma = self.memory.lock().mmap(pid, req)?;
        drop(pm);
        let attached = self.ipc.lock().segment_mut(id).and_then(|seg| seg.attach(pid, vma.start, now));
        if let Err(err) = attached {
            if let Err(undo) = self.memory.lock().munmap(pid, vma.start, vma.len()) {
                self.note_failure("shared mapping rollback", &undo, LogContext::pid(pid));
            }
            return Err(err);
        }
        self.klog(
            LogLevel::Debug,
            LogFacility::Ipc,
            format!("pid {} attached segment {} at {:#x}", pid, id, vma.start),
            LogContext::pid(pid),
        );
        Ok(vma.start)
    }

    /// Detaches `pid`'s attachment of segment `id`
    pub fn shm_detach(&self, pid: Pid, id: u32) -> Result<()> {
        let addr = self
            .ipc
            .lock()
            .segment(id)?
            .address_of(pid)
            .ok_or_else(|| Error::InvalidArgument(format!("pid {} has not attached segment {}", pid, id)))?;
        self.shm_detach_at(pid, addr)
    }

    /// Detaches the segment mapped at `addr`
    ///
    /// The last detach of a segment marked for deletion releases it.
    pub fn shm_detach_at(&self, pid: Pid, addr: VirtAddr) -> Result<()> {
        let now = self.now();
        let vma = self
            .memory
            .lock()
            .find_vma(pid, addr)?
            .filter(|v| v.start == addr)
            .ok_or_else(|| Error::InvalidArgument(format!("no segment attached at {:#x}", addr)))?;
        let VmaBacking::Shared { key, .. } = vma.backing else {
            return Err(Error::InvalidArgument(format!("{:#x} is not a shared segment", addr)));
        };
        let id = key
            .checked_sub(SHM_KEY_BASE)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::InvalidArgument(format!("{:#x} is not a System V segment", addr)))?;

        let released = self.ipc.lock().segment_mut(id)?.detach(pid, addr, now)?;
        {
            let mut memory = self.memory.lock();
            if let Err(err) = memory.munmap(pid, vma.start, vma.len()) {
                self.note_failure("shared segment unmap", &err, LogContext::pid(pid));
            }
        }
        if released {
            self.ipc.lock().remove_segment(id)?;
            self.memory.lock().release_shared(key)?;
            self.klog(
                LogLevel::Debug,
                LogFacility::Ipc,
                format!("segment {} released on last detach", id),
                LogContext::pid(pid),
            );
        }
        Ok(())
    }

    /// Reads from a segment `pid` has attached
    pub fn shm_read(&self, pid: Pid, id: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
        let ipc = self.ipc.lock();
        let seg = ipc.segment(id)?;
        if seg.address_of(pid).is_none() {
            return Err(Error::PermissionDenied(format!("pid {} has not attached segment {}", pid, id)));
        }
        seg.read(offset, len)
    }

    pub fn shm_write(&self, pid: Pid, id: u32, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut ipc = self.ipc.lock();
        let seg = ipc.segment_mut(id)?;
        if seg.address_of(pid).is_none() {
            return Err(Error::PermissionDenied(format!("pid {} has not attached segment {}", pid, id)));
        }
        seg.write(offset, bytes)
    }

    /// Marks a segment for deletion; it goes once nothing is attached
    pub fn destroy_shared_memory(&self, pid: Pid, id: u32) -> Result<()> {
        let privileged = self.ipc_owner(pid);
        let (key, released) = {
            let mut ipc = self.ipc.lock();
            let key = ipc.segment(id)?.frame_key();
            (key, ipc.destroy_segment(id, pid, privileged)?)
        };
        if released {
            self.memory.lock().release_shared(key)?;
        }
        Ok(())
    }

    pub fn segment_stats(&self, id: u32) -> Result<SegmentStats> {
        self.ipc.lock().segment_stats(id)
    }

    // ========================================================================
    // Semaphores
    // ========================================================================

    pub fn create_semaphore(&self, pid: Pid, name: Option<&str>, value: u32) -> Result<u32> {
        {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
        }
        self.ipc.lock().create_semaphore(name, value, pid)
    }

    pub fn semget(&self, pid: Pid, key: i64, value: u32, create: bool) -> Result<u32> {
        self.ipc.lock().semget(key, value, create, pid)
    }

    pub fn semaphore_by_name(&self, name: &str) -> Result<u32> {
        self.ipc.lock().semaphore_by_name(name)
    }

    /// Decrements, suspending while the value is zero
    pub fn semaphore_wait(&self, tid: Tid, id: u32) -> Result<Blocking<()>> {
        let mut pm = self.procs.lock();
        let pid = pm.pid_of(tid)?;
        Self::live_process(&pm, pid)?;
        let mut ipc = self.ipc.lock();
        match ipc.semaphore_mut(id)?.wait() {
            Step::Done(()) => Ok(Blocking::Ready(())),
            Step::Block => {
                let token = pm.block_thread(tid, WaitChannel::Semaphore(id), None)?;
                ipc.semaphore_mut(id)?.park(token);
                Ok(Blocking::Pending(token))
            }
        }
    }

    /// Decrements or fails with `WouldBlock`
    pub fn semaphore_try_wait(&self, id: u32) -> Result<()> {
        self.ipc.lock().semaphore_mut(id)?.try_wait()
    }

    /// Increments; a waiter takes the unit straight away
    pub fn semaphore_post(&self, id: u32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut wake = Vec::new();
        let posted = self.ipc.lock().semaphore_mut(id).and_then(|s| s.post(1, &mut wake));
        Self::apply_wakeups(&mut pm, wake, now);
        posted
    }

    pub fn semaphore_value(&self, id: u32) -> Result<u32> {
        Ok(self.ipc.lock().semaphore(id)?.value())
    }

    pub fn destroy_semaphore(&self, id: u32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut wake = Vec::new();
        let destroyed = self.ipc.lock().destroy_semaphore(id, &mut wake);
        Self::apply_wakeups(&mut pm, wake, now);
        destroyed
    }

    pub fn semaphore_stats(&self, id: u32) -> Result<SemaphoreStats> {
        Ok(self.ipc.lock().semaphore(id)?.stats())
    }

    pub fn ipc_counts(&self) -> IpcCounts {
        self.ipc.lock().counts()
    }
}

#[cfg(test)]
mod tests {
    use akern_api::INIT_PID;

    use super::*;
    use crate::config::KernelConfig;
    use crate::process::ProcessState;
    use crate::wait::WaitResult;

    fn setup() -> (Kernel, Pid, Tid) {
        let kernel = Kernel::new(KernelConfig::default().with_pipe_capacity(8)).unwrap();
        let pid = kernel.create_process("ipc", INIT_PID).unwrap();
        let tid = kernel.threads_of(pid).unwrap()[0].tid;
        (kernel, pid, tid)
    }

    #[test]
    fn test_blocked_writer_resumes_after_read() {
        let (kernel, pid, tid) = setup();
        let reader = kernel.create_thread(pid, "reader", 0, 0).unwrap();
        let id = kernel.create_pipe(pid).unwrap();

        let token = kernel.pipe_write(tid, id, b"0123456789", false).unwrap().token().unwrap();
        assert_eq!(kernel.pipe_stats(id).unwrap().buffered, 8);
        assert_eq!(kernel.poll_wait(token).unwrap(), None);

        let got = kernel.pipe_read(reader, id, 16, false).unwrap().ready().unwrap();
        assert_eq!(got, b"01234567");
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Written(10)));
        assert_eq!(kernel.pipe_read(reader, id, 16, true).unwrap().ready().unwrap(), b"89");
    }

    #[test]
    fn test_broken_pipe_raises_sigpipe() {
        let (kernel, pid, tid) = setup();
        let id = kernel.create_pipe(pid).unwrap();
        kernel.close_pipe(id, PipeEnd::Read).unwrap();
        assert_eq!(kernel.pipe_write(tid, id, b"x", false), Err(Error::BrokenPipe));
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn test_message_queue_wakes_receiver() {
        let (kernel, pid, tid) = setup();
        let sender = kernel.create_thread(pid, "sender", 0, 0).unwrap();
        let q = kernel.create_message_queue(pid, Some("jobs")).unwrap();
        assert_eq!(kernel.message_queue_by_name("jobs").unwrap(), q);

        let token = kernel.receive_message(tid, q, 7, false).unwrap().token().unwrap();
        kernel.send_message(sender, q, 3, 0, b"skip".to_vec(), false).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), None);
        kernel.send_message(sender, q, 7, 0, b"job".to_vec(), false).unwrap();
        assert_eq!(
            kernel.poll_wait(token).unwrap(),
            Some(WaitResult::Message { mtype: 7, data: b"job".to_vec() })
        );
        assert_eq!(kernel.queue_stats(q).unwrap().messages, 1);

        kernel.destroy_message_queue(pid, q).unwrap();
        assert!(kernel.queue_stats(q).is_err());
    }

    #[test]
    fn test_shared_memory_between_processes() {
        let (kernel, a, _) = setup();
        let b = kernel.create_process("peer", INIT_PID).unwrap();
        let id = kernel.shmget(a, 42, 4096, true, 0o600).unwrap();
        assert_eq!(kernel.shmget(b, 42, 0, false, 0).unwrap(), id);

        let addr_a = kernel.shm_attach(a, id).unwrap();
        kernel.shm_attach(b, id).unwrap();
        kernel.shm_write(a, id, 0, b"shared").unwrap();
        assert_eq!(kernel.shm_read(b, id, 0, 6).unwrap(), b"shared");

        kernel.destroy_shared_memory(a, id).unwrap();
        assert!(kernel.shm_attach(a, id).is_err());
        kernel.shm_detach_at(a, addr_a).unwrap();
        assert!(kernel.segment_stats(id).is_ok());
        kernel.shm_detach(b, id).unwrap();
        assert!(kernel.segment_stats(id).is_err());
    }

    #[test]
    fn test_semaphore_handoff() {
        let (kernel, pid, tid) = setup();
        let sem = kernel.create_semaphore(pid, Some("slots"), 1).unwrap();
        assert!(kernel.semaphore_wait(tid, sem).unwrap().is_ready());
        assert_eq!(kernel.semaphore_try_wait(sem), Err(Error::WouldBlock));

        let other = kernel.create_thread(pid, "other", 0, 0).unwrap();
        let token = kernel.semaphore_wait(other, sem).unwrap().token().unwrap();
        kernel.semaphore_post(sem).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Acquired));
        assert_eq!(kernel.semaphore_value(sem).unwrap(), 0);
    }
}
