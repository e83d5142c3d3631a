//! Process and thread life cycle, signals

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Nanoseconds, Pid, ROOT_UID, Result, Tid, Uid};
use akern_memory_management::{MmapFlags, MmapRequest, Protection};

use super::Kernel;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::process::{Process, ProcessManager, ProcessSpec, SigDisposition, SignalOutcome, SignalSet, Thread};
use crate::sched::Lane;
use crate::sync::Effects;
use crate::wait::Blocking;

impl Kernel {
    /// Creates a normal-policy process under `parent`
    pub fn create_process(&self, name: &str, parent: Pid) -> Result<Pid> {
        self.create_process_with(ProcessSpec::new(name, parent))
    }

    /// Creates a process from a full `ProcessSpec`
    ///
    /// The parent's sandbox must allow process creation. A child running
    /// under the parent's uid inherits its capabilities; a child switched to
    /// another uid starts with all capabilities when root and none otherwise.
    pub fn create_process_with(&self, spec: ProcessSpec) -> Result<Pid> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let parent_uid = pm.table.get(spec.ppid)?.uid;
        self.check_creation(spec.ppid)?;
        if spec.policy.lane() == Lane::Realtime && !self.security.lock().check_capability(spec.ppid, Capabilities::SYS_NICE) {
            return Err(Error::PermissionDenied(format!(
                "{:?} policy needs CAP_SYS_NICE",
                spec.policy
            )));
        }

        let pid = pm.spawn(&spec, now)?;
        let uid = pm.table.get(pid)?.uid;
        let (inherit, initial) = if uid == parent_uid {
            (true, Capabilities::empty())
        } else if uid == ROOT_UID {
            (false, Capabilities::ALL)
        } else {
            (false, Capabilities::empty())
        };
        if let Err(err) = self.setup_process(pid, spec.ppid, inherit, initial) {
            self.rollback_process(&mut pm, pid);
            return Err(err);
        }

        self.klog(
            LogLevel::Info,
            LogFacility::Process,
            format!("created pid {} ({}) under pid {} as uid {}", pid, spec.name, spec.ppid, uid),
            LogContext::pid(pid),
        );
        Ok(pid)
    }

    fn check_creation(&self, parent: Pid) -> Result<()> {
        let checked = self.security.lock().check_process_creation(parent);
        if let Err(err) = &checked {
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("process creation by pid {} denied: {}", parent, err),
                LogContext::pid(parent),
            );
        }
        checked
    }

    fn setup_process(&self, pid: Pid, parent: Pid, inherit: bool, initial: Capabilities) -> Result<()> {
        self.memory.lock().create_address_space(pid)?;
        let fd_limit = {
            let mut security = self.security.lock();
            security.register(pid, Some(parent), inherit, initial)?;
            security.fd_limit(pid)
        };
        if let Some(limit) = fd_limit {
            self.vfs.lock().set_fd_limit(pid, limit);
        }
        Ok(())
    }

    fn rollback_process(&self, pm: &mut ProcessManager, pid: Pid) {
        let destroyed = {
            let mut memory = self.memory.lock();
            if memory.has_address_space(pid) {
                memory.destroy_address_space(pid).map(drop)
            } else {
                Ok(())
            }
        };
        if let Err(err) = destroyed {
            self.note_failure("address space rollback", &err, LogContext::pid(pid));
        }
        self.security.lock().unregister(pid);
        if let Err(err) = pm.discard(pid) {
            self.note_failure("process rollback", &err, LogContext::pid(pid));
        }
    }

    /// Duplicates a process
    ///
    /// The address space is shared copy-on-write, descriptors are
    /// duplicated (pipe ends gain a reference) and security state is
    /// inherited in full.
    pub fn fork_process(&self, parent: Pid) -> Result<Pid> {
        let now = self.now();
        let mut pm = self.procs.lock();
        self.check_creation(parent)?;
        let child = pm.fork(parent, now)?;

        let cloned = self.memory.lock().clone_address_space(parent, child);
        let setup = cloned.and_then(|()| {
            let mut security = self.security.lock();
            security.register(child, Some(parent), true, Capabilities::empty())?;
            Ok(security.fd_limit(child))
        });
        let fd_limit = match setup {
            Ok(limit) => limit,
            Err(err) => {
                self.rollback_process(&mut pm, child);
                return Err(err);
            }
        };

        let pipes = {
            let mut vfs = self.vfs.lock();
            if let Some(limit) = fd_limit {
                vfs.set_fd_limit(child, limit);
            }
            vfs.fork_fds(parent, child)
        };
        if !pipes.is_empty() {
            let mut ipc = self.ipc.lock();
            for (id, end) in pipes {
                match ipc.pipe_mut(id) {
                    Ok(pipe) => pipe.add_ref(end),
                    Err(err) => self.note_failure("pipe reference on fork", &err, LogContext::pid(child)),
                }
            }
        }

        self.klog(
            LogLevel::Info,
            LogFacility::Process,
            format!("pid {} forked pid {}", parent, child),
            LogContext::pid(child),
        );
        Ok(child)
    }

    /// Exits every thread of `pid` with `code`
    ///
    /// The process stays a zombie until its parent reaps it, unless the
    /// parent is already waiting.
    pub fn terminate_process(&self, pid: Pid, code: i32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let report = pm.exit_process(pid, code, now)?;
        self.finish_exit(&mut pm, &report, now);
        Ok(())
    }

    /// Signal sent by one process to another
    ///
    /// The target must be visible from the sender's pid namespace, and the
    /// sender needs the same uid or `CAP_KILL`.
    pub fn kill_process(&self, sender: Pid, pid: Pid, sig: u32) -> Result<SignalOutcome> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let sender_uid = pm.table.get(sender)?.uid;
        let target_uid = pm.table.get(pid)?.uid;
        {
            let mut security = self.security.lock();
            if !security.can_see(sender, pid) {
                return Err(Error::NotFound(format!("pid {}", pid)));
            }
            if sender_uid != target_uid {
                if let Err(err) = security.require(sender, Capabilities::KILL) {
                    drop(security);
                    self.klog(
                        LogLevel::Warning,
                        LogFacility::Security,
                        format!("pid {} may not signal pid {}", sender, pid),
                        LogContext::pid(sender),
                    );
                    return Err(err);
                }
            }
        }
        self.signal_locked(&mut pm, pid, sig, now)
    }

    /// Signal sent with kernel authority
    pub fn send_signal(&self, pid: Pid, sig: u32) -> Result<SignalOutcome> {
        let now = self.now();
        let mut pm = self.procs.lock();
        self.signal_locked(&mut pm, pid, sig, now)
    }

    pub fn set_signal_disposition(&self, pid: Pid, sig: u32, disposition: SigDisposition) -> Result<SigDisposition> {
        self.procs.lock().set_signal_disposition(pid, sig, disposition)
    }

    /// Replaces the blocked set; returns the previous one
    pub fn set_signal_mask(&self, pid: Pid, mask: SignalSet) -> Result<SignalSet> {
        self.procs.lock().set_signal_mask(pid, mask)
    }

    /// Dequeues the lowest deliverable pending signal
    pub fn take_pending_signal(&self, pid: Pid) -> Result<Option<u32>> {
        self.procs.lock().take_pending_signal(pid)
    }

    /// Reaps a zombie child; `target` is a pid or `-1` for any child
    pub fn wait_pid(&self, tid: Tid, target: i64, nohang: bool) -> Result<Blocking<(Pid, i32)>> {
        let blocking = self.procs.lock().wait_pid(tid, target, nohang)?;
        if let Blocking::Ready((pid, code)) = blocking {
            if pid != 0 {
                self.klog(
                    LogLevel::Debug,
                    LogFacility::Process,
                    format!("reaped pid {} with status {}", pid, code),
                    LogContext::pid(pid),
                );
            }
        }
        Ok(blocking)
    }

    /// Changes real and effective ids; `None` keeps the current value
    pub fn set_credentials(&self, pid: Pid, uid: Option<Uid>, gid: Option<u32>) -> Result<()> {
        self.procs.lock().set_credentials(pid, uid, gid)?;
        self.klog(
            LogLevel::Notice,
            LogFacility::Audit,
            format!("pid {} credentials changed to uid {:?} gid {:?}", pid, uid, gid),
            LogContext::pid(pid),
        );
        Ok(())
    }

    /// Snapshot of one PCB
    pub fn process(&self, pid: Pid) -> Result<Process> {
        self.procs.lock().table.get(pid).cloned()
    }

    pub fn all_processes(&self) -> Vec<Process> {
        let pm = self.procs.lock();
        let mut all: Vec<Process> = pm.table.iter().cloned().collect();
        all.sort_by_key(|p| p.pid);
        all
    }

    pub fn processes_for_user(&self, uid: Uid) -> Vec<Process> {
        self.all_processes().into_iter().filter(|p| p.uid == uid).collect()
    }

    /// Pids that `observer` can see through its pid namespace
    pub fn processes_visible_to(&self, observer: Pid) -> Result<Vec<Pid>> {
        let pm = self.procs.lock();
        pm.table.get(observer)?;
        let security = self.security.lock();
        let mut pids: Vec<Pid> = pm.table.pids().into_iter().filter(|p| security.can_see(observer, *p)).collect();
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn process_count(&self) -> usize {
        self.procs.lock().table.len()
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Creates a thread with its own stack mapping
    ///
    /// `stack_size == 0` uses the configured default.
    pub fn create_thread(&self, pid: Pid, name: &str, priority: i32, stack_size: u64) -> Result<Tid> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let live = pm.table.threads_of(pid).iter().filter(|t| !t.state.has_exited()).count();
        self.security.lock().check_thread_limit(pid, live)?;

        let size = if stack_size == 0 {
            self.config.default_stack_size
        } else {
            stack_size
        };
        let stack = self.memory.lock().mmap(
            pid,
            MmapRequest::anonymous(size, Protection::READ | Protection::WRITE)
                .with_flags(MmapFlags::STACK | MmapFlags::GROWS_DOWN),
        )?;
        let tid = match pm.create_thread(pid, name, priority, now) {
            Ok(tid) => tid,
            Err(err) => {
                let unmapped = self.memory.lock().munmap(pid, stack.start, stack.len());
                if let Err(undo) = unmapped {
                    self.note_failure("thread stack rollback", &undo, LogContext::pid(pid));
                }
                return Err(err);
            }
        };
        let thread = pm.table.thread_mut(tid)?;
        thread.stack_base = stack.start;
        thread.stack_size = stack.len();

        self.klog(
            LogLevel::Debug,
            LogFacility::Thread,
            format!("pid {} created thread {} ({}) with stack {:#x}", pid, tid, name, stack.start),
            LogContext::thread(pid, tid),
        );
        Ok(tid)
    }

    /// Ends one thread; the last thread takes the process with it
    pub fn terminate_thread(&self, tid: Tid, code: i32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let (pid, stack_base, stack_size) = {
            let t = pm.table.thread(tid)?;
            (t.pid, t.stack_base, t.stack_size)
        };
        let exit = pm.terminate_thread(tid, code, now)?;
        self.unlink_waits(&mut pm, &exit.cancelled, now);
        match exit.process {
            Some(report) => self.finish_exit(&mut pm, &report, now),
            None => {
                let mut fx = Effects::default();
                let recovered = self.sync.lock().threads_exited(&[tid], &mut fx);
                Self::apply_effects(&mut pm, fx, now);
                for id in recovered {
                    self.klog(
                        LogLevel::Warning,
                        LogFacility::Thread,
                        format!("robust mutex {} recovered from exited thread {}", id, tid),
                        LogContext::thread(pid, tid),
                    );
                }
                if stack_size > 0 {
                    let unmapped = self.memory.lock().munmap(pid, stack_base, stack_size);
                    if let Err(err) = unmapped {
                        self.note_failure("thread stack unmap", &err, LogContext::thread(pid, tid));
                    }
                }
                self.klog(
                    LogLevel::Debug,
                    LogFacility::Thread,
                    format!("thread {} of pid {} exited with code {}", tid, pid, code),
                    LogContext::thread(pid, tid),
                );
            }
        }
        Ok(())
    }

    /// Waits for `target` to exit and collects its code
    pub fn join_thread(&self, joiner: Tid, target: Tid) -> Result<Blocking<i32>> {
        self.procs.lock().join_thread(joiner, target)
    }

    pub fn detach_thread(&self, tid: Tid) -> Result<()> {
        self.procs.lock().detach_thread(tid)
    }

    /// Suspends `tid` for `ns` of simulated time
    pub fn sleep_thread(&self, tid: Tid, ns: Nanoseconds) -> Result<Blocking<()>> {
        let now = self.now();
        self.procs.lock().sleep_thread(tid, ns, now)
    }

    pub fn thread(&self, tid: Tid) -> Result<Thread> {
        self.procs.lock().table.thread(tid).cloned()
    }

    pub fn threads_of(&self, pid: Pid) -> Result<Vec<Thread>> {
        let pm = self.procs.lock();
        pm.table.get(pid)?;
        Ok(pm.table.threads_of(pid).into_iter().cloned().collect())
    }

    pub(crate) fn credentials_of(&self, pid: Pid) -> Result<crate::cred::Credentials> {
        let pm = self.procs.lock();
        let p = pm.table.get(pid)?;
        let caps = self.security.lock().effective(pid);
        Ok(crate::cred::Credentials {
            pid,
            uid: p.uid,
            gid: p.gid,
            euid: p.euid,
            egid: p.egid,
            caps,
        })
    }
}
