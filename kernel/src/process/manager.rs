//! Process life cycle, threads, waits and signal delivery
//!
//! [`ProcessManager`] is everything guarded by the process lock: the table,
//! the scheduler and the wait registry. It never touches memory, files or
//! IPC objects. Operations that leave work for those subsystems (cancelled
//! waits to unlink, address spaces to drop) report it in their return value.

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Gid, INIT_PID, Nanoseconds, Pid, Result, Tid, Uid};

use super::signal::{self, DefaultAction, SigDisposition, SIGCHLD, SIGCONT, SIGKILL, SIGSTOP};
use super::{Process, ProcessSpec, ProcessState, ProcessTable, Thread, ThreadState};
use crate::sched::{SchedConfig, Scheduler};
use crate::wait::{Blocking, WaitChannel, WaitRegistry, WaitResult, WaitToken};

/// A wait that was cancelled and must be unlinked from its object
pub type Cancelled = (WaitToken, WaitChannel);

/// What an exit left behind
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitReport {
    pub pid: Pid,
    pub code: i32,
    /// Threads that were alive at exit
    pub threads: Vec<Tid>,
    pub cancelled: Vec<Cancelled>,
    /// Children handed to init
    pub orphans: Vec<Pid>,
    /// Set when a waiting parent reaped the process immediately
    pub reaped: bool,
}

/// What a thread exit left behind
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadExit {
    pub tid: Tid,
    pub cancelled: Vec<Cancelled>,
    /// Present when the thread was the last one of its process
    pub process: Option<ExitReport>,
}

/// Effect of one signal delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Signal 0: the target exists
    Checked,
    /// Dropped by disposition or because the target already exited
    Ignored,
    /// Blocked by the mask and left pending
    Pending,
    /// Left pending for a handler; waits it interrupted are listed
    Delivered { interrupted: Vec<Cancelled> },
    Stopped,
    Continued,
    Terminated(ExitReport),
}

/// Registry of processes and threads plus the scheduler over them
pub struct ProcessManager {
    pub table: ProcessTable,
    pub sched: Scheduler,
    pub waits: WaitRegistry,
}

impl ProcessManager {
    /// Creates an empty manager
    pub fn new(pid_max: u32, sched: SchedConfig) -> Self {
        Self {
            table: ProcessTable::new(pid_max),
            sched: Scheduler::new(sched),
            waits: WaitRegistry::new(),
        }
    }

    /// Creates a process with its main thread and queues it
    ///
    /// Credentials the `ProcessSpec` leaves unset are inherited from the parent.
    pub fn spawn(&mut self, spec: &ProcessSpec, now: Nanoseconds) -> Result<Pid> {
        let root = spec.pid == Some(INIT_PID) || self.table.is_empty();
        let (uid, gid, cwd, affinity) = if root {
            (spec.uid.unwrap_or(0), spec.gid.unwrap_or(0), "/".into(), u64::MAX)
        } else {
            let parent = self.table.get(spec.ppid)?;
            if parent.state.has_exited() {
                return Err(Error::InvalidArgument(format!("parent {} has exited", spec.ppid)));
            }
            (
                spec.uid.unwrap_or(parent.uid),
                spec.gid.unwrap_or(parent.gid),
                parent.cwd.clone(),
                parent.sched.affinity,
            )
        };
        let pid = match spec.pid {
            Some(pid) if pid == 0 => return Err(Error::InvalidArgument("pid 0 is reserved".into())),
            Some(pid) if self.table.id_in_use(pid) => {
                return Err(Error::AlreadyExists(format!("pid {}", pid)));
            }
            Some(pid) => pid,
            None => self.table.alloc_id()?,
        };
        if pid == spec.ppid {
            return Err(Error::InvalidArgument(format!("pid {} cannot parent itself", pid)));
        }

        let mut entity = self.sched.new_entity(spec.policy, spec.priority, spec.nice)?;
        entity.affinity = affinity;
        let mut process = Process::new(pid, spec, uid, gid, entity, now);
        process.cwd = cwd;
        if root {
            process.ppid = 0;
        }
        let ppid = process.ppid;
        self.table.insert(process)?;
        self.table.insert_thread(Thread::new(pid, pid, &spec.name, 0, now))?;
        if let Ok(parent) = self.table.get_mut(ppid) {
            parent.children.push(pid);
        }
        self.sched.enqueue(pid, &mut self.table, now, true)?;
        Ok(pid)
    }

    /// Duplicates a process: credentials, scheduling, signal dispositions
    /// and working directory carry over, pending signals do not
    pub fn fork(&mut self, parent: Pid, now: Nanoseconds) -> Result<Pid> {
        let p = self.table.get(parent)?;
        if p.state.has_exited() {
            return Err(Error::InvalidArgument(format!("pid {} has exited", parent)));
        }
        let mut spec = ProcessSpec::new(&p.name, parent)
            .with_path(&p.path)
            .with_credentials(p.uid, p.gid)
            .with_policy(p.sched.policy, p.sched.priority)
            .with_nice(p.sched.nice);
        spec.args = p.args.clone();
        spec.env = p.env.clone();
        let (context, mut signals, se, euid, egid) =
            (p.context, p.signals.clone(), p.sched.clone(), p.euid, p.egid);
        let child = self.spawn(&spec, now)?;

        signals.pending = Default::default();
        let c = self.table.get_mut(child)?;
        c.signals = signals;
        c.euid = euid;
        c.egid = egid;
        c.context = context;
        c.context.gpr[0] = 0;
        c.context.cr3 = child as u64;
        c.sched.tickets = se.tickets;
        c.sched.stride = se.stride;
        c.sched.deadline = se.deadline;
        Ok(child)
    }

    fn live_thread(&self, tid: Tid) -> Result<&Thread> {
        let t = self.table.thread(tid)?;
        if t.state.has_exited() {
            return Err(Error::InvalidArgument(format!("tid {} has exited", tid)));
        }
        Ok(t)
    }

    /// Adds a thread to a live process
    pub fn create_thread(&mut self, pid: Pid, name: &str, priority: i32, now: Nanoseconds) -> Result<Tid> {
        let p = self.table.get(pid)?;
        if p.state.has_exited() {
            return Err(Error::InvalidArgument(format!("pid {} has exited", pid)));
        }
        let tid = self.table.alloc_id()?;
        self.table.insert_thread(Thread::new(tid, pid, name, priority, now))?;
        self.table.get_mut(pid)?.threads.push(tid);
        self.make_runnable(pid, now)?;
        Ok(tid)
    }

    /// Suspends a thread on `channel`
    ///
    /// When no thread of the process can run any more, the process takes
    /// the channel's wait state and leaves its run queue.
    pub fn block_thread(
        &mut self,
        tid: Tid,
        channel: WaitChannel,
        deadline: Option<Nanoseconds>,
    ) -> Result<WaitToken> {
        let t = self.live_thread(tid)?;
        if !t.state.is_runnable() {
            return Err(Error::InvalidArgument(format!("tid {} is already waiting", tid)));
        }
        let pid = t.pid;
        let token = self.waits.register(tid, pid, channel, deadline);
        self.table.thread_mut(tid)?.state = if channel == WaitChannel::Sleep {
            ThreadState::Sleeping
        } else {
            ThreadState::Blocked
        };
        self.settle(pid, channel)?;
        Ok(token)
    }

    /// Moves a process off its run queue once none of its threads can run
    fn settle(&mut self, pid: Pid, channel: WaitChannel) -> Result<()> {
        if self.table.has_runnable_thread(pid) {
            return Ok(());
        }
        let p = self.table.get_mut(pid)?;
        if p.state.is_runnable() {
            p.state = channel.process_state();
            self.sched.dequeue(pid, &mut self.table)?;
        }
        Ok(())
    }

    /// Puts a process back on a run queue if it was waiting
    fn make_runnable(&mut self, pid: Pid, now: Nanoseconds) -> Result<()> {
        let p = self.table.get_mut(pid)?;
        if p.state.is_waiting() {
            p.state = ProcessState::Ready;
        }
        if p.state.is_runnable() && !p.sched.queued {
            self.sched.enqueue(pid, &mut self.table, now, false)?;
        }
        Ok(())
    }

    /// Completes a pending wait and wakes its thread
    ///
    /// Returns false when the wait had already completed.
    pub fn complete_wait(&mut self, token: WaitToken, outcome: Result<WaitResult>, now: Nanoseconds) -> bool {
        let Some((tid, pid)) = self.waits.complete(token, outcome) else {
            return false;
        };
        if let Ok(t) = self.table.thread_mut(tid) {
            if matches!(t.state, ThreadState::Blocked | ThreadState::Sleeping) {
                t.state = ThreadState::Ready;
            }
        }
        if let Err(err) = self.make_runnable(pid, now) {
            log::warn!("wake of pid {} failed: {}", pid, err);
        }
        true
    }

    /// Interrupts every pending wait of the listed threads
    fn interrupt_threads(&mut self, tids: &[Tid], now: Nanoseconds) -> Vec<Cancelled> {
        let mut cancelled = Vec::new();
        for tid in tids {
            for (token, channel) in self.waits.pending_for_thread(*tid) {
                if self.complete_wait(token, Err(Error::Interrupted), now) {
                    cancelled.push((token, channel));
                }
            }
        }
        cancelled
    }

    /// Cancels one pending wait with `Interrupted`
    pub fn cancel_wait(&mut self, token: WaitToken, now: Nanoseconds) -> Result<WaitChannel> {
        let slot = self
            .waits
            .slot(token)
            .ok_or_else(|| Error::NotFound(format!("wait token {}", token.0)))?;
        if !slot.is_pending() {
            return Err(Error::InvalidArgument(format!("wait token {} already completed", token.0)));
        }
        let channel = slot.channel;
        self.complete_wait(token, Err(Error::Interrupted), now);
        Ok(channel)
    }

    /// Finishes expired sleeps and returns the other expired waits
    pub fn expire_waits(&mut self, now: Nanoseconds) -> Vec<Cancelled> {
        let mut others = Vec::new();
        for (token, channel) in self.waits.expired(now) {
            if channel == WaitChannel::Sleep {
                self.complete_wait(token, Ok(WaitResult::Slept), now);
            } else {
                others.push((token, channel));
            }
        }
        others
    }

    /// Suspends a thread for `ns`; zero just yields
    pub fn sleep_thread(&mut self, tid: Tid, ns: Nanoseconds, now: Nanoseconds) -> Result<Blocking<()>> {
        let pid = self.live_thread(tid)?.pid;
        if ns == 0 {
            if self.table.get(pid)?.sched.queued {
                self.sched.yield_task(pid, &mut self.table)?;
            }
            return Ok(Blocking::Ready(()));
        }
        let token = self.block_thread(tid, WaitChannel::Sleep, Some(now.saturating_add(ns)))?;
        Ok(Blocking::Pending(token))
    }

    /// Marks a process as exited
    ///
    /// Threads end, waits are cancelled, children go to init and the
    /// parent is told: a parent already waiting reaps at once, any other
    /// parent gets SIGCHLD.
    pub fn exit_process(&mut self, pid: Pid, code: i32, now: Nanoseconds) -> Result<ExitReport> {
        if pid == INIT_PID {
            return Err(Error::PermissionDenied("init cannot exit".into()));
        }
        let p = self.table.get(pid)?;
        if p.state.has_exited() {
            return Err(Error::InvalidArgument(format!("pid {} has already exited", pid)));
        }
        let threads: Vec<Tid> = p
            .threads
            .iter()
            .copied()
            .filter(|t| self.table.thread(*t).is_ok_and(|t| !t.state.has_exited()))
            .collect();
        let cancelled = self.interrupt_threads(&threads, now);
        self.sched.dequeue(pid, &mut self.table)?;

        for tid in self.table.get(pid)?.threads.clone() {
            if tid == pid {
                if let Ok(t) = self.table.thread_mut(tid) {
                    t.state = ThreadState::Terminated;
                    t.exit_code.get_or_insert(code);
                }
            } else {
                self.table.remove_thread(tid);
            }
        }
        let p = self.table.get_mut(pid)?;
        p.threads.retain(|t| *t == pid);
        p.state = ProcessState::Zombie;
        p.exit_code = Some(code);
        p.end_time_ns = Some(now);
        let orphans = core::mem::take(&mut p.children);
        let ppid = p.ppid;
        for child in &orphans {
            if let Ok(c) = self.table.get_mut(*child) {
                c.ppid = INIT_PID;
            }
        }
        if let Ok(init) = self.table.get_mut(INIT_PID) {
            init.children.extend(orphans.iter().copied());
        }

        let mut report = ExitReport {
            pid,
            code,
            threads,
            cancelled,
            orphans,
            reaped: false,
        };
        if let Some(token) = self.parent_waiter(ppid, pid) {
            let status = self.reap(pid)?.1;
            self.complete_wait(token, Ok(WaitResult::Child { pid, status }), now);
            report.reaped = true;
        } else if self.table.contains(ppid) {
            if let SignalOutcome::Delivered { interrupted } = self.send_signal(ppid, SIGCHLD, now)? {
                report.cancelled.extend(interrupted);
            }
        }
        Ok(report)
    }

    /// Oldest wait of `ppid` that accepts the exit of `child`
    fn parent_waiter(&self, ppid: Pid, child: Pid) -> Option<WaitToken> {
        let parent = self.table.get(ppid).ok()?;
        parent
            .threads
            .iter()
            .flat_map(|t| self.waits.pending_for_thread(*t))
            .filter(|(_, ch)| matches!(ch, WaitChannel::Child(c) if *c == -1 || *c == i64::from(child)))
            .map(|(token, _)| token)
            .min()
    }

    /// Removes a zombie from every structure, returning its pid and exit code
    pub fn reap(&mut self, pid: Pid) -> Result<(Pid, i32)> {
        let p = self.table.get_mut(pid)?;
        if p.state != ProcessState::Zombie {
            return Err(Error::InvalidArgument(format!("pid {} is not a zombie", pid)));
        }
        p.state = ProcessState::Dead;
        let code = p.exit_code.unwrap_or(0);
        let ppid = p.ppid;
        for tid in p.threads.clone() {
            self.table.remove_thread(tid);
        }
        if let Ok(parent) = self.table.get_mut(ppid) {
            parent.children.retain(|c| *c != pid);
        }
        self.table.remove(pid);
        self.waits.purge_process(pid);
        Ok((pid, code))
    }

    /// Waits for a child; `target` is a pid or `-1` for any
    ///
    /// With `nohang` a live child yields `(0, 0)` instead of suspending.
    pub fn wait_pid(&mut self, tid: Tid, target: i64, nohang: bool) -> Result<Blocking<(Pid, i32)>> {
        let pid = self.live_thread(tid)?.pid;
        let children: Vec<Pid> = self
            .table
            .get(pid)?
            .children
            .iter()
            .copied()
            .filter(|c| target == -1 || i64::from(*c) == target)
            .collect();
        if children.is_empty() {
            return Err(Error::NotFound(format!("pid {} has no child matching {}", pid, target)));
        }
        let zombie = children
            .iter()
            .copied()
            .find(|c| self.table.get(*c).is_ok_and(|p| p.state == ProcessState::Zombie));
        if let Some(child) = zombie {
            return Ok(Blocking::Ready(self.reap(child)?));
        }
        if nohang {
            return Ok(Blocking::Ready((0, 0)));
        }
        let token = self.block_thread(tid, WaitChannel::Child(target), None)?;
        Ok(Blocking::Pending(token))
    }

    /// Ends one thread; the last thread of a process takes the process with it
    pub fn terminate_thread(&mut self, tid: Tid, code: i32, now: Nanoseconds) -> Result<ThreadExit> {
        let pid = self.live_thread(tid)?.pid;
        let live = self
            .table
            .threads_of(pid)
            .iter()
            .filter(|t| !t.state.has_exited())
            .count();
        if live <= 1 {
            let report = self.exit_process(pid, code, now)?;
            return Ok(ThreadExit {
                tid,
                cancelled: Vec::new(),
                process: Some(report),
            });
        }

        let cancelled = self.interrupt_threads(&[tid], now);
        let t = self.table.thread_mut(tid)?;
        t.exit_code = Some(code);
        t.state = ThreadState::Joinable;
        let detached = t.detached;

        let joiners = self.waits.pending_on(WaitChannel::Join(tid));
        if detached {
            self.drop_thread(tid)?;
        } else if let Some((first, rest)) = joiners.split_first() {
            self.complete_wait(*first, Ok(WaitResult::Joined(code)), now);
            for token in rest {
                self.complete_wait(*token, Err(Error::NotFound(format!("tid {} already joined", tid))), now);
            }
            self.drop_thread(tid)?;
        }
        let channel = self
            .table
            .threads_of(pid)
            .iter()
            .flat_map(|t| self.waits.pending_for_thread(t.tid))
            .map(|(_, ch)| ch)
            .next()
            .unwrap_or(WaitChannel::Join(tid));
        self.settle(pid, channel)?;
        Ok(ThreadExit {
            tid,
            cancelled,
            process: None,
        })
    }

    fn drop_thread(&mut self, tid: Tid) -> Result<()> {
        if let Some(t) = self.table.remove_thread(tid) {
            self.table.get_mut(t.pid)?.threads.retain(|x| *x != tid);
        }
        Ok(())
    }

    /// Waits for a sibling thread to exit
    pub fn join_thread(&mut self, joiner: Tid, target: Tid) -> Result<Blocking<i32>> {
        if joiner == target {
            return Err(Error::InvalidArgument(format!("tid {} cannot join itself", joiner)));
        }
        let jpid = self.live_thread(joiner)?.pid;
        let t = self.table.thread(target)?;
        if t.pid != jpid {
            return Err(Error::InvalidArgument(format!(
                "tid {} belongs to another process",
                target
            )));
        }
        if t.detached {
            return Err(Error::InvalidArgument(format!("tid {} is detached", target)));
        }
        if t.state == ThreadState::Joinable {
            let code = t.exit_code.unwrap_or(0);
            self.drop_thread(target)?;
            return Ok(Blocking::Ready(code));
        }
        if t.is_main() && t.state.has_exited() {
            return Ok(Blocking::Ready(t.exit_code.unwrap_or(0)));
        }
        if !self.waits.pending_on(WaitChannel::Join(target)).is_empty() {
            return Err(Error::InvalidArgument(format!("tid {} already has a joiner", target)));
        }
        let token = self.block_thread(joiner, WaitChannel::Join(target), None)?;
        Ok(Blocking::Pending(token))
    }

    /// Detaches a thread; an already exited one is released at once
    pub fn detach_thread(&mut self, tid: Tid) -> Result<()> {
        let t = self.table.thread_mut(tid)?;
        if t.detached {
            return Err(Error::InvalidArgument(format!("tid {} is already detached", tid)));
        }
        t.detached = true;
        if t.state == ThreadState::Joinable {
            self.drop_thread(tid)?;
        }
        Ok(())
    }

    /// Delivers a signal following the target's mask and dispositions
    pub fn send_signal(&mut self, pid: Pid, sig: u32, now: Nanoseconds) -> Result<SignalOutcome> {
        let p = self.table.get(pid)?;
        if sig == 0 {
            return Ok(SignalOutcome::Checked);
        }
        signal::check(sig)?;
        if p.state.has_exited() {
            return Ok(SignalOutcome::Ignored);
        }

        let fatal = sig == SIGKILL
            || (!p.signals.blocked.has(sig)
                && p.signals.disposition(sig) == SigDisposition::Default
                && signal::default_action(sig) == DefaultAction::Terminate);
        if fatal {
            if pid == INIT_PID {
                return Err(Error::PermissionDenied(format!(
                    "init cannot be killed by {}",
                    signal::signal_name(sig)
                )));
            }
            return Ok(SignalOutcome::Terminated(self.exit_process(pid, 128 + sig as i32, now)?));
        }
        if sig == SIGSTOP {
            return self.stop(pid).map(|_| SignalOutcome::Stopped);
        }
        if sig == SIGCONT {
            self.resume(pid, now)?;
        }

        let p = self.table.get_mut(pid)?;
        if p.signals.blocked.has(sig) {
            p.signals.pending |= signal::SignalSet::of(sig);
            return Ok(SignalOutcome::Pending);
        }
        match p.signals.disposition(sig) {
            SigDisposition::Ignore => Ok(SignalOutcome::Ignored),
            SigDisposition::Handler(_) => {
                p.signals.pending |= signal::SignalSet::of(sig);
                let threads = p.threads.clone();
                let interrupted = self.interrupt_threads(&threads, now);
                Ok(SignalOutcome::Delivered { interrupted })
            }
            SigDisposition::Default => match signal::default_action(sig) {
                DefaultAction::Stop => self.stop(pid).map(|_| SignalOutcome::Stopped),
                DefaultAction::Continue => Ok(SignalOutcome::Continued),
                _ => Ok(SignalOutcome::Ignored),
            },
        }
    }

    fn stop(&mut self, pid: Pid) -> Result<()> {
        if pid == INIT_PID {
            return Err(Error::PermissionDenied("init cannot be stopped".into()));
        }
        self.sched.dequeue(pid, &mut self.table)?;
        self.table.get_mut(pid)?.state = ProcessState::Stopped;
        Ok(())
    }

    fn resume(&mut self, pid: Pid, now: Nanoseconds) -> Result<()> {
        if self.table.get(pid)?.state != ProcessState::Stopped {
            return Ok(());
        }
        let waiting = self
            .table
            .threads_of(pid)
            .iter()
            .flat_map(|t| self.waits.pending_for_thread(t.tid))
            .map(|(_, ch)| ch)
            .next();
        if self.table.has_runnable_thread(pid) || waiting.is_none() {
            self.table.get_mut(pid)?.state = ProcessState::Ready;
            self.sched.enqueue(pid, &mut self.table, now, false)?;
        } else if let Some(channel) = waiting {
            self.table.get_mut(pid)?.state = channel.process_state();
        }
        Ok(())
    }

    /// Takes the lowest deliverable pending signal
    pub fn take_pending_signal(&mut self, pid: Pid) -> Result<Option<u32>> {
        Ok(self.table.get_mut(pid)?.signals.take_pending())
    }

    /// Replaces a process's signal mask, returning the old one
    pub fn set_signal_mask(&mut self, pid: Pid, mask: signal::SignalSet) -> Result<signal::SignalSet> {
        Ok(self.table.get_mut(pid)?.signals.set_mask(mask))
    }

    /// Installs a disposition, returning the old one
    pub fn set_signal_disposition(&mut self, pid: Pid, sig: u32, disp: SigDisposition) -> Result<SigDisposition> {
        self.table.get_mut(pid)?.signals.set_disposition(sig, disp)
    }

    /// Changes real and effective ids
    pub fn set_credentials(&mut self, pid: Pid, uid: Option<Uid>, gid: Option<Gid>) -> Result<()> {
        let p = self.table.get_mut(pid)?;
        if let Some(uid) = uid {
            p.uid = uid;
            p.euid = uid;
        }
        if let Some(gid) = gid {
            p.gid = gid;
            p.egid = gid;
        }
        Ok(())
    }

    /// Pid owning a thread
    pub fn pid_of(&self, tid: Tid) -> Result<Pid> {
        Ok(self.table.thread(tid)?.pid)
    }

    /// Undoes a [`spawn`](Self::spawn) whose later setup steps failed
    ///
    /// The process never ran, so nobody can be waiting on it.
    pub fn discard(&mut self, pid: Pid) -> Result<()> {
        if self.table.get(pid)?.sched.queued {
            self.sched.dequeue(pid, &mut self.table)?;
        }
        let p = self.table.remove(pid).ok_or_else(|| Error::NotFound(format!("pid {}", pid)))?;
        for tid in &p.threads {
            self.table.remove_thread(*tid);
        }
        if let Ok(parent) = self.table.get_mut(p.ppid) {
            parent.children.retain(|c| *c != pid);
        }
        self.waits.purge_process(pid);
        Ok(())
    }
}
