//! The kernel context
//!
//! [`Kernel`] owns every subsystem behind its own lock and is the only place
//! where they meet. Operations that touch several subsystems take the locks
//! in a fixed order: processes, memory, vfs, ipc, sync, security. The kernel
//! log has its own ring lock and may be written under any of them.
//!
//! No lock is held across a simulated wait: a blocking call registers a
//! waiter, returns [`Blocking::Pending`] and releases everything. The call
//! that satisfies the wait completes the token before it returns.

mod fs;
mod info;
mod ipc;
mod memory;
mod process;
mod sched;
mod security;
mod sync;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use akern_api::{Capabilities, Error, ErrorKind, INIT_PID, Nanoseconds, Result, ROOT_GID, ROOT_UID};
use akern_memory_management::{MemoryManager, PAGE_SIZE};
use hashbrown::HashMap;
use spin::Mutex;

use crate::clock::SimClock;
use crate::config::KernelConfig;
use crate::ipc::{IpcLimits, IpcManager};
use crate::klog::{KernelLog, LogContext, LogFacility, LogLevel};
use crate::process::signal::{SIGKILL, SIGXCPU, signal_name};
use crate::process::{Cancelled, ExitReport, ProcessManager, ProcessSpec, SignalOutcome};
use crate::sched::{SchedConfig, SchedEvent};
use crate::security::SecurityManager;
use crate::sync::{Effects, SyncManager};
use crate::syscall::{self, SyscallTable};
use crate::vfs::Vfs;
use crate::wait::{WaitChannel, WaitResult, WaitToken, Wakeup};

pub use self::info::KernelInfo;

/// Version string reported by `uname` and [`Kernel::kernel_version`]
pub const KERNEL_VERSION: &str = concat!("AKern ", env!("CARGO_PKG_VERSION"));

/// One simulated kernel instance
///
/// Every operation is a method on an explicit `Kernel` value; tests build
/// as many isolated instances as they need. The type is `Send + Sync` and
/// is shared between threads through an `Arc`.
pub struct Kernel {
    clock: SimClock,
    procs: Mutex<ProcessManager>,
    memory: Mutex<MemoryManager>,
    vfs: Mutex<Vfs>,
    ipc: Mutex<IpcManager>,
    sync: Mutex<SyncManager>,
    security: Mutex<SecurityManager>,
    log: KernelLog,
    syscalls: SyscallTable,
    /// Bit `n` set while CPU `n` runs with preemption disabled
    preempt_off: AtomicU64,
    config: KernelConfig,
}

impl Kernel {
    /// Builds the subsystems and boots `init` (pid 1)
    pub fn new(config: KernelConfig) -> Result<Self> {
        if config.num_cpus == 0 || config.num_cpus > 64 {
            return Err(Error::InvalidArgument(format!(
                "cpu count {} outside 1..=64",
                config.num_cpus
            )));
        }
        let clock = SimClock::new();
        let now = clock.now();
        let kernel = Self {
            clock,
            procs: Mutex::new(ProcessManager::new(config.pid_max, SchedConfig::from(&config))),
            memory: Mutex::new(MemoryManager::new(config.memory_config())),
            vfs: Mutex::new(Vfs::new(
                config.max_symlink_depth as usize,
                config.max_fds_per_process,
                now,
            )),
            ipc: Mutex::new(IpcManager::new(IpcLimits::from(&config))),
            sync: Mutex::new(SyncManager::new()),
            security: Mutex::new(SecurityManager::new(now)),
            log: KernelLog::new(config.log_capacity),
            syscalls: SyscallTable::new(),
            preempt_off: AtomicU64::new(0),
            config,
        };
        kernel.boot()?;
        Ok(kernel)
    }

    fn boot(&self) -> Result<()> {
        let now = self.clock.now();
        {
            let mut pm = self.procs.lock();
            let init = ProcessSpec::new("init", 0)
                .with_pid(INIT_PID)
                .with_path("/sbin/init")
                .with_credentials(ROOT_UID, ROOT_GID);
            pm.spawn(&init, now)?;
            self.memory.lock().create_address_space(INIT_PID)?;
            self.security.lock().register(INIT_PID, None, false, Capabilities::ALL)?;
        }
        syscall::register_all(&self.syscalls);

        let total = self.memory.lock().statistics().total_bytes;
        self.klog(
            LogLevel::Info,
            LogFacility::Kernel,
            format!(
                "{} booted on {} cpus with {} KiB of memory, {} syscalls",
                KERNEL_VERSION,
                self.config.num_cpus,
                total / 1024,
                self.syscalls.len()
            ),
            LogContext::pid(INIT_PID),
        );
        Ok(())
    }

    /// The configuration this kernel was built with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Nanoseconds {
        self.clock.now()
    }

    pub(crate) fn syscall_table(&self) -> &SyscallTable {
        &self.syscalls
    }

    pub(crate) fn klog(&self, level: LogLevel, facility: LogFacility, message: String, ctx: LogContext) -> u64 {
        self.log.record(level, facility, message, self.clock.now(), ctx)
    }

    /// Logs a failed cleanup step; broken invariants are critical
    fn note_failure(&self, what: &str, err: &Error, ctx: LogContext) {
        let level = if err.kind() == ErrorKind::InvariantViolation {
            LogLevel::Critical
        } else {
            LogLevel::Warning
        };
        self.klog(level, LogFacility::Kernel, format!("{}: {}", what, err), ctx);
    }

    // ========================================================================
    // Wait plumbing
    // ========================================================================

    fn apply_wakeups(pm: &mut ProcessManager, wake: Vec<Wakeup>, now: Nanoseconds) {
        for (token, outcome) in wake {
            pm.complete_wait(token, outcome, now);
        }
    }

    fn apply_effects(pm: &mut ProcessManager, fx: Effects, now: Nanoseconds) {
        for (token, channel) in fx.requeued {
            pm.waits.requeue(token, channel, false);
        }
        Self::apply_wakeups(pm, fx.wake, now);
    }

    /// Removes already-cancelled waits from the objects they queued on
    fn unlink_waits(&self, pm: &mut ProcessManager, cancelled: &[Cancelled], now: Nanoseconds) {
        if cancelled.is_empty() {
            return;
        }
        let mut fx = Effects::default();
        {
            let mut ipc = self.ipc.lock();
            let mut sync = self.sync.lock();
            for &(token, channel) in cancelled {
                if !ipc.cancel(token, channel) {
                    sync.cancel(token, channel, &mut fx);
                }
            }
        }
        Self::apply_effects(pm, fx, now);
    }

    /// Releases what an exited process held outside the process table
    fn finish_exit(&self, pm: &mut ProcessManager, report: &ExitReport, now: Nanoseconds) {
        let pid = report.pid;
        let ctx = LogContext::pid(pid);
        self.unlink_waits(pm, &report.cancelled, now);

        let mut fx = Effects::default();
        let recovered = self.sync.lock().threads_exited(&report.threads, &mut fx);
        Self::apply_effects(pm, fx, now);
        for id in recovered {
            self.klog(
                LogLevel::Warning,
                LogFacility::Thread,
                format!("robust mutex {} recovered from exited pid {}", id, pid),
                ctx,
            );
        }

        let destroyed = self.memory.lock().destroy_address_space(pid);
        if let Err(err) = destroyed {
            self.note_failure("address space teardown", &err, ctx);
        }

        let mut wake = Vec::new();
        let closed = self.vfs.lock().close_all(pid);
        match closed {
            Ok(pipes) => {
                let mut ipc = self.ipc.lock();
                for (id, end) in pipes {
                    if let Err(err) = ipc.close_pipe_end(id, end, &mut wake) {
                        self.note_failure("pipe close on exit", &err, ctx);
                    }
                }
            }
            Err(err) => self.note_failure("descriptor teardown", &err.into(), ctx),
        }
        Self::apply_wakeups(pm, wake, now);

        let dropped = self.ipc.lock().detach_process(pid, now);
        if dropped.iter().any(|d| d.released) {
            let mut memory = self.memory.lock();
            for d in dropped.iter().filter(|d| d.released) {
                if let Err(err) = memory.release_shared(d.frame_key) {
                    self.note_failure("shared segment release", &err, ctx);
                }
            }
        }

        self.security.lock().unregister(pid);

        if !report.orphans.is_empty() {
            self.klog(
                LogLevel::Debug,
                LogFacility::Process,
                format!("{} children of pid {} re-parented to init", report.orphans.len(), pid),
                ctx,
            );
        }
        self.klog(
            LogLevel::Info,
            LogFacility::Process,
            format!(
                "pid {} exited with code {}{}",
                pid,
                report.code,
                if report.reaped { " and was reaped" } else { "" }
            ),
            ctx,
        );
    }

    /// Sends a signal and carries out whatever it caused
    fn signal_locked(&self, pm: &mut ProcessManager, pid: u32, sig: u32, now: Nanoseconds) -> Result<SignalOutcome> {
        let outcome = pm.send_signal(pid, sig, now)?;
        match &outcome {
            SignalOutcome::Terminated(report) => self.finish_exit(pm, report, now),
            SignalOutcome::Delivered { interrupted } => self.unlink_waits(pm, interrupted, now),
            _ => {}
        }
        if sig != 0 {
            self.klog(
                LogLevel::Debug,
                LogFacility::Process,
                format!("{} to pid {}: {:?}", signal_name(sig), pid, outcome),
                LogContext::pid(pid),
            );
        }
        Ok(outcome)
    }

    /// Outcome of a wait, at most once
    ///
    /// `None` while the operation is still pending. Once an outcome has been
    /// returned the token is gone and later polls fail with `NotFound`.
    pub fn poll_wait(&self, token: WaitToken) -> Result<Option<WaitResult>> {
        match self.procs.lock().waits.take(token)? {
            Some(outcome) => outcome.map(Some),
            None => Ok(None),
        }
    }

    /// Withdraws a pending wait; its outcome becomes `Interrupted`
    pub fn cancel_wait(&self, token: WaitToken) -> Result<()> {
        let now = self.clock.now();
        let mut pm = self.procs.lock();
        let channel = pm.cancel_wait(token, now)?;
        self.unlink_waits(&mut pm, &[(token, channel)], now);
        Ok(())
    }

    /// Outstanding waits across the system
    pub fn pending_waits(&self) -> usize {
        self.procs.lock().waits.pending_count()
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Moves simulated time forward and runs everything that was due
    ///
    /// Sleeps and timed waits expire, cgroup CPU periods roll over, the
    /// scheduler samples load and checks deadlines, memory limits and
    /// sandbox CPU limits are enforced. Returns the new time.
    pub fn advance_clock(&self, ns: Nanoseconds) -> Nanoseconds {
        let now = self.clock.advance(ns);
        let mut pm = self.procs.lock();
        self.memory.lock().set_time(now);

        for (token, channel) in pm.expire_waits(now) {
            if let WaitChannel::CondVar(cv) = channel {
                let mut fx = Effects::default();
                let hit = self.sync.lock().cond_timeout(cv, token, &mut fx);
                Self::apply_effects(&mut pm, fx, now);
                if hit {
                    continue;
                }
            }
            self.unlink_waits(&mut pm, &[(token, channel)], now);
            pm.complete_wait(token, Err(Error::Timeout), now);
        }

        self.security.lock().cgroups_mut().roll_periods(now);
        {
            let pm = &mut *pm;
            pm.sched.tick(&mut pm.table, now);
            pm.sched.check_deadlines(&mut pm.table, now);
        }
        self.log_sched_events(&mut pm);
        self.enforce_memory_limits(&mut pm, now);
        self.enforce_cpu_limits(&mut pm, now);
        now
    }

    fn log_sched_events(&self, pm: &mut ProcessManager) {
        for event in pm.sched.drain_events() {
            let (level, ctx, message) = match event {
                SchedEvent::DeadlineMiss { pid, deadline } => (
                    LogLevel::Warning,
                    LogContext::pid(pid),
                    format!("pid {} missed its deadline at {} ns, demoted to normal", pid, deadline),
                ),
                SchedEvent::MlfqDemoted { pid, level } => (
                    LogLevel::Debug,
                    LogContext::pid(pid),
                    format!("pid {} used its quantum, now at mlfq level {}", pid, level),
                ),
                SchedEvent::MlfqBoost => (
                    LogLevel::Debug,
                    LogContext::default(),
                    String::from("mlfq priority boost"),
                ),
                SchedEvent::Migrated { pid, from, to } => (
                    LogLevel::Info,
                    LogContext::pid(pid),
                    format!("pid {} migrated from cpu {} to cpu {}", pid, from, to),
                ),
                SchedEvent::WeightDrift { cpu, recorded, actual } => (
                    LogLevel::Critical,
                    LogContext::cpu(cpu),
                    format!("run queue weight drift: recorded {}, actual {}", recorded, actual),
                ),
                SchedEvent::DemotionFailed { pid, error } => (
                    LogLevel::Warning,
                    LogContext::pid(pid),
                    format!("pid {} could not be demoted after a missed deadline: {}", pid, error),
                ),
            };
            self.klog(level, LogFacility::Scheduler, message, ctx);
        }
    }

    /// Kills the largest member of every cgroup over its memory limit
    fn enforce_memory_limits(&self, pm: &mut ProcessManager, now: Nanoseconds) {
        let usage: HashMap<u32, u64> = {
            let memory = self.memory.lock();
            pm.table
                .iter()
                .filter(|p| !p.state.has_exited())
                .map(|p| (p.pid, memory.resident_pages(p.pid) * PAGE_SIZE))
                .collect()
        };
        let victims = self.security.lock().cgroups_mut().update_memory(&usage);
        for victim in victims {
            let ctx = LogContext::pid(victim.pid);
            self.klog(
                LogLevel::Error,
                LogFacility::Memory,
                format!(
                    "out of memory in cgroup {}: {} bytes over a {} byte limit, killing pid {}",
                    victim.cgroup, victim.usage, victim.limit, victim.pid
                ),
                ctx,
            );
            if let Err(err) = self.signal_locked(pm, victim.pid, SIGKILL, now) {
                self.note_failure("oom kill", &err, ctx);
            }
        }
    }

    /// Sends SIGXCPU to processes past their sandbox CPU budget
    fn enforce_cpu_limits(&self, pm: &mut ProcessManager, now: Nanoseconds) {
        let over: Vec<u32> = {
            let security = self.security.lock();
            pm.table
                .iter()
                .filter(|p| !p.state.has_exited())
                .filter(|p| security.cpu_limit_exceeded(p.pid, p.cpu_time_ns))
                .map(|p| p.pid)
                .collect()
        };
        for pid in over {
            let ctx = LogContext::pid(pid);
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("pid {} exceeded its sandbox cpu time", pid),
                ctx,
            );
            if let Err(err) = self.signal_locked(pm, pid, SIGXCPU, now) {
                self.note_failure("cpu limit signal", &err, ctx);
            }
        }
    }

    fn preemption_disabled(&self, cpu: u32) -> bool {
        self.preempt_off.load(Ordering::Acquire) & (1u64 << cpu) != 0
    }
}
