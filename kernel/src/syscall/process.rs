//! Process, signal and scheduling calls

use alloc::format;

use akern_api::{Capabilities, Error, Result, SyscallNumber, SyscallResult};

use super::{Args, FnHandler, SyscallContext, SyscallTable, add, blocking_result};
use crate::kernel::Kernel;
use crate::process::{SigDisposition, SignalSet};
use crate::sched::{MAX_NICE, MIN_NICE, SchedPolicy};

/// `waitpid` option: return at once when no child has exited
pub const WNOHANG: i64 = 1;

/// `sigaction` handler values with a special meaning
pub const SIG_DFL: i64 = 0;
pub const SIG_IGN: i64 = 1;

/// `sigprocmask` operations
pub const SIG_BLOCK: i64 = 0;
pub const SIG_UNBLOCK: i64 = 1;
pub const SIG_SETMASK: i64 = 2;

pub(super) fn register(table: &SyscallTable) {
    use SyscallNumber::*;
    add(table, FnHandler::new(Exit, sys_exit));
    add(table, FnHandler::new(Fork, sys_fork));
    add(table, FnHandler::new(Wait, sys_wait));
    add(table, FnHandler::new(Waitpid, sys_waitpid));
    add(table, FnHandler::new(Getpid, sys_getpid));
    add(table, FnHandler::new(Getppid, sys_getppid));
    add(table, FnHandler::new(Getuid, sys_getuid));
    add(table, FnHandler::new(Getgid, sys_getgid));
    add(table, FnHandler::new(Setuid, sys_setuid));
    add(table, FnHandler::new(Setgid, sys_setgid));
    add(table, FnHandler::new(Kill, sys_kill));
    add(table, FnHandler::new(Sigaction, sys_sigaction));
    add(table, FnHandler::new(Sigprocmask, sys_sigprocmask));
    add(table, FnHandler::new(Nanosleep, sys_nanosleep));
    add(table, FnHandler::new(Clone, sys_clone));
    add(table, FnHandler::new(Nice, sys_nice));
    add(table, FnHandler::new(SchedSetparam, sys_sched_setparam));
    add(table, FnHandler::new(SchedGetparam, sys_sched_getparam));
    add(table, FnHandler::new(SchedYield, sys_sched_yield));
}

/// Reaped child: pid as the return value, status in the data bytes
fn reaped((pid, status): (u32, i32)) -> SyscallResult {
    SyscallResult::with_data(pid as i64, status.to_le_bytes().to_vec())
}

fn sys_exit(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let code = args.int_or(0, 0)? as i32;
    kernel.terminate_process(ctx.pid, code)?;
    Ok(SyscallResult::ok(0))
}

fn sys_fork(kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    let child = kernel.fork_process(ctx.pid)?;
    Ok(SyscallResult::ok(child as i64))
}

fn sys_wait(kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    Ok(blocking_result(kernel.wait_pid(ctx.tid, -1, false)?, reaped))
}

/// `waitpid(pid, options)`; pid `-1` waits for any child
fn sys_waitpid(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = args.int(0)?;
    let options = args.int_or(1, 0)?;
    let outcome = kernel.wait_pid(ctx.tid, target, options & WNOHANG != 0)?;
    Ok(blocking_result(outcome, reaped))
}

fn sys_getpid(_kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    Ok(SyscallResult::ok(ctx.pid as i64))
}

fn sys_getppid(kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    Ok(SyscallResult::ok(kernel.process(ctx.pid)?.ppid as i64))
}

fn sys_getuid(_kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    Ok(SyscallResult::ok(ctx.creds.uid as i64))
}

fn sys_getgid(_kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    Ok(SyscallResult::ok(ctx.creds.gid as i64))
}

/// Switching to an id other than the current ones needs `cap`
fn check_id_change(kernel: &Kernel, ctx: &SyscallContext, current: (u32, u32), wanted: u32, cap: Capabilities) -> Result<()> {
    if wanted == current.0 || wanted == current.1 {
        return Ok(());
    }
    kernel.require_capability(ctx.pid, cap)
}

fn sys_setuid(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let uid = args.u32(0)?;
    check_id_change(kernel, ctx, (ctx.creds.uid, ctx.creds.euid), uid, Capabilities::SETUID)?;
    kernel.set_credentials(ctx.pid, Some(uid), None)?;
    Ok(SyscallResult::ok(0))
}

fn sys_setgid(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let gid = args.u32(0)?;
    check_id_change(kernel, ctx, (ctx.creds.gid, ctx.creds.egid), gid, Capabilities::SETGID)?;
    kernel.set_credentials(ctx.pid, None, Some(gid))?;
    Ok(SyscallResult::ok(0))
}

fn sys_kill(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = args.u32(0)?;
    let sig = args.u32(1)?;
    kernel.kill_process(ctx.pid, target, sig)?;
    Ok(SyscallResult::ok(0))
}

fn encode_disposition(disp: SigDisposition) -> i64 {
    match disp {
        SigDisposition::Default => SIG_DFL,
        SigDisposition::Ignore => SIG_IGN,
        SigDisposition::Handler(addr) => addr as i64,
    }
}

/// `sigaction(sig, handler)`; returns the previous handler value
fn sys_sigaction(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let sig = args.u32(0)?;
    let disposition = match args.int(1)? {
        SIG_DFL => SigDisposition::Default,
        SIG_IGN => SigDisposition::Ignore,
        addr if addr > 0 => SigDisposition::Handler(addr as u64),
        bad => return Err(Error::InvalidArgument(format!("signal handler {:#x}", bad))),
    };
    let old = kernel.set_signal_disposition(ctx.pid, sig, disposition)?;
    Ok(SyscallResult::ok(encode_disposition(old)))
}

/// `sigprocmask(how, set)`; returns the previous mask bits
fn sys_sigprocmask(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let how = args.int(0)?;
    let set = SignalSet::from_bits_truncate(args.int(1)? as u64);
    let current = kernel.process(ctx.pid)?.signals.blocked;
    let mask = match how {
        SIG_BLOCK => current | set,
        SIG_UNBLOCK => current - set,
        SIG_SETMASK => set,
        other => return Err(Error::InvalidArgument(format!("sigprocmask how {}", other))),
    };
    let old = kernel.set_signal_mask(ctx.pid, mask)?;
    Ok(SyscallResult::ok(old.bits() as i64))
}

fn sys_nanosleep(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let ns = args.u64(0)?;
    Ok(blocking_result(kernel.sleep_thread(ctx.tid, ns)?, |()| SyscallResult::ok(0)))
}

/// `clone(name, priority, stack_size)` creates a thread in the caller
fn sys_clone(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let name = if args.is_empty() { "thread" } else { args.str(0)? };
    let priority = args.int_or(1, 0)? as i32;
    let stack_size = args.int_or(2, 0)?.max(0) as u64;
    let tid = kernel.create_thread(ctx.pid, name, priority, stack_size)?;
    Ok(SyscallResult::ok(tid as i64))
}

/// `nice(inc)`; lowering niceness needs `CAP_SYS_NICE`
fn sys_nice(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let inc = args.int(0)?;
    if inc < 0 {
        kernel.require_capability(ctx.pid, Capabilities::SYS_NICE)?;
    }
    let current = kernel.process(ctx.pid)?.sched.nice as i64;
    let nice = (current + inc).clamp(MIN_NICE as i64, MAX_NICE as i64) as i32;
    kernel.set_niceness(ctx.pid, nice)?;
    Ok(SyscallResult::ok(nice as i64))
}

/// `sched_setparam(pid, policy, priority)`; pid 0 is the caller
///
/// Realtime policies and changes to other processes need `CAP_SYS_NICE`.
fn sys_sched_setparam(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = match args.u32(0)? {
        0 => ctx.pid,
        pid => pid,
    };
    let raw = args.int(1)?;
    let policy = SchedPolicy::from_raw(raw).ok_or_else(|| Error::InvalidArgument(format!("scheduling policy {}", raw)))?;
    let priority = args.int_or(2, 0)?;
    let priority = u32::try_from(priority).map_err(|_| Error::InvalidArgument(format!("priority {}", priority)))?;
    if target != ctx.pid || policy.is_realtime() || policy == SchedPolicy::Deadline {
        kernel.require_capability(ctx.pid, Capabilities::SYS_NICE)?;
    }
    kernel.set_scheduling_policy(target, policy, priority)?;
    Ok(SyscallResult::ok(0))
}

/// `sched_getparam(pid)`; priority as the return value, policy code in the data
fn sys_sched_getparam(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let target = match args.int_or(0, 0)? {
        0 => ctx.pid,
        pid => u32::try_from(pid).map_err(|_| Error::InvalidArgument(format!("pid {}", pid)))?,
    };
    let sched = kernel.process(target)?.sched;
    Ok(SyscallResult::with_data(sched.priority as i64, sched.policy.raw().to_le_bytes().to_vec()))
}

fn sys_sched_yield(kernel: &Kernel, ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    kernel.sched_yield(ctx.pid)?;
    Ok(SyscallResult::ok(0))
}
