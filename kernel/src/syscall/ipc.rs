//! System V style IPC calls
//!
//! Flag words use the Linux values: `IPC_CREAT` and `IPC_NOWAIT` in the
//! high bits, permission bits in the low nine.

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Error, Result, SyscallNumber, SyscallResult};

use super::{Args, FnHandler, SyscallContext, SyscallTable, add, blocking_result};
use crate::kernel::Kernel;

pub const IPC_CREAT: i64 = 0o1000;
pub const IPC_NOWAIT: i64 = 0o4000;

pub const IPC_RMID: i64 = 0;
pub const IPC_STAT: i64 = 2;
pub const GETVAL: i64 = 12;

pub(super) fn register(table: &SyscallTable) {
    use SyscallNumber::*;
    add(table, FnHandler::new(Msgget, sys_msgget));
    add(table, FnHandler::new(Msgsnd, sys_msgsnd));
    add(table, FnHandler::new(Msgrcv, sys_msgrcv));
    add(table, FnHandler::new(Msgctl, sys_msgctl));
    add(table, FnHandler::new(Semget, sys_semget));
    add(table, FnHandler::new(Semop, sys_semop));
    add(table, FnHandler::new(Semctl, sys_semctl));
    add(table, FnHandler::new(Shmget, sys_shmget));
    add(table, FnHandler::new(Shmat, sys_shmat));
    add(table, FnHandler::new(Shmdt, sys_shmdt));
    add(table, FnHandler::new(Shmctl, sys_shmctl));
}

fn unsupported(call: &str, cmd: i64) -> Error {
    Error::InvalidArgument(format!("{}: unsupported command {}", call, cmd))
}

fn le_words(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// `msgget(key, flags)`
fn sys_msgget(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let key = args.int(0)?;
    let flags = args.int_or(1, 0)?;
    let id = kernel.msgget(ctx.pid, key, flags & IPC_CREAT != 0)?;
    Ok(SyscallResult::ok(id as i64))
}

/// `msgsnd(id, mtype, data, flags[, priority])`
fn sys_msgsnd(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    let mtype = args.int(1)?;
    if mtype <= 0 {
        return Err(Error::InvalidArgument(format!("message type {}", mtype)));
    }
    let data = args.bytes(2)?.to_vec();
    let nonblock = args.int_or(3, 0)? & IPC_NOWAIT != 0;
    let priority = args.int_or(4, 0)?;
    let priority = u32::try_from(priority).map_err(|_| Error::InvalidArgument(format!("priority {}", priority)))?;
    let outcome = kernel.send_message(ctx.tid, id, mtype, priority, data, nonblock)?;
    Ok(blocking_result(outcome, |()| SyscallResult::ok(0)))
}

/// `msgrcv(id, filter, flags)`; returns the type, payload as data
fn sys_msgrcv(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    let filter = args.int_or(1, 0)?;
    let nonblock = args.int_or(2, 0)? & IPC_NOWAIT != 0;
    let outcome = kernel.receive_message(ctx.tid, id, filter, nonblock)?;
    Ok(blocking_result(outcome, |msg| SyscallResult::with_data(msg.mtype, msg.data)))
}

/// `msgctl(id, cmd)`; `IPC_STAT` returns the queued count with
/// (messages, bytes, sent, received) as data
fn sys_msgctl(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    match args.int(1)? {
        IPC_RMID => {
            kernel.destroy_message_queue(ctx.pid, id)?;
            Ok(SyscallResult::ok(0))
        }
        IPC_STAT => {
            let s = kernel.queue_stats(id)?;
            let data = le_words(&[s.messages as u64, s.bytes as u64, s.sent, s.received]);
            Ok(SyscallResult::with_data(s.messages as i64, data))
        }
        cmd => Err(unsupported("msgctl", cmd)),
    }
}

/// `semget(key, value, flags)`
fn sys_semget(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let key = args.int(0)?;
    let value = args.u32(1)?;
    let flags = args.int_or(2, 0)?;
    let id = kernel.semget(ctx.pid, key, value, flags & IPC_CREAT != 0)?;
    Ok(SyscallResult::ok(id as i64))
}

/// `semop(id, op, flags)`
///
/// `-1` takes one unit and a positive op posts that many. Waiting for zero
/// is not supported.
fn sys_semop(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    let op = args.int(1)?;
    let nonblock = args.int_or(2, 0)? & IPC_NOWAIT != 0;
    match op {
        -1 if nonblock => {
            kernel.semaphore_try_wait(id)?;
            Ok(SyscallResult::ok(0))
        }
        -1 => {
            let outcome = kernel.semaphore_wait(ctx.tid, id)?;
            Ok(blocking_result(outcome, |()| SyscallResult::ok(0)))
        }
        n if n > 0 => {
            for _ in 0..n {
                kernel.semaphore_post(id)?;
            }
            Ok(SyscallResult::ok(0))
        }
        n => Err(Error::InvalidArgument(format!("semop: operation {}", n))),
    }
}

/// `semctl(id, cmd)`; `IPC_STAT` returns the value with
/// (value, waiting, waits, posts) as data
fn sys_semctl(kernel: &Kernel, _ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    match args.int(1)? {
        GETVAL => Ok(SyscallResult::ok(kernel.semaphore_value(id)? as i64)),
        IPC_RMID => {
            kernel.destroy_semaphore(id)?;
            Ok(SyscallResult::ok(0))
        }
        IPC_STAT => {
            let s = kernel.semaphore_stats(id)?;
            let data = le_words(&[s.value as u64, s.waiting as u64, s.waits, s.posts]);
            Ok(SyscallResult::with_data(s.value as i64, data))
        }
        cmd => Err(unsupported("semctl", cmd)),
    }
}

/// `shmget(key, size, flags)`
fn sys_shmget(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let key = args.int(0)?;
    let size = args.u64(1)?;
    let flags = args.int_or(2, 0)?;
    let mode = (flags & 0o777) as u32;
    let id = kernel.shmget(ctx.pid, key, size, flags & IPC_CREAT != 0, mode)?;
    Ok(SyscallResult::ok(id as i64))
}

/// `shmat(id)`; returns the attach address
fn sys_shmat(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let addr = kernel.shm_attach(ctx.pid, args.u32(0)?)?;
    Ok(SyscallResult::ok(addr as i64))
}

fn sys_shmdt(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    kernel.shm_detach_at(ctx.pid, args.u64(0)?)?;
    Ok(SyscallResult::ok(0))
}

/// `shmctl(id, cmd)`; `IPC_STAT` returns the size with
/// (size, attachments, marked) as data
fn sys_shmctl(kernel: &Kernel, ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    let id = args.u32(0)?;
    match args.int(1)? {
        IPC_RMID => {
            kernel.destroy_shared_memory(ctx.pid, id)?;
            Ok(SyscallResult::ok(0))
        }
        IPC_STAT => {
            let s = kernel.segment_stats(id)?;
            let data = le_words(&[s.size, s.attachments as u64, s.marked_for_deletion as u64]);
            Ok(SyscallResult::with_data(s.size as i64, data))
        }
        cmd => Err(unsupported("shmctl", cmd)),
    }
}

#[cfg(test)]
mod tests {
    use akern_api::error::errno;
    use akern_api::{INIT_PID, SyscallArg};

    use super::*;
    use crate::config::KernelConfig;
    use crate::ipc::IPC_PRIVATE;
    use crate::wait::{WaitResult, WaitToken};

    fn call(kernel: &Kernel, number: SyscallNumber, args: &[SyscallArg]) -> SyscallResult {
        kernel.execute_syscall_as(INIT_PID, number.raw(), args)
    }

    #[test]
    fn test_message_round_trip() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let id = call(&kernel, SyscallNumber::Msgget, &[42i64.into(), IPC_CREAT.into()]).return_value;
        assert!(id >= 0);
        assert_eq!(call(&kernel, SyscallNumber::Msgget, &[42i64.into()]).return_value, id);

        let r = call(&kernel, SyscallNumber::Msgsnd, &[id.into(), 7i64.into(), b"hello".as_slice().into()]);
        assert!(r.success, "{}", r.error_message);
        let r = call(&kernel, SyscallNumber::Msgctl, &[id.into(), IPC_STAT.into()]);
        assert_eq!(r.return_value, 1);

        let r = call(&kernel, SyscallNumber::Msgrcv, &[id.into(), 7i64.into()]);
        assert_eq!(r.return_value, 7);
        assert_eq!(r.data, b"hello");

        let r = call(&kernel, SyscallNumber::Msgrcv, &[id.into(), 0i64.into(), IPC_NOWAIT.into()]);
        assert_eq!(r.error_code, errno::EAGAIN);
        assert!(call(&kernel, SyscallNumber::Msgctl, &[id.into(), IPC_RMID.into()]).success);
        assert_eq!(call(&kernel, SyscallNumber::Msgctl, &[id.into(), IPC_STAT.into()]).error_code, errno::ENOENT);
    }

    #[test]
    fn test_blocking_receive_completes_on_send() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let reader = kernel.create_process("reader", INIT_PID).unwrap();
        let id = call(&kernel, SyscallNumber::Msgget, &[IPC_PRIVATE.into(), IPC_CREAT.into()]).return_value;

        let r = kernel.execute_syscall_as(reader, SyscallNumber::Msgrcv.raw(), &[id.into()]);
        assert!(r.is_pending());
        let token = WaitToken(r.pending.unwrap());

        call(&kernel, SyscallNumber::Msgsnd, &[id.into(), 3i64.into(), b"wake".as_slice().into()]);
        let done = kernel.poll_wait(token).unwrap();
        assert_eq!(
            done,
            Some(WaitResult::Message {
                mtype: 3,
                data: b"wake".to_vec()
            })
        );
    }

    #[test]
    fn test_semaphore_ops() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let id = call(&kernel, SyscallNumber::Semget, &[IPC_PRIVATE.into(), 1i64.into(), IPC_CREAT.into()]).return_value;

        assert!(call(&kernel, SyscallNumber::Semop, &[id.into(), (-1i64).into(), IPC_NOWAIT.into()]).success);
        let r = call(&kernel, SyscallNumber::Semop, &[id.into(), (-1i64).into(), IPC_NOWAIT.into()]);
        assert_eq!(r.error_code, errno::EAGAIN);

        assert!(call(&kernel, SyscallNumber::Semop, &[id.into(), 3i64.into()]).success);
        assert_eq!(call(&kernel, SyscallNumber::Semctl, &[id.into(), GETVAL.into()]).return_value, 3);
        assert!(!call(&kernel, SyscallNumber::Semop, &[id.into(), 0i64.into()]).success);
        assert!(call(&kernel, SyscallNumber::Semctl, &[id.into(), IPC_RMID.into()]).success);
    }

    #[test]
    fn test_shared_memory_attach_detach() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let id = call(&kernel, SyscallNumber::Shmget, &[IPC_PRIVATE.into(), 8192i64.into(), (IPC_CREAT | 0o600).into()]).return_value;
        assert!(id >= 0);

        let addr = call(&kernel, SyscallNumber::Shmat, &[id.into()]).return_value;
        assert!(kernel.translate_address(INIT_PID, addr as u64).is_ok());
        let r = call(&kernel, SyscallNumber::Shmctl, &[id.into(), IPC_STAT.into()]);
        assert_eq!(r.return_value, 8192);
        assert_eq!(u64::from_le_bytes(r.data[8..16].try_into().unwrap()), 1);

        assert!(call(&kernel, SyscallNumber::Shmdt, &[addr.into()]).success);
        assert!(call(&kernel, SyscallNumber::Shmctl, &[id.into(), IPC_RMID.into()]).success);
        assert!(!call(&kernel, SyscallNumber::Shmctl, &[id.into(), 99i64.into()]).success);
    }
}
