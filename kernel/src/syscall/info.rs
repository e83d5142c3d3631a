//! Clock, system information and kernel log calls

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Result, SyscallNumber, SyscallResult};

use super::{Args, FnHandler, SyscallContext, SyscallTable, add};
use crate::kernel::Kernel;
use crate::klog::LogLevel;

pub const SYSNAME: &str = "AKern";

pub const CLOCK_REALTIME: i64 = 0;
pub const CLOCK_MONOTONIC: i64 = 1;

pub const SYSLOG_ACTION_READ_ALL: i64 = 3;
pub const SYSLOG_ACTION_CLEAR: i64 = 5;
pub const SYSLOG_ACTION_SIZE_BUFFER: i64 = 10;

pub(super) fn register(table: &SyscallTable) {
    use SyscallNumber::*;
    add(table, FnHandler::new(Gettimeofday, sys_gettimeofday));
    add(table, FnHandler::new(ClockGettime, sys_clock_gettime));
    add(table, FnHandler::new(ClockGetres, sys_clock_getres));
    add(table, FnHandler::new(ClockSettime, sys_clock_settime).requiring(Capabilities::SYS_TIME));
    add(table, FnHandler::new(Uname, sys_uname));
    add(table, FnHandler::new(Sysinfo, sys_sysinfo));
    add(table, FnHandler::new(Syslog, sys_syslog).requiring(Capabilities::SYSLOG));
}

fn check_clock(id: i64) -> Result<()> {
    match id {
        CLOCK_REALTIME | CLOCK_MONOTONIC => Ok(()),
        other => Err(Error::InvalidArgument(format!("clock id {}", other))),
    }
}

/// Returns microseconds since boot; data holds (seconds, microseconds)
fn sys_gettimeofday(kernel: &Kernel, _ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    let micros = kernel.uptime_nanoseconds() / 1_000;
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&(micros / 1_000_000).to_le_bytes());
    data.extend_from_slice(&(micros % 1_000_000).to_le_bytes());
    Ok(SyscallResult::with_data(micros as i64, data))
}

/// `clock_gettime(clock_id)`; nanoseconds since boot
fn sys_clock_gettime(kernel: &Kernel, _ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    check_clock(args.int_or(0, CLOCK_MONOTONIC)?)?;
    Ok(SyscallResult::ok(kernel.uptime_nanoseconds() as i64))
}

fn sys_clock_getres(_kernel: &Kernel, _ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    check_clock(args.int_or(0, CLOCK_MONOTONIC)?)?;
    Ok(SyscallResult::ok(1))
}

/// `clock_settime(clock_id, ns)`
///
/// The simulated clock only moves forward, so the new time may not be
/// earlier than the current one.
fn sys_clock_settime(kernel: &Kernel, _ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    check_clock(args.int(0)?)?;
    let target = args.u64(1)?;
    let now = kernel.uptime_nanoseconds();
    if target < now {
        return Err(Error::InvalidArgument(format!("clock cannot go back from {} to {}", now, target)));
    }
    kernel.advance_clock(target - now);
    Ok(SyscallResult::ok(0))
}

/// Data holds `sysname\nhostname\nversion`
fn sys_uname(kernel: &Kernel, _ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    let info = kernel.kernel_info();
    let text = format!("{}\n{}\n{}", SYSNAME, info.hostname, info.version);
    Ok(SyscallResult::with_data(0, text.into_bytes()))
}

/// Returns uptime in seconds; data holds (total memory, available memory,
/// processes, threads) as u64
fn sys_sysinfo(kernel: &Kernel, _ctx: &SyscallContext, _args: &Args<'_>) -> Result<SyscallResult> {
    let info = kernel.kernel_info();
    let data: Vec<u8> = [info.total_memory, info.available_memory, info.processes as u64, info.threads as u64]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    Ok(SyscallResult::with_data((info.uptime_ns / 1_000_000_000) as i64, data))
}

/// `syslog(action[, count[, min_level]])`
///
/// Reading returns the entry count with one formatted line per entry as data.
fn sys_syslog(kernel: &Kernel, _ctx: &SyscallContext, args: &Args<'_>) -> Result<SyscallResult> {
    match args.int(0)? {
        SYSLOG_ACTION_READ_ALL => {
            let count = args.int_or(1, i64::MAX)?;
            let count = usize::try_from(count).map_err(|_| Error::InvalidArgument(format!("count {}", count)))?;
            let raw = args.int_or(2, LogLevel::Trace as i64)?;
            let level = LogLevel::from_raw(raw).ok_or_else(|| Error::InvalidArgument(format!("log level {}", raw)))?;
            let entries = kernel.log_entries_with_level(level, None, count);
            let mut text = String::new();
            for e in &entries {
                text.push_str(&format!("[{}] {:?} {}: {}\n", e.sequence, e.level, e.subsystem, e.message));
            }
            Ok(SyscallResult::with_data(entries.len() as i64, text.into_bytes()))
        }
        SYSLOG_ACTION_CLEAR => {
            kernel.clear_logs();
            Ok(SyscallResult::ok(0))
        }
        SYSLOG_ACTION_SIZE_BUFFER => Ok(SyscallResult::ok(kernel.log_count() as i64)),
        action => Err(Error::InvalidArgument(format!("syslog action {}", action))),
    }
}

#[cfg(test)]
mod tests {
    use akern_api::error::errno;
    use akern_api::{INIT_PID, SyscallArg};

    use super::*;
    use crate::config::KernelConfig;
    use crate::klog::LogFacility;
    use crate::process::ProcessSpec;

    fn call(kernel: &Kernel, number: SyscallNumber, args: &[SyscallArg]) -> SyscallResult {
        kernel.execute_syscall_as(INIT_PID, number.raw(), args)
    }

    #[test]
    fn test_clock_calls() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.advance_clock(2_500_000_000);
        assert_eq!(call(&kernel, SyscallNumber::ClockGettime, &[]).return_value, 2_500_000_000);
        let r = call(&kernel, SyscallNumber::Gettimeofday, &[]);
        assert_eq!(r.return_value, 2_500_000);
        assert_eq!(u64::from_le_bytes(r.data[..8].try_into().unwrap()), 2);
        assert!(!call(&kernel, SyscallNumber::ClockGettime, &[7i64.into()]).success);

        assert!(call(&kernel, SyscallNumber::ClockSettime, &[CLOCK_MONOTONIC.into(), 3_000_000_000i64.into()]).success);
        assert_eq!(kernel.uptime_nanoseconds(), 3_000_000_000);
        assert!(!call(&kernel, SyscallNumber::ClockSettime, &[CLOCK_MONOTONIC.into(), 1i64.into()]).success);
    }

    #[test]
    fn test_uname_and_sysinfo() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let r = call(&kernel, SyscallNumber::Uname, &[]);
        let text = String::from_utf8(r.data).unwrap();
        let fields: Vec<&str> = text.split('\n').collect();
        assert_eq!(fields[0], SYSNAME);
        assert_eq!(fields[2], kernel.kernel_version());

        let r = call(&kernel, SyscallNumber::Sysinfo, &[]);
        assert_eq!(r.data.len(), 32);
        assert_eq!(u64::from_le_bytes(r.data[16..24].try_into().unwrap()), 1);
    }

    #[test]
    fn test_syslog_read_and_clear() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.clear_logs();
        kernel.kernel_log(LogLevel::Error, LogFacility::Driver, "bad sector");
        kernel.kernel_log(LogLevel::Debug, LogFacility::Driver, "link up");

        let r = call(&kernel, SyscallNumber::Syslog, &[SYSLOG_ACTION_READ_ALL.into(), 10i64.into(), (LogLevel::Warning as i64).into()]);
        assert_eq!(r.return_value, 1);
        assert!(String::from_utf8(r.data).unwrap().contains("bad sector"));

        assert!(call(&kernel, SyscallNumber::Syslog, &[SYSLOG_ACTION_CLEAR.into()]).success);
        assert_eq!(call(&kernel, SyscallNumber::Syslog, &[SYSLOG_ACTION_SIZE_BUFFER.into()]).return_value, 0);
    }

    #[test]
    fn test_syslog_needs_capability() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let user = kernel
            .create_process_with(ProcessSpec::new("user", INIT_PID).with_credentials(1000, 1000))
            .unwrap();
        let r = kernel.execute_syscall_as(user, SyscallNumber::Syslog.raw(), &[SYSLOG_ACTION_CLEAR.into()]);
        assert_eq!(r.error_code, errno::EACCES);
    }
}
