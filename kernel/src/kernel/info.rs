//! Kernel log, system information and syscall entry points

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use akern_api::{INIT_PID, Nanoseconds, Pid, Result, SyscallArg, SyscallNumber, SyscallResult};

use super::{KERNEL_VERSION, Kernel};
use crate::klog::{LogContext, LogEntry, LogFacility, LogLevel};
use crate::syscall::{self, SyscallContext, SyscallHandler, SyscallStats};

/// Point-in-time summary of the whole kernel
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KernelInfo {
    pub version: String,
    pub hostname: String,
    pub num_cpus: u32,
    pub uptime_ns: Nanoseconds,
    /// Processes in the table, zombies included
    pub processes: usize,
    pub threads: usize,
    pub total_memory: u64,
    pub available_memory: u64,
    /// Syscalls dispatched since boot
    pub syscalls: u64,
    pub context_switches: u64,
    /// Entries currently held by the log ring
    pub log_entries: usize,
    pub load_average: [f64; 3],
}

impl Kernel {
    pub fn kernel_info(&self) -> KernelInfo {
        let (processes, threads, context_switches) = {
            let pm = self.procs.lock();
            (pm.table.len(), pm.table.thread_count(), pm.sched.total_switches())
        };
        let memory = self.memory.lock().statistics();
        KernelInfo {
            version: String::from(KERNEL_VERSION),
            hostname: self.config.hostname.clone(),
            num_cpus: self.config.num_cpus,
            uptime_ns: self.now(),
            processes,
            threads,
            total_memory: memory.total_bytes,
            available_memory: memory.available_bytes,
            syscalls: self.syscalls.total(),
            context_switches,
            log_entries: self.log.len(),
            load_average: self.load_average(),
        }
    }

    pub fn kernel_version(&self) -> &'static str {
        KERNEL_VERSION
    }

    pub fn uptime_nanoseconds(&self) -> Nanoseconds {
        self.now()
    }

    // ========================================================================
    // Kernel log
    // ========================================================================

    /// Appends an entry with no process context; returns its sequence number
    pub fn kernel_log(&self, level: LogLevel, facility: LogFacility, message: &str) -> u64 {
        self.klog(level, facility, String::from(message), LogContext::default())
    }

    /// Most recent `count` entries at least as severe as `min_level`, oldest first
    pub fn log_entries_with_level(&self, min_level: LogLevel, facility: Option<LogFacility>, count: usize) -> Vec<LogEntry> {
        self.log.entries(min_level, facility, count)
    }

    pub fn clear_logs(&self) {
        self.log.clear();
    }

    pub fn log_count(&self) -> usize {
        self.log.len()
    }

    /// Entries pushed out of the ring by newer ones
    pub fn dropped_log_entries(&self) -> u64 {
        self.log.dropped()
    }

    // ========================================================================
    // Syscalls
    // ========================================================================

    /// Dispatches a syscall on behalf of the task running on CPU 0
    ///
    /// When CPU 0 is idle the call runs as init.
    pub fn execute_syscall(&self, number: u32, args: &[SyscallArg]) -> SyscallResult {
        let pid = self.current_task(0).unwrap_or(INIT_PID);
        self.execute_syscall_as(pid, number, args)
    }

    /// Dispatches a syscall on behalf of `pid`'s first live thread
    pub fn execute_syscall_as(&self, pid: Pid, number: u32, args: &[SyscallArg]) -> SyscallResult {
        let ctx = match self.syscall_context(pid) {
            Ok(ctx) => ctx,
            Err(err) => {
                let result = SyscallResult::from_error(&err);
                self.syscalls.record(number, &result);
                return result;
            }
        };
        syscall::dispatch(self, &ctx, number, args)
    }

    fn syscall_context(&self, pid: Pid) -> Result<SyscallContext> {
        let tid = self.main_thread(pid)?;
        let creds = self.credentials_of(pid)?;
        Ok(SyscallContext { pid, tid, creds })
    }

    /// Sandbox syscall filter for `pid`
    pub(crate) fn check_syscall_as(&self, pid: Pid, name: &str) -> Result<()> {
        let checked = self.security.lock().check_syscall(pid, name);
        if let Err(err) = &checked {
            self.klog(
                LogLevel::Warning,
                LogFacility::Security,
                format!("pid {} denied syscall {}: {}", pid, name, err),
                LogContext::pid(pid),
            );
        }
        checked
    }

    /// Name of a syscall number, `"unknown"` when there is none
    pub fn syscall_name(&self, number: u32) -> &'static str {
        SyscallNumber::from_raw(number).map_or("unknown", SyscallNumber::name)
    }

    pub fn total_syscall_count(&self) -> u64 {
        self.syscalls.total()
    }

    pub fn syscall_stats(&self) -> SyscallStats {
        self.syscalls.stats()
    }

    /// Installs a handler, replacing any handler for the same number
    pub fn register_syscall(&self, handler: Arc<dyn SyscallHandler>) -> Option<Arc<dyn SyscallHandler>> {
        let id = handler.id();
        let name = String::from(handler.name());
        let previous = self.syscalls.register(handler);
        self.klog(
            LogLevel::Info,
            LogFacility::Syscall,
            format!("syscall {} ({}) {}", id, name, if previous.is_some() { "replaced" } else { "registered" }),
            LogContext::default(),
        );
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[test]
    fn test_kernel_info() {
        let kernel = Kernel::new(KernelConfig::default().with_cpus(2)).unwrap();
        kernel.create_process("a", INIT_PID).unwrap();
        kernel.advance_clock(5_000);
        let info = kernel.kernel_info();
        assert_eq!(info.num_cpus, 2);
        assert_eq!(info.processes, 2);
        assert_eq!(info.uptime_ns, 5_000);
        assert!(info.version.starts_with("AKern"));
        assert!(info.available_memory <= info.total_memory);
    }

    #[test]
    fn test_log_filters() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.clear_logs();
        kernel.kernel_log(LogLevel::Debug, LogFacility::Driver, "noise");
        let seq = kernel.kernel_log(LogLevel::Error, LogFacility::Driver, "disk on fire");
        let errors = kernel.log_entries_with_level(LogLevel::Warning, Some(LogFacility::Driver), 10);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].sequence, seq);
        assert_eq!(kernel.log_count(), 2);
        kernel.clear_logs();
        assert_eq!(kernel.log_count(), 0);
    }

    #[test]
    fn test_syscall_counts() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let getpid = SyscallNumber::Getpid.raw();
        let r = kernel.execute_syscall(getpid, &[]);
        assert!(r.success);
        assert_eq!(r.return_value, INIT_PID as i64);
        assert!(!kernel.execute_syscall(29, &[]).success);
        assert_eq!(kernel.total_syscall_count(), 2);
        assert_eq!(kernel.syscall_name(getpid), "getpid");
        assert_eq!(kernel.syscall_name(29), "unknown");
    }
}
