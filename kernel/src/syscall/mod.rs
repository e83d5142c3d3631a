//! Syscall dispatch
//!
//! Handlers sit in a table keyed by syscall number. A dispatched call goes
//! through the same steps every time: resolve the handler, run the
//! caller's sandbox filter, check the handler's capability, execute, then
//! fold the outcome into a [`SyscallResult`] and the statistics.
//!
//! Argument conventions follow Linux where a call has a Linux twin: flag
//! words use the Linux bit values, `-1` means "any" for wait targets, and
//! paths are resolved against the caller's working directory.

mod fs;
mod info;
mod ipc;
mod memory;
mod process;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;

use akern_api::{Capabilities, Error, ErrorKind, Pid, Result, SyscallArg, SyscallNumber, SyscallResult, Tid};
use spin::{Mutex, RwLock};

use crate::cred::Credentials;
use crate::kernel::Kernel;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::wait::Blocking;

/// Who issued a syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallContext {
    pub pid: Pid,
    /// Thread the call blocks, if it blocks
    pub tid: Tid,
    pub creds: Credentials,
}

/// One syscall implementation
pub trait SyscallHandler: Send + Sync {
    /// Syscall number served
    fn id(&self) -> u32;

    /// Name used by sandbox filters and the log
    fn name(&self) -> &'static str;

    /// Capability the caller must hold before the handler runs
    fn required_capability(&self) -> Option<Capabilities> {
        None
    }

    /// Runs the call; errors become failed results
    fn execute(&self, kernel: &Kernel, ctx: &SyscallContext, args: &[SyscallArg]) -> Result<SyscallResult>;
}

/// Body of a table-driven handler
pub type HandlerFn = fn(&Kernel, &SyscallContext, &Args<'_>) -> Result<SyscallResult>;

/// Handler built from a plain function
pub struct FnHandler {
    number: SyscallNumber,
    capability: Option<Capabilities>,
    body: HandlerFn,
}

impl FnHandler {
    pub fn new(number: SyscallNumber, body: HandlerFn) -> Self {
        Self {
            number,
            capability: None,
            body,
        }
    }

    /// Requires `cap` before the body runs
    pub fn requiring(mut self, cap: Capabilities) -> Self {
        self.capability = Some(cap);
        self
    }
}

impl SyscallHandler for FnHandler {
    fn id(&self) -> u32 {
        self.number.raw()
    }

    fn name(&self) -> &'static str {
        self.number.name()
    }

    fn required_capability(&self) -> Option<Capabilities> {
        self.capability
    }

    fn execute(&self, kernel: &Kernel, ctx: &SyscallContext, args: &[SyscallArg]) -> Result<SyscallResult> {
        (self.body)(kernel, ctx, &Args::new(self.number.name(), args))
    }
}

/// Typed view over a syscall's arguments
pub struct Args<'a> {
    call: &'static str,
    args: &'a [SyscallArg],
}

impl<'a> Args<'a> {
    pub fn new(call: &'static str, args: &'a [SyscallArg]) -> Self {
        Self { call, args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn missing(&self, index: usize, what: &str) -> Error {
        Error::InvalidArgument(format!("{}: argument {} must be {}", self.call, index, what))
    }

    pub fn int(&self, index: usize) -> Result<i64> {
        self.args
            .get(index)
            .and_then(SyscallArg::as_int)
            .ok_or_else(|| self.missing(index, "an integer"))
    }

    /// Integer argument, or `default` when absent
    pub fn int_or(&self, index: usize, default: i64) -> Result<i64> {
        if index >= self.args.len() {
            return Ok(default);
        }
        self.int(index)
    }

    pub fn u32(&self, index: usize) -> Result<u32> {
        let v = self.int(index)?;
        u32::try_from(v).map_err(|_| Error::InvalidArgument(format!("{}: argument {} out of range: {}", self.call, index, v)))
    }

    pub fn u64(&self, index: usize) -> Result<u64> {
        let v = self.int(index)?;
        u64::try_from(v).map_err(|_| Error::InvalidArgument(format!("{}: argument {} is negative: {}", self.call, index, v)))
    }

    pub fn i32(&self, index: usize) -> Result<i32> {
        let v = self.int(index)?;
        i32::try_from(v).map_err(|_| Error::InvalidArgument(format!("{}: argument {} out of range: {}", self.call, index, v)))
    }

    pub fn str(&self, index: usize) -> Result<&'a str> {
        self.args
            .get(index)
            .and_then(SyscallArg::as_str)
            .ok_or_else(|| self.missing(index, "a string"))
    }

    pub fn bytes(&self, index: usize) -> Result<&'a [u8]> {
        self.args
            .get(index)
            .and_then(SyscallArg::as_bytes)
            .ok_or_else(|| self.missing(index, "a buffer"))
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyscallStats {
    pub total_calls: u64,
    pub calls_by_number: BTreeMap<u32, u64>,
    pub error_count: u64,
    pub errors_by_number: BTreeMap<u32, u64>,
    /// Calls that suspended their thread
    pub pending_count: u64,
}

/// Handler table with its statistics
pub struct SyscallTable {
    handlers: RwLock<BTreeMap<u32, Arc<dyn SyscallHandler>>>,
    stats: Mutex<SyscallStats>,
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallTable {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            stats: Mutex::new(SyscallStats::default()),
        }
    }

    /// Installs a handler; returns the one it replaced
    pub fn register(&self, handler: Arc<dyn SyscallHandler>) -> Option<Arc<dyn SyscallHandler>> {
        self.handlers.write().insert(handler.id(), handler)
    }

    pub fn handler(&self, number: u32) -> Option<Arc<dyn SyscallHandler>> {
        self.handlers.read().get(&number).cloned()
    }

    /// Handlers installed
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub(crate) fn record(&self, number: u32, result: &SyscallResult) {
        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        *stats.calls_by_number.entry(number).or_insert(0) += 1;
        if !result.success {
            stats.error_count += 1;
            *stats.errors_by_number.entry(number).or_insert(0) += 1;
        }
        if result.is_pending() {
            stats.pending_count += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.stats.lock().total_calls
    }

    pub fn stats(&self) -> SyscallStats {
        self.stats.lock().clone()
    }
}

/// Installs every built-in handler
pub fn register_all(table: &SyscallTable) {
    process::register(table);
    fs::register(table);
    memory::register(table);
    ipc::register(table);
    info::register(table);
}

fn add(table: &SyscallTable, handler: FnHandler) {
    table.register(Arc::new(handler));
}

/// Runs one call through the full pipeline and records it
pub(crate) fn dispatch(kernel: &Kernel, ctx: &SyscallContext, number: u32, args: &[SyscallArg]) -> SyscallResult {
    let result = match run(kernel, ctx, number, args) {
        Ok(result) => result,
        Err(err) => {
            let level = if err.kind() == ErrorKind::InvariantViolation {
                LogLevel::Critical
            } else {
                LogLevel::Debug
            };
            kernel.klog(
                level,
                LogFacility::Syscall,
                format!("{} from pid {} failed: {}", kernel.syscall_name(number), ctx.pid, err),
                LogContext::thread(ctx.pid, ctx.tid),
            );
            SyscallResult::from_error(&err)
        }
    };
    kernel.syscall_table().record(number, &result);
    result
}

fn run(kernel: &Kernel, ctx: &SyscallContext, number: u32, args: &[SyscallArg]) -> Result<SyscallResult> {
    // The handler is cloned out so no table lock is held while it runs.
    let handler = match kernel.syscall_table().handler(number) {
        Some(handler) => handler,
        None => {
            return Err(match SyscallNumber::from_raw(number) {
                Some(known) => Error::NotImplemented(format!("syscall {}", known.name())),
                None => Error::InvalidArgument(format!("unknown syscall number {}", number)),
            });
        }
    };
    kernel.check_syscall_as(ctx.pid, handler.name())?;
    if let Some(cap) = handler.required_capability() {
        kernel.require_capability(ctx.pid, cap)?;
    }
    handler.execute(kernel, ctx, args)
}

/// Result of a call that may have suspended the caller
fn blocking_result<T>(outcome: Blocking<T>, ready: impl FnOnce(T) -> SyscallResult) -> SyscallResult {
    match outcome {
        Blocking::Ready(value) => ready(value),
        Blocking::Pending(token) => SyscallResult::pending(token.0),
    }
}

#[cfg(test)]
mod tests {
    use akern_api::INIT_PID;

    use super::*;
    use crate::config::KernelConfig;
    use crate::security::SandboxProfile;

    #[test]
    fn test_unknown_and_unimplemented() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let r = kernel.execute_syscall(499, &[]);
        assert_eq!(r.error_code, akern_api::error::errno::EINVAL);
        let r = kernel.execute_syscall(SyscallNumber::Socket.raw(), &[]);
        assert_eq!(r.error_code, akern_api::error::errno::ENOSYS);
        assert_eq!(kernel.syscall_stats().error_count, 2);
    }

    #[test]
    fn test_sandbox_filter_runs_first() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let pid = kernel.create_process("jail", INIT_PID).unwrap();
        kernel.install_sandbox_profile(SandboxProfile::new("nofork").deny_syscall("fork"));
        kernel.apply_sandbox("nofork", pid).unwrap();

        let r = kernel.execute_syscall_as(pid, SyscallNumber::Fork.raw(), &[]);
        assert!(!r.success);
        assert_eq!(r.error_code, akern_api::error::errno::EACCES);
        assert!(kernel.execute_syscall_as(pid, SyscallNumber::Getpid.raw(), &[]).success);
        assert_eq!(kernel.process_count(), 2);
    }

    #[test]
    fn test_args_type_errors() {
        let raw = [SyscallArg::from("x"), SyscallArg::from(-1i64)];
        let args = Args::new("test", &raw);
        assert_eq!(args.str(0).unwrap(), "x");
        assert!(args.int(0).is_err());
        assert!(args.u32(1).is_err());
        assert_eq!(args.int_or(5, 7).unwrap(), 7);
        assert_eq!(args.bytes(0).unwrap(), b"x");
    }
}
