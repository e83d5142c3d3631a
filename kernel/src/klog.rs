//! Kernel log
//!
//! A bounded ring of structured entries. When the ring is full the oldest
//! entry is dropped. Every entry is also forwarded to the `log` facade under
//! the target `akern::<facility>`.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{CpuId, Nanoseconds, Pid, Tid};
use spin::Mutex;

/// Severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// System is unusable
    Emergency = 0,
    /// Immediate action required
    Alert,
    /// Critical condition, e.g. a broken invariant
    Critical,
    /// Error condition
    Error,
    /// Warning condition
    Warning,
    /// Normal but significant
    Notice,
    /// Informational
    Info,
    /// Debug detail
    Debug,
    /// Very verbose tracing
    Trace,
}

impl LogLevel {
    /// Level on the `log` facade
    pub fn facade_level(self) -> log::Level {
        match self {
            LogLevel::Emergency | LogLevel::Alert | LogLevel::Critical | LogLevel::Error => {
                log::Level::Error
            }
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Notice | LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }

    /// Level from its syslog number
    pub fn from_raw(raw: i64) -> Option<Self> {
        use LogLevel::*;
        [Emergency, Alert, Critical, Error, Warning, Notice, Info, Debug, Trace]
            .get(usize::try_from(raw).ok()?)
            .copied()
    }
}

/// Subsystem an entry comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogFacility {
    /// Core and boot
    Kernel,
    /// Scheduler
    Scheduler,
    /// Memory manager
    Memory,
    /// IPC objects
    Ipc,
    /// File systems
    Vfs,
    /// Networking
    Network,
    /// Capabilities, sandboxes, cgroups
    Security,
    /// Device drivers
    Driver,
    /// Process life cycle
    Process,
    /// Thread life cycle and sync primitives
    Thread,
    /// Syscall dispatch
    Syscall,
    /// Interrupts
    Interrupt,
    /// Clock and timers
    Timer,
    /// Power management
    Power,
    /// Audit trail
    Audit,
}

impl LogFacility {
    /// Subsystem name stored in entries
    pub fn name(self) -> &'static str {
        match self {
            LogFacility::Kernel => "kernel",
            LogFacility::Scheduler => "sched",
            LogFacility::Memory => "mm",
            LogFacility::Ipc => "ipc",
            LogFacility::Vfs => "vfs",
            LogFacility::Network => "net",
            LogFacility::Security => "security",
            LogFacility::Driver => "driver",
            LogFacility::Process => "process",
            LogFacility::Thread => "thread",
            LogFacility::Syscall => "syscall",
            LogFacility::Interrupt => "irq",
            LogFacility::Timer => "timer",
            LogFacility::Power => "power",
            LogFacility::Audit => "audit",
        }
    }
}

/// One structured log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Monotonic sequence number, starting at 1
    pub sequence: u64,
    /// Severity
    pub level: LogLevel,
    /// Source facility
    pub facility: LogFacility,
    /// Facility name
    pub subsystem: &'static str,
    /// Text
    pub message: String,
    /// Simulated time of the event
    pub timestamp_ns: Nanoseconds,
    /// Process involved, if any
    pub pid: Option<Pid>,
    /// Thread involved, if any
    pub tid: Option<Tid>,
    /// CPU involved, if any
    pub cpu: Option<CpuId>,
}

/// Optional context attached to an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    /// Process
    pub pid: Option<Pid>,
    /// Thread
    pub tid: Option<Tid>,
    /// CPU
    pub cpu: Option<CpuId>,
}

impl LogContext {
    /// Context naming a process
    pub fn pid(pid: Pid) -> Self {
        Self {
            pid: Some(pid),
            ..Self::default()
        }
    }

    /// Context naming a thread of a process
    pub fn thread(pid: Pid, tid: Tid) -> Self {
        Self {
            pid: Some(pid),
            tid: Some(tid),
            cpu: None,
        }
    }

    /// Context naming a CPU
    pub fn cpu(cpu: CpuId) -> Self {
        Self {
            cpu: Some(cpu),
            ..Self::default()
        }
    }
}

struct Ring {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_sequence: u64,
    dropped: u64,
}

/// The kernel log sink
pub struct KernelLog {
    ring: Mutex<Ring>,
}

impl KernelLog {
    /// Creates a log holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::new(),
                capacity: capacity.max(1),
                next_sequence: 1,
                dropped: 0,
            }),
        }
    }

    /// Appends an entry and returns its sequence number
    pub fn record(
        &self,
        level: LogLevel,
        facility: LogFacility,
        message: String,
        timestamp_ns: Nanoseconds,
        ctx: LogContext,
    ) -> u64 {
        log::log!(
            target: "akern",
            level.facade_level(),
            "[{}] {}",
            facility.name(),
            message
        );
        let mut ring = self.ring.lock();
        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        if ring.entries.len() >= ring.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(LogEntry {
            sequence,
            level,
            facility,
            subsystem: facility.name(),
            message,
            timestamp_ns,
            pid: ctx.pid,
            tid: ctx.tid,
            cpu: ctx.cpu,
        });
        sequence
    }

    /// Most recent `count` entries at least as severe as `min_level`, oldest first
    pub fn entries(
        &self,
        min_level: LogLevel,
        facility: Option<LogFacility>,
        count: usize,
    ) -> Vec<LogEntry> {
        let ring = self.ring.lock();
        let mut picked: Vec<LogEntry> = ring
            .entries
            .iter()
            .rev()
            .filter(|e| e.level <= min_level)
            .filter(|e| facility.is_none_or(|f| e.facility == f))
            .take(count)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    /// Drops every entry; sequence numbers keep increasing
    pub fn clear(&self) {
        self.ring.lock().entries.clear();
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.ring.lock().entries.is_empty()
    }

    /// Entries lost to the capacity bound
    pub fn dropped(&self) -> u64 {
        self.ring.lock().dropped
    }
}
