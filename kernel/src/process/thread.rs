//! Threads

use alloc::string::String;

use akern_api::{Nanoseconds, Pid, Tid};
use akern_memory_management::VirtAddr;

use super::CpuContext;

/// Thread life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// On a CPU
    Running,
    /// Runnable
    Ready,
    /// Waiting on an object
    Blocked,
    /// Timed sleep
    Sleeping,
    /// Gone; kept only until removed from the table
    Terminated,
    /// Exited and waiting to be joined
    Joinable,
}

impl ThreadState {
    /// Whether the thread can run
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::Ready)
    }

    /// Whether the thread has exited
    pub fn has_exited(self) -> bool {
        matches!(self, ThreadState::Terminated | ThreadState::Joinable)
    }
}

/// One thread of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    pub name: String,
    pub state: ThreadState,
    pub priority: i32,
    /// Lowest address of the stack area
    pub stack_base: VirtAddr,
    pub stack_size: u64,
    pub context: CpuContext,
    pub tls_base: u64,
    pub cpu_time_ns: Nanoseconds,
    pub detached: bool,
    pub exit_code: Option<i32>,
    pub start_time_ns: Nanoseconds,
}

impl Thread {
    /// Creates a ready thread
    pub fn new(tid: Tid, pid: Pid, name: &str, priority: i32, now: Nanoseconds) -> Self {
        Self {
            tid,
            pid,
            name: name.into(),
            state: ThreadState::Ready,
            priority,
            stack_base: 0,
            stack_size: 0,
            context: CpuContext::default(),
            tls_base: 0,
            cpu_time_ns: 0,
            detached: false,
            exit_code: None,
            start_time_ns: now,
        }
    }

    /// Whether this is the process's main thread
    pub fn is_main(&self) -> bool {
        self.tid == self.pid
    }
}
