//! Process control blocks and the process table
//!
//! Processes and threads live in two id-keyed maps. Parent, child and
//! thread links are ids looked up in the table, never references.

pub mod manager;
pub mod signal;
pub mod thread;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Gid, INIT_PID, Nanoseconds, Pid, Result, Tid, Uid};
use hashbrown::HashMap;

pub use self::manager::{Cancelled, ExitReport, ProcessManager, SignalOutcome, ThreadExit};
pub use self::signal::{DefaultAction, SigDisposition, SignalSet, SignalState};
pub use self::thread::{Thread, ThreadState};
use crate::sched::{SchedEntity, SchedPolicy};

/// Process life-cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// On a CPU
    Running,
    /// On a run queue
    Ready,
    /// Waiting for a child or a thread
    Blocked,
    /// Timed sleep
    Sleeping,
    /// Stopped by a signal
    Stopped,
    /// Exited, waiting to be reaped
    Zombie,
    /// Reaped
    Dead,
    /// Waiting for I/O
    WaitingIo,
    /// Waiting on a pipe, queue or semaphore
    WaitingIpc,
    /// Waiting on a lock, condition or barrier
    WaitingMutex,
    /// Not interruptible by signals
    Uninterruptible,
}

impl ProcessState {
    /// Whether the process belongs on a run queue
    pub fn is_runnable(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Ready)
    }

    /// Whether the process has exited
    pub fn has_exited(self) -> bool {
        matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }

    /// Whether the process is suspended on a wait
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ProcessState::Blocked
                | ProcessState::Sleeping
                | ProcessState::WaitingIo
                | ProcessState::WaitingIpc
                | ProcessState::WaitingMutex
                | ProcessState::Uninterruptible
        )
    }
}

/// Saved register file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp, r8..r15
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    /// Page table base; the address space id of the owner
    pub cr3: u64,
    pub fs_base: u64,
}

/// Parameters of a new process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Exact pid, or the next free one
    pub pid: Option<Pid>,
    pub ppid: Pid,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Credentials; `None` inherits the parent's
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub policy: SchedPolicy,
    pub priority: u32,
    pub nice: i32,
}

impl ProcessSpec {
    /// Normal-policy child of `ppid`
    pub fn new(name: &str, ppid: Pid) -> Self {
        Self {
            pid: None,
            ppid,
            name: name.into(),
            path: format!("/bin/{}", name),
            args: Vec::new(),
            env: BTreeMap::new(),
            uid: None,
            gid: None,
            policy: SchedPolicy::Normal,
            priority: 0,
            nice: 0,
        }
    }

    /// Requests an exact pid
    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Sets the executable path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the argument vector
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| String::from(*a)).collect();
        self
    }

    /// Sets credentials
    pub fn with_credentials(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Sets the scheduling policy and static priority
    pub fn with_policy(mut self, policy: SchedPolicy, priority: u32) -> Self {
        self.policy = policy;
        self.priority = priority;
        self
    }

    /// Sets niceness
    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = nice;
        self
    }
}

/// Process control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub uid: Uid,
    pub gid: Gid,
    pub euid: Uid,
    pub egid: Gid,
    pub state: ProcessState,
    pub sched: SchedEntity,
    pub context: CpuContext,
    pub context_switches: u64,
    pub cpu_time_ns: Nanoseconds,
    pub start_time_ns: Nanoseconds,
    pub end_time_ns: Option<Nanoseconds>,
    pub page_faults: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub children: Vec<Pid>,
    /// Thread ids, main thread first
    pub threads: Vec<Tid>,
    pub signals: SignalState,
    pub exit_code: Option<i32>,
    pub cwd: String,
}

impl Process {
    /// Builds a ready PCB from a `ProcessSpec`
    pub fn new(pid: Pid, spec: &ProcessSpec, uid: Uid, gid: Gid, sched: SchedEntity, now: Nanoseconds) -> Self {
        Self {
            pid,
            ppid: spec.ppid,
            pgid: pid,
            sid: pid,
            name: spec.name.clone(),
            path: spec.path.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            uid,
            gid,
            euid: uid,
            egid: gid,
            state: ProcessState::Ready,
            sched,
            context: CpuContext {
                cr3: pid as u64,
                ..CpuContext::default()
            },
            context_switches: 0,
            cpu_time_ns: 0,
            start_time_ns: now,
            end_time_ns: None,
            page_faults: 0,
            minor_faults: 0,
            major_faults: 0,
            children: Vec::new(),
            threads: alloc::vec![pid],
            signals: SignalState::default(),
            exit_code: None,
            cwd: String::from("/"),
        }
    }
}

/// Id-keyed registry of processes and threads
pub struct ProcessTable {
    processes: HashMap<Pid, Process>,
    threads: HashMap<Tid, Thread>,
    next_id: u32,
    pid_max: u32,
}

impl ProcessTable {
    /// Creates an empty table; ids wrap after `pid_max`
    pub fn new(pid_max: u32) -> Self {
        Self {
            processes: HashMap::new(),
            threads: HashMap::new(),
            next_id: INIT_PID,
            pid_max: pid_max.max(16),
        }
    }

    /// Next id unused by any process or thread
    pub fn alloc_id(&mut self) -> Result<u32> {
        let span = self.pid_max - 1;
        for _ in 0..span {
            let id = self.next_id;
            self.next_id = if id >= self.pid_max { 2 } else { id + 1 };
            if !self.processes.contains_key(&id) && !self.threads.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::ResourceExhausted("pid space exhausted".into()))
    }

    /// Whether an id is taken by a process or thread
    pub fn id_in_use(&self, id: u32) -> bool {
        self.processes.contains_key(&id) || self.threads.contains_key(&id)
    }

    /// Adds a process
    pub fn insert(&mut self, process: Process) -> Result<()> {
        if self.id_in_use(process.pid) {
            return Err(Error::AlreadyExists(format!("pid {}", process.pid)));
        }
        self.processes.insert(process.pid, process);
        Ok(())
    }

    /// Removes a process
    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Looks a process up
    pub fn get(&self, pid: Pid) -> Result<&Process> {
        self.processes
            .get(&pid)
            .ok_or_else(|| Error::NotFound(format!("pid {}", pid)))
    }

    /// Looks a process up mutably
    pub fn get_mut(&mut self, pid: Pid) -> Result<&mut Process> {
        self.processes
            .get_mut(&pid)
            .ok_or_else(|| Error::NotFound(format!("pid {}", pid)))
    }

    /// Whether a pid exists
    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Every process, ordered by pid
    pub fn iter(&self) -> impl Iterator<Item = &Process> + '_ {
        let mut all: Vec<&Process> = self.processes.values().collect();
        all.sort_by_key(|p| p.pid);
        all.into_iter()
    }

    /// Every pid, ascending
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Number of processes
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Adds a thread
    pub fn insert_thread(&mut self, thread: Thread) -> Result<()> {
        if self.threads.contains_key(&thread.tid) {
            return Err(Error::AlreadyExists(format!("tid {}", thread.tid)));
        }
        self.threads.insert(thread.tid, thread);
        Ok(())
    }

    /// Removes a thread
    pub fn remove_thread(&mut self, tid: Tid) -> Option<Thread> {
        self.threads.remove(&tid)
    }

    /// Looks a thread up
    pub fn thread(&self, tid: Tid) -> Result<&Thread> {
        self.threads
            .get(&tid)
            .ok_or_else(|| Error::NotFound(format!("tid {}", tid)))
    }

    /// Looks a thread up mutably
    pub fn thread_mut(&mut self, tid: Tid) -> Result<&mut Thread> {
        self.threads
            .get_mut(&tid)
            .ok_or_else(|| Error::NotFound(format!("tid {}", tid)))
    }

    /// Threads of a process in creation order
    pub fn threads_of(&self, pid: Pid) -> Vec<&Thread> {
        match self.processes.get(&pid) {
            Some(p) => p.threads.iter().filter_map(|t| self.threads.get(t)).collect(),
            None => Vec::new(),
        }
    }

    /// Number of threads
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Whether any thread of `pid` can run
    pub fn has_runnable_thread(&self, pid: Pid) -> bool {
        self.threads_of(pid).iter().any(|t| t.state.is_runnable())
    }

    /// Whether `ancestor` is `pid` or one of its ancestors
    pub fn is_ancestor(&self, ancestor: Pid, pid: Pid) -> bool {
        let mut cursor = pid;
        for _ in 0..=self.processes.len() {
            if cursor == ancestor {
                return true;
            }
            match self.processes.get(&cursor) {
                Some(p) if p.ppid != cursor && cursor != INIT_PID => cursor = p.ppid,
                _ => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcb(pid: Pid, ppid: Pid) -> Process {
        Process::new(pid, &ProcessSpec::new("t", ppid), 0, 0, SchedEntity::default(), 0)
    }

    #[test]
    fn test_alloc_skips_threads_and_processes() {
        let mut table = ProcessTable::new(100);
        assert_eq!(table.alloc_id().unwrap(), 1);
        table.insert(pcb(2, 1)).unwrap();
        table.insert_thread(Thread::new(3, 2, "w", 0, 0)).unwrap();
        assert_eq!(table.alloc_id().unwrap(), 4);
        assert!(table.insert(pcb(2, 1)).is_err());
    }

    #[test]
    fn test_ancestry() {
        let mut table = ProcessTable::new(100);
        table.insert(pcb(1, 0)).unwrap();
        table.insert(pcb(5, 1)).unwrap();
        table.insert(pcb(9, 5)).unwrap();
        assert!(table.is_ancestor(1, 9));
        assert!(table.is_ancestor(5, 9));
        assert!(!table.is_ancestor(9, 5));
    }
}
