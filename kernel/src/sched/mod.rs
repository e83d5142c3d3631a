//! Multi-policy scheduler
//!
//! Every CPU owns a [`RunQueue`] with three lanes. A pick walks the classes
//! in precedence order and takes the first class with a runnable task:
//!
//! 1. Deadline (earliest absolute deadline, reservation not exhausted)
//! 2. FIFO / RoundRobin (highest static priority, arrival order)
//! 3. Normal / Batch (minimum vruntime)
//! 4. MLFQ (highest level)
//! 5. Stride (minimum pass)
//! 6. Lottery (ticket draw)
//! 7. Idle
//!
//! The scheduler never runs guest code. Time is charged to the running task
//! from its dispatch stamp whenever the CPU is rescheduled.

pub mod load;
pub mod lottery;
pub mod runqueue;

use alloc::format;
use alloc::vec::Vec;

use akern_api::{CpuId, Error, Nanoseconds, Pid, Result};
use static_assertions::const_assert_eq;

pub use self::load::LoadAverage;
pub use self::lottery::XorShift64;
pub use self::runqueue::{RunQueue, RunQueueInfo};
use crate::config::KernelConfig;
use crate::process::{ProcessTable, ThreadState};

/// Weight of a nice-0 task
pub const NICE_0_WEIGHT: u32 = 1024;

/// Stride numerator; stride = `STRIDE1 / tickets`
pub const STRIDE1: u64 = 1 << 20;

/// Lowest niceness
pub const MIN_NICE: i32 = -20;
/// Highest niceness
pub const MAX_NICE: i32 = 19;
/// Highest realtime priority
pub const MAX_RT_PRIO: u32 = 99;

/// Load weight for nice -20..=19
pub const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110,
    87, 70, 56, 45, 36, 29, 23, 18, 15,
];

const_assert_eq!(NICE_TO_WEIGHT[20], NICE_0_WEIGHT);

/// Weight for a niceness, clamped to the valid range
pub fn nice_to_weight(nice: i32) -> u32 {
    NICE_TO_WEIGHT[(nice.clamp(MIN_NICE, MAX_NICE) - MIN_NICE) as usize]
}

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedPolicy {
    /// CFS
    #[default]
    Normal,
    /// Realtime FIFO
    Fifo,
    /// Realtime round robin
    RoundRobin,
    /// CFS, batch hint
    Batch,
    /// Runs only when nothing else can
    Idle,
    /// Earliest deadline first
    Deadline,
    /// Multi-level feedback queue
    Mlfq,
    /// Lottery
    Lottery,
    /// Stride
    Stride,
}

impl SchedPolicy {
    /// Lane the policy is queued in
    pub fn lane(self) -> Lane {
        match self {
            SchedPolicy::Fifo | SchedPolicy::RoundRobin | SchedPolicy::Deadline => Lane::Realtime,
            SchedPolicy::Idle => Lane::Idle,
            _ => Lane::Normal,
        }
    }

    /// Whether the policy takes a realtime priority
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
    }

    /// Whether the policy is weighted by niceness
    pub fn is_fair(self) -> bool {
        matches!(self, SchedPolicy::Normal | SchedPolicy::Batch)
    }

    /// Policy from its numeric code
    pub fn from_raw(raw: i64) -> Option<Self> {
        use SchedPolicy::*;
        [Normal, Fifo, RoundRobin, Batch, Idle, Deadline, Mlfq, Lottery, Stride]
            .get(usize::try_from(raw).ok()?)
            .copied()
    }

    /// Numeric code
    pub fn raw(self) -> i64 {
        self as i64
    }
}

/// Run-queue lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Realtime,
    Normal,
    Idle,
}

/// EDF reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeadlineParams {
    /// Budget per period
    pub runtime_ns: Nanoseconds,
    /// Relative deadline
    pub deadline_ns: Nanoseconds,
    /// Period
    pub period_ns: Nanoseconds,
}

impl Default for DeadlineParams {
    fn default() -> Self {
        Self {
            runtime_ns: 10_000_000,
            deadline_ns: 100_000_000,
            period_ns: 100_000_000,
        }
    }
}

/// Scheduling state carried in the PCB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedEntity {
    pub policy: SchedPolicy,
    /// Static realtime priority, 0 for other policies
    pub priority: u32,
    pub nice: i32,
    pub weight: u32,
    pub vruntime: u64,
    pub deadline: DeadlineParams,
    /// Absolute deadline of the current period
    pub abs_deadline: Nanoseconds,
    /// Budget consumed in the current period
    pub runtime_used: Nanoseconds,
    pub tickets: u32,
    pub stride: u64,
    pub pass: u64,
    pub mlfq_level: usize,
    /// Time used of the current RR or MLFQ slice
    pub slice_used: Nanoseconds,
    /// CPU the task is queued on or last ran on
    pub cpu: CpuId,
    /// Allowed CPUs, bit per CPU
    pub affinity: u64,
    /// When the task was last dispatched
    pub last_dispatch: Nanoseconds,
    /// Whether the task sits on a run queue
    pub queued: bool,
}

impl Default for SchedEntity {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Normal,
            priority: 0,
            nice: 0,
            weight: NICE_0_WEIGHT,
            vruntime: 0,
            deadline: DeadlineParams::default(),
            abs_deadline: 0,
            runtime_used: 0,
            tickets: 100,
            stride: STRIDE1 / 100,
            pass: 0,
            mlfq_level: 0,
            slice_used: 0,
            cpu: 0,
            affinity: u64::MAX,
            last_dispatch: 0,
            queued: false,
        }
    }
}

/// Scheduler tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    pub num_cpus: u32,
    pub min_granularity_ns: Nanoseconds,
    pub rr_timeslice_ns: Nanoseconds,
    pub mlfq_levels: usize,
    pub mlfq_base_quantum_ns: Nanoseconds,
    pub mlfq_boost_interval_ns: Nanoseconds,
    pub default_tickets: u32,
    pub lottery_seed: u64,
}

impl From<&KernelConfig> for SchedConfig {
    fn from(config: &KernelConfig) -> Self {
        Self {
            num_cpus: config.num_cpus.clamp(1, 64),
            min_granularity_ns: config.sched_min_granularity_ns,
            rr_timeslice_ns: config.rr_timeslice_ns.max(1),
            mlfq_levels: config.mlfq_levels.max(1),
            mlfq_base_quantum_ns: config.mlfq_base_quantum_ns.max(1),
            mlfq_boost_interval_ns: config.mlfq_boost_interval_ns,
            default_tickets: config.default_tickets,
            lottery_seed: config.lottery_seed,
        }
    }
}

/// Something the kernel should log after a scheduler call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedEvent {
    /// A deadline task missed its deadline and was demoted to Normal
    DeadlineMiss { pid: Pid, deadline: Nanoseconds },
    /// An MLFQ task used a full quantum
    MlfqDemoted { pid: Pid, level: usize },
    /// Every MLFQ task went back to the top level
    MlfqBoost,
    /// A task moved to another CPU
    Migrated { pid: Pid, from: CpuId, to: CpuId },
    /// A run queue's weight sum had drifted and was recomputed
    WeightDrift { cpu: CpuId, recorded: u64, actual: u64 },
    /// A missed deadline could not be turned into a Normal requeue
    DemotionFailed { pid: Pid, error: Error },
}

enum Pick {
    Task(Pid),
    Stride(Pid),
    Lottery(Vec<(Pid, u64)>),
    Nothing,
}

/// Result of one reschedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub cpu: CpuId,
    pub previous: Option<Pid>,
    pub next: Option<Pid>,
    /// Time charged to the previous task
    pub charged: Option<(Pid, Nanoseconds)>,
    pub switched: bool,
}

/// The scheduler: run queues plus policy state
pub struct Scheduler {
    config: SchedConfig,
    queues: Vec<RunQueue>,
    rng: XorShift64,
    events: Vec<SchedEvent>,
    last_boost: Nanoseconds,
    load: LoadAverage,
    switches: u64,
}

impl Scheduler {
    /// Creates one empty run queue per CPU
    pub fn new(config: SchedConfig) -> Self {
        let queues = (0..config.num_cpus).map(RunQueue::new).collect();
        let rng = XorShift64::new(config.lottery_seed);
        Self {
            config,
            queues,
            rng,
            events: Vec::new(),
            last_boost: 0,
            load: LoadAverage::default(),
            switches: 0,
        }
    }

    /// Number of CPUs
    pub fn num_cpus(&self) -> u32 {
        self.queues.len() as u32
    }

    /// Mask of every CPU
    pub fn cpu_mask(&self) -> u64 {
        if self.queues.len() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.queues.len()) - 1
        }
    }

    /// Checks a policy and priority pair
    pub fn validate_policy(policy: SchedPolicy, priority: u32) -> Result<()> {
        if policy.is_realtime() {
            if !(1..=MAX_RT_PRIO).contains(&priority) {
                return Err(Error::InvalidArgument(format!(
                    "realtime priority {} outside 1..={}",
                    priority, MAX_RT_PRIO
                )));
            }
        } else if priority != 0 {
            return Err(Error::InvalidArgument(format!(
                "{:?} takes no static priority",
                policy
            )));
        }
        Ok(())
    }

    /// Builds the scheduling state of a new task
    pub fn new_entity(&self, policy: SchedPolicy, priority: u32, nice: i32) -> Result<SchedEntity> {
        Self::validate_policy(policy, priority)?;
        if !(MIN_NICE..=MAX_NICE).contains(&nice) {
            return Err(Error::InvalidArgument(format!("nice {} outside -20..=19", nice)));
        }
        let tickets = self.config.default_tickets;
        Ok(SchedEntity {
            policy,
            priority,
            nice,
            weight: nice_to_weight(nice),
            tickets,
            stride: STRIDE1 / u64::from(tickets.max(1)),
            ..SchedEntity::default()
        })
    }

    fn rq(&self, cpu: CpuId) -> Result<&RunQueue> {
        self.queues
            .get(cpu as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("cpu {} does not exist", cpu)))
    }

    /// Least loaded CPU allowed by `mask`
    pub fn least_loaded(&self, mask: u64) -> Option<CpuId> {
        self.queues
            .iter()
            .filter(|rq| mask & (1u64 << rq.cpu) != 0)
            .min_by_key(|rq| (rq.nr_running(), rq.cpu))
            .map(|rq| rq.cpu)
    }

    /// Puts a task on a run queue
    ///
    /// `fresh` places the task as new: CFS at the queue's minimum vruntime,
    /// stride at the lane's minimum pass, deadline at a new period.
    pub fn enqueue(&mut self, pid: Pid, table: &mut ProcessTable, now: Nanoseconds, fresh: bool) -> Result<()> {
        let mask = self.cpu_mask();
        let p = table.get_mut(pid)?;
        if p.sched.queued {
            return Ok(());
        }
        let allowed = p.sched.affinity & mask;
        let cpu = if allowed & (1u64 << p.sched.cpu.min(63)) != 0 && p.sched.cpu < self.num_cpus() && !fresh {
            p.sched.cpu
        } else {
            self.least_loaded(allowed)
                .ok_or_else(|| Error::InvalidArgument(format!("pid {} has an empty affinity mask", pid)))?
        };

        let lane = p.sched.policy.lane();
        let min_pass = self.min_pass(cpu, table);
        let p = table.get_mut(pid)?;
        let rq = &mut self.queues[cpu as usize];
        let se = &mut p.sched;
        match se.policy {
            SchedPolicy::Normal | SchedPolicy::Batch => {
                se.vruntime = if fresh {
                    rq.min_vruntime
                } else {
                    se.vruntime
                        .max(rq.min_vruntime.saturating_sub(self.config.min_granularity_ns))
                };
                rq.total_weight += u64::from(se.weight);
            }
            SchedPolicy::Stride => {
                se.pass = se.pass.max(min_pass.unwrap_or(0));
            }
            SchedPolicy::Deadline => {
                if fresh || se.abs_deadline <= now {
                    se.abs_deadline = now.saturating_add(se.deadline.deadline_ns);
                    se.runtime_used = 0;
                }
            }
            _ => {}
        }
        se.cpu = cpu;
        se.queued = true;
        se.last_dispatch = now;
        if !p.state.is_runnable() {
            p.state = crate::process::ProcessState::Ready;
        }
        rq.lane_mut(lane).push(pid);
        Ok(())
    }

    /// Takes a task off its run queue, saving its context if it was running
    pub fn dequeue(&mut self, pid: Pid, table: &mut ProcessTable) -> Result<()> {
        let p = table.get_mut(pid)?;
        if !p.sched.queued {
            return Ok(());
        }
        let rq = self
            .queues
            .get_mut(p.sched.cpu as usize)
            .ok_or_else(|| Error::InvariantViolation(format!("pid {} queued on a missing cpu", pid)))?;
        if rq.current == Some(pid) {
            p.context = rq.context;
        }
        rq.remove(pid);
        if p.sched.policy.is_fair() {
            rq.total_weight = rq.total_weight.saturating_sub(u64::from(p.sched.weight));
        }
        p.sched.queued = false;
        for tid in p.threads.clone() {
            if let Ok(t) = table.thread_mut(tid) {
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                }
            }
        }
        Ok(())
    }

    fn min_pass(&self, cpu: CpuId, table: &ProcessTable) -> Option<u64> {
        self.queues.get(cpu as usize)?
            .normal
            .iter()
            .filter_map(|pid| table.get(*pid).ok())
            .filter(|p| p.sched.policy == SchedPolicy::Stride)
            .map(|p| p.sched.pass)
            .min()
    }

    /// Running task of a CPU
    pub fn current(&self, cpu: CpuId) -> Option<Pid> {
        self.queues.get(cpu as usize).and_then(|rq| rq.current)
    }

    /// CPU currently running `pid`
    pub fn cpu_of_current(&self, pid: Pid) -> Option<CpuId> {
        self.queues.iter().find(|rq| rq.current == Some(pid)).map(|rq| rq.cpu)
    }

    /// Charges the running task of `cpu` for the time since its dispatch
    pub fn charge(&mut self, cpu: CpuId, table: &mut ProcessTable, now: Nanoseconds) -> Option<(Pid, Nanoseconds)> {
        let pid = self.queues.get(cpu as usize)?.current?;
        let levels = self.config.mlfq_levels;
        let base_quantum = self.config.mlfq_base_quantum_ns;
        let rr_slice = self.config.rr_timeslice_ns;
        let p = table.get_mut(pid).ok()?;
        let delta = now.saturating_sub(p.sched.last_dispatch);
        p.sched.last_dispatch = now;
        if delta == 0 {
            return None;
        }
        p.cpu_time_ns += delta;
        let threads = p.threads.clone();

        let mut rotate = None;
        let se = &mut p.sched;
        match se.policy {
            SchedPolicy::Normal | SchedPolicy::Batch => {
                let scaled = u128::from(delta) * u128::from(NICE_0_WEIGHT) / u128::from(se.weight.max(1));
                se.vruntime = se.vruntime.saturating_add(scaled.min(u128::from(u64::MAX)) as u64);
            }
            SchedPolicy::RoundRobin => {
                se.slice_used += delta;
                if se.slice_used >= rr_slice {
                    se.slice_used = 0;
                    rotate = Some(Lane::Realtime);
                }
            }
            SchedPolicy::Mlfq => {
                se.slice_used += delta;
                let quantum = base_quantum.saturating_mul(1u64 << se.mlfq_level.min(32));
                if se.slice_used >= quantum {
                    se.slice_used = 0;
                    if se.mlfq_level + 1 < levels {
                        se.mlfq_level += 1;
                        self.events.push(SchedEvent::MlfqDemoted {
                            pid,
                            level: se.mlfq_level,
                        });
                    }
                    rotate = Some(Lane::Normal);
                }
            }
            SchedPolicy::Deadline => {
                se.runtime_used = se.runtime_used.saturating_add(delta);
            }
            _ => {}
        }
        let running = threads
            .iter()
            .copied()
            .find(|t| table.thread(*t).is_ok_and(|t| t.state == ThreadState::Running))
            .or(threads.first().copied());
        if let Some(tid) = running {
            if let Ok(t) = table.thread_mut(tid) {
                t.cpu_time_ns += delta;
            }
        }
        if let Some(lane) = rotate {
            self.queues[cpu as usize].rotate(lane, pid);
        }
        self.update_min_vruntime(cpu, table);
        Some((pid, delta))
    }

    fn update_min_vruntime(&mut self, cpu: CpuId, table: &ProcessTable) {
        let Some(rq) = self.queues.get_mut(cpu as usize) else {
            return;
        };
        let min = rq
            .normal
            .iter()
            .filter_map(|pid| table.get(*pid).ok())
            .filter(|p| p.sched.policy.is_fair())
            .map(|p| p.sched.vruntime)
            .min();
        if let Some(min) = min {
            rq.min_vruntime = rq.min_vruntime.max(min);
        }
    }

    /// Chooses the next task for `cpu` without switching to it
    ///
    /// Stride passes advance here, once per selection.
    pub fn pick_next(&mut self, cpu: CpuId, table: &mut ProcessTable, throttled: &[Pid]) -> Option<Pid> {
        let pick = Self::select(self.queues.get(cpu as usize)?, table, throttled);
        match pick {
            Pick::Task(pid) => Some(pid),
            Pick::Stride(pid) => {
                if let Ok(p) = table.get_mut(pid) {
                    p.sched.pass = p.sched.pass.saturating_add(p.sched.stride);
                }
                Some(pid)
            }
            Pick::Lottery(entrants) => Some(self.draw(&entrants)),
            Pick::Nothing => None,
        }
    }

    fn select(rq: &RunQueue, table: &ProcessTable, throttled: &[Pid]) -> Pick {
        let rt = runnable(&rq.realtime, table, throttled);
        let edf = best(
            &rt,
            |se| se.policy == SchedPolicy::Deadline && se.runtime_used < se.deadline.runtime_ns,
            |se| se.abs_deadline,
        );
        if let Some(pid) = edf {
            return Pick::Task(pid);
        }
        if let Some(pid) = best(&rt, |se| se.policy.is_realtime(), |se| core::cmp::Reverse(se.priority)) {
            return Pick::Task(pid);
        }

        let normal = runnable(&rq.normal, table, throttled);
        if let Some(pid) = best(&normal, |se| se.policy.is_fair(), |se| se.vruntime) {
            return Pick::Task(pid);
        }
        if let Some(pid) = best(&normal, |se| se.policy == SchedPolicy::Mlfq, |se| se.mlfq_level) {
            return Pick::Task(pid);
        }
        if let Some(pid) = best(&normal, |se| se.policy == SchedPolicy::Stride, |se| se.pass) {
            return Pick::Stride(pid);
        }
        let lottery: Vec<(Pid, u64)> = normal
            .iter()
            .filter(|(_, _, se)| se.policy == SchedPolicy::Lottery)
            .map(|(_, pid, se)| (*pid, u64::from(se.tickets)))
            .collect();
        if !lottery.is_empty() {
            return Pick::Lottery(lottery);
        }

        match runnable(&rq.idle, table, throttled).first() {
            Some((_, pid, _)) => Pick::Task(*pid),
            None => Pick::Nothing,
        }
    }

    /// Draws a winner; zero-ticket entrants only run when nobody holds tickets
    fn draw(&mut self, entrants: &[(Pid, u64)]) -> Pid {
        let total: u64 = entrants.iter().map(|(_, t)| t).sum();
        if total == 0 {
            return entrants[0].0;
        }
        let mut winner = self.rng.below(total);
        for (pid, t) in entrants {
            if winner < *t {
                return *pid;
            }
            winner -= t;
        }
        entrants[0].0
    }

    /// Switches `cpu` to `next`, saving and restoring register files
    ///
    /// Returns whether the running task changed.
    pub fn context_switch(
        &mut self,
        cpu: CpuId,
        next: Option<Pid>,
        table: &mut ProcessTable,
        now: Nanoseconds,
    ) -> Result<bool> {
        let prev = self.rq(cpu)?.current;
        if let Some(n) = next {
            let p = table.get(n)?;
            if !p.sched.queued || p.sched.cpu != cpu || !p.state.is_runnable() {
                return Err(Error::InvalidArgument(format!(
                    "pid {} is not runnable on cpu {}",
                    n, cpu
                )));
            }
        }
        if prev == next {
            return Ok(false);
        }
        let rq = &mut self.queues[cpu as usize];
        if let Some(prev) = prev {
            if let Ok(p) = table.get_mut(prev) {
                p.context = rq.context;
                p.context_switches += 1;
                if p.state == crate::process::ProcessState::Running {
                    p.state = crate::process::ProcessState::Ready;
                }
                for tid in p.threads.clone() {
                    if let Ok(t) = table.thread_mut(tid) {
                        if t.state == ThreadState::Running {
                            t.state = ThreadState::Ready;
                        }
                    }
                }
            }
        }
        if let Some(next) = next {
            let p = table.get_mut(next)?;
            rq.context = p.context;
            p.context_switches += 1;
            p.state = crate::process::ProcessState::Running;
            p.sched.last_dispatch = now;
            let threads = p.threads.clone();
            if let Some(tid) = threads
                .into_iter()
                .find(|t| table.thread(*t).is_ok_and(|t| t.state == ThreadState::Ready))
            {
                table.thread_mut(tid)?.state = ThreadState::Running;
            }
        }
        rq.current = next;
        rq.switches += 1;
        self.switches += 1;
        Ok(true)
    }

    /// Charges, picks and switches one CPU
    pub fn schedule_cpu(
        &mut self,
        cpu: CpuId,
        table: &mut ProcessTable,
        throttled: &[Pid],
        now: Nanoseconds,
    ) -> Result<ScheduleOutcome> {
        self.rq(cpu)?;
        self.queues[cpu as usize].clock_ticks += 1;
        let charged = self.charge(cpu, table, now);
        self.check_weight(cpu, table);
        self.check_deadlines(table, now);
        let previous = self.queues[cpu as usize].current;
        let next = self.pick_next(cpu, table, throttled);
        let switched = self.context_switch(cpu, next, table, now)?;
        Ok(ScheduleOutcome {
            cpu,
            previous,
            next,
            charged,
            switched,
        })
    }

    /// Recomputes a queue's weight sum if it drifted, recording an event
    fn check_weight(&mut self, cpu: CpuId, table: &ProcessTable) {
        let Some(rq) = self.queues.get_mut(cpu as usize) else {
            return;
        };
        let actual: u64 = rq
            .normal
            .iter()
            .filter_map(|pid| table.get(*pid).ok())
            .filter(|p| p.sched.policy.is_fair())
            .map(|p| u64::from(p.sched.weight))
            .sum();
        if actual != rq.total_weight {
            self.events.push(SchedEvent::WeightDrift {
                cpu,
                recorded: rq.total_weight,
                actual,
            });
            rq.total_weight = actual;
        }
    }

    /// Verifies the weight invariant on every CPU
    pub fn verify(&self, table: &ProcessTable) -> Result<()> {
        for rq in &self.queues {
            let actual: u64 = rq
                .normal
                .iter()
                .filter_map(|pid| table.get(*pid).ok())
                .filter(|p| p.sched.policy.is_fair())
                .map(|p| u64::from(p.sched.weight))
                .sum();
            if actual != rq.total_weight {
                return Err(Error::InvariantViolation(format!(
                    "cpu {} total weight {} != {}",
                    rq.cpu, rq.total_weight, actual
                )));
            }
        }
        Ok(())
    }

    /// Replenishes met reservations and demotes deadline tasks that missed
    pub fn check_deadlines(&mut self, table: &mut ProcessTable, now: Nanoseconds) {
        let queued: Vec<Pid> = self.queues.iter().flat_map(|rq| rq.realtime.iter().copied()).collect();
        for pid in queued {
            let Ok(p) = table.get_mut(pid) else {
                continue;
            };
            if p.sched.policy != SchedPolicy::Deadline || now < p.sched.abs_deadline {
                continue;
            }
            let se = &mut p.sched;
            if se.runtime_used >= se.deadline.runtime_ns {
                se.abs_deadline = se.abs_deadline.saturating_add(se.deadline.period_ns.max(1));
                se.runtime_used = 0;
                if now < se.abs_deadline {
                    continue;
                }
            }
            let deadline = se.abs_deadline;
            self.events.push(SchedEvent::DeadlineMiss { pid, deadline });
            if let Err(error) = self.change_policy(pid, SchedPolicy::Normal, 0, table, now) {
                self.events.push(SchedEvent::DemotionFailed { pid, error });
            }
        }
    }

    fn change_policy(
        &mut self,
        pid: Pid,
        policy: SchedPolicy,
        priority: u32,
        table: &mut ProcessTable,
        now: Nanoseconds,
    ) -> Result<()> {
        let was_queued = table.get(pid)?.sched.queued;
        let was_current = self.cpu_of_current(pid);
        self.dequeue(pid, table)?;
        {
            let se = &mut table.get_mut(pid)?.sched;
            se.policy = policy;
            se.priority = priority;
            se.slice_used = 0;
            se.mlfq_level = 0;
            se.runtime_used = 0;
        }
        if was_queued {
            self.enqueue(pid, table, now, true)?;
            if let Some(cpu) = was_current {
                let p = table.get(pid)?;
                if p.sched.cpu == cpu {
                    self.queues[cpu as usize].current = Some(pid);
                }
            }
        }
        Ok(())
    }

    /// Global MLFQ boost and load-average sampling
    pub fn tick(&mut self, table: &mut ProcessTable, now: Nanoseconds) {
        let interval = self.config.mlfq_boost_interval_ns;
        if interval > 0 && now.saturating_sub(self.last_boost) >= interval {
            self.last_boost = now;
            let mut boosted = false;
            for pid in self.queues.iter().flat_map(|rq| rq.normal.iter().copied()).collect::<Vec<_>>() {
                if let Ok(p) = table.get_mut(pid) {
                    if p.sched.policy == SchedPolicy::Mlfq && p.sched.mlfq_level > 0 {
                        p.sched.mlfq_level = 0;
                        p.sched.slice_used = 0;
                        boosted = true;
                    }
                }
            }
            if boosted {
                self.events.push(SchedEvent::MlfqBoost);
            }
        }
        let runnable = self.nr_running();
        self.load.update(now, runnable);
    }

    /// Moves a task to the tail of its lane
    pub fn yield_task(&mut self, pid: Pid, table: &mut ProcessTable) -> Result<()> {
        let p = table.get(pid)?;
        if !p.sched.queued {
            return Err(Error::InvalidArgument(format!("pid {} is not runnable", pid)));
        }
        let (cpu, policy) = (p.sched.cpu, p.sched.policy);
        if policy.is_fair() {
            let max = self.queues[cpu as usize]
                .normal
                .iter()
                .filter_map(|q| table.get(*q).ok())
                .filter(|q| q.sched.policy.is_fair())
                .map(|q| q.sched.vruntime)
                .max()
                .unwrap_or(0);
            let se = &mut table.get_mut(pid)?.sched;
            se.vruntime = se.vruntime.max(max);
        }
        self.queues[cpu as usize].rotate(policy.lane(), pid);
        Ok(())
    }

    /// Changes policy and static priority
    pub fn set_policy(
        &mut self,
        pid: Pid,
        policy: SchedPolicy,
        priority: u32,
        table: &mut ProcessTable,
        now: Nanoseconds,
    ) -> Result<()> {
        Self::validate_policy(policy, priority)?;
        self.change_policy(pid, policy, priority, table, now)
    }

    /// Changes the realtime priority without touching the policy
    pub fn set_priority(&mut self, pid: Pid, priority: u32, table: &mut ProcessTable) -> Result<()> {
        let se = &mut table.get_mut(pid)?.sched;
        Self::validate_policy(se.policy, priority)?;
        se.priority = priority;
        Ok(())
    }

    /// Changes niceness and weight
    pub fn set_nice(&mut self, pid: Pid, nice: i32, table: &mut ProcessTable) -> Result<()> {
        if !(MIN_NICE..=MAX_NICE).contains(&nice) {
            return Err(Error::InvalidArgument(format!("nice {} outside -20..=19", nice)));
        }
        let p = table.get_mut(pid)?;
        let old = u64::from(p.sched.weight);
        p.sched.nice = nice;
        p.sched.weight = nice_to_weight(nice);
        if p.sched.queued && p.sched.policy.is_fair() {
            let rq = &mut self.queues[p.sched.cpu as usize];
            rq.total_weight = rq.total_weight.saturating_sub(old) + u64::from(p.sched.weight);
        }
        Ok(())
    }

    /// Sets lottery tickets and the derived stride
    pub fn set_tickets(&mut self, pid: Pid, tickets: u32, table: &mut ProcessTable) -> Result<()> {
        let se = &mut table.get_mut(pid)?.sched;
        se.tickets = tickets;
        se.stride = STRIDE1 / u64::from(tickets.max(1));
        if tickets == 0 {
            se.stride = STRIDE1;
        }
        Ok(())
    }

    /// Configures an EDF reservation; requires `0 < runtime <= deadline <= period`
    pub fn set_deadline_params(
        &mut self,
        pid: Pid,
        params: DeadlineParams,
        table: &mut ProcessTable,
        now: Nanoseconds,
    ) -> Result<()> {
        if params.runtime_ns == 0
            || params.runtime_ns > params.deadline_ns
            || params.deadline_ns > params.period_ns
        {
            return Err(Error::InvalidArgument(
                "deadline parameters must satisfy 0 < runtime <= deadline <= period".into(),
            ));
        }
        let se = &mut table.get_mut(pid)?.sched;
        se.deadline = params;
        if se.policy == SchedPolicy::Deadline {
            se.abs_deadline = now.saturating_add(params.deadline_ns);
            se.runtime_used = 0;
        }
        Ok(())
    }

    /// Restricts a task to `mask`, migrating it if its CPU left the mask
    pub fn set_affinity(&mut self, pid: Pid, mask: u64, table: &mut ProcessTable, now: Nanoseconds) -> Result<()> {
        let allowed = mask & self.cpu_mask();
        if allowed == 0 {
            return Err(Error::InvalidArgument(format!(
                "affinity mask {:#x} selects no cpu",
                mask
            )));
        }
        let p = table.get_mut(pid)?;
        p.sched.affinity = mask;
        let from = p.sched.cpu;
        if allowed & (1u64 << from.min(63)) != 0 {
            return Ok(());
        }
        let to = self
            .least_loaded(allowed)
            .ok_or_else(|| Error::InvalidArgument("no cpu in mask".into()))?;
        if p.sched.queued {
            self.dequeue(pid, table)?;
            table.get_mut(pid)?.sched.cpu = to;
            self.enqueue(pid, table, now, false)?;
        } else {
            p.sched.cpu = to;
        }
        self.events.push(SchedEvent::Migrated { pid, from, to });
        Ok(())
    }

    /// Snapshot of one run queue
    pub fn run_queue_info(&self, cpu: CpuId) -> Result<RunQueueInfo> {
        Ok(self.rq(cpu)?.info())
    }

    /// Runnable tasks over every CPU
    pub fn nr_running(&self) -> usize {
        self.queues.iter().map(RunQueue::nr_running).sum()
    }

    /// 1, 5 and 15 minute load averages
    pub fn load_average(&self) -> [f64; 3] {
        self.load.as_array()
    }

    /// Context switches over every CPU
    pub fn total_switches(&self) -> u64 {
        self.switches
    }

    /// Takes the events recorded since the last call
    pub fn drain_events(&mut self) -> Vec<SchedEvent> {
        core::mem::take(&mut self.events)
    }
}

/// Runnable, unthrottled members of a lane with their queue position
fn runnable<'a>(lane: &[Pid], table: &'a ProcessTable, throttled: &[Pid]) -> Vec<(usize, Pid, &'a SchedEntity)> {
    lane.iter()
        .enumerate()
        .filter(|(_, pid)| !throttled.contains(pid))
        .filter_map(|(i, pid)| {
            let p = table.get(*pid).ok()?;
            p.state.is_runnable().then_some((i, *pid, &p.sched))
        })
        .collect()
}

/// Member with the smallest key among those matching `filter`; ties go to
/// the earliest queued
fn best<K: Ord>(
    candidates: &[(usize, Pid, &SchedEntity)],
    filter: impl Fn(&SchedEntity) -> bool,
    key: impl Fn(&SchedEntity) -> K,
) -> Option<Pid> {
    candidates
        .iter()
        .filter(|(_, _, se)| filter(se))
        .min_by_key(|(i, _, se)| (key(se), *i))
        .map(|(_, pid, _)| *pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Process, ProcessSpec, Thread};

    fn setup(cpus: u32) -> (Scheduler, ProcessTable) {
        let config = KernelConfig::default().with_cpus(cpus);
        (Scheduler::new(SchedConfig::from(&config)), ProcessTable::new(1000))
    }

    fn spawn(s: &mut Scheduler, t: &mut ProcessTable, pid: Pid, policy: SchedPolicy, prio: u32) {
        let se = s.new_entity(policy, prio, 0).unwrap();
        t.insert(Process::new(pid, &ProcessSpec::new("t", 1), 0, 0, se, 0)).unwrap();
        t.insert_thread(Thread::new(pid, pid, "t", 0, 0)).unwrap();
        s.enqueue(pid, t, 0, true).unwrap();
    }

    #[test]
    fn test_nice_weights() {
        assert_eq!(nice_to_weight(0), 1024);
        assert_eq!(nice_to_weight(-20), 88761);
        assert_eq!(nice_to_weight(19), 15);
        assert_eq!(nice_to_weight(99), 15);
    }

    #[test]
    fn test_realtime_preempts_normal() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Normal, 0);
        spawn(&mut s, &mut t, 11, SchedPolicy::Fifo, 5);
        spawn(&mut s, &mut t, 12, SchedPolicy::Fifo, 50);
        let out = s.schedule_cpu(0, &mut t, &[], 0).unwrap();
        assert_eq!(out.next, Some(12));
        assert_eq!(t.get(12).unwrap().state, crate::process::ProcessState::Running);
    }

    #[test]
    fn test_cfs_charges_by_weight() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Normal, 0);
        spawn(&mut s, &mut t, 11, SchedPolicy::Normal, 0);
        s.set_nice(11, 5, &mut t).unwrap();
        assert_eq!(s.run_queue_info(0).unwrap().total_weight, 1024 + 335);
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 0).unwrap().next, Some(10));
        // 10 ran 1ms at weight 1024 -> vruntime 1ms, so 11 (vruntime 0) goes next
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 1_000_000).unwrap().next, Some(11));
        s.schedule_cpu(0, &mut t, &[], 2_000_000).unwrap();
        let scaled = t.get(11).unwrap().sched.vruntime;
        assert_eq!(scaled, 1_000_000 * 1024 / 335);
    }

    #[test]
    fn test_stride_pass_advances_on_selection() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Stride, 0);
        spawn(&mut s, &mut t, 11, SchedPolicy::Stride, 0);
        s.set_tickets(10, 200, &mut t).unwrap();
        let mut picks = [0u32; 2];
        for i in 0..30u64 {
            let next = s.schedule_cpu(0, &mut t, &[], i).unwrap().next.unwrap();
            picks[(next - 10) as usize] += 1;
        }
        assert_eq!(picks[0], 20);
        assert_eq!(picks[1], 10);
    }

    #[test]
    fn test_zero_ticket_lottery_never_wins() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Lottery, 0);
        spawn(&mut s, &mut t, 11, SchedPolicy::Lottery, 0);
        s.set_tickets(10, 0, &mut t).unwrap();
        for i in 0..50u64 {
            assert_eq!(s.schedule_cpu(0, &mut t, &[], i).unwrap().next, Some(11));
        }
    }

    #[test]
    fn test_deadline_miss_demotes() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Deadline, 0);
        spawn(&mut s, &mut t, 11, SchedPolicy::Fifo, 10);
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 0).unwrap().next, Some(10));
        // the realtime task hogs the cpu once 10 is off it, so 10 misses
        s.context_switch(0, Some(11), &mut t, 0).unwrap();
        s.schedule_cpu(0, &mut t, &[], 200_000_000).unwrap();
        assert_eq!(t.get(10).unwrap().sched.policy, SchedPolicy::Normal);
        assert!(s
            .drain_events()
            .iter()
            .any(|e| matches!(e, SchedEvent::DeadlineMiss { pid: 10, .. })));
        s.verify(&t).unwrap();
    }

    #[test]
    fn test_failed_demotion_is_reported() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::Deadline, 0);
        t.get_mut(10).unwrap().sched.affinity = 0;
        s.check_deadlines(&mut t, 10_000_000_000);

        let events = s.drain_events();
        assert!(events.iter().any(|e| matches!(e, SchedEvent::DeadlineMiss { pid: 10, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SchedEvent::DemotionFailed { pid: 10, error: Error::InvalidArgument(_) })));
    }

    #[test]
    fn test_affinity_migrates() {
        let (mut s, mut t) = setup(2);
        spawn(&mut s, &mut t, 10, SchedPolicy::Normal, 0);
        let from = t.get(10).unwrap().sched.cpu;
        let other = 1 - from;
        s.set_affinity(10, 1 << other, &mut t, 0).unwrap();
        assert_eq!(t.get(10).unwrap().sched.cpu, other);
        assert!(s.run_queue_info(other).unwrap().normal.contains(&10));
        assert!(s.set_affinity(10, 1 << 7, &mut t, 0).is_err());
    }

    #[test]
    fn test_round_robin_rotates_after_slice() {
        let (mut s, mut t) = setup(1);
        spawn(&mut s, &mut t, 10, SchedPolicy::RoundRobin, 5);
        spawn(&mut s, &mut t, 11, SchedPolicy::RoundRobin, 5);
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 0).unwrap().next, Some(10));
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 50_000_000).unwrap().next, Some(10));
        assert_eq!(s.schedule_cpu(0, &mut t, &[], 100_000_000).unwrap().next, Some(11));
    }
}
