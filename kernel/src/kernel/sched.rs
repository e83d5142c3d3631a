//! Scheduling entry points

use alloc::format;
use alloc::vec::Vec;

use akern_api::{CpuId, Error, Nanoseconds, Pid, Result};

use super::Kernel;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::process::ProcessManager;
use crate::sched::{DeadlineParams, RunQueueInfo, SchedPolicy, ScheduleOutcome};

impl Kernel {
    /// Reschedules every CPU
    pub fn schedule(&self) -> Result<Vec<ScheduleOutcome>> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let mut outcomes = Vec::with_capacity(self.config.num_cpus as usize);
        for cpu in 0..self.config.num_cpus {
            outcomes.push(self.schedule_locked(&mut pm, cpu, now)?);
        }
        self.log_sched_events(&mut pm);
        Ok(outcomes)
    }

    /// Reschedules one CPU
    pub fn schedule_cpu(&self, cpu: CpuId) -> Result<ScheduleOutcome> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let outcome = self.schedule_locked(&mut pm, cpu, now)?;
        self.log_sched_events(&mut pm);
        Ok(outcome)
    }

    fn schedule_locked(&self, pm: &mut ProcessManager, cpu: CpuId, now: Nanoseconds) -> Result<ScheduleOutcome> {
        if cpu >= self.config.num_cpus {
            return Err(Error::InvalidArgument(format!("no cpu {}", cpu)));
        }
        if self.preemption_disabled(cpu) {
            let current = pm.sched.current(cpu);
            return Ok(ScheduleOutcome {
                cpu,
                previous: current,
                next: current,
                charged: None,
                switched: false,
            });
        }
        let throttled = self.security.lock().cgroups().throttled_pids();
        let outcome = pm.sched.schedule_cpu(cpu, &mut pm.table, &throttled, now)?;
        if let Some((pid, ns)) = outcome.charged {
            let newly = self.security.lock().cgroups_mut().charge_cpu(pid, ns);
            for cgroup in newly {
                self.klog(
                    LogLevel::Info,
                    LogFacility::Scheduler,
                    format!("cgroup {} exhausted its cpu quota, throttling", cgroup),
                    LogContext::cpu(cpu),
                );
            }
        }
        if outcome.switched {
            self.klog(
                LogLevel::Trace,
                LogFacility::Scheduler,
                format!("switch {:?} -> {:?}", outcome.previous, outcome.next),
                LogContext::cpu(cpu),
            );
        }
        Ok(outcome)
    }

    /// Switches `cpu` straight to `next` without a policy pick
    ///
    /// `next` must already be queued on `cpu`; `None` idles the CPU.
    pub fn context_switch(&self, cpu: CpuId, next: Option<Pid>) -> Result<bool> {
        if cpu >= self.config.num_cpus {
            return Err(Error::InvalidArgument(format!("no cpu {}", cpu)));
        }
        let now = self.now();
        let mut guard = self.procs.lock();
        let pm = &mut *guard;
        let previous = pm.sched.current(cpu);
        let switched = pm.sched.context_switch(cpu, next, &mut pm.table, now)?;
        if switched {
            self.klog(
                LogLevel::Trace,
                LogFacility::Scheduler,
                format!("switch {:?} -> {:?}", previous, next),
                LogContext::cpu(cpu),
            );
        }
        Ok(switched)
    }

    /// Moves `pid` to the back of its lane
    pub fn sched_yield(&self, pid: Pid) -> Result<()> {
        let mut pm = self.procs.lock();
        let pm = &mut *pm;
        pm.sched.yield_task(pid, &mut pm.table)
    }

    pub fn set_scheduling_policy(&self, pid: Pid, policy: SchedPolicy, priority: u32) -> Result<()> {
        let now = self.now();
        let mut guard = self.procs.lock();
        let pm = &mut *guard;
        pm.sched.set_policy(pid, policy, priority, &mut pm.table, now)?;
        self.klog(
            LogLevel::Info,
            LogFacility::Scheduler,
            format!("pid {} now runs {:?} at priority {}", pid, policy, priority),
            LogContext::pid(pid),
        );
        self.log_sched_events(pm);
        Ok(())
    }

    /// Sets the realtime priority (1..=99)
    pub fn set_priority(&self, pid: Pid, priority: u32) -> Result<()> {
        let mut pm = self.procs.lock();
        let pm = &mut *pm;
        pm.sched.set_priority(pid, priority, &mut pm.table)
    }

    /// Sets niceness (-20..=19) and the derived CFS weight
    pub fn set_niceness(&self, pid: Pid, nice: i32) -> Result<()> {
        let mut pm = self.procs.lock();
        let pm = &mut *pm;
        pm.sched.set_nice(pid, nice, &mut pm.table)
    }

    /// Lottery tickets, also the stride share
    pub fn set_tickets(&self, pid: Pid, tickets: u32) -> Result<()> {
        let mut pm = self.procs.lock();
        let pm = &mut *pm;
        pm.sched.set_tickets(pid, tickets, &mut pm.table)
    }

    pub fn set_deadline_params(&self, pid: Pid, params: DeadlineParams) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        let pm = &mut *pm;
        pm.sched.set_deadline_params(pid, params, &mut pm.table, now)
    }

    /// Restricts `pid` to the CPUs in `mask`, migrating it if needed
    pub fn set_cpu_affinity(&self, pid: Pid, mask: u64) -> Result<()> {
        let now = self.now();
        let mut guard = self.procs.lock();
        let pm = &mut *guard;
        pm.sched.set_affinity(pid, mask, &mut pm.table, now)?;
        self.log_sched_events(pm);
        Ok(())
    }

    pub fn run_queue_info(&self, cpu: CpuId) -> Result<RunQueueInfo> {
        self.procs.lock().sched.run_queue_info(cpu)
    }

    /// Task running on `cpu`
    pub fn current_task(&self, cpu: CpuId) -> Option<Pid> {
        self.procs.lock().sched.current(cpu)
    }

    /// 1, 5 and 15 minute load averages
    pub fn load_average(&self) -> [f64; 3] {
        self.procs.lock().sched.load_average()
    }

    /// Runnable tasks over all CPUs
    pub fn nr_running(&self) -> usize {
        self.procs.lock().sched.nr_running()
    }

    pub fn context_switches(&self) -> u64 {
        self.procs.lock().sched.total_switches()
    }
}
