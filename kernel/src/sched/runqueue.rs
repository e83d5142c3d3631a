//! Per-CPU run queues

use alloc::vec::Vec;

use akern_api::{CpuId, Pid};

use super::Lane;
use crate::process::CpuContext;

/// Schedulable set of one CPU
///
/// Each lane keeps arrival order; the running task stays in its lane.
#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    pub cpu: CpuId,
    pub(crate) realtime: Vec<Pid>,
    pub(crate) normal: Vec<Pid>,
    pub(crate) idle: Vec<Pid>,
    pub(crate) current: Option<Pid>,
    /// Sum of CFS weights queued here
    pub(crate) total_weight: u64,
    pub(crate) min_vruntime: u64,
    /// Live register file of the CPU
    pub(crate) context: CpuContext,
    pub(crate) switches: u64,
    pub(crate) clock_ticks: u64,
}

/// Read-only snapshot of a run queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunQueueInfo {
    pub cpu: CpuId,
    pub current: Option<Pid>,
    pub realtime: Vec<Pid>,
    pub normal: Vec<Pid>,
    pub idle: Vec<Pid>,
    pub total_weight: u64,
    pub min_vruntime: u64,
    pub nr_running: usize,
    pub context_switches: u64,
    pub clock_ticks: u64,
}

impl RunQueue {
    /// Creates an empty queue for `cpu`
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            ..Self::default()
        }
    }

    pub(crate) fn lane(&self, lane: Lane) -> &Vec<Pid> {
        match lane {
            Lane::Realtime => &self.realtime,
            Lane::Normal => &self.normal,
            Lane::Idle => &self.idle,
        }
    }

    pub(crate) fn lane_mut(&mut self, lane: Lane) -> &mut Vec<Pid> {
        match lane {
            Lane::Realtime => &mut self.realtime,
            Lane::Normal => &mut self.normal,
            Lane::Idle => &mut self.idle,
        }
    }

    /// Removes `pid` from whichever lane holds it
    pub(crate) fn remove(&mut self, pid: Pid) -> bool {
        let mut found = false;
        for lane in [&mut self.realtime, &mut self.normal, &mut self.idle] {
            if let Some(pos) = lane.iter().position(|p| *p == pid) {
                lane.remove(pos);
                found = true;
            }
        }
        if self.current == Some(pid) {
            self.current = None;
        }
        found
    }

    /// Moves `pid` to the tail of `lane`
    pub(crate) fn rotate(&mut self, lane: Lane, pid: Pid) {
        let list = self.lane_mut(lane);
        if let Some(pos) = list.iter().position(|p| *p == pid) {
            list.remove(pos);
            list.push(pid);
        }
    }

    /// Tasks queued in every lane
    pub fn nr_running(&self) -> usize {
        self.realtime.len() + self.normal.len() + self.idle.len()
    }

    /// Running task
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Snapshot
    pub fn info(&self) -> RunQueueInfo {
        RunQueueInfo {
            cpu: self.cpu,
            current: self.current,
            realtime: self.realtime.clone(),
            normal: self.normal.clone(),
            idle: self.idle.clone(),
            total_weight: self.total_weight,
            min_vruntime: self.min_vruntime,
            nr_running: self.nr_running(),
            context_switches: self.switches,
            clock_ticks: self.clock_ticks,
        }
    }
}
