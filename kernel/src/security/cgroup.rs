//! Control groups
//!
//! Cgroups form a tree rooted at `/`. Every process belongs to exactly one
//! cgroup; CPU time and memory are charged to it and to each ancestor.
//! A cgroup whose quota is used up for the current period is throttled,
//! and so is every cgroup below it.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Error, Nanoseconds, Pid, Result};
use hashbrown::HashMap;

pub const ROOT_CGROUP: u32 = 1;
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;
pub const DEFAULT_CPU_SHARES: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    pub id: u32,
    pub name: String,
    pub path: String,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    pub members: BTreeSet<Pid>,
    pub cpu_quota_us: Option<u64>,
    pub cpu_period_us: u64,
    pub cpu_shares: u64,
    pub memory_limit: Option<u64>,
    pub pids_max: Option<usize>,
    /// Hierarchical totals
    pub cpu_usage_ns: Nanoseconds,
    pub memory_usage: u64,
    pub memory_peak: u64,
    period_usage_ns: Nanoseconds,
    period_start: Nanoseconds,
    pub throttled: bool,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub oom_kills: u64,
}

/// Snapshot returned by `statistics`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupStats {
    pub id: u32,
    pub path: String,
    pub members: Vec<Pid>,
    pub pids_current: usize,
    pub pids_max: Option<usize>,
    pub cpu_usage_ns: Nanoseconds,
    pub cpu_quota_us: Option<u64>,
    pub cpu_period_us: u64,
    pub cpu_shares: u64,
    pub throttled: bool,
    pub nr_periods: u64,
    pub nr_throttled: u64,
    pub memory_usage: u64,
    pub memory_peak: u64,
    pub memory_limit: Option<u64>,
    pub oom_kills: u64,
}

/// A process chosen by the OOM policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomVictim {
    pub pid: Pid,
    pub cgroup: u32,
    pub usage: u64,
    pub limit: u64,
}

pub struct CgroupTree {
    groups: BTreeMap<u32, Cgroup>,
    membership: HashMap<Pid, u32>,
    next_id: u32,
}

impl CgroupTree {
    pub fn new(now: Nanoseconds) -> Self {
        let mut tree = Self {
            groups: BTreeMap::new(),
            membership: HashMap::new(),
            next_id: ROOT_CGROUP + 1,
        };
        tree.groups.insert(ROOT_CGROUP, Cgroup::new(ROOT_CGROUP, "", String::from("/"), None, now));
        tree
    }

    pub fn get(&self, id: u32) -> Result<&Cgroup> {
        self.groups
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("cgroup {}", id)))
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Cgroup> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("cgroup {}", id)))
    }

    pub fn by_path(&self, path: &str) -> Option<u32> {
        self.groups.values().find(|g| g.path == path).map(|g| g.id)
    }

    pub fn cgroup_of(&self, pid: Pid) -> Option<u32> {
        self.membership.get(&pid).copied()
    }

    pub fn create(&mut self, name: &str, parent: u32, now: Nanoseconds) -> Result<u32> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!("bad cgroup name {:?}", name)));
        }
        let parent_group = self.get(parent)?;
        let path = if parent == ROOT_CGROUP {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_group.path, name)
        };
        if self.by_path(&path).is_some() {
            return Err(Error::AlreadyExists(format!("cgroup {}", path)));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.groups.insert(id, Cgroup::new(id, name, path, Some(parent), now));
        self.get_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Removes an empty leaf cgroup
    pub fn remove(&mut self, id: u32) -> Result<()> {
        let group = self.get(id)?;
        if id == ROOT_CGROUP || !group.members.is_empty() || !group.children.is_empty() {
            return Err(Error::Busy(format!("cgroup {} in use", group.path)));
        }
        let parent = group.parent;
        self.groups.remove(&id);
        if let Some(parent) = parent.and_then(|p| self.groups.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
        }
        Ok(())
    }

    /// Places `pid` in `id`, leaving its previous cgroup
    ///
    /// Fails with `ResourceExhausted` if `id` or an ancestor is at its
    /// pids limit.
    pub fn attach(&mut self, pid: Pid, id: u32) -> Result<()> {
        self.get(id)?;
        let current = self.cgroup_of(pid);
        if current == Some(id) {
            return Ok(());
        }
        for group in self.lineage(id) {
            let g = self.get(group)?;
            if let Some(max) = g.pids_max {
                let inside = current.is_some_and(|c| self.is_descendant(c, group));
                if !inside && self.pids_in(group) >= max {
                    return Err(Error::ResourceExhausted(format!("cgroup {} pids.max {}", g.path, max)));
                }
            }
        }
        self.detach(pid);
        self.get_mut(id)?.members.insert(pid);
        self.membership.insert(pid, id);
        Ok(())
    }

    pub fn detach(&mut self, pid: Pid) {
        if let Some(old) = self.membership.remove(&pid) {
            if let Some(g) = self.groups.get_mut(&old) {
                g.members.remove(&pid);
            }
        }
    }

    pub fn set_cpu_limit(&mut self, id: u32, quota_us: Option<u64>, period_us: u64) -> Result<()> {
        if period_us == 0 || quota_us == Some(0) {
            return Err(Error::InvalidArgument("cpu quota and period must be positive".into()));
        }
        let g = self.get_mut(id)?;
        g.cpu_quota_us = quota_us;
        g.cpu_period_us = period_us;
        g.throttled = false;
        g.period_usage_ns = 0;
        Ok(())
    }

    pub fn set_cpu_shares(&mut self, id: u32, shares: u64) -> Result<()> {
        if shares == 0 {
            return Err(Error::InvalidArgument("cpu shares must be positive".into()));
        }
        self.get_mut(id)?.cpu_shares = shares;
        Ok(())
    }

    pub fn set_memory_limit(&mut self, id: u32, bytes: Option<u64>) -> Result<()> {
        self.get_mut(id)?.memory_limit = bytes;
        Ok(())
    }

    pub fn set_pids_max(&mut self, id: u32, max: Option<usize>) -> Result<()> {
        self.get_mut(id)?.pids_max = max;
        Ok(())
    }

    /// Charges CPU time to the cgroup of `pid` and its ancestors
    ///
    /// Returns the cgroups that became throttled.
    pub fn charge_cpu(&mut self, pid: Pid, ns: Nanoseconds) -> Vec<u32> {
        let Some(id) = self.cgroup_of(pid) else {
            return Vec::new();
        };
        let mut newly = Vec::new();
        for group in self.lineage(id) {
            let Some(g) = self.groups.get_mut(&group) else {
                continue;
            };
            g.cpu_usage_ns += ns;
            g.period_usage_ns += ns;
            if let Some(quota) = g.cpu_quota_us {
                if !g.throttled && g.period_usage_ns >= quota.saturating_mul(1000) {
                    g.throttled = true;
                    g.nr_throttled += 1;
                    newly.push(group);
                }
            }
        }
        newly
    }

    /// Starts new CPU periods where the current one has elapsed
    pub fn roll_periods(&mut self, now: Nanoseconds) {
        for g in self.groups.values_mut() {
            let period = g.cpu_period_us.saturating_mul(1000);
            if now.saturating_sub(g.period_start) < period {
                continue;
            }
            let elapsed = (now - g.period_start) / period;
            g.period_start += elapsed * period;
            g.nr_periods += elapsed;
            g.period_usage_ns = 0;
            g.throttled = false;
        }
    }

    /// Members of throttled cgroups, including those nested below them
    pub fn throttled_pids(&self) -> Vec<Pid> {
        self.membership
            .iter()
            .filter(|(_, id)| self.lineage(**id).iter().any(|g| self.groups.get(g).is_some_and(|g| g.throttled)))
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Recomputes memory usage from per-process resident bytes
    ///
    /// Every cgroup over its limit yields the largest member of its
    /// subtree as a victim, at most once per pid.
    pub fn update_memory(&mut self, usage: &HashMap<Pid, u64>) -> Vec<OomVictim> {
        let ids: Vec<u32> = self.groups.keys().copied().collect();
        for id in &ids {
            let total: u64 = self.pids_below(*id).iter().map(|p| usage.get(p).copied().unwrap_or(0)).sum();
            if let Some(g) = self.groups.get_mut(id) {
                g.memory_usage = total;
                g.memory_peak = g.memory_peak.max(total);
            }
        }

        let mut victims: Vec<OomVictim> = Vec::new();
        for id in ids {
            let Some(g) = self.groups.get(&id) else {
                continue;
            };
            let Some(limit) = g.memory_limit else {
                continue;
            };
            if g.memory_usage <= limit {
                continue;
            }
            let largest = self
                .pids_below(id)
                .into_iter()
                .filter(|p| !victims.iter().any(|v| v.pid == *p))
                .max_by_key(|p| (usage.get(p).copied().unwrap_or(0), core::cmp::Reverse(*p)));
            if let Some(pid) = largest {
                victims.push(OomVictim {
                    pid,
                    cgroup: id,
                    usage: g.memory_usage,
                    limit,
                });
            }
        }
        for v in &victims {
            if let Some(g) = self.groups.get_mut(&v.cgroup) {
                g.oom_kills += 1;
            }
        }
        victims
    }

    pub fn statistics(&self, id: u32) -> Result<CgroupStats> {
        let g = self.get(id)?;
        Ok(CgroupStats {
            id,
            path: g.path.clone(),
            members: g.members.iter().copied().collect(),
            pids_current: self.pids_in(id),
            pids_max: g.pids_max,
            cpu_usage_ns: g.cpu_usage_ns,
            cpu_quota_us: g.cpu_quota_us,
            cpu_period_us: g.cpu_period_us,
            cpu_shares: g.cpu_shares,
            throttled: g.throttled,
            nr_periods: g.nr_periods,
            nr_throttled: g.nr_throttled,
            memory_usage: g.memory_usage,
            memory_peak: g.memory_peak,
            memory_limit: g.memory_limit,
            oom_kills: g.oom_kills,
        })
    }

    pub fn list(&self) -> Vec<&Cgroup> {
        self.groups.values().collect()
    }

    /// `id` followed by its ancestors up to the root
    fn lineage(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            out.push(c);
            cursor = self.groups.get(&c).and_then(|g| g.parent);
        }
        out
    }

    fn is_descendant(&self, id: u32, ancestor: u32) -> bool {
        self.lineage(id).contains(&ancestor)
    }

    fn pids_below(&self, id: u32) -> Vec<Pid> {
        self.membership
            .iter()
            .filter(|(_, g)| self.is_descendant(**g, id))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn pids_in(&self, id: u32) -> usize {
        self.pids_below(id).len()
    }
}

impl Cgroup {
    fn new(id: u32, name: &str, path: String, parent: Option<u32>, now: Nanoseconds) -> Self {
        Self {
            id,
            name: String::from(name),
            path,
            parent,
            children: Vec::new(),
            members: BTreeSet::new(),
            cpu_quota_us: None,
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            cpu_shares: DEFAULT_CPU_SHARES,
            memory_limit: None,
            pids_max: None,
            cpu_usage_ns: 0,
            memory_usage: 0,
            memory_peak: 0,
            period_usage_ns: 0,
            period_start: now,
            throttled: false,
            nr_periods: 0,
            nr_throttled: 0,
            oom_kills: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_throttles_subtree_until_rollover() {
        let mut tree = CgroupTree::new(0);
        let web = tree.create("web", ROOT_CGROUP, 0).unwrap();
        let worker = tree.create("worker", web, 0).unwrap();
        assert_eq!(tree.get(worker).unwrap().path, "/web/worker");
        tree.attach(10, worker).unwrap();
        tree.attach(11, ROOT_CGROUP).unwrap();
        tree.set_cpu_limit(web, Some(50_000), 100_000).unwrap();

        assert!(tree.charge_cpu(10, 30_000_000).is_empty());
        assert_eq!(tree.charge_cpu(10, 20_000_000), [web]);
        assert_eq!(tree.throttled_pids(), [10]);

        tree.roll_periods(99_000_000);
        assert_eq!(tree.throttled_pids(), [10]);
        assert_eq!(tree.statistics(web).unwrap().nr_periods, 0);
        tree.roll_periods(100_000_000);
        assert!(tree.throttled_pids().is_empty());
        assert_eq!(tree.statistics(ROOT_CGROUP).unwrap().cpu_usage_ns, 50_000_000);
    }

    #[test]
    fn test_pids_max_counts_subtree() {
        let mut tree = CgroupTree::new(0);
        let jail = tree.create("jail", ROOT_CGROUP, 0).unwrap();
        let inner = tree.create("inner", jail, 0).unwrap();
        tree.set_pids_max(jail, Some(2)).unwrap();
        tree.attach(1, jail).unwrap();
        tree.attach(2, inner).unwrap();
        assert!(matches!(tree.attach(3, inner), Err(Error::ResourceExhausted(_))));
        tree.attach(1, inner).unwrap();
        assert_eq!(tree.statistics(jail).unwrap().pids_current, 2);
        assert!(matches!(tree.remove(inner), Err(Error::Busy(_))));
    }

    #[test]
    fn test_oom_picks_largest_member() {
        let mut tree = CgroupTree::new(0);
        let db = tree.create("db", ROOT_CGROUP, 0).unwrap();
        tree.attach(20, db).unwrap();
        tree.attach(21, db).unwrap();
        tree.attach(22, ROOT_CGROUP).unwrap();
        tree.set_memory_limit(db, Some(8192)).unwrap();

        let usage: HashMap<Pid, u64> = [(20, 4096), (21, 8192), (22, 1 << 20)].into_iter().collect();
        let victims = tree.update_memory(&usage);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].pid, 21);
        assert_eq!(tree.statistics(db).unwrap().memory_usage, 12288);
        assert_eq!(tree.statistics(db).unwrap().oom_kills, 1);
    }
}
