//! Security and accounting
//!
//! Per-process capability grants, namespace memberships, sandbox profiles
//! and cgroup placement. Effective capabilities are the granted set masked
//! by the process's sandbox, if any.

pub mod cgroup;
pub mod namespace;
pub mod sandbox;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Nanoseconds, Pid, Result, Uid};
use hashbrown::HashMap;

pub use self::cgroup::{Cgroup, CgroupStats, CgroupTree, OomVictim, ROOT_CGROUP};
pub use self::namespace::{Namespace, NamespaceSet, NamespaceTable, NamespaceType};
pub use self::sandbox::SandboxProfile;

/// Security state of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSecurity {
    pub granted: Capabilities,
    pub namespaces: NamespaceSet,
    pub sandbox: Option<String>,
}

pub struct SecurityManager {
    procs: HashMap<Pid, ProcessSecurity>,
    namespaces: NamespaceTable,
    profiles: BTreeMap<String, SandboxProfile>,
    cgroups: CgroupTree,
    denials: u64,
}

impl SecurityManager {
    pub fn new(now: Nanoseconds) -> Self {
        Self {
            procs: HashMap::new(),
            namespaces: NamespaceTable::new(now),
            profiles: BTreeMap::new(),
            cgroups: CgroupTree::new(now),
            denials: 0,
        }
    }

    // ========================================================================
    // Process life cycle
    // ========================================================================

    /// Registers a new process
    ///
    /// Namespaces, sandbox and cgroup come from `parent` (the roots when
    /// there is none). Capabilities are copied only when `inherit_caps`;
    /// otherwise the process starts with `initial`.
    pub fn register(&mut self, pid: Pid, parent: Option<Pid>, inherit_caps: bool, initial: Capabilities) -> Result<()> {
        let inherited = parent.and_then(|p| self.procs.get(&p)).cloned();
        let cgroup = parent.and_then(|p| self.cgroups.cgroup_of(p)).unwrap_or(ROOT_CGROUP);
        let state = match inherited {
            Some(parent_state) => ProcessSecurity {
                granted: if inherit_caps { parent_state.granted } else { initial },
                namespaces: parent_state.namespaces,
                sandbox: parent_state.sandbox,
            },
            None => ProcessSecurity {
                granted: initial,
                namespaces: self.namespaces.roots(),
                sandbox: None,
            },
        };
        if let Some(profile) = state.sandbox.as_deref().and_then(|n| self.profiles.get(n)) {
            if let Some(max) = profile.max_processes {
                let running = self
                    .procs
                    .values()
                    .filter(|s| s.sandbox.as_deref() == Some(profile.name.as_str()))
                    .count();
                if running >= max {
                    return Err(Error::ResourceExhausted(format!(
                        "sandbox {} allows {} processes",
                        profile.name, max
                    )));
                }
            }
        }
        self.cgroups.attach(pid, cgroup)?;
        self.namespaces.enter(pid, &state.namespaces);
        self.procs.insert(pid, state);
        Ok(())
    }

    pub fn unregister(&mut self, pid: Pid) {
        if let Some(state) = self.procs.remove(&pid) {
            self.namespaces.leave(pid, &state.namespaces);
        }
        self.cgroups.detach(pid);
    }

    pub fn process(&self, pid: Pid) -> Result<&ProcessSecurity> {
        self.procs
            .get(&pid)
            .ok_or_else(|| Error::NotFound(format!("pid {}", pid)))
    }

    fn process_mut(&mut self, pid: Pid) -> Result<&mut ProcessSecurity> {
        self.procs
            .get_mut(&pid)
            .ok_or_else(|| Error::NotFound(format!("pid {}", pid)))
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Granted set masked by the sandbox; empty for unknown pids
    pub fn effective(&self, pid: Pid) -> Capabilities {
        let Some(state) = self.procs.get(&pid) else {
            return Capabilities::empty();
        };
        match self.sandbox_of(pid) {
            Some(profile) => profile.mask(state.granted),
            None => state.granted,
        }
    }

    pub fn check_capability(&self, pid: Pid, cap: Capabilities) -> bool {
        self.effective(pid).grants(cap)
    }

    /// Fails with `PermissionDenied` unless `pid` holds `cap`
    pub fn require(&mut self, pid: Pid, cap: Capabilities) -> Result<()> {
        if self.check_capability(pid, cap) {
            return Ok(());
        }
        self.denials += 1;
        Err(Error::PermissionDenied(format!("pid {} lacks CAP_{}", pid, cap.name())))
    }

    pub fn grant_capability(&mut self, pid: Pid, cap: Capabilities) -> Result<()> {
        let state = self.process_mut(pid)?;
        state.granted |= cap;
        Ok(())
    }

    pub fn revoke_capability(&mut self, pid: Pid, cap: Capabilities) -> Result<()> {
        let state = self.process_mut(pid)?;
        state.granted.remove(cap);
        Ok(())
    }

    pub fn denials(&self) -> u64 {
        self.denials
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    /// Creates a namespace beneath the creator's and moves the creator in
    pub fn create_namespace(&mut self, pid: Pid, kind: NamespaceType, owner_uid: Uid, now: Nanoseconds) -> Result<u32> {
        let from = self.process(pid)?.namespaces[kind.index()];
        let id = self.namespaces.create(kind, from, owner_uid, now)?;
        self.namespaces.transfer(pid, from, id)?;
        self.process_mut(pid)?.namespaces[kind.index()] = id;
        Ok(id)
    }

    pub fn join_namespace(&mut self, pid: Pid, id: u32) -> Result<()> {
        let kind = self.namespaces.get(id)?.kind;
        let from = self.process(pid)?.namespaces[kind.index()];
        self.namespaces.transfer(pid, from, id)?;
        self.process_mut(pid)?.namespaces[kind.index()] = id;
        Ok(())
    }

    pub fn namespace_of(&self, pid: Pid, kind: NamespaceType) -> Result<u32> {
        Ok(self.process(pid)?.namespaces[kind.index()])
    }

    pub fn namespace(&self, id: u32) -> Result<&Namespace> {
        self.namespaces.get(id)
    }

    pub fn namespaces(&self) -> Vec<&Namespace> {
        self.namespaces.list()
    }

    /// Whether `target`'s PID namespace is `observer`'s or nested in it
    pub fn can_see(&self, observer: Pid, target: Pid) -> bool {
        let idx = NamespaceType::Pid.index();
        match (self.procs.get(&observer), self.procs.get(&target)) {
            (Some(o), Some(t)) => self.namespaces.is_within(t.namespaces[idx], o.namespaces[idx]),
            _ => false,
        }
    }

    // ========================================================================
    // Sandboxes
    // ========================================================================

    /// Registers or replaces a profile by name
    pub fn install_sandbox_profile(&mut self, profile: SandboxProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn sandbox_profile(&self, name: &str) -> Result<&SandboxProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("sandbox profile {}", name)))
    }

    pub fn apply_sandbox(&mut self, name: &str, pid: Pid) -> Result<()> {
        self.sandbox_profile(name)?;
        self.process_mut(pid)?.sandbox = Some(String::from(name));
        Ok(())
    }

    pub fn sandbox_of(&self, pid: Pid) -> Option<&SandboxProfile> {
        let name = self.procs.get(&pid)?.sandbox.as_deref()?;
        self.profiles.get(name)
    }

    pub fn check_syscall(&mut self, pid: Pid, name: &str) -> Result<()> {
        let denied = self.sandbox_of(pid).is_some_and(|p| !p.permits_syscall(name));
        self.verdict(denied, || format!("sandbox denies syscall {} for pid {}", name, pid))
    }

    pub fn check_path(&mut self, pid: Pid, path: &str) -> Result<()> {
        let denied = self.sandbox_of(pid).is_some_and(|p| !p.permits_path(path));
        self.verdict(denied, || format!("sandbox denies path {} for pid {}", path, pid))
    }

    pub fn check_file_creation(&mut self, pid: Pid) -> Result<()> {
        let denied = self.sandbox_of(pid).is_some_and(|p| !p.allow_file_creation);
        self.verdict(denied, || format!("sandbox denies file creation for pid {}", pid))
    }

    pub fn check_process_creation(&mut self, pid: Pid) -> Result<()> {
        let denied = self.sandbox_of(pid).is_some_and(|p| !p.allow_process_creation);
        self.verdict(denied, || format!("sandbox denies process creation for pid {}", pid))
    }

    pub fn check_thread_limit(&mut self, pid: Pid, threads: usize) -> Result<()> {
        let denied = self
            .sandbox_of(pid)
            .and_then(|p| p.max_threads)
            .is_some_and(|max| threads >= max);
        self.verdict(denied, || format!("sandbox thread limit reached for pid {}", pid))
    }

    /// Mapped bytes after a new mapping of `bytes`
    pub fn check_memory(&mut self, pid: Pid, bytes: u64) -> Result<()> {
        let denied = self
            .sandbox_of(pid)
            .and_then(|p| p.max_memory)
            .is_some_and(|max| bytes > max);
        self.verdict(denied, || format!("sandbox memory limit exceeded for pid {}", pid))
    }

    pub fn cpu_limit_exceeded(&self, pid: Pid, cpu_time: Nanoseconds) -> bool {
        self.sandbox_of(pid)
            .and_then(|p| p.max_cpu_time_ns)
            .is_some_and(|max| cpu_time > max)
    }

    pub fn fd_limit(&self, pid: Pid) -> Option<usize> {
        self.sandbox_of(pid).and_then(|p| p.max_fds)
    }

    fn verdict(&mut self, denied: bool, msg: impl FnOnce() -> String) -> Result<()> {
        if !denied {
            return Ok(());
        }
        self.denials += 1;
        Err(Error::PermissionDenied(msg()))
    }

    // ========================================================================
    // Cgroups
    // ========================================================================

    pub fn cgroups(&self) -> &CgroupTree {
        &self.cgroups
    }

    pub fn cgroups_mut(&mut self) -> &mut CgroupTree {
        &mut self.cgroups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecurityManager {
        let mut sec = SecurityManager::new(0);
        sec.register(1, None, false, Capabilities::ALL).unwrap();
        sec
    }

    #[test]
    fn test_grant_and_revoke() {
        let mut sec = manager();
        sec.register(100, Some(1), false, Capabilities::empty()).unwrap();
        assert!(!sec.check_capability(100, Capabilities::NET_ADMIN));
        sec.grant_capability(100, Capabilities::NET_ADMIN).unwrap();
        assert!(sec.check_capability(100, Capabilities::NET_ADMIN));
        sec.revoke_capability(100, Capabilities::NET_ADMIN).unwrap();
        assert!(!sec.check_capability(100, Capabilities::NET_ADMIN));
        assert!(sec.require(100, Capabilities::SYS_ADMIN).is_err());
        assert_eq!(sec.denials(), 1);
    }

    #[test]
    fn test_sandbox_masks_and_is_inherited() {
        let mut sec = manager();
        sec.register(2, Some(1), true, Capabilities::empty()).unwrap();
        sec.install_sandbox_profile(
            SandboxProfile::new("box")
                .with_capabilities(Capabilities::KILL)
                .deny_syscall("mount")
                .with_max_processes(2),
        );
        sec.apply_sandbox("box", 2).unwrap();
        assert_eq!(sec.effective(2), Capabilities::KILL);
        assert!(sec.check_syscall(2, "mount").is_err());
        assert!(sec.check_syscall(1, "mount").is_ok());

        sec.register(3, Some(2), true, Capabilities::empty()).unwrap();
        assert_eq!(sec.sandbox_of(3).map(|p| p.name.as_str()), Some("box"));
        assert!(matches!(sec.register(4, Some(3), true, Capabilities::empty()), Err(Error::ResourceExhausted(_))));
        assert!(sec.apply_sandbox("missing", 3).is_err());
    }

    #[test]
    fn test_pid_namespace_visibility() {
        let mut sec = manager();
        sec.register(10, Some(1), true, Capabilities::empty()).unwrap();
        let ns = sec.create_namespace(10, NamespaceType::Pid, 0, 1).unwrap();
        sec.register(11, Some(10), true, Capabilities::empty()).unwrap();

        assert_eq!(sec.namespace_of(11, NamespaceType::Pid).unwrap(), ns);
        assert!(sec.can_see(1, 11));
        assert!(sec.can_see(10, 11));
        assert!(!sec.can_see(11, 1));
        assert!(sec.namespace(ns).unwrap().members.contains(&11));

        sec.unregister(11);
        assert!(!sec.namespace(ns).unwrap().members.contains(&11));
        assert_eq!(sec.cgroups().cgroup_of(11), None);
    }
}
