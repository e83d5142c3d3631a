//! Capabilities, namespaces, sandboxes and cgroups

use alloc::format;
use alloc::vec::Vec;

use akern_api::{Capabilities, Error, Pid, Result};

use super::Kernel;
use crate::klog::{LogContext, LogFacility, LogLevel};
use crate::security::{Cgroup, CgroupStats, Namespace, NamespaceType, SandboxProfile};

impl Kernel {
    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Whether `pid`'s effective set holds every bit of `cap`
    pub fn check_capability(&self, pid: Pid, cap: Capabilities) -> bool {
        self.security.lock().check_capability(pid, cap)
    }

    /// Like [`check_capability`](Self::check_capability) but counts and
    /// logs a denial
    pub fn require_capability(&self, pid: Pid, cap: Capabilities) -> Result<()> {
        let checked = self.security.lock().require(pid, cap);
        if let Err(err) = &checked {
            self.klog(LogLevel::Notice, LogFacility::Security, format!("{}", err), LogContext::pid(pid));
        }
        checked
    }

    pub fn effective_capabilities(&self, pid: Pid) -> Capabilities {
        self.security.lock().effective(pid)
    }

    pub fn grant_capability(&self, pid: Pid, cap: Capabilities) -> Result<()> {
        self.security.lock().grant_capability(pid, cap)?;
        self.klog(
            LogLevel::Notice,
            LogFacility::Audit,
            format!("granted {:?} to pid {}", cap, pid),
            LogContext::pid(pid),
        );
        Ok(())
    }

    pub fn revoke_capability(&self, pid: Pid, cap: Capabilities) -> Result<()> {
        self.security.lock().revoke_capability(pid, cap)?;
        self.klog(
            LogLevel::Notice,
            LogFacility::Audit,
            format!("revoked {:?} from pid {}", cap, pid),
            LogContext::pid(pid),
        );
        Ok(())
    }

    /// Checks refused so far
    pub fn security_denials(&self) -> u64 {
        self.security.lock().denials()
    }

    // ========================================================================
    // Namespaces
    // ========================================================================

    /// Creates a namespace below `pid`'s current one and moves `pid` in
    ///
    /// Every type but `User` needs `CAP_SYS_ADMIN`.
    pub fn create_namespace(&self, pid: Pid, kind: NamespaceType) -> Result<u32> {
        let now = self.now();
        let uid = {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
            pm.table.get(pid)?.uid
        };
        if kind != NamespaceType::User {
            self.require_capability(pid, Capabilities::SYS_ADMIN)?;
        }
        let id = self.security.lock().create_namespace(pid, kind, uid, now)?;
        self.klog(
            LogLevel::Info,
            LogFacility::Security,
            format!("pid {} entered new {} namespace {}", pid, kind.name(), id),
            LogContext::pid(pid),
        );
        Ok(id)
    }

    pub fn join_namespace(&self, pid: Pid, id: u32) -> Result<()> {
        {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
        }
        self.require_capability(pid, Capabilities::SYS_ADMIN)?;
        self.security.lock().join_namespace(pid, id)
    }

    pub fn namespace_of(&self, pid: Pid, kind: NamespaceType) -> Result<u32> {
        self.security.lock().namespace_of(pid, kind)
    }

    pub fn namespace(&self, id: u32) -> Result<Namespace> {
        self.security.lock().namespace(id).cloned()
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.security.lock().namespaces().into_iter().cloned().collect()
    }

    // ========================================================================
    // Sandboxes
    // ========================================================================

    /// Registers or replaces a profile by name
    pub fn install_sandbox_profile(&self, profile: SandboxProfile) {
        self.security.lock().install_sandbox_profile(profile);
    }

    /// Puts `pid` under a profile; its children inherit it
    pub fn apply_sandbox(&self, name: &str, pid: Pid) -> Result<()> {
        {
            let pm = self.procs.lock();
            Self::live_process(&pm, pid)?;
        }
        let fd_limit = {
            let mut security = self.security.lock();
            security.apply_sandbox(name, pid)?;
            security.fd_limit(pid)
        };
        if let Some(limit) = fd_limit {
            self.vfs.lock().set_fd_limit(pid, limit);
        }
        self.klog(
            LogLevel::Info,
            LogFacility::Security,
            format!("sandbox {} applied to pid {}", name, pid),
            LogContext::pid(pid),
        );
        Ok(())
    }

    pub fn sandbox_of(&self, pid: Pid) -> Option<SandboxProfile> {
        self.security.lock().sandbox_of(pid).cloned()
    }

    // ========================================================================
    // Cgroups
    // ========================================================================

    pub fn create_cgroup(&self, name: &str, parent: u32) -> Result<u32> {
        let now = self.now();
        let id = self.security.lock().cgroups_mut().create(name, parent, now)?;
        self.klog(
            LogLevel::Info,
            LogFacility::Security,
            format!("cgroup {} created under {}", name, parent),
            LogContext::default(),
        );
        Ok(id)
    }

    /// Removes an empty leaf cgroup
    pub fn remove_cgroup(&self, id: u32) -> Result<()> {
        self.security.lock().cgroups_mut().remove(id)
    }

    pub fn cgroup_by_path(&self, path: &str) -> Result<u32> {
        self.security
            .lock()
            .cgroups()
            .by_path(path)
            .ok_or_else(|| Error::NotFound(format!("cgroup {}", path)))
    }

    /// Moves a live process into a cgroup
    pub fn add_process_to_cgroup(&self, pid: Pid, id: u32) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        Self::live_process(&pm, pid)?;
        self.security.lock().cgroups_mut().attach(pid, id)?;
        self.enforce_memory_limits(&mut pm, now);
        Ok(())
    }

    /// CPU bandwidth: `quota_us` per `period_us`, `None` for unlimited
    pub fn set_cgroup_cpu_limit(&self, id: u32, quota_us: Option<u64>, period_us: u64) -> Result<()> {
        self.security.lock().cgroups_mut().set_cpu_limit(id, quota_us, period_us)
    }

    pub fn set_cgroup_cpu_shares(&self, id: u32, shares: u64) -> Result<()> {
        self.security.lock().cgroups_mut().set_cpu_shares(id, shares)
    }

    /// Memory limit in bytes; lowering it below usage kills at once
    pub fn set_cgroup_memory_limit(&self, id: u32, bytes: Option<u64>) -> Result<()> {
        let now = self.now();
        let mut pm = self.procs.lock();
        self.security.lock().cgroups_mut().set_memory_limit(id, bytes)?;
        self.enforce_memory_limits(&mut pm, now);
        Ok(())
    }

    pub fn set_cgroup_pids_max(&self, id: u32, max: Option<usize>) -> Result<()> {
        self.security.lock().cgroups_mut().set_pids_max(id, max)
    }

    pub fn cgroup_of(&self, pid: Pid) -> Option<u32> {
        self.security.lock().cgroups().cgroup_of(pid)
    }

    pub fn cgroup_statistics(&self, id: u32) -> Result<CgroupStats> {
        self.security.lock().cgroups().statistics(id)
    }

    pub fn cgroups(&self) -> Vec<Cgroup> {
        self.security.lock().cgroups().list().into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use akern_api::INIT_PID;
    use akern_memory_management::{MmapFlags, PAGE_SIZE, Protection};

    use super::*;
    use crate::config::KernelConfig;
    use crate::process::{ProcessSpec, ProcessState};
    use crate::security::ROOT_CGROUP;

    #[test]
    fn test_capability_gate() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let spec = ProcessSpec::new("daemon", INIT_PID).with_credentials(1000, 1000);
        let pid = kernel.create_process_with(spec).unwrap();
        assert!(!kernel.check_capability(pid, Capabilities::NET_ADMIN));
        kernel.grant_capability(pid, Capabilities::NET_ADMIN).unwrap();
        assert!(kernel.check_capability(pid, Capabilities::NET_ADMIN));
        kernel.revoke_capability(pid, Capabilities::NET_ADMIN).unwrap();
        assert!(!kernel.check_capability(pid, Capabilities::NET_ADMIN));
    }

    #[test]
    fn test_pid_namespace_hides_outsiders() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let outside = kernel.create_process("outside", INIT_PID).unwrap();
        let container = kernel.create_process("container", INIT_PID).unwrap();
        let ns = kernel.create_namespace(container, NamespaceType::Pid).unwrap();
        assert_eq!(kernel.namespace_of(container, NamespaceType::Pid).unwrap(), ns);

        let inner = kernel.create_process("inner", container).unwrap();
        let visible = kernel.processes_visible_to(inner).unwrap();
        assert!(visible.contains(&container));
        assert!(!visible.contains(&outside));
        assert!(kernel.kill_process(inner, outside, 15).is_err());
    }

    #[test]
    fn test_unprivileged_namespace_creation() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let spec = ProcessSpec::new("user", INIT_PID).with_credentials(1000, 1000);
        let pid = kernel.create_process_with(spec).unwrap();
        assert!(matches!(
            kernel.create_namespace(pid, NamespaceType::Network),
            Err(Error::PermissionDenied(_))
        ));
        assert!(kernel.create_namespace(pid, NamespaceType::User).is_ok());
        assert!(kernel.security_denials() >= 1);
    }

    #[test]
    fn test_cgroup_memory_limit_kills_largest() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cg = kernel.create_cgroup("batch", ROOT_CGROUP).unwrap();
        let small = kernel.create_process("small", INIT_PID).unwrap();
        let big = kernel.create_process("big", INIT_PID).unwrap();
        kernel.add_process_to_cgroup(small, cg).unwrap();
        kernel.add_process_to_cgroup(big, cg).unwrap();

        let rw = Protection::READ | Protection::WRITE;
        kernel.mmap_for_process(small, 0, PAGE_SIZE, rw, MmapFlags::POPULATE).unwrap();
        kernel.mmap_for_process(big, 0, 4 * PAGE_SIZE, rw, MmapFlags::POPULATE).unwrap();

        kernel.set_cgroup_memory_limit(cg, Some(3 * PAGE_SIZE)).unwrap();
        assert_eq!(kernel.process(big).unwrap().state, ProcessState::Zombie);
        assert!(!kernel.process(small).unwrap().state.has_exited());
        assert_eq!(kernel.cgroup_statistics(cg).unwrap().oom_kills, 1);
    }

    #[test]
    fn test_pids_max() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let cg = kernel.create_cgroup("tight", ROOT_CGROUP).unwrap();
        kernel.set_cgroup_pids_max(cg, Some(1)).unwrap();
        let a = kernel.create_process("a", INIT_PID).unwrap();
        let b = kernel.create_process("b", INIT_PID).unwrap();
        kernel.add_process_to_cgroup(a, cg).unwrap();
        assert!(matches!(
            kernel.add_process_to_cgroup(b, cg),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(kernel.cgroup_of(a), Some(cg));
        assert_eq!(kernel.cgroup_by_path("/tight").unwrap(), cg);
    }
}
