//! Sandbox profiles
//!
//! A profile filters syscalls by name and paths by prefix, caps the
//! capabilities a process can exercise, and bounds its resources. Deny
//! lists win over allow lists; an empty allow list allows everything.

use alloc::string::String;
use alloc::vec::Vec;

use akern_api::{Capabilities, Nanoseconds};

const NETWORK_CAPS: Capabilities = Capabilities::NET_ADMIN
    .union(Capabilities::NET_RAW)
    .union(Capabilities::NET_BIND_SERVICE)
    .union(Capabilities::NET_BROADCAST);

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SandboxProfile {
    pub name: String,
    pub allowed_capabilities: Capabilities,
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub allowed_syscalls: Vec<String>,
    pub denied_syscalls: Vec<String>,
    pub allow_networking: bool,
    pub allow_file_creation: bool,
    pub allow_process_creation: bool,
    /// Bytes of mapped memory
    pub max_memory: Option<u64>,
    pub max_cpu_time_ns: Option<Nanoseconds>,
    pub max_fds: Option<usize>,
    pub max_processes: Option<usize>,
    pub max_threads: Option<usize>,
}

impl SandboxProfile {
    /// A profile that permits everything
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            allowed_capabilities: Capabilities::ALL,
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            allowed_syscalls: Vec::new(),
            denied_syscalls: Vec::new(),
            allow_networking: true,
            allow_file_creation: true,
            allow_process_creation: true,
            max_memory: None,
            max_cpu_time_ns: None,
            max_fds: None,
            max_processes: None,
            max_threads: None,
        }
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.allowed_capabilities = caps;
        self
    }

    pub fn allow_path(mut self, prefix: &str) -> Self {
        self.allowed_paths.push(String::from(prefix));
        self
    }

    pub fn deny_path(mut self, prefix: &str) -> Self {
        self.denied_paths.push(String::from(prefix));
        self
    }

    pub fn allow_syscall(mut self, name: &str) -> Self {
        self.allowed_syscalls.push(String::from(name));
        self
    }

    pub fn deny_syscall(mut self, name: &str) -> Self {
        self.denied_syscalls.push(String::from(name));
        self
    }

    pub fn without_networking(mut self) -> Self {
        self.allow_networking = false;
        self
    }

    pub fn without_file_creation(mut self) -> Self {
        self.allow_file_creation = false;
        self
    }

    pub fn without_process_creation(mut self) -> Self {
        self.allow_process_creation = false;
        self
    }

    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    pub fn with_max_cpu_time(mut self, ns: Nanoseconds) -> Self {
        self.max_cpu_time_ns = Some(ns);
        self
    }

    pub fn with_max_fds(mut self, n: usize) -> Self {
        self.max_fds = Some(n);
        self
    }

    pub fn with_max_processes(mut self, n: usize) -> Self {
        self.max_processes = Some(n);
        self
    }

    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = Some(n);
        self
    }

    /// Capabilities that survive the profile
    pub fn mask(&self, granted: Capabilities) -> Capabilities {
        let mut caps = granted & self.allowed_capabilities;
        if !self.allow_networking {
            caps.remove(NETWORK_CAPS);
        }
        caps
    }

    pub fn permits_syscall(&self, name: &str) -> bool {
        if self.denied_syscalls.iter().any(|s| s == name) {
            return false;
        }
        self.allowed_syscalls.is_empty() || self.allowed_syscalls.iter().any(|s| s == name)
    }

    /// Path filter on an absolute path
    pub fn permits_path(&self, path: &str) -> bool {
        if self.denied_paths.iter().any(|p| under(path, p)) {
            return false;
        }
        self.allowed_paths.is_empty() || self.allowed_paths.iter().any(|p| under(path, p))
    }
}

/// Whether `path` is `prefix` or lies below it
fn under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deny_wins_and_prefixes_respect_components() {
        let profile = SandboxProfile::new("web")
            .allow_path("/srv")
            .allow_path("/tmp/")
            .deny_path("/srv/secret")
            .deny_syscall("mount");

        assert!(profile.permits_path("/srv/www/index.html"));
        assert!(profile.permits_path("/tmp"));
        assert!(!profile.permits_path("/srv/secret/key"));
        assert!(!profile.permits_path("/srvx"));
        assert!(!profile.permits_path("/etc/passwd"));
        assert!(profile.permits_syscall("open"));
        assert!(!profile.permits_syscall("mount"));

        let strict = SandboxProfile::new("strict").allow_syscall("read").allow_syscall("write");
        assert!(strict.permits_syscall("read"));
        assert!(!strict.permits_syscall("open"));
    }

    #[test]
    fn test_mask_drops_network_caps() {
        let profile = SandboxProfile::new("offline")
            .with_capabilities(Capabilities::NET_ADMIN | Capabilities::KILL | Capabilities::CHOWN)
            .without_networking();
        let effective = profile.mask(Capabilities::ALL);
        assert!(effective.contains(Capabilities::KILL | Capabilities::CHOWN));
        assert!(!effective.contains(Capabilities::NET_ADMIN));
        assert!(!effective.contains(Capabilities::SYS_ADMIN));
    }
}
