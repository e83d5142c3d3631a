//! Caller credentials

use akern_api::{Capabilities, Gid, INIT_PID, Pid, ROOT_GID, ROOT_UID, Uid};

/// Identity an operation runs with
///
/// Built from the caller's process and its effective capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: Pid,
    pub uid: Uid,
    pub gid: Gid,
    pub euid: Uid,
    pub egid: Gid,
    pub caps: Capabilities,
}

impl Credentials {
    /// Kernel authority: init's identity with every capability
    pub fn root() -> Self {
        Self {
            pid: INIT_PID,
            uid: ROOT_UID,
            gid: ROOT_GID,
            euid: ROOT_UID,
            egid: ROOT_GID,
            caps: Capabilities::ALL,
        }
    }

    pub fn user(pid: Pid, uid: Uid, gid: Gid, caps: Capabilities) -> Self {
        Self {
            pid,
            uid,
            gid,
            euid: uid,
            egid: gid,
            caps,
        }
    }

    pub fn has(&self, cap: Capabilities) -> bool {
        self.caps.grants(cap)
    }

    /// Whether mode bits are bypassed
    pub fn is_superuser(&self) -> bool {
        self.euid == ROOT_UID || self.has(Capabilities::DAC_OVERRIDE)
    }
}
