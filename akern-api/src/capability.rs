//! Capability bitmask
//!
//! Bit positions follow the classic POSIX capability numbering so that
//! masks can be exchanged with tooling that already knows them.

use bitflags::bitflags;

bitflags! {
    /// Privilege bits gating classes of operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Capabilities: u64 {
        /// Change file ownership
        const CHOWN = 1 << 0;
        /// Bypass file permission checks
        const DAC_OVERRIDE = 1 << 1;
        /// Bypass read and search checks
        const DAC_READ_SEARCH = 1 << 2;
        /// Bypass owner checks on files
        const FOWNER = 1 << 3;
        /// Keep set-id bits on modification
        const FSETID = 1 << 4;
        /// Send signals to any process
        const KILL = 1 << 5;
        /// Change group ids
        const SETGID = 1 << 6;
        /// Change user ids
        const SETUID = 1 << 7;
        /// Transfer capabilities
        const SETPCAP = 1 << 8;
        /// Bind privileged ports
        const NET_BIND_SERVICE = 1 << 10;
        /// Broadcast and multicast
        const NET_BROADCAST = 1 << 11;
        /// Network administration
        const NET_ADMIN = 1 << 12;
        /// Raw sockets
        const NET_RAW = 1 << 13;
        /// Lock memory
        const IPC_LOCK = 1 << 14;
        /// Bypass IPC ownership checks
        const IPC_OWNER = 1 << 15;
        /// Load kernel modules
        const SYS_MODULE = 1 << 16;
        /// Raw I/O
        const SYS_RAWIO = 1 << 17;
        /// Change root directory
        const SYS_CHROOT = 1 << 18;
        /// Trace any process
        const SYS_PTRACE = 1 << 19;
        /// Process accounting
        const SYS_PACCT = 1 << 20;
        /// System administration (mount, namespaces, cgroups)
        const SYS_ADMIN = 1 << 21;
        /// Reboot
        const SYS_BOOT = 1 << 22;
        /// Raise priority and set realtime policies
        const SYS_NICE = 1 << 23;
        /// Override resource limits
        const SYS_RESOURCE = 1 << 24;
        /// Set the system clock
        const SYS_TIME = 1 << 25;
        /// Configure terminals
        const SYS_TTY_CONFIG = 1 << 26;
        /// Write the audit log
        const AUDIT_WRITE = 1 << 29;
        /// Configure auditing
        const AUDIT_CONTROL = 1 << 30;
        /// Read and clear the kernel log
        const SYSLOG = 1 << 34;
        /// Trigger wake alarms
        const WAKE_ALARM = 1 << 35;
        /// Block system suspend
        const BLOCK_SUSPEND = 1 << 36;
        /// Every capability, present and future
        const ALL = u64::MAX;
    }
}

impl Capabilities {
    /// Tests whether this set grants `cap`
    ///
    /// A set equal to [`Capabilities::ALL`] grants everything, including
    /// bits without a name.
    pub fn grants(self, cap: Capabilities) -> bool {
        self.bits() == u64::MAX || self.contains(cap)
    }

    /// Name of the first named flag in the set, or `"NONE"`
    pub fn name(self) -> &'static str {
        if self.bits() == u64::MAX {
            return "ALL";
        }
        self.iter_names().next().map(|(n, _)| n).unwrap_or("NONE")
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_bit_positions() {
        assert_eq!(Capabilities::NET_ADMIN.bits(), 1 << 12);
        assert_eq!(Capabilities::AUDIT_CONTROL.bits(), 1 << 30);
        assert_eq!(Capabilities::BLOCK_SUSPEND.bits(), 1 << 36);
    }

    #[test]
    fn test_all_grants_everything() {
        assert!(Capabilities::ALL.grants(Capabilities::SYS_ADMIN));
        assert!(Capabilities::ALL.grants(Capabilities::from_bits_retain(1 << 9)));
        assert!(!Capabilities::KILL.grants(Capabilities::NET_ADMIN));
        assert_eq!(Capabilities::SYS_NICE.name(), "SYS_NICE");
    }
}
