//! Signal numbers, sets and dispositions

use alloc::collections::BTreeMap;

use akern_api::{Error, Result};
use bitflags::bitflags;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGSTKFLT: u32 = 16;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGXCPU: u32 = 24;
pub const SIGXFSZ: u32 = 25;
pub const SIGVTALRM: u32 = 26;
pub const SIGPROF: u32 = 27;
pub const SIGWINCH: u32 = 28;
pub const SIGIO: u32 = 29;
pub const SIGPWR: u32 = 30;
pub const SIGSYS: u32 = 31;
pub const SIGRTMIN: u32 = 34;
pub const SIGRTMAX: u32 = 64;

bitflags! {
    /// Set of signals; bit `n - 1` stands for signal `n`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SignalSet: u64 {
        const HUP = 1 << (SIGHUP - 1);
        const INT = 1 << (SIGINT - 1);
        const QUIT = 1 << (SIGQUIT - 1);
        const KILL = 1 << (SIGKILL - 1);
        const USR1 = 1 << (SIGUSR1 - 1);
        const SEGV = 1 << (SIGSEGV - 1);
        const USR2 = 1 << (SIGUSR2 - 1);
        const PIPE = 1 << (SIGPIPE - 1);
        const ALRM = 1 << (SIGALRM - 1);
        const TERM = 1 << (SIGTERM - 1);
        const CHLD = 1 << (SIGCHLD - 1);
        const CONT = 1 << (SIGCONT - 1);
        const STOP = 1 << (SIGSTOP - 1);
        const _ = !0;
    }
}

impl SignalSet {
    /// Set holding one signal
    pub fn of(sig: u32) -> Self {
        if (1..=SIGRTMAX).contains(&sig) {
            Self::from_bits_retain(1u64 << (sig - 1))
        } else {
            Self::empty()
        }
    }

    /// Whether `sig` is in the set
    pub fn has(self, sig: u32) -> bool {
        !Self::of(sig).is_empty() && self.contains(Self::of(sig))
    }

    /// Lowest numbered signal in the set
    pub fn lowest(self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.bits().trailing_zeros() + 1)
        }
    }

    /// Signals that can never be blocked or caught
    pub fn unblockable() -> Self {
        Self::KILL | Self::STOP
    }
}

/// What happens when a signal arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SigDisposition {
    /// The signal's default action
    #[default]
    Default,
    /// Discard
    Ignore,
    /// Run a user handler at this address
    Handler(u64),
}

/// Default action of a signal without a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultAction {
    /// Exit with `128 + signo`
    Terminate,
    /// Discard
    Ignore,
    /// Stop the process
    Stop,
    /// Resume a stopped process
    Continue,
}

/// Whether `sig` names a signal
pub fn is_valid(sig: u32) -> bool {
    (1..=SIGSYS).contains(&sig) || (SIGRTMIN..=SIGRTMAX).contains(&sig)
}

/// Validates a signal number
pub fn check(sig: u32) -> Result<u32> {
    if is_valid(sig) {
        Ok(sig)
    } else {
        Err(Error::InvalidArgument(alloc::format!("invalid signal {}", sig)))
    }
}

/// Default action of `sig`
pub fn default_action(sig: u32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Conventional name of `sig`
pub fn signal_name(sig: u32) -> &'static str {
    match sig {
        SIGHUP => "SIGHUP",
        SIGINT => "SIGINT",
        SIGQUIT => "SIGQUIT",
        SIGILL => "SIGILL",
        SIGTRAP => "SIGTRAP",
        SIGABRT => "SIGABRT",
        SIGBUS => "SIGBUS",
        SIGFPE => "SIGFPE",
        SIGKILL => "SIGKILL",
        SIGUSR1 => "SIGUSR1",
        SIGSEGV => "SIGSEGV",
        SIGUSR2 => "SIGUSR2",
        SIGPIPE => "SIGPIPE",
        SIGALRM => "SIGALRM",
        SIGTERM => "SIGTERM",
        SIGSTKFLT => "SIGSTKFLT",
        SIGCHLD => "SIGCHLD",
        SIGCONT => "SIGCONT",
        SIGSTOP => "SIGSTOP",
        SIGTSTP => "SIGTSTP",
        SIGTTIN => "SIGTTIN",
        SIGTTOU => "SIGTTOU",
        SIGURG => "SIGURG",
        SIGXCPU => "SIGXCPU",
        SIGXFSZ => "SIGXFSZ",
        SIGVTALRM => "SIGVTALRM",
        SIGPROF => "SIGPROF",
        SIGWINCH => "SIGWINCH",
        SIGIO => "SIGIO",
        SIGPWR => "SIGPWR",
        SIGSYS => "SIGSYS",
        SIGRTMIN..=SIGRTMAX => "SIGRT",
        _ => "SIG?",
    }
}

/// Per-process signal state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalState {
    /// Delivered but not yet taken
    pub pending: SignalSet,
    /// Masked signals
    pub blocked: SignalSet,
    dispositions: BTreeMap<u32, SigDisposition>,
}

impl SignalState {
    /// Disposition of `sig`
    pub fn disposition(&self, sig: u32) -> SigDisposition {
        self.dispositions.get(&sig).copied().unwrap_or_default()
    }

    /// Installs a disposition, returning the previous one
    pub fn set_disposition(&mut self, sig: u32, disp: SigDisposition) -> Result<SigDisposition> {
        check(sig)?;
        if SignalSet::unblockable().has(sig) && disp != SigDisposition::Default {
            return Err(Error::InvalidArgument(alloc::format!(
                "{} cannot be caught or ignored",
                signal_name(sig)
            )));
        }
        let old = self.disposition(sig);
        if disp == SigDisposition::Default {
            self.dispositions.remove(&sig);
        } else {
            self.dispositions.insert(sig, disp);
        }
        Ok(old)
    }

    /// Replaces the mask; SIGKILL and SIGSTOP are silently dropped from it
    pub fn set_mask(&mut self, mask: SignalSet) -> SignalSet {
        let old = self.blocked;
        self.blocked = mask - SignalSet::unblockable();
        old
    }

    /// Whether any handler is installed for `sig`
    pub fn has_handler(&self, sig: u32) -> bool {
        matches!(self.disposition(sig), SigDisposition::Handler(_))
    }

    /// Takes the lowest pending signal that is not blocked
    pub fn take_pending(&mut self) -> Option<u32> {
        let sig = (self.pending - self.blocked).lowest()?;
        self.pending.remove(SignalSet::of(sig));
        Some(sig)
    }

    /// Resets caught signals to default, as after exec
    pub fn reset_handlers(&mut self) {
        self.dispositions.retain(|_, d| *d == SigDisposition::Ignore);
    }
}
