//! Syscall number table
//!
//! Numbers are grouped in blocks: process control from 0, files from 50,
//! memory from 150, System V IPC from 200, sockets from 250, time from 300,
//! system information from 350, threading from 400, misc from 450.

/// Exclusive upper bound of syscall numbers
pub const MAX_SYSCALL: u32 = 512;

macro_rules! syscall_table {
    ($($variant:ident = $num:expr, $name:literal;)*) => {
        /// Every syscall number known to the dispatcher
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(u32)]
        pub enum SyscallNumber {
            $(
                #[doc = $name]
                $variant = $num,
            )*
        }

        impl SyscallNumber {
            /// All syscall numbers in table order
            pub const ALL: &'static [SyscallNumber] = &[$(SyscallNumber::$variant,)*];

            /// Lowercase syscall name, e.g. `"open"`
            pub fn name(self) -> &'static str {
                match self {
                    $(SyscallNumber::$variant => $name,)*
                }
            }

            /// Looks a number up by its raw value
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $(n if n == $num => Some(SyscallNumber::$variant),)*
                    _ => None,
                }
            }

            /// Looks a number up by its lowercase name
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(SyscallNumber::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

syscall_table! {
    Exit = 0, "exit";
    Fork = 1, "fork";
    Vfork = 2, "vfork";
    Exec = 3, "exec";
    Wait = 4, "wait";
    Waitpid = 5, "waitpid";
    Getpid = 6, "getpid";
    Getppid = 7, "getppid";
    Getuid = 8, "getuid";
    Getgid = 9, "getgid";
    Setuid = 10, "setuid";
    Setgid = 11, "setgid";
    Setsid = 12, "setsid";
    Getpgid = 13, "getpgid";
    Setpgid = 14, "setpgid";
    Kill = 15, "kill";
    Signal = 16, "signal";
    Sigaction = 17, "sigaction";
    Sigprocmask = 18, "sigprocmask";
    Alarm = 19, "alarm";
    Pause = 20, "pause";
    Nanosleep = 21, "nanosleep";
    Clone = 22, "clone";
    Nice = 23, "nice";
    SchedSetparam = 24, "sched_setparam";
    SchedGetparam = 25, "sched_getparam";
    SchedYield = 26, "sched_yield";
    Prctl = 27, "prctl";
    ArchPrctl = 28, "arch_prctl";

    Open = 50, "open";
    Close = 51, "close";
    Read = 52, "read";
    Write = 53, "write";
    Lseek = 54, "lseek";
    Stat = 55, "stat";
    Fstat = 56, "fstat";
    Lstat = 57, "lstat";
    Poll = 58, "poll";
    Select = 59, "select";
    EpollCreate = 60, "epoll_create";
    EpollCtl = 61, "epoll_ctl";
    EpollWait = 62, "epoll_wait";
    Dup = 63, "dup";
    Dup2 = 64, "dup2";
    Pipe = 65, "pipe";
    Pipe2 = 66, "pipe2";
    Fcntl = 67, "fcntl";
    Ioctl = 68, "ioctl";
    Access = 69, "access";
    Mkdir = 70, "mkdir";
    Rmdir = 71, "rmdir";
    Unlink = 72, "unlink";
    Rename = 73, "rename";
    Link = 74, "link";
    Symlink = 75, "symlink";
    Readlink = 76, "readlink";
    Chmod = 77, "chmod";
    Chown = 78, "chown";
    Truncate = 79, "truncate";
    Fsync = 80, "fsync";
    Fdatasync = 81, "fdatasync";
    Getdents = 82, "getdents";
    Getcwd = 83, "getcwd";
    Chdir = 84, "chdir";
    Chroot = 85, "chroot";
    Mount = 86, "mount";
    Umount = 87, "umount";
    Statfs = 88, "statfs";
    Fstatfs = 89, "fstatfs";
    Openat = 90, "openat";
    Mkdirat = 91, "mkdirat";
    Unlinkat = 92, "unlinkat";
    Renameat = 93, "renameat";
    Fchmod = 94, "fchmod";
    Fchown = 95, "fchown";
    Utimes = 96, "utimes";
    Sendfile = 97, "sendfile";
    Splice = 98, "splice";
    Tee = 99, "tee";

    Mmap = 150, "mmap";
    Munmap = 151, "munmap";
    Mprotect = 152, "mprotect";
    Madvise = 153, "madvise";
    Mremap = 154, "mremap";
    Msync = 155, "msync";
    Mlock = 156, "mlock";
    Munlock = 157, "munlock";
    Mlockall = 158, "mlockall";
    Munlockall = 159, "munlockall";
    Brk = 160, "brk";
    Sbrk = 161, "sbrk";
    Mincore = 162, "mincore";

    Msgget = 200, "msgget";
    Msgsnd = 201, "msgsnd";
    Msgrcv = 202, "msgrcv";
    Msgctl = 203, "msgctl";
    Semget = 204, "semget";
    Semop = 205, "semop";
    Semctl = 206, "semctl";
    Shmget = 207, "shmget";
    Shmat = 208, "shmat";
    Shmdt = 209, "shmdt";
    Shmctl = 210, "shmctl";

    Socket = 250, "socket";
    Bind = 251, "bind";
    Listen = 252, "listen";
    Accept = 253, "accept";
    Connect = 254, "connect";
    Send = 255, "send";
    Recv = 256, "recv";
    Sendto = 257, "sendto";
    Recvfrom = 258, "recvfrom";
    Sendmsg = 259, "sendmsg";
    Recvmsg = 260, "recvmsg";
    Shutdown = 261, "shutdown";
    Getsockname = 262, "getsockname";
    Getpeername = 263, "getpeername";
    Setsockopt = 264, "setsockopt";
    Getsockopt = 265, "getsockopt";
    Socketpair = 266, "socketpair";

    Gettimeofday = 300, "gettimeofday";
    Settimeofday = 301, "settimeofday";
    ClockGettime = 302, "clock_gettime";
    ClockSettime = 303, "clock_settime";
    ClockGetres = 304, "clock_getres";
    TimerCreate = 305, "timer_create";
    TimerSettime = 306, "timer_settime";
    TimerGettime = 307, "timer_gettime";
    TimerDelete = 308, "timer_delete";

    Uname = 350, "uname";
    Sysinfo = 351, "sysinfo";
    Syslog = 352, "syslog";
    Getrusage = 353, "getrusage";
    Getrlimit = 354, "getrlimit";
    Setrlimit = 355, "setrlimit";
    Prlimit = 356, "prlimit";
    Times = 357, "times";

    Futex = 400, "futex";
    SetTidAddress = 401, "set_tid_address";
    SetRobustList = 402, "set_robust_list";
    GetRobustList = 403, "get_robust_list";
    Tkill = 404, "tkill";
    Tgkill = 405, "tgkill";

    Reboot = 450, "reboot";
    Sync = 451, "sync";
    Acct = 452, "acct";
    Ptrace = 453, "ptrace";
    PerfEventOpen = 454, "perf_event_open";
    Getrandom = 455, "getrandom";
    MemfdCreate = 456, "memfd_create";
    CopyFileRange = 457, "copy_file_range";
    Preadv2 = 458, "preadv2";
    Pwritev2 = 459, "pwritev2";
    IoUringSetup = 460, "io_uring_setup";
    IoUringEnter = 461, "io_uring_enter";
    IoUringRegister = 462, "io_uring_register";
    PidfdOpen = 463, "pidfd_open";
    CloseRange = 464, "close_range";
    Openat2 = 465, "openat2";
    Faccessat2 = 466, "faccessat2";
}

impl SyscallNumber {
    /// Raw numeric value
    pub fn raw(self) -> u32 {
        self as u32
    }
}

static_assertions::const_assert!((SyscallNumber::Faccessat2 as u32) < MAX_SYSCALL);
