//! AKern - a simulated operating system kernel
//!
//! This crate models the core of a multi-CPU kernel as plain data and
//! deterministic operations. There is no hardware underneath: time is a
//! simulated clock advanced by the caller, CPUs are run queues, and
//! blocking calls hand back a [`WaitToken`] instead of parking a host
//! thread.
//!
//! # Architecture
//!
//! - **Process** (`process`): process and thread tables, signals, credentials
//! - **Scheduler** (`sched`): per-CPU run queues for CFS, real-time, deadline,
//!   MLFQ, lottery and stride classes, with load balancing
//! - **Memory** (`akern-memory-management`): zones, page tables, TLB, VMAs
//! - **IPC** (`ipc`): pipes, message queues, semaphores, shared memory
//! - **Sync** (`sync`): mutexes, rwlocks, condition variables, barriers, spinlocks
//! - **VFS** (`vfs`): inodes, dentries, mounts, descriptors
//! - **Security** (`security`): capabilities, cgroups, namespaces, sandboxes
//! - **Syscalls** (`syscall`): numbered dispatch over all of the above
//! - **Kernel log** (`klog`): a bounded ring forwarded to the `log` facade
//!
//! Everything is reached through one [`Kernel`] value.
//!
//! # Usage
//!
//! ```rust
//! use akern::{Kernel, KernelConfig, SyscallNumber};
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! let r = kernel.execute_syscall(SyscallNumber::Getpid.raw(), &[]);
//! assert!(r.success);
//! assert_eq!(r.return_value, 1);
//! ```
//!
//! # Features
//!
//! - `std`: hosted builds
//! - `serde`: serialization of configuration and reports
//! - `mm-log`: memory manager diagnostics on the `log` facade

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod clock;
pub mod config;
pub mod cred;
pub mod ipc;
pub mod kernel;
pub mod klog;
pub mod process;
pub mod sched;
pub mod security;
pub mod sync;
pub mod syscall;
pub mod vfs;
pub mod wait;

pub use akern_api::{Capabilities, Error, ErrorKind, Result, SyscallArg, SyscallNumber, SyscallResult};
pub use akern_api::{Gid, INIT_PID, Nanoseconds, Pid, Tid, Uid};

pub use crate::config::KernelConfig;
pub use crate::cred::Credentials;
pub use crate::kernel::{KERNEL_VERSION, Kernel, KernelInfo};
pub use crate::klog::{LogEntry, LogFacility, LogLevel};
pub use crate::process::ProcessSpec;
pub use crate::sched::SchedPolicy;
pub use crate::syscall::{SyscallContext, SyscallHandler, SyscallStats};
pub use crate::wait::{Blocking, WaitResult, WaitToken};
