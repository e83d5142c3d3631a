//! AKern API - Core types shared by every AKern crate
//!
//! This crate provides the vocabulary used between the kernel simulator's
//! subsystems and its external callers:
//!
//! - **Error**: the error kinds every operation reports, with errno mapping
//! - **Types**: identifier aliases (`Pid`, `Tid`, ...)
//! - **Capability**: the capability bitmask gating privileged operations
//! - **Syscall**: syscall numbers, arguments and structured results
//!
//! # Usage
//!
//! ```rust
//! use akern_api::{Error, ErrorKind, Result};
//!
//! fn lookup(pid: u32) -> Result<u32> {
//!     Err(Error::NotFound(format!("pid {}", pid)))
//! }
//!
//! assert_eq!(lookup(7).unwrap_err().kind(), ErrorKind::NotFound);
//! ```

#![no_std]
#![warn(missing_docs)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod capability;
pub mod error;
pub mod syscall;
pub mod types;

pub use crate::capability::Capabilities;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::syscall::{SyscallArg, SyscallNumber, SyscallResult};
pub use crate::types::*;
